//! YAML file inventory backend.
//!
//! The file holds a list of hardware records. It is re-read when its
//! modification time changes so inventory edits take effect without a
//! restart.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use macaddr::MacAddr6;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    normalize_mac, parse_mac, BackendError, BackendReader, HardwareRecord, Netboot, Osie,
    DEFAULT_LEASE_TIME,
};

/// On-disk shape of one hardware record.
#[derive(Debug, Deserialize)]
struct RawRecord {
    mac: String,
    ip: Ipv4Addr,
    #[serde(default = "default_netmask")]
    netmask: Ipv4Addr,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    #[serde(default)]
    nameservers: Vec<Ipv4Addr>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    lease_time: Option<u32>,
    #[serde(default)]
    vlan_id: Option<u16>,
    #[serde(default)]
    netboot: RawNetboot,
    #[serde(default)]
    osie_base_url: Option<String>,
    #[serde(default)]
    facility: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawNetboot {
    #[serde(default = "default_true")]
    allow_pxe: bool,
    #[serde(default)]
    ipxe_script_url: Option<String>,
}

impl Default for RawNetboot {
    fn default() -> Self {
        Self {
            allow_pxe: true,
            ipxe_script_url: None,
        }
    }
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_true() -> bool {
    true
}

struct Indexed {
    by_mac: HashMap<MacAddr6, HardwareRecord>,
    by_ip: HashMap<IpAddr, HardwareRecord>,
    mtime: Option<SystemTime>,
}

/// Inventory backend reading hardware records from a YAML file.
pub struct FileBackend {
    path: PathBuf,
    cache: tokio::sync::RwLock<Indexed>,
}

impl FileBackend {
    /// Load the inventory file and build the MAC/IP indexes.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        let indexed = load(&path)?;
        info!(
            "loaded {} hardware records from {}",
            indexed.by_mac.len(),
            path.display()
        );

        Ok(Self {
            path,
            cache: tokio::sync::RwLock::new(indexed),
        })
    }

    /// Reload the file when its mtime moved since the last load.
    async fn refresh(&self) -> Result<(), BackendError> {
        let current = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        {
            let cache = self.cache.read().await;
            if cache.mtime == current {
                return Ok(());
            }
        }

        let indexed = load(&self.path)?;
        debug!(
            "inventory file changed, reloaded {} records",
            indexed.by_mac.len()
        );
        *self.cache.write().await = indexed;
        Ok(())
    }
}

#[async_trait]
impl BackendReader for FileBackend {
    async fn get_by_mac(&self, mac: MacAddr6) -> Result<Option<HardwareRecord>, BackendError> {
        self.refresh().await?;
        Ok(self.cache.read().await.by_mac.get(&mac).cloned())
    }

    async fn get_by_ip(&self, ip: IpAddr) -> Result<Option<HardwareRecord>, BackendError> {
        self.refresh().await?;
        Ok(self.cache.read().await.by_ip.get(&ip).cloned())
    }
}

fn load(path: &Path) -> Result<Indexed, BackendError> {
    let content = std::fs::read_to_string(path).map_err(|e| BackendError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    let raw: Vec<RawRecord> =
        serde_yaml::from_str(&content).map_err(|e| BackendError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;

    let mut by_mac = HashMap::with_capacity(raw.len());
    let mut by_ip = HashMap::with_capacity(raw.len());

    for record in raw {
        let mac = parse_mac(&record.mac).ok_or_else(|| BackendError::InvalidRecord {
            mac: record.mac.clone(),
            message: "invalid MAC address".to_string(),
        })?;

        if by_mac.contains_key(&mac) {
            return Err(BackendError::DuplicateMac(normalize_mac(&record.mac)));
        }

        let hw = HardwareRecord {
            mac,
            ip: record.ip,
            netmask: record.netmask,
            gateway: record.gateway,
            nameservers: record.nameservers,
            hostname: record.hostname,
            domain: record.domain,
            lease_time: record.lease_time.unwrap_or(DEFAULT_LEASE_TIME),
            vlan_id: record.vlan_id,
            netboot: Netboot {
                allow_pxe: record.netboot.allow_pxe,
                ipxe_script_url: record.netboot.ipxe_script_url,
            },
            osie: record.osie_base_url.map(|base_url| Osie { base_url }),
            facility: record.facility,
            metadata: record.metadata,
        };

        by_ip.insert(IpAddr::V4(hw.ip), hw.clone());
        by_mac.insert(mac, hw);
    }

    Ok(Indexed {
        by_mac,
        by_ip,
        mtime,
    })
}
