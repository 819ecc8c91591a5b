//! Hardware inventory access.
//!
//! The DHCP handler and the iPXE script renderer only ever see the
//! [`BackendReader`] trait; the concrete store behind it is chosen at
//! startup.

pub mod file;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use macaddr::MacAddr6;
use thiserror::Error;

/// Default DHCP lease time in seconds when a record does not set one.
pub const DEFAULT_LEASE_TIME: u32 = 3600;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid record for {mac}: {message}")]
    InvalidRecord { mac: String, message: String },

    #[error("duplicate MAC {0} in inventory")]
    DuplicateMac(String),
}

/// Netboot policy for one machine.
#[derive(Debug, Clone, Default)]
pub struct Netboot {
    /// Gate for the whole boot chain. When false the DHCP handler stays
    /// silent for this client and the script endpoint returns 403.
    pub allow_pxe: bool,
    /// Per-machine override for the iPXE script URL (used verbatim).
    pub ipxe_script_url: Option<String>,
}

/// Per-machine override for the OSIE image location.
#[derive(Debug, Clone)]
pub struct Osie {
    pub base_url: String,
}

/// One known machine, keyed by MAC.
///
/// The inventory owns these; the service only reads them.
#[derive(Debug, Clone)]
pub struct HardwareRecord {
    pub mac: MacAddr6,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub nameservers: Vec<Ipv4Addr>,
    pub hostname: Option<String>,
    pub domain: Option<String>,
    pub lease_time: u32,
    pub vlan_id: Option<u16>,
    pub netboot: Netboot,
    pub osie: Option<Osie>,
    pub facility: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Read-only inventory lookups.
///
/// A miss is `Ok(None)`, never an error; errors mean the store itself
/// failed. Implementations must be safe for concurrent callers. Callers
/// bound each lookup with a deadline (`tokio::time::timeout`).
#[async_trait]
pub trait BackendReader: Send + Sync {
    async fn get_by_mac(&self, mac: MacAddr6) -> Result<Option<HardwareRecord>, BackendError>;

    async fn get_by_ip(&self, ip: IpAddr) -> Result<Option<HardwareRecord>, BackendError>;
}

/// Normalize a MAC address string to lowercase colon form.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().replace('-', ":").to_lowercase()
}

/// Parse a MAC address in colon or hyphen form.
pub fn parse_mac(mac: &str) -> Option<MacAddr6> {
    let normalized = normalize_mac(mac);
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut octets = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        octets[i] = u8::from_str_radix(part, 16).ok()?;
    }

    Some(MacAddr6::new(
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_colon() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some(MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff))
        );
    }

    #[test]
    fn test_parse_mac_hyphen() {
        assert_eq!(
            parse_mac("AA-BB-CC-DD-EE-01"),
            Some(MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01))
        );
    }

    #[test]
    fn test_parse_mac_invalid() {
        assert_eq!(parse_mac("not-a-mac"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:gg"), None);
        assert_eq!(parse_mac(""), None);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize_mac(" aa:bb:cc:dd:ee:ff "), "aa:bb:cc:dd:ee:ff");
    }
}
