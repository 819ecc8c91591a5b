//! Service configuration.
//!
//! One section per subsystem, each with an `enabled` switch and a bind
//! address. Anything invalid here is fatal at startup; the listeners
//! never see a half-checked config.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use nix::ifaddrs::getifaddrs;

use crate::error::AppError;
use crate::http::TrustedProxies;

/// Bounds for the TFTP block size knob (RFC 2348, minus UDP overhead).
const TFTP_BLOCK_SIZE_MIN: usize = 512;
const TFTP_BLOCK_SIZE_MAX: usize = 65456;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub syslog: SyslogConfig,
    pub tftp: TftpConfig,
    pub http: HttpConfig,
    pub dhcp: DhcpConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone)]
pub struct SyslogConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct TftpConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    /// Upper bound for negotiated block sizes.
    pub block_size: usize,
    /// Per-block retransmission budget.
    pub timeout: Duration,
    /// Directory holding the iPXE binaries loaded at startup.
    pub ipxe_dir: PathBuf,
    /// iPXE script fragment spliced into served binaries.
    pub ipxe_patch: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub binary_enabled: bool,
    pub script_enabled: bool,
    pub bind_addr: SocketAddr,
    /// Root URL of the OSIE images referenced by the boot script.
    pub osie_url: String,
    /// Extra kernel args appended verbatim (whitespace separated).
    pub extra_kernel_args: String,
    /// Workflow server address, host:port.
    pub tink_server: String,
    pub tink_server_tls: bool,
    /// Comma separated CIDR list; bare IPs promote to host masks.
    pub trusted_proxies: String,
}

#[derive(Debug, Clone)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    /// Interface for SO_BINDTODEVICE.
    pub bind_interface: Option<String>,
    /// Address advertised in option 54. The host may have several IPs;
    /// exactly this one goes on the wire.
    pub ip_for_packet: Ipv4Addr,
    /// Syslog collector advertised in option 7.
    pub syslog_ip: Ipv4Addr,
    /// TFTP server advertised as next-server/option 66.
    pub tftp_ip: Ipv4Addr,
    /// Base URL for iPXE binaries over HTTP.
    pub http_ipxe_binary_url: String,
    pub http_ipxe_script: ScriptUrlConfig,
}

#[derive(Debug, Clone)]
pub struct ScriptUrlConfig {
    /// iPXE script URL handed to clients that already run iPXE.
    pub url: String,
    /// Splice the client MAC into the URL path:
    /// `http://1.2.3.4/auto.ipxe` -> `http://1.2.3.4/<mac>/auto.ipxe`.
    pub inject_mac: bool,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub file_enabled: bool,
    pub file_path: Option<PathBuf>,
}

impl Config {
    /// Check everything that must hold before any listener starts.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.dhcp.enabled || self.http.script_enabled {
            if !self.backend.file_enabled {
                return Err(AppError::Config(
                    "DHCP or the iPXE script server is enabled but no backend is".to_string(),
                ));
            }
        }

        if self.backend.file_enabled && self.backend.file_path.is_none() {
            return Err(AppError::Config(
                "file backend is enabled but no file path is set".to_string(),
            ));
        }

        if self.tftp.enabled
            && !(TFTP_BLOCK_SIZE_MIN..=TFTP_BLOCK_SIZE_MAX).contains(&self.tftp.block_size)
        {
            return Err(AppError::Config(format!(
                "tftp block size {} outside {}..={}",
                self.tftp.block_size, TFTP_BLOCK_SIZE_MIN, TFTP_BLOCK_SIZE_MAX
            )));
        }

        if self.dhcp.enabled && self.dhcp.ip_for_packet.is_unspecified() {
            return Err(AppError::Config(
                "no usable IPv4 address for DHCP replies; set --dhcp-ip-for-packet".to_string(),
            ));
        }

        if self.dhcp.enabled {
            for url in [
                &self.dhcp.http_ipxe_binary_url,
                &self.dhcp.http_ipxe_script.url,
            ] {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(AppError::Config(format!("not an HTTP URL: {url}")));
                }
            }
        }

        // Parsed again where it is used; parsed here so a typo aborts
        // startup instead of quietly changing who gets believed.
        TrustedProxies::parse(&self.http.trusted_proxies)
            .map_err(|e| AppError::Config(e.to_string()))?;

        Ok(())
    }
}

/// First global-unicast IPv4 address of this host, for flag defaults.
pub fn detect_public_ipv4() -> Option<Ipv4Addr> {
    let addrs = getifaddrs().ok()?;
    for addr in addrs {
        if let Some(storage) = addr.address {
            if let Some(sockaddr) = storage.as_sockaddr_in() {
                let ip = Ipv4Addr::from(sockaddr.ip());
                if !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified() {
                    return Some(ip);
                }
            }
        }
    }
    None
}
