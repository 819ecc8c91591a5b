//! Gantry - DHCP and network boot service for bare-metal provisioning.
//!
//! One process co-hosts four listeners: a DHCPv4 server that steers
//! machines through the iPXE chain-loading sequence, a single-port TFTP
//! server and an HTTP server delivering iPXE binaries and per-machine
//! boot scripts, and a syslog collector for the booting machines. All
//! hardware knowledge lives in a pluggable inventory backend; the
//! service itself keeps no state.

pub mod backend;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod http;
pub mod ipxe;
pub mod metrics;
pub mod syslog;
pub mod tftp;
