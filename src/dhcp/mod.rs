//! DHCPv4 service: wire codec, netboot decision engine, and server loop.

pub mod arch;
pub mod handler;
pub mod packet;
pub mod server;

pub use arch::ClientArch;
pub use handler::{BootStage, ReservationHandler};
pub use packet::{DhcpMessageType, DhcpOption, DhcpPacket, ParseError};
pub use server::DhcpServer;

/// DHCP server port.
pub const SERVER_PORT: u16 = 67;
/// DHCP client port.
pub const CLIENT_PORT: u16 = 68;
