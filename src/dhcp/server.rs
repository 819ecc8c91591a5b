//! DHCP server loop.
//!
//! Listens on UDP/67, parses each datagram and hands it to the
//! reservation handler in its own task. Replies go out on the same
//! socket, one `send_to` per reply.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dhcp::handler::ReservationHandler;
use crate::dhcp::packet::DhcpPacket;
use crate::metrics::Metrics;

/// Largest datagram we accept; a DHCP message fits an Ethernet frame.
const MAX_PACKET_SIZE: usize = 1500;

/// How long in-flight handlers may finish after shutdown.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub struct DhcpServer {
    bind_addr: SocketAddr,
    /// Interface for SO_BINDTODEVICE, so 0.0.0.0:67 here does not
    /// collide with DHCP listeners on other interfaces.
    bind_interface: Option<String>,
    handler: Arc<ReservationHandler>,
    metrics: Metrics,
}

impl DhcpServer {
    pub fn new(
        bind_addr: SocketAddr,
        bind_interface: Option<String>,
        handler: Arc<ReservationHandler>,
        metrics: Metrics,
    ) -> Self {
        Self {
            bind_addr,
            bind_interface,
            handler,
            metrics,
        }
    }

    /// Run until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = Arc::new(self.bind()?);
        info!("DHCP server listening on {}", self.bind_addr);

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            error!("DHCP receive error: {}", e);
                            continue;
                        }
                    };

                    self.metrics.dhcp_packets_received.inc();

                    let packet = match DhcpPacket::parse(&buf[..len]) {
                        Ok(p) => p,
                        Err(e) => {
                            self.metrics.dhcp_packets_malformed.inc();
                            debug!("dropping malformed packet from {}: {}", peer, e);
                            continue;
                        }
                    };

                    let socket = Arc::clone(&socket);
                    let handler = Arc::clone(&self.handler);
                    let metrics = self.metrics.clone();
                    inflight.spawn(async move {
                        match handler.handle(&packet).await {
                            Some(reply) => {
                                let bytes = reply.packet.encode();
                                match socket.send_to(&bytes, reply.destination).await {
                                    Ok(_) => metrics.dhcp_packets_replied.inc(),
                                    Err(e) => {
                                        warn!("failed to send DHCP reply to {}: {}", reply.destination, e);
                                    }
                                }
                            }
                            None => metrics.dhcp_packets_ignored.inc(),
                        }
                    });
                }
            }
        }

        // Let in-flight handlers finish within the grace window.
        let drain = async {
            while inflight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace expired with DHCP handlers still running");
            inflight.abort_all();
        }

        info!("DHCP server stopped");
        Ok(())
    }

    /// Build the listening socket: reuse-addr + broadcast, optionally
    /// pinned to one interface.
    fn bind(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create socket")?;

        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        #[cfg(target_os = "linux")]
        if let Some(ref iface) = self.bind_interface {
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            let iface_bytes = iface.as_bytes();
            let result = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_BINDTODEVICE,
                    iface_bytes.as_ptr() as *const libc::c_void,
                    iface_bytes.len() as libc::socklen_t,
                )
            };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                anyhow::bail!("Failed to bind to interface {}: {}", iface, err);
            }
            info!("bound DHCP socket to interface {}", iface);
        }

        socket
            .bind(&self.bind_addr.into())
            .with_context(|| format!("Failed to bind to {}", self.bind_addr))?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into()).context("Failed to register socket with tokio")
    }
}
