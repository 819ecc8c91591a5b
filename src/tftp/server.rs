//! Single-port TFTP server.
//!
//! Implements RFC 1350 with RFC 2347 (options), RFC 2348 (blksize) and
//! RFC 2349 (timeout). Every packet of every transfer flows over the
//! one listening socket; no ephemeral data port is ever opened. NAT and
//! strict firewalls drop the classic ephemeral-port callback, so
//! single-port is the only mode.
//!
//! The server is read-only and serves exclusively the in-memory iPXE
//! binary set, patched at first serve.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ipxe::IpxeBinaries;
use crate::metrics::Metrics;

/// TFTP opcodes
const OPCODE_RRQ: u16 = 1; // Read request
const OPCODE_WRQ: u16 = 2; // Write request (not supported)
const OPCODE_DATA: u16 = 3; // Data packet
const OPCODE_ACK: u16 = 4; // Acknowledgment
const OPCODE_ERROR: u16 = 5; // Error
const OPCODE_OACK: u16 = 6; // Option acknowledgment (RFC 2347)

/// TFTP error codes
const ERROR_NOT_DEFINED: u16 = 0;
const ERROR_FILE_NOT_FOUND: u16 = 1;
const ERROR_ACCESS_VIOLATION: u16 = 2;

/// Default block size
const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest and largest negotiable block size.
const MIN_BLOCK_SIZE: usize = 512;
const MAX_BLOCK_SIZE: usize = 65456;

/// First retransmit delay; doubles per retry until the block timeout.
const RETRANSMIT_INITIAL: Duration = Duration::from_millis(500);

/// How often stalled sessions are checked.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// One in-flight transfer, keyed by peer address.
struct Session {
    filename: String,
    data: Arc<Vec<u8>>,
    block_size: usize,
    /// Per-block deadline; a block not acked within it aborts the session.
    timeout: Duration,
    /// Block currently on the wire (0 while waiting for the OACK ack).
    current_block: u16,
    /// Last packet sent, kept verbatim for retransmission.
    last_packet: Vec<u8>,
    block_started: Instant,
    last_sent: Instant,
    retransmits: u32,
    /// The final short block has been sent; its ack ends the session.
    finished: bool,
}

impl Session {
    /// Byte range of a data block (1-based).
    fn chunk(&self, block: u16) -> &[u8] {
        let start = (block as usize - 1) * self.block_size;
        let end = (start + self.block_size).min(self.data.len());
        &self.data[start.min(self.data.len())..end]
    }
}

/// TFTP server for the iPXE binary set.
pub struct TftpServer {
    bind_addr: SocketAddr,
    binaries: Arc<IpxeBinaries>,
    /// Upper bound for negotiated block sizes.
    max_block_size: usize,
    /// Default per-block timeout; RFC 2349 lets the client override it.
    timeout: Duration,
    metrics: Metrics,
}

impl TftpServer {
    pub fn new(
        bind_addr: SocketAddr,
        binaries: Arc<IpxeBinaries>,
        max_block_size: usize,
        timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            bind_addr,
            binaries,
            max_block_size: max_block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
            timeout,
            metrics,
        }
    }

    /// Run until the shutdown channel flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind TFTP socket to {}", self.bind_addr))?;

        info!("TFTP server listening on {}", self.bind_addr);
        self.serve(socket, shutdown).await
    }

    async fn serve(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut buf = [0u8; 4 + MAX_BLOCK_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sweep.tick() => {
                    self.sweep(&socket, &mut sessions).await;
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) if len >= 4 => {
                            self.dispatch(&socket, &mut sessions, &buf[..len], peer).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("TFTP receive error: {}", e),
                    }
                }
            }
        }

        info!("TFTP server stopped");
        Ok(())
    }

    async fn dispatch(
        &self,
        socket: &UdpSocket,
        sessions: &mut HashMap<SocketAddr, Session>,
        packet: &[u8],
        peer: SocketAddr,
    ) {
        let opcode = u16::from_be_bytes([packet[0], packet[1]]);

        match opcode {
            OPCODE_RRQ => self.open_session(socket, sessions, &packet[2..], peer).await,
            OPCODE_ACK => {
                let block = u16::from_be_bytes([packet[2], packet[3]]);
                self.advance_session(socket, sessions, block, peer).await;
            }
            OPCODE_WRQ => {
                warn!("TFTP write request from {} denied (read-only server)", peer);
                send_error(socket, peer, ERROR_ACCESS_VIOLATION, "Write not supported").await;
            }
            OPCODE_ERROR => {
                if let Some(session) = sessions.remove(&peer) {
                    self.metrics.tftp_transfers_failed.inc();
                    debug!("TFTP client {} aborted transfer of {}", peer, session.filename);
                }
            }
            _ => debug!("TFTP unknown opcode {} from {}", opcode, peer),
        }
    }

    async fn open_session(
        &self,
        socket: &UdpSocket,
        sessions: &mut HashMap<SocketAddr, Session>,
        request: &[u8],
        peer: SocketAddr,
    ) {
        let Some((filename, _mode, options)) = parse_rrq(request) else {
            send_error(socket, peer, ERROR_NOT_DEFINED, "Malformed read request").await;
            return;
        };

        let Some(data) = self.binaries.get(&filename) else {
            info!("TFTP: {} requested unknown file {}", peer, filename);
            send_error(socket, peer, ERROR_FILE_NOT_FOUND, "File not found").await;
            return;
        };

        info!("TFTP: {} requesting {} ({} bytes)", peer, filename, data.len());
        self.metrics.tftp_transfers_opened.inc();

        let block_size = options
            .get("blksize")
            .and_then(|v| v.parse::<usize>().ok())
            .map(|requested| clamp_block_size(requested, self.max_block_size))
            .unwrap_or(DEFAULT_BLOCK_SIZE);

        let timeout = options
            .get("timeout")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&secs| (1..=255).contains(&secs))
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);

        let now = Instant::now();
        let mut session = Session {
            filename,
            data,
            block_size,
            timeout,
            current_block: 0,
            last_packet: Vec::new(),
            block_started: now,
            last_sent: now,
            retransmits: 0,
            finished: false,
        };

        let negotiated = negotiated_options(&options, block_size, timeout, session.data.len());
        if negotiated.is_empty() {
            // No options: straight to the first data block.
            session.current_block = 1;
            session.finished = session.chunk(1).len() < session.block_size;
            session.last_packet = build_data_packet(1, session.chunk(1));
        } else {
            session.last_packet = build_oack(&negotiated);
        }

        if socket.send_to(&session.last_packet, peer).await.is_ok() {
            // A re-sent RRQ replaces any previous session from this peer.
            sessions.insert(peer, session);
        }
    }

    async fn advance_session(
        &self,
        socket: &UdpSocket,
        sessions: &mut HashMap<SocketAddr, Session>,
        block: u16,
        peer: SocketAddr,
    ) {
        let Some(session) = sessions.get_mut(&peer) else {
            return;
        };

        if block != session.current_block {
            // Stale or duplicate ack; the sweep timer resends if needed.
            return;
        }

        if session.finished {
            info!(
                "TFTP: transfer complete: {} to {} ({} bytes)",
                session.filename,
                peer,
                session.data.len()
            );
            self.metrics.tftp_transfers_completed.inc();
            sessions.remove(&peer);
            return;
        }

        let next = session.current_block.wrapping_add(1);
        let packet = build_data_packet(next, session.chunk(next));
        session.finished = packet.len() - 4 < session.block_size;
        session.last_packet = packet;
        session.current_block = next;
        session.retransmits = 0;
        let now = Instant::now();
        session.block_started = now;
        session.last_sent = now;

        if let Err(e) = socket.send_to(&session.last_packet, peer).await {
            warn!("TFTP send to {} failed: {}", peer, e);
        }
    }

    /// Retransmit stalled blocks with exponential backoff; abort sessions
    /// whose per-block timeout expired.
    async fn sweep(&self, socket: &UdpSocket, sessions: &mut HashMap<SocketAddr, Session>) {
        let now = Instant::now();
        let mut expired = Vec::new();

        for (peer, session) in sessions.iter_mut() {
            if now.duration_since(session.block_started) >= session.timeout {
                expired.push(*peer);
                continue;
            }

            let backoff = RETRANSMIT_INITIAL * 2u32.saturating_pow(session.retransmits);
            if now.duration_since(session.last_sent) >= backoff {
                session.retransmits += 1;
                session.last_sent = now;
                debug!(
                    "TFTP: retransmit {} of block {} for {}",
                    session.retransmits, session.current_block, peer
                );
                let _ = socket.send_to(&session.last_packet, *peer).await;
            }
        }

        for peer in expired {
            if let Some(session) = sessions.remove(&peer) {
                warn!(
                    "TFTP: transfer of {} to {} timed out at block {}",
                    session.filename, peer, session.current_block
                );
                self.metrics.tftp_transfers_failed.inc();
                send_error(socket, peer, ERROR_NOT_DEFINED, "Transfer timed out").await;
            }
        }
    }
}

/// Clamp a requested block size into the negotiable range.
fn clamp_block_size(requested: usize, server_max: usize) -> usize {
    requested.clamp(MIN_BLOCK_SIZE, server_max.min(MAX_BLOCK_SIZE))
}

/// Parse an RRQ payload: filename, mode, then option name/value pairs.
fn parse_rrq(request: &[u8]) -> Option<(String, String, HashMap<String, String>)> {
    let mut parts = request.split(|&b| b == 0);

    let filename = std::str::from_utf8(parts.next()?).ok()?;
    if filename.is_empty() {
        return None;
    }
    let mode = std::str::from_utf8(parts.next()?).ok()?.to_lowercase();

    let mut options = HashMap::new();
    loop {
        let Some(name) = parts.next() else { break };
        let Some(value) = parts.next() else { break };
        if name.is_empty() || value.is_empty() {
            continue;
        }
        if let (Ok(name), Ok(value)) = (std::str::from_utf8(name), std::str::from_utf8(value)) {
            options.insert(name.to_lowercase(), value.to_string());
        }
    }

    Some((filename.to_string(), mode, options))
}

/// Options to echo in the OACK, in a stable order.
fn negotiated_options(
    requested: &HashMap<String, String>,
    block_size: usize,
    timeout: Duration,
    transfer_size: usize,
) -> Vec<(String, String)> {
    let mut negotiated = Vec::new();
    if requested.contains_key("blksize") {
        negotiated.push(("blksize".to_string(), block_size.to_string()));
    }
    if requested.contains_key("timeout") {
        negotiated.push(("timeout".to_string(), timeout.as_secs().to_string()));
    }
    if requested.contains_key("tsize") {
        negotiated.push(("tsize".to_string(), transfer_size.to_string()));
    }
    negotiated
}

fn build_oack(options: &[(String, String)]) -> Vec<u8> {
    let mut packet = OPCODE_OACK.to_be_bytes().to_vec();
    for (name, value) in options {
        packet.extend_from_slice(name.as_bytes());
        packet.push(0);
        packet.extend_from_slice(value.as_bytes());
        packet.push(0);
    }
    packet
}

fn build_data_packet(block: u16, chunk: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + chunk.len());
    packet.extend_from_slice(&OPCODE_DATA.to_be_bytes());
    packet.extend_from_slice(&block.to_be_bytes());
    packet.extend_from_slice(chunk);
    packet
}

async fn send_error(socket: &UdpSocket, peer: SocketAddr, code: u16, message: &str) {
    let mut packet = Vec::with_capacity(5 + message.len());
    packet.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet.push(0);

    let _ = socket.send_to(&packet, peer).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server(content_len: usize) -> Arc<TftpServer> {
        let mut files = HashMap::new();
        files.insert("undionly.kpxe".to_string(), vec![0xAAu8; content_len]);
        let binaries = Arc::new(IpxeBinaries::from_map(files, &b""[..]));

        Arc::new(TftpServer::new(
            "127.0.0.1:0".parse().unwrap(),
            binaries,
            MAX_BLOCK_SIZE,
            Duration::from_secs(5),
            Metrics::new().unwrap(),
        ))
    }

    /// Spawn the server on an ephemeral localhost port, return its addr
    /// and a client socket plus the shutdown sender keeping it alive.
    async fn spawn_server(
        server: Arc<TftpServer>,
    ) -> (SocketAddr, UdpSocket, watch::Sender<bool>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            let _ = server.serve(socket, rx).await;
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (addr, client, tx)
    }

    fn rrq(filename: &str, options: &[(&str, &str)]) -> Vec<u8> {
        let mut packet = OPCODE_RRQ.to_be_bytes().to_vec();
        packet.extend_from_slice(filename.as_bytes());
        packet.push(0);
        packet.extend_from_slice(b"octet\0");
        for (name, value) in options {
            packet.extend_from_slice(name.as_bytes());
            packet.push(0);
            packet.extend_from_slice(value.as_bytes());
            packet.push(0);
        }
        packet
    }

    fn ack(block: u16) -> Vec<u8> {
        let mut packet = OPCODE_ACK.to_be_bytes().to_vec();
        packet.extend_from_slice(&block.to_be_bytes());
        packet
    }

    #[test]
    fn test_parse_rrq_plain() {
        let packet = rrq("undionly.kpxe", &[]);
        let (filename, mode, options) = parse_rrq(&packet[2..]).unwrap();
        assert_eq!(filename, "undionly.kpxe");
        assert_eq!(mode, "octet");
        assert!(options.is_empty());
    }

    #[test]
    fn test_parse_rrq_with_options() {
        let packet = rrq("ipxe.efi", &[("blksize", "4096"), ("tsize", "0")]);
        let (filename, _, options) = parse_rrq(&packet[2..]).unwrap();
        assert_eq!(filename, "ipxe.efi");
        assert_eq!(options.get("blksize").unwrap(), "4096");
        assert_eq!(options.get("tsize").unwrap(), "0");
    }

    #[test]
    fn test_parse_rrq_empty_filename() {
        assert!(parse_rrq(b"\0octet\0").is_none());
    }

    #[test]
    fn test_clamp_block_size() {
        assert_eq!(clamp_block_size(4096, MAX_BLOCK_SIZE), 4096);
        assert_eq!(clamp_block_size(8, MAX_BLOCK_SIZE), MIN_BLOCK_SIZE);
        assert_eq!(clamp_block_size(100_000, MAX_BLOCK_SIZE), MAX_BLOCK_SIZE);
        assert_eq!(clamp_block_size(4096, 1024), 1024);
    }

    #[test]
    fn test_build_data_packet() {
        let packet = build_data_packet(3, b"abc");
        assert_eq!(&packet[..2], &OPCODE_DATA.to_be_bytes());
        assert_eq!(&packet[2..4], &3u16.to_be_bytes());
        assert_eq!(&packet[4..], b"abc");
    }

    #[test]
    fn test_build_oack() {
        let packet = build_oack(&[("blksize".to_string(), "4096".to_string())]);
        assert_eq!(&packet[..2], &OPCODE_OACK.to_be_bytes());
        assert_eq!(&packet[2..], b"blksize\x004096\x00");
    }

    // blksize negotiation, then full-size data blocks.
    #[tokio::test]
    async fn test_blksize_negotiation() {
        let (addr, client, _tx) = spawn_server(test_server(5000)).await;

        client.send_to(&rrq("undionly.kpxe", &[("blksize", "4096")]), addr)
            .await
            .unwrap();

        let mut buf = [0u8; 65536];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_OACK);
        assert_eq!(&buf[2..len], b"blksize\x004096\x00");

        // Ack the OACK, expect a 4096-byte first block.
        client.send_to(&ack(0), addr).await.unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_DATA);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 1);
        assert_eq!(len - 4, 4096);

        // Second block is the 904-byte remainder.
        client.send_to(&ack(1), addr).await.unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 2);
        assert_eq!(len - 4, 904);
    }

    #[tokio::test]
    async fn test_transfer_without_options() {
        let (addr, client, _tx) = spawn_server(test_server(700)).await;

        client.send_to(&rrq("undionly.kpxe", &[]), addr).await.unwrap();

        // No options means no OACK: data block 1 arrives directly.
        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_DATA);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 1);
        assert_eq!(len - 4, DEFAULT_BLOCK_SIZE);

        client.send_to(&ack(1), addr).await.unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 2);
        assert_eq!(len - 4, 188);
    }

    #[tokio::test]
    async fn test_unknown_file_gets_not_found() {
        let (addr, client, _tx) = spawn_server(test_server(100)).await;

        client.send_to(&rrq("missing.bin", &[]), addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (_, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_ERROR);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), ERROR_FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrq_rejected() {
        let (addr, client, _tx) = spawn_server(test_server(100)).await;

        let mut packet = OPCODE_WRQ.to_be_bytes().to_vec();
        packet.extend_from_slice(b"upload.bin\0octet\0");
        client.send_to(&packet, addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (_, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_ERROR);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), ERROR_ACCESS_VIOLATION);
    }

    #[tokio::test]
    async fn test_tsize_reports_length() {
        let (addr, client, _tx) = spawn_server(test_server(12345)).await;

        client.send_to(&rrq("undionly.kpxe", &[("tsize", "0")]), addr)
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_OACK);
        assert_eq!(&buf[2..len], b"tsize\x0012345\x00");
    }
}
