//! Syslog collector.
//!
//! Machines netbooted by this service are pointed here via DHCP option 7
//! and the `syslog_host` kernel argument. Datagrams are parsed just far
//! enough (RFC 3164/5424) to recover severity and origin, then handed to
//! the structured logger; the content is otherwise opaque.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;

const MAX_MESSAGE_SIZE: usize = 8192;

/// One parsed syslog datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct SyslogRecord<'a> {
    pub facility: u8,
    pub severity: u8,
    pub hostname: Option<&'a str>,
    pub app: Option<&'a str>,
    pub message: &'a str,
}

/// UDP syslog receiver.
pub struct SyslogServer {
    bind_addr: SocketAddr,
    metrics: Metrics,
}

impl SyslogServer {
    pub fn new(bind_addr: SocketAddr, metrics: Metrics) -> Self {
        Self { bind_addr, metrics }
    }

    /// Run until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind syslog socket to {}", self.bind_addr))?;

        info!("syslog server listening on {}", self.bind_addr);

        let mut buf = [0u8; MAX_MESSAGE_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            self.metrics.syslog_messages.inc();
                            let text = String::from_utf8_lossy(&buf[..len]);
                            log_record(&parse_message(&text), peer);
                        }
                        Err(e) => warn!("syslog receive error: {}", e),
                    }
                }
            }
        }

        info!("syslog server stopped");
        Ok(())
    }
}

/// Forward one record to the logger at a level mapped from its severity.
fn log_record(record: &SyslogRecord<'_>, peer: SocketAddr) {
    let host = record.hostname.unwrap_or("-");
    let app = record.app.unwrap_or("-");

    match record.severity {
        0..=3 => error!("syslog {} {} [{}]: {}", peer.ip(), host, app, record.message),
        4 => warn!("syslog {} {} [{}]: {}", peer.ip(), host, app, record.message),
        5 | 6 => info!("syslog {} {} [{}]: {}", peer.ip(), host, app, record.message),
        _ => debug!("syslog {} {} [{}]: {}", peer.ip(), host, app, record.message),
    }
}

/// Best-effort parse of a syslog datagram.
///
/// Unparseable payloads come back as a notice-severity record carrying
/// the raw text; a bad datagram never costs us the listener.
pub fn parse_message(raw: &str) -> SyslogRecord<'_> {
    let fallback = SyslogRecord {
        facility: 1,
        severity: 5,
        hostname: None,
        app: None,
        message: raw,
    };

    // <PRI>
    let Some(rest) = raw.strip_prefix('<') else {
        return fallback;
    };
    let Some((pri, rest)) = rest.split_once('>') else {
        return fallback;
    };
    let Ok(pri) = pri.parse::<u16>() else {
        return fallback;
    };
    if pri > 191 {
        return fallback;
    }

    let facility = (pri / 8) as u8;
    let severity = (pri % 8) as u8;

    if let Some(rest) = rest.strip_prefix("1 ") {
        parse_rfc5424(rest, facility, severity)
    } else {
        parse_rfc3164(rest, facility, severity)
    }
}

/// RFC 5424: TIMESTAMP HOSTNAME APP-NAME PROCID MSGID SD MSG
fn parse_rfc5424(rest: &str, facility: u8, severity: u8) -> SyslogRecord<'_> {
    let mut fields = rest.splitn(7, ' ');

    let _timestamp = fields.next();
    let hostname = fields.next().filter(|f| *f != "-");
    let app = fields.next().filter(|f| *f != "-");
    let _procid = fields.next();
    let _msgid = fields.next();
    let _structured_data = fields.next();
    let message = fields.next().unwrap_or("").trim_start();

    SyslogRecord {
        facility,
        severity,
        hostname,
        app,
        message,
    }
}

/// RFC 3164: "Mmm dd hh:mm:ss HOSTNAME TAG: MSG", with every part
/// optional in the wild.
fn parse_rfc3164(rest: &str, facility: u8, severity: u8) -> SyslogRecord<'_> {
    let mut hostname = None;
    let mut app = None;
    let mut message = rest;

    // Timestamp is exactly 15 chars when present.
    let after_timestamp = if looks_like_bsd_timestamp(rest) {
        rest[15..].trim_start()
    } else {
        rest
    };

    if let Some((first, remainder)) = after_timestamp.split_once(' ') {
        // "TAG:" directly after the timestamp means there was no hostname.
        if first.ends_with(':') {
            app = Some(first.trim_end_matches(':'));
            message = remainder.trim_start();
        } else {
            hostname = Some(first);
            message = remainder.trim_start();
            if let Some((tag, rest)) = message.split_once(' ') {
                if tag.ends_with(':') {
                    app = Some(tag.trim_end_matches(':'));
                    message = rest.trim_start();
                }
            }
        }
    }

    SyslogRecord {
        facility,
        severity,
        hostname,
        app,
        message,
    }
}

fn looks_like_bsd_timestamp(s: &str) -> bool {
    if s.len() < 16 {
        return false;
    }
    let bytes = s.as_bytes();
    bytes[..3].iter().all(|b| b.is_ascii_alphabetic())
        && bytes[3] == b' '
        && bytes[6] == b' '
        && bytes[9] == b':'
        && bytes[12] == b':'
        && bytes[15] == b' '
}
