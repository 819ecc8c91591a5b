//! Prometheus metrics for all listeners.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Counters shared by the DHCP, TFTP, HTTP and syslog listeners.
///
/// All counters are atomic; the struct is cheap to clone and safe to
/// share across tasks.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub dhcp_packets_received: IntCounter,
    pub dhcp_packets_replied: IntCounter,
    pub dhcp_packets_ignored: IntCounter,
    pub dhcp_packets_malformed: IntCounter,

    pub tftp_transfers_opened: IntCounter,
    pub tftp_transfers_completed: IntCounter,
    pub tftp_transfers_failed: IntCounter,

    /// HTTP requests by handler ("script" or "binary") and status code.
    pub http_requests: IntCounterVec,

    pub syslog_messages: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let dhcp_packets_received = IntCounter::with_opts(Opts::new(
            "gantry_dhcp_packets_received_total",
            "DHCP packets received",
        ))?;
        let dhcp_packets_replied = IntCounter::with_opts(Opts::new(
            "gantry_dhcp_packets_replied_total",
            "DHCP replies sent",
        ))?;
        let dhcp_packets_ignored = IntCounter::with_opts(Opts::new(
            "gantry_dhcp_packets_ignored_total",
            "DHCP packets deliberately left unanswered",
        ))?;
        let dhcp_packets_malformed = IntCounter::with_opts(Opts::new(
            "gantry_dhcp_packets_malformed_total",
            "DHCP packets that failed to parse",
        ))?;

        let tftp_transfers_opened = IntCounter::with_opts(Opts::new(
            "gantry_tftp_transfers_opened_total",
            "TFTP transfers started",
        ))?;
        let tftp_transfers_completed = IntCounter::with_opts(Opts::new(
            "gantry_tftp_transfers_completed_total",
            "TFTP transfers completed",
        ))?;
        let tftp_transfers_failed = IntCounter::with_opts(Opts::new(
            "gantry_tftp_transfers_failed_total",
            "TFTP transfers aborted",
        ))?;

        let http_requests = IntCounterVec::new(
            Opts::new("gantry_http_requests_total", "HTTP requests"),
            &["handler", "status"],
        )?;

        let syslog_messages = IntCounter::with_opts(Opts::new(
            "gantry_syslog_messages_total",
            "Syslog messages received",
        ))?;

        registry.register(Box::new(dhcp_packets_received.clone()))?;
        registry.register(Box::new(dhcp_packets_replied.clone()))?;
        registry.register(Box::new(dhcp_packets_ignored.clone()))?;
        registry.register(Box::new(dhcp_packets_malformed.clone()))?;
        registry.register(Box::new(tftp_transfers_opened.clone()))?;
        registry.register(Box::new(tftp_transfers_completed.clone()))?;
        registry.register(Box::new(tftp_transfers_failed.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(syslog_messages.clone()))?;

        Ok(Self {
            registry,
            dhcp_packets_received,
            dhcp_packets_replied,
            dhcp_packets_ignored,
            dhcp_packets_malformed,
            tftp_transfers_opened,
            tftp_transfers_completed,
            tftp_transfers_failed,
            http_requests,
            syslog_messages,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
