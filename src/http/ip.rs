//! Client IP resolution behind reverse proxies.
//!
//! X-Forwarded-For is only ever believed when the socket peer itself is
//! a configured trusted proxy; anyone else can claim whatever they want
//! in that header.

use std::net::IpAddr;

use anyhow::{anyhow, Result};
use ipnetwork::IpNetwork;

/// CIDR allowlist of reverse proxies.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNetwork>,
}

impl TrustedProxies {
    /// Parse a comma separated list of CIDRs. Bare IPs are promoted to
    /// host masks. Any entry that parses as neither is a hard error:
    /// a silently skipped proxy entry would change who gets believed.
    pub fn parse(input: &str) -> Result<Self> {
        let mut networks = Vec::new();

        for entry in input.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let network = match entry.parse::<IpNetwork>() {
                Ok(network) => network,
                Err(_) => {
                    let ip: IpAddr = entry
                        .parse()
                        .map_err(|_| anyhow!("invalid trusted proxy entry: {entry}"))?;
                    let prefix = match ip {
                        IpAddr::V4(_) => 32,
                        IpAddr::V6(_) => 128,
                    };
                    IpNetwork::new(ip, prefix)
                        .map_err(|_| anyhow!("invalid trusted proxy entry: {entry}"))?
                }
            };
            networks.push(network);
        }

        Ok(Self { networks })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }

    /// Resolve the client address for a request.
    ///
    /// When the peer is trusted, X-Forwarded-For is walked right to
    /// left and the first untrusted hop is the client. An untrusted
    /// peer is always taken at face value.
    pub fn client_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.contains(peer) {
            return peer;
        }

        let Some(forwarded_for) = forwarded_for else {
            return peer;
        };

        let hops: Vec<IpAddr> = forwarded_for
            .split(',')
            .filter_map(|hop| hop.trim().parse().ok())
            .collect();

        for hop in hops.iter().rev() {
            if !self.contains(*hop) {
                return *hop;
            }
        }

        // Every listed hop is a trusted proxy; the leftmost one is the
        // closest thing to a client address we have.
        hops.first().copied().unwrap_or(peer)
    }
}
