//! The netboot decision engine.
//!
//! Takes one parsed DHCPv4 request, consults the inventory, and either
//! produces a reply that advances the client through the iPXE chain or
//! decides to stay silent. The handler keeps no per-client state: each
//! chain stage re-DISCOVERs, and the user-class flip after iPXE loads is
//! the only progress signal.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{BackendReader, HardwareRecord};
use crate::dhcp::arch::ClientArch;
use crate::dhcp::packet::{DhcpMessageType, DhcpOption, DhcpPacket};
use crate::dhcp::CLIENT_PORT;
use crate::dhcp::SERVER_PORT;

/// PXE vendor option 43 sub-option codes.
const PXE_DISCOVERY_CONTROL: u8 = 6;
const PXE_BOOT_MENU: u8 = 9;
const PXE_MENU_PROMPT: u8 = 10;

/// Discovery control 0x08: skip the boot server menu, boot from option 67.
const PXE_SKIP_MENU: u8 = 0x08;

/// User classes that mark a client already running iPXE.
const IPXE_USER_CLASSES: [&str; 2] = ["iPXE", "Tinkerbell"];

/// Which artifact the reply steers the client to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    /// Firmware PXE fetching an iPXE binary over TFTP.
    TftpBin,
    /// UEFI HTTP Boot fetching an iPXE binary over HTTP.
    HttpBin,
    /// iPXE fetching the operator script over HTTP.
    HttpScript,
}

/// Netboot fields of one reply, derived from request x record.
#[derive(Debug, Clone)]
pub struct BootDecision {
    pub stage: BootStage,
    pub next_server: Ipv4Addr,
    pub boot_file_name: String,
    pub server_name: Option<String>,
}

/// A reply ready to be encoded and sent.
#[derive(Debug)]
pub struct DhcpReply {
    pub packet: DhcpPacket,
    pub destination: SocketAddr,
}

/// Reservation-based DHCP handler.
///
/// Every decision is derived from the incoming packet and the inventory
/// record; nothing is cached between packets.
pub struct ReservationHandler {
    backend: Arc<dyn BackendReader>,
    /// Address placed in option 54 (and used for option 66/urls). The
    /// host may have several IPs; exactly this one is advertised.
    ip_for_packet: Ipv4Addr,
    /// Syslog collector advertised in option 7.
    syslog_ip: Ipv4Addr,
    /// TFTP server for the firmware-PXE stage (next-server/option 66).
    tftp_ip: Ipv4Addr,
    /// Base URL for iPXE binaries over HTTP, e.g. `http://10.0.0.1:8080/ipxe`.
    http_binary_url: String,
    /// Global iPXE script URL, e.g. `http://10.0.0.1/auto.ipxe`.
    script_url: String,
    /// Splice the client MAC into the script URL path.
    inject_mac: bool,
    backend_timeout: Duration,
}

impl ReservationHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn BackendReader>,
        ip_for_packet: Ipv4Addr,
        syslog_ip: Ipv4Addr,
        tftp_ip: Ipv4Addr,
        http_binary_url: impl Into<String>,
        script_url: impl Into<String>,
        inject_mac: bool,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            ip_for_packet,
            syslog_ip,
            tftp_ip,
            http_binary_url: http_binary_url.into(),
            script_url: script_url.into(),
            inject_mac,
            backend_timeout,
        }
    }

    /// Handle one request. `None` means stay silent.
    pub async fn handle(&self, request: &DhcpPacket) -> Option<DhcpReply> {
        if !request.is_request() {
            return None;
        }

        let reply_type = match request.message_type()? {
            DhcpMessageType::Discover => DhcpMessageType::Offer,
            DhcpMessageType::Request | DhcpMessageType::Inform => DhcpMessageType::Ack,
            other => {
                debug!("ignoring DHCP {} from {}", other, request.chaddr);
                return None;
            }
        };

        let record = match tokio::time::timeout(
            self.backend_timeout,
            self.backend.get_by_mac(request.chaddr),
        )
        .await
        {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                // Unknown clients get silence, never a NAK: other DHCP
                // servers on the LAN may own them.
                debug!("no reservation for {}, staying silent", request.chaddr);
                return None;
            }
            Ok(Err(e)) => {
                warn!("backend lookup for {} failed: {}", request.chaddr, e);
                return None;
            }
            Err(_) => {
                warn!("backend lookup for {} timed out", request.chaddr);
                return None;
            }
        };

        if !record.netboot.allow_pxe {
            debug!("netboot disabled for {}, staying silent", request.chaddr);
            return None;
        }

        if request.message_type() == Some(DhcpMessageType::Request) {
            let requested = request.requested_ip().or({
                if request.ciaddr.is_unspecified() {
                    None
                } else {
                    Some(request.ciaddr)
                }
            });
            if let Some(requested) = requested {
                if requested != record.ip {
                    info!(
                        "{} requested {} but is reserved {}, sending NAK",
                        request.chaddr, requested, record.ip
                    );
                    return Some(self.nak(request));
                }
            }
        }

        let decision = self.decide(request, &record);
        info!(
            "DHCP {} for {} -> {} (stage {:?}, next-server {})",
            reply_type, request.chaddr, decision.boot_file_name, decision.stage, decision.next_server
        );

        let mut reply = DhcpPacket::reply_to(request, reply_type);
        reply
            .options
            .push(DhcpOption::ServerIdentifier(self.ip_for_packet));

        // INFORM gets option 54 and the netboot subset, never lease fields.
        if request.message_type() != Some(DhcpMessageType::Inform) {
            reply.yiaddr = record.ip;
            self.push_lease_options(&mut reply, &record);
        }

        self.push_netboot_options(&mut reply, request, &decision);

        Some(DhcpReply {
            destination: reply_destination(request),
            packet: reply,
        })
    }

    /// Standard lease options from the reservation.
    fn push_lease_options(&self, reply: &mut DhcpPacket, record: &HardwareRecord) {
        let opts = &mut reply.options;
        opts.push(DhcpOption::SubnetMask(record.netmask));
        if let Some(gateway) = record.gateway {
            opts.push(DhcpOption::Router(gateway));
        }
        if !record.nameservers.is_empty() {
            opts.push(DhcpOption::DomainServer(record.nameservers.clone()));
        }
        opts.push(DhcpOption::LogServer(self.syslog_ip));
        if let Some(ref hostname) = record.hostname {
            opts.push(DhcpOption::HostName(hostname.clone()));
        }
        if let Some(ref domain) = record.domain {
            opts.push(DhcpOption::DomainName(domain.clone()));
        }
        opts.push(DhcpOption::BroadcastAddress(broadcast_address(
            record.ip,
            record.netmask,
        )));
        opts.push(DhcpOption::LeaseTime(record.lease_time));
        opts.push(DhcpOption::RenewalTime(record.lease_time / 2));
        opts.push(DhcpOption::RebindingTime(record.lease_time / 8 * 7));
    }

    /// Netboot options: 66/67, siaddr/sname, 60, 43 and 97.
    fn push_netboot_options(
        &self,
        reply: &mut DhcpPacket,
        request: &DhcpPacket,
        decision: &BootDecision,
    ) {
        reply.siaddr = decision.next_server;
        reply.sname = decision.server_name.clone();
        reply.file = Some(decision.boot_file_name.clone());
        reply
            .options
            .push(DhcpOption::BootfileName(decision.boot_file_name.clone()));

        if decision.stage == BootStage::TftpBin {
            reply
                .options
                .push(DhcpOption::TftpServerName(decision.next_server.to_string()));
        }

        let is_pxe_client = request
            .vendor_class_id()
            .map_or(false, |vc| vc.starts_with("PXEClient"));

        // UEFI HTTP Boot firmware only accepts an HTTP URL in option 67
        // when the reply identifies as an HTTPClient.
        if decision.stage == BootStage::HttpBin {
            reply
                .options
                .push(DhcpOption::VendorClassId("HTTPClient".to_string()));
        } else if is_pxe_client {
            reply
                .options
                .push(DhcpOption::VendorClassId("PXEClient".to_string()));
        }

        if is_pxe_client {
            reply
                .options
                .push(DhcpOption::VendorSpecific(pxe_vendor_options()));
        }

        if let Some(uuid) = request.client_uuid() {
            reply.options.push(DhcpOption::ClientUuid(uuid.to_vec()));
        }
    }

    /// The crux: pick the boot-chain stage from option 77 and option 93.
    fn decide(&self, request: &DhcpPacket, record: &HardwareRecord) -> BootDecision {
        if let Some(user_class) = request.user_class() {
            if IPXE_USER_CLASSES.contains(&user_class) {
                return BootDecision {
                    stage: BootStage::HttpScript,
                    next_server: Ipv4Addr::UNSPECIFIED,
                    boot_file_name: self.script_url_for(record, request),
                    server_name: None,
                };
            }
        }

        let arch = ClientArch::from_u16(request.client_arch().unwrap_or(0));
        if arch.supports_http_boot() {
            return BootDecision {
                stage: BootStage::HttpBin,
                next_server: Ipv4Addr::UNSPECIFIED,
                boot_file_name: format!(
                    "{}/{}",
                    self.http_binary_url.trim_end_matches('/'),
                    arch.ipxe_binary()
                ),
                server_name: None,
            };
        }

        BootDecision {
            stage: BootStage::TftpBin,
            next_server: self.tftp_ip,
            boot_file_name: arch.ipxe_binary().to_string(),
            server_name: Some(self.tftp_ip.to_string()),
        }
    }

    /// Script URL for this client. A per-record override is used verbatim;
    /// otherwise the configured URL, with the MAC spliced in front of the
    /// file name when injection is on.
    fn script_url_for(&self, record: &HardwareRecord, request: &DhcpPacket) -> String {
        if let Some(ref url) = record.netboot.ipxe_script_url {
            return url.clone();
        }

        if !self.inject_mac {
            return self.script_url.clone();
        }

        let mac = request.chaddr.to_string().to_lowercase();
        match self.script_url.rsplit_once('/') {
            Some((dir, file)) => format!("{dir}/{mac}/{file}"),
            None => self.script_url.clone(),
        }
    }

    fn nak(&self, request: &DhcpPacket) -> DhcpReply {
        let mut reply = DhcpPacket::reply_to(request, DhcpMessageType::Nak);
        reply
            .options
            .push(DhcpOption::ServerIdentifier(self.ip_for_packet));

        DhcpReply {
            destination: reply_destination(request),
            packet: reply,
        }
    }
}

/// Outer framing per RFC 2131 section 4.1.
fn reply_destination(request: &DhcpPacket) -> SocketAddr {
    if !request.giaddr.is_unspecified() {
        return SocketAddr::V4(SocketAddrV4::new(request.giaddr, SERVER_PORT));
    }

    if request.broadcast_requested() || request.ciaddr.is_unspecified() {
        return SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT));
    }

    SocketAddr::V4(SocketAddrV4::new(request.ciaddr, CLIENT_PORT))
}

fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Encoded option 43 payload: skip the prompt, one menu entry.
fn pxe_vendor_options() -> Vec<u8> {
    let mut opts = vec![PXE_DISCOVERY_CONTROL, 1, PXE_SKIP_MENU];

    let prompt = b"netboot";
    opts.push(PXE_MENU_PROMPT);
    opts.push((prompt.len() + 1) as u8);
    opts.push(0); // zero timeout: never show the prompt
    opts.extend_from_slice(prompt);

    let entry = b"netboot";
    opts.push(PXE_BOOT_MENU);
    opts.push((entry.len() + 3) as u8);
    opts.extend_from_slice(&[0, 0]); // boot server type 0
    opts.push(entry.len() as u8);
    opts.extend_from_slice(entry);

    opts
}
