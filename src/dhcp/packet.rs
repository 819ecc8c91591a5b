//! DHCPv4 wire format (RFC 2131/2132).
//!
//! One place for both directions: parsing client requests into
//! [`DhcpPacket`] and encoding server replies back to bytes.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;
use thiserror::Error;

/// DHCP magic cookie: 0x63825363
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Minimum DHCP packet size (without options)
const MIN_DHCP_SIZE: usize = 236;

/// Minimum size of an encoded reply (RFC 2131 requires padding to 300).
const MIN_REPLY_SIZE: usize = 300;

/// Broadcast bit in the flags field.
const FLAG_BROADCAST: u16 = 0x8000;

/// DHCP option codes
pub mod option_codes {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DOMAIN_SERVER: u8 = 6;
    pub const LOG_SERVER: u8 = 7;
    pub const HOSTNAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const BROADCAST_ADDRESS: u8 = 28;
    pub const VENDOR_SPECIFIC: u8 = 43;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const VENDOR_CLASS_ID: u8 = 60;
    pub const CLIENT_ID: u8 = 61;
    pub const TFTP_SERVER_NAME: u8 = 66;
    pub const BOOTFILE_NAME: u8 = 67;
    pub const USER_CLASS: u8 = 77;
    pub const CLIENT_ARCH: u8 = 93;
    pub const CLIENT_NDI: u8 = 94;
    pub const CLIENT_UUID: u8 = 97;
    pub const END: u8 = 255;
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid DHCP magic cookie")]
    InvalidMagicCookie,

    #[error("invalid option at offset {offset}: {message}")]
    InvalidOption { offset: usize, message: String },
}

/// DHCP message types as defined in RFC 2131.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    /// Parse from the DHCP option 53 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }
}

impl std::fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// DHCP options the netboot engine reads or emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Option 1: Subnet Mask
    SubnetMask(Ipv4Addr),
    /// Option 3: Router
    Router(Ipv4Addr),
    /// Option 6: Domain Name Servers
    DomainServer(Vec<Ipv4Addr>),
    /// Option 7: Log (syslog) Server
    LogServer(Ipv4Addr),
    /// Option 12: Host Name
    HostName(String),
    /// Option 15: Domain Name
    DomainName(String),
    /// Option 28: Broadcast Address
    BroadcastAddress(Ipv4Addr),
    /// Option 43: Vendor-specific information (PXE sub-options)
    VendorSpecific(Vec<u8>),
    /// Option 50: Requested IP Address
    RequestedIp(Ipv4Addr),
    /// Option 51: IP Address Lease Time
    LeaseTime(u32),
    /// Option 53: DHCP Message Type
    MessageType(DhcpMessageType),
    /// Option 54: Server Identifier
    ServerIdentifier(Ipv4Addr),
    /// Option 58: Renewal (T1) Time
    RenewalTime(u32),
    /// Option 59: Rebinding (T2) Time
    RebindingTime(u32),
    /// Option 60: Vendor Class Identifier (e.g., "PXEClient:...")
    VendorClassId(String),
    /// Option 61: Client Identifier
    ClientId(Vec<u8>),
    /// Option 66: TFTP Server Name
    TftpServerName(String),
    /// Option 67: Bootfile Name
    BootfileName(String),
    /// Option 77: User Class (iPXE sets "iPXE")
    UserClass(String),
    /// Option 93: Client System Architecture (PXE)
    ClientArch(u16),
    /// Option 94: Client Network Interface Identifier (PXE)
    ClientNdi(Vec<u8>),
    /// Option 97: Client Machine Identifier (UUID/GUID)
    ClientUuid(Vec<u8>),
    /// Unknown option (code, data)
    Unknown(u8, Vec<u8>),
}

impl DhcpOption {
    fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => option_codes::SUBNET_MASK,
            Self::Router(_) => option_codes::ROUTER,
            Self::DomainServer(_) => option_codes::DOMAIN_SERVER,
            Self::LogServer(_) => option_codes::LOG_SERVER,
            Self::HostName(_) => option_codes::HOSTNAME,
            Self::DomainName(_) => option_codes::DOMAIN_NAME,
            Self::BroadcastAddress(_) => option_codes::BROADCAST_ADDRESS,
            Self::VendorSpecific(_) => option_codes::VENDOR_SPECIFIC,
            Self::RequestedIp(_) => option_codes::REQUESTED_IP,
            Self::LeaseTime(_) => option_codes::LEASE_TIME,
            Self::MessageType(_) => option_codes::MESSAGE_TYPE,
            Self::ServerIdentifier(_) => option_codes::SERVER_ID,
            Self::RenewalTime(_) => option_codes::RENEWAL_TIME,
            Self::RebindingTime(_) => option_codes::REBINDING_TIME,
            Self::VendorClassId(_) => option_codes::VENDOR_CLASS_ID,
            Self::ClientId(_) => option_codes::CLIENT_ID,
            Self::TftpServerName(_) => option_codes::TFTP_SERVER_NAME,
            Self::BootfileName(_) => option_codes::BOOTFILE_NAME,
            Self::UserClass(_) => option_codes::USER_CLASS,
            Self::ClientArch(_) => option_codes::CLIENT_ARCH,
            Self::ClientNdi(_) => option_codes::CLIENT_NDI,
            Self::ClientUuid(_) => option_codes::CLIENT_UUID,
            Self::Unknown(code, _) => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(ip)
            | Self::Router(ip)
            | Self::LogServer(ip)
            | Self::BroadcastAddress(ip)
            | Self::RequestedIp(ip)
            | Self::ServerIdentifier(ip) => ip.octets().to_vec(),
            Self::DomainServer(ips) => ips.iter().flat_map(|ip| ip.octets()).collect(),
            Self::HostName(s)
            | Self::DomainName(s)
            | Self::VendorClassId(s)
            | Self::TftpServerName(s)
            | Self::BootfileName(s)
            | Self::UserClass(s) => s.as_bytes().to_vec(),
            Self::VendorSpecific(data)
            | Self::ClientId(data)
            | Self::ClientNdi(data)
            | Self::ClientUuid(data) => data.clone(),
            Self::LeaseTime(v) | Self::RenewalTime(v) | Self::RebindingTime(v) => {
                v.to_be_bytes().to_vec()
            }
            Self::MessageType(t) => vec![*t as u8],
            Self::ClientArch(arch) => arch.to_be_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }
}

/// A parsed DHCP message.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    /// Operation: 1 = BOOTREQUEST, 2 = BOOTREPLY
    pub op: u8,
    /// Hardware type (1 = Ethernet)
    pub htype: u8,
    /// Hardware address length
    pub hlen: u8,
    /// Transaction ID
    pub xid: u32,
    /// Seconds elapsed
    pub secs: u16,
    /// Flags
    pub flags: u16,
    /// Client IP address (if already known)
    pub ciaddr: Ipv4Addr,
    /// 'Your' IP address (assigned by server)
    pub yiaddr: Ipv4Addr,
    /// Next-server IP address
    pub siaddr: Ipv4Addr,
    /// Relay agent IP address
    pub giaddr: Ipv4Addr,
    /// Client hardware address (MAC)
    pub chaddr: MacAddr6,
    /// Server hostname (optional)
    pub sname: Option<String>,
    /// Boot filename (optional)
    pub file: Option<String>,
    /// DHCP options
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parse a DHCP packet from the UDP payload.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < MIN_DHCP_SIZE {
            return Err(ParseError::PacketTooShort {
                expected: MIN_DHCP_SIZE,
                actual: data.len(),
            });
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        // hops at [3]
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        // chaddr is 16 bytes; the first 6 are the MAC for Ethernet.
        let chaddr = MacAddr6::new(data[28], data[29], data[30], data[31], data[32], data[33]);

        let sname = parse_null_terminated_string(&data[44..108]);
        let file = parse_null_terminated_string(&data[108..236]);

        if data.len() < 240 {
            return Err(ParseError::PacketTooShort {
                expected: 240,
                actual: data.len(),
            });
        }

        if data[236..240] != DHCP_MAGIC_COOKIE {
            return Err(ParseError::InvalidMagicCookie);
        }

        let options = parse_options(&data[240..])?;

        Ok(Self {
            op,
            htype,
            hlen,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Start a BOOTREPLY for the given request, copying the fields the
    /// reply must echo.
    pub fn reply_to(request: &DhcpPacket, msg_type: DhcpMessageType) -> Self {
        Self {
            op: 2,
            htype: request.htype,
            hlen: request.hlen,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: None,
            file: None,
            options: vec![DhcpOption::MessageType(msg_type)],
        }
    }

    /// Encode to wire format, padded to the RFC minimum reply size.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 240];

        buf[0] = self.op;
        buf[1] = self.htype;
        buf[2] = self.hlen;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[8..10].copy_from_slice(&self.secs.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..34].copy_from_slice(self.chaddr.as_bytes());

        if let Some(ref sname) = self.sname {
            let bytes = sname.as_bytes();
            let len = bytes.len().min(63);
            buf[44..44 + len].copy_from_slice(&bytes[..len]);
        }

        if let Some(ref file) = self.file {
            let bytes = file.as_bytes();
            let len = bytes.len().min(127);
            buf[108..108 + len].copy_from_slice(&bytes[..len]);
        }

        buf[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            let payload = option.payload();
            buf.push(option.code());
            buf.push(payload.len() as u8);
            buf.extend_from_slice(&payload);
        }
        buf.push(option_codes::END);

        if buf.len() < MIN_REPLY_SIZE {
            buf.resize(MIN_REPLY_SIZE, 0);
        }

        buf
    }

    /// Returns true if this is a client request (BOOTREQUEST).
    pub fn is_request(&self) -> bool {
        self.op == 1
    }

    /// Returns true if the client asked for a broadcast reply.
    pub fn broadcast_requested(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// Get the DHCP message type from options.
    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Get the vendor class identifier (Option 60).
    pub fn vendor_class_id(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::VendorClassId(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Get the user class (Option 77).
    pub fn user_class(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::UserClass(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Get the client architecture (Option 93).
    pub fn client_arch(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ClientArch(arch) => Some(*arch),
            _ => None,
        })
    }

    /// Get the client UUID (Option 97).
    pub fn client_uuid(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ClientUuid(uuid) => Some(uuid.as_slice()),
            _ => None,
        })
    }

    /// Get the requested IP address (Option 50).
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RequestedIp(ip) => Some(*ip),
            _ => None,
        })
    }
}

/// Parse a null-terminated string, returning None if empty.
fn parse_null_terminated_string(data: &[u8]) -> Option<String> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    if end == 0 {
        return None;
    }

    String::from_utf8(data[..end].to_vec()).ok()
}

/// Parse DHCP options from the options section.
fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>, ParseError> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let code = data[offset];

        if code == option_codes::PAD {
            offset += 1;
            continue;
        }

        if code == option_codes::END {
            break;
        }

        if offset + 1 >= data.len() {
            return Err(ParseError::InvalidOption {
                offset,
                message: "option length missing".to_string(),
            });
        }

        let len = data[offset + 1] as usize;

        if offset + 2 + len > data.len() {
            return Err(ParseError::InvalidOption {
                offset,
                message: format!(
                    "option data truncated: expected {} bytes, have {}",
                    len,
                    data.len() - offset - 2
                ),
            });
        }

        let option_data = &data[offset + 2..offset + 2 + len];

        if let Some(option) = parse_option(code, option_data) {
            options.push(option);
        }

        offset += 2 + len;
    }

    Ok(options)
}

fn parse_ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    if data.len() < 4 {
        return None;
    }
    Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

/// Parse a single DHCP option into its typed form.
fn parse_option(code: u8, data: &[u8]) -> Option<DhcpOption> {
    match code {
        option_codes::MESSAGE_TYPE => {
            DhcpMessageType::from_u8(*data.first()?).map(DhcpOption::MessageType)
        }

        option_codes::SUBNET_MASK => parse_ipv4(data).map(DhcpOption::SubnetMask),
        option_codes::ROUTER => parse_ipv4(data).map(DhcpOption::Router),
        option_codes::LOG_SERVER => parse_ipv4(data).map(DhcpOption::LogServer),
        option_codes::BROADCAST_ADDRESS => parse_ipv4(data).map(DhcpOption::BroadcastAddress),
        option_codes::REQUESTED_IP => parse_ipv4(data).map(DhcpOption::RequestedIp),
        option_codes::SERVER_ID => parse_ipv4(data).map(DhcpOption::ServerIdentifier),

        option_codes::DOMAIN_SERVER => {
            let servers: Vec<Ipv4Addr> = data.chunks_exact(4).filter_map(parse_ipv4).collect();
            if servers.is_empty() {
                return None;
            }
            Some(DhcpOption::DomainServer(servers))
        }

        option_codes::LEASE_TIME => {
            if data.len() < 4 {
                return None;
            }
            Some(DhcpOption::LeaseTime(u32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ])))
        }

        option_codes::HOSTNAME => {
            String::from_utf8(data.to_vec()).ok().map(DhcpOption::HostName)
        }

        option_codes::DOMAIN_NAME => {
            String::from_utf8(data.to_vec()).ok().map(DhcpOption::DomainName)
        }

        option_codes::VENDOR_CLASS_ID => String::from_utf8(data.to_vec())
            .ok()
            .map(DhcpOption::VendorClassId),

        // RFC 3004 frames user class as length-prefixed instances, but
        // iPXE and PXE firmware send a bare string. Take the bytes as-is.
        option_codes::USER_CLASS => {
            String::from_utf8(data.to_vec()).ok().map(DhcpOption::UserClass)
        }

        option_codes::CLIENT_ID => Some(DhcpOption::ClientId(data.to_vec())),

        option_codes::CLIENT_ARCH => {
            if data.len() < 2 {
                return None;
            }
            Some(DhcpOption::ClientArch(u16::from_be_bytes([
                data[0], data[1],
            ])))
        }

        option_codes::CLIENT_NDI => Some(DhcpOption::ClientNdi(data.to_vec())),

        option_codes::CLIENT_UUID => Some(DhcpOption::ClientUuid(data.to_vec())),

        _ => Some(DhcpOption::Unknown(code, data.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> Vec<u8> {
        let mut packet = vec![0u8; 300];
        packet[0] = 1; // BOOTREQUEST
        packet[1] = 1; // Ethernet
        packet[2] = 6;
        packet[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        packet[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        packet[240] = option_codes::MESSAGE_TYPE;
        packet[241] = 1;
        packet[242] = 1; // DISCOVER
        packet[243] = option_codes::END;
        packet
    }

    #[test]
    fn test_parse_minimum_packet() {
        let packet = minimal_request();
        let dhcp = DhcpPacket::parse(&packet).unwrap();

        assert_eq!(dhcp.op, 1);
        assert_eq!(dhcp.xid, 0x12345678);
        assert_eq!(
            dhcp.chaddr,
            MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff)
        );
        assert_eq!(dhcp.message_type(), Some(DhcpMessageType::Discover));
        assert!(dhcp.is_request());
    }

    #[test]
    fn test_packet_too_short() {
        let packet = vec![0u8; 100];
        assert!(matches!(
            DhcpPacket::parse(&packet),
            Err(ParseError::PacketTooShort { .. })
        ));
    }

    #[test]
    fn test_bad_magic_cookie() {
        let mut packet = minimal_request();
        packet[236] = 0;
        assert!(matches!(
            DhcpPacket::parse(&packet),
            Err(ParseError::InvalidMagicCookie)
        ));
    }

    #[test]
    fn test_truncated_option() {
        let mut packet = minimal_request();
        packet.truncate(243);
        packet[240] = option_codes::VENDOR_CLASS_ID;
        packet[241] = 9; // claims 9 bytes, only 1 present
        assert!(matches!(
            DhcpPacket::parse(&packet),
            Err(ParseError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_parse_pxe_options() {
        let mut packet = minimal_request();
        packet.truncate(243);

        // Option 60: PXEClient vendor class
        let vc = b"PXEClient:Arch:00000:UNDI:002001";
        packet.push(option_codes::VENDOR_CLASS_ID);
        packet.push(vc.len() as u8);
        packet.extend_from_slice(vc);
        // Option 93: arch 7
        packet.extend_from_slice(&[option_codes::CLIENT_ARCH, 2, 0, 7]);
        // Option 77: user class
        packet.extend_from_slice(&[option_codes::USER_CLASS, 4]);
        packet.extend_from_slice(b"iPXE");
        // Option 97: uuid
        packet.extend_from_slice(&[option_codes::CLIENT_UUID, 4, 1, 2, 3, 4]);
        packet.push(option_codes::END);
        packet.resize(350, 0);

        let dhcp = DhcpPacket::parse(&packet).unwrap();
        assert!(dhcp.vendor_class_id().unwrap().starts_with("PXEClient"));
        assert_eq!(dhcp.client_arch(), Some(7));
        assert_eq!(dhcp.user_class(), Some("iPXE"));
        assert_eq!(dhcp.client_uuid(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn test_broadcast_flag() {
        let mut packet = minimal_request();
        packet[10] = 0x80;
        let dhcp = DhcpPacket::parse(&packet).unwrap();
        assert!(dhcp.broadcast_requested());
    }

    #[test]
    fn test_encode_reply_header() {
        let request = DhcpPacket::parse(&minimal_request()).unwrap();
        let mut reply = DhcpPacket::reply_to(&request, DhcpMessageType::Offer);
        reply.yiaddr = Ipv4Addr::new(10, 0, 0, 10);
        reply.siaddr = Ipv4Addr::new(10, 0, 0, 1);
        reply.file = Some("undionly.kpxe".to_string());

        let bytes = reply.encode();
        assert_eq!(bytes[0], 2); // BOOTREPLY
        assert_eq!(&bytes[4..8], &0x12345678u32.to_be_bytes());
        assert_eq!(&bytes[16..20], &[10, 0, 0, 10]);
        assert_eq!(&bytes[20..24], &[10, 0, 0, 1]);
        assert_eq!(&bytes[28..34], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(&bytes[236..240], &DHCP_MAGIC_COOKIE);
        assert!(bytes.len() >= 300);

        let file_field = &bytes[108..236];
        let end = file_field.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&file_field[..end], b"undionly.kpxe");
    }

    #[test]
    fn test_encode_parse_roundtrip_options() {
        let request = DhcpPacket::parse(&minimal_request()).unwrap();
        let mut reply = DhcpPacket::reply_to(&request, DhcpMessageType::Ack);
        reply.options.push(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)));
        reply.options.push(DhcpOption::LeaseTime(3600));
        reply
            .options
            .push(DhcpOption::DomainServer(vec![Ipv4Addr::new(8, 8, 8, 8)]));
        reply
            .options
            .push(DhcpOption::BootfileName("http://10.0.0.1/auto.ipxe".to_string()));

        let parsed = DhcpPacket::parse(&reply.encode()).unwrap();
        assert_eq!(parsed.message_type(), Some(DhcpMessageType::Ack));
        assert!(parsed
            .options
            .contains(&DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(parsed.options.contains(&DhcpOption::LeaseTime(3600)));
        assert!(parsed
            .options
            .contains(&DhcpOption::BootfileName("http://10.0.0.1/auto.ipxe".to_string())));
    }

    #[test]
    fn test_encode_truncates_long_bootfile_in_header_field() {
        let request = DhcpPacket::parse(&minimal_request()).unwrap();
        let mut reply = DhcpPacket::reply_to(&request, DhcpMessageType::Offer);
        reply.file = Some("x".repeat(200));

        let bytes = reply.encode();
        // The fixed-size file field holds at most 127 bytes plus NUL.
        assert_eq!(bytes[108 + 127], 0);
        assert_eq!(&bytes[236..240], &DHCP_MAGIC_COOKIE);
    }
}
