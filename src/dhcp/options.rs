//! DHCPv4 wire format (RFC 2131) and the option subset the server speaks.
//! Anything else arrives as `Unknown` and is carried through untouched.

use std::net::Ipv4Addr;

use pnet::util::MacAddr;

use crate::core::errors::DecodeError;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const OP_REQUEST: u8 = 1;
pub const OP_REPLY: u8 = 2;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const FIXED_HEADER_LEN: usize = 236;
/// Replies are padded to the classic BOOTP minimum.
const MIN_PACKET_LEN: usize = 300;

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
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DomainNameServer(Vec<Ipv4Addr>),
    DomainName(String),
    RequestedIp(Ipv4Addr),
    LeaseTime(u32),
    MessageType(DhcpMessageType),
    ServerId(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    RenewalTime(u32),
    RebindingTime(u32),
    ClientId(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => 1,
            Self::Router(_) => 3,
            Self::DomainNameServer(_) => 6,
            Self::DomainName(_) => 15,
            Self::RequestedIp(_) => 50,
            Self::LeaseTime(_) => 51,
            Self::MessageType(_) => 53,
            Self::ServerId(_) => 54,
            Self::ParameterRequestList(_) => 55,
            Self::RenewalTime(_) => 58,
            Self::RebindingTime(_) => 59,
            Self::ClientId(_) => 61,
            Self::Unknown(code, _) => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(ip) | Self::RequestedIp(ip) | Self::ServerId(ip) => {
                ip.octets().to_vec()
            }
            Self::Router(ips) | Self::DomainNameServer(ips) => {
                ips.iter().flat_map(|ip| ip.octets()).collect()
            }
            Self::DomainName(name) => name.as_bytes().to_vec(),
            Self::LeaseTime(v) | Self::RenewalTime(v) | Self::RebindingTime(v) => {
                v.to_be_bytes().to_vec()
            }
            Self::MessageType(t) => vec![*t as u8],
            Self::ParameterRequestList(codes) => codes.clone(),
            Self::ClientId(id) => id.clone(),
            Self::Unknown(_, bytes) => bytes.clone(),
        }
    }

    fn parse(code: u8, bytes: &[u8]) -> Self {
        match code {
            1 if bytes.len() == 4 => Self::SubnetMask(ipv4(bytes)),
            3 => Self::Router(ipv4_list(bytes)),
            6 => Self::DomainNameServer(ipv4_list(bytes)),
            15 => Self::DomainName(String::from_utf8_lossy(bytes).into_owned()),
            50 if bytes.len() == 4 => Self::RequestedIp(ipv4(bytes)),
            51 if bytes.len() == 4 => Self::LeaseTime(u32_be(bytes)),
            53 if bytes.len() == 1 => match DhcpMessageType::from_u8(bytes[0]) {
                Some(t) => Self::MessageType(t),
                None => Self::Unknown(code, bytes.to_vec()),
            },
            54 if bytes.len() == 4 => Self::ServerId(ipv4(bytes)),
            55 => Self::ParameterRequestList(bytes.to_vec()),
            58 if bytes.len() == 4 => Self::RenewalTime(u32_be(bytes)),
            59 if bytes.len() == 4 => Self::RebindingTime(u32_be(bytes)),
            61 => Self::ClientId(bytes.to_vec()),
            _ => Self::Unknown(code, bytes.to_vec()),
        }
    }
}

fn ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn ipv4_list(bytes: &[u8]) -> Vec<Ipv4Addr> {
    bytes.chunks_exact(4).map(ipv4).collect()
}

fn u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpV4Packet {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: String,
    pub file: String,
    pub options: Vec<DhcpOption>,
}

impl DhcpV4Packet {
    pub fn reply_to(request: &DhcpV4Packet) -> Self {
        Self {
            op: OP_REPLY,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: String::new(),
            file: String::new(),
            options: Vec::new(),
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < FIXED_HEADER_LEN + 4 {
            return Err(DecodeError::Truncated("dhcpv4"));
        }
        let op = raw[0];
        let htype = raw[1];
        let hlen = raw[2];
        let hops = raw[3];
        let xid = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let secs = u16::from_be_bytes([raw[8], raw[9]]);
        let flags = u16::from_be_bytes([raw[10], raw[11]]);
        let ciaddr = ipv4(&raw[12..16]);
        let yiaddr = ipv4(&raw[16..20]);
        let siaddr = ipv4(&raw[20..24]);
        let giaddr = ipv4(&raw[24..28]);
        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&raw[28..44]);
        let sname = String::from_utf8_lossy(&raw[44..108])
            .trim_end_matches('\0')
            .to_string();
        let file = String::from_utf8_lossy(&raw[108..236])
            .trim_end_matches('\0')
            .to_string();
        if raw[236..240] != MAGIC_COOKIE {
            return Err(DecodeError::Unsupported {
                what: "dhcp magic cookie",
                value: u32_be(&raw[236..240]),
            });
        }

        let mut options = Vec::new();
        let mut rest = &raw[240..];
        while let Some((&code, after)) = rest.split_first() {
            match code {
                0 => {
                    rest = after;
                    continue;
                }
                255 => break,
                _ => {}
            }
            let Some((&len, after)) = after.split_first() else {
                return Err(DecodeError::Truncated("dhcpv4 options"));
            };
            let len = len as usize;
            if after.len() < len {
                return Err(DecodeError::Truncated("dhcpv4 options"));
            }
            options.push(DhcpOption::parse(code, &after[..len]));
            rest = &after[len..];
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
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

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        let mut sname = [0u8; 64];
        let n = self.sname.len().min(63);
        sname[..n].copy_from_slice(&self.sname.as_bytes()[..n]);
        buf.extend_from_slice(&sname);
        let mut file = [0u8; 128];
        let n = self.file.len().min(127);
        file[..n].copy_from_slice(&self.file.as_bytes()[..n]);
        buf.extend_from_slice(&file);
        buf.extend_from_slice(&MAGIC_COOKIE);
        for option in &self.options {
            let payload = option.payload();
            buf.push(option.code());
            buf.push(payload.len() as u8);
            buf.extend_from_slice(&payload);
        }
        buf.push(255);
        if buf.len() < MIN_PACKET_LEN {
            buf.resize(MIN_PACKET_LEN, 0);
        }
        buf
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RequestedIp(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn client_mac(&self) -> MacAddr {
        let b = &self.chaddr;
        MacAddr::new(b[0], b[1], b[2], b[3], b[4], b[5])
    }
}
