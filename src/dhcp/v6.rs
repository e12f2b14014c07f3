//! DHCPv6 server (RFC 3315 subset): SOLICIT/ADVERTISE, REQUEST/RENEW/REPLY,
//! RELEASE, Rapid Commit, IA_NA address assignment keyed by client DUID.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::{debug, info};

use crate::config::{DhcpPoolV6, DhcpV6Config};
use crate::core::device::Device;
use crate::core::errors::{DecodeError, HandlerError};
use crate::core::frame::{self, Frame, NetLayer, RawFrame, Transport};
use crate::dispatch::{DispatchKey, ProtocolHandler};

use super::lease::{Lease, LeaseState, LeaseTable};

pub const DHCPV6_SERVER_PORT: u16 = 547;
pub const DHCPV6_CLIENT_PORT: u16 = 546;

const STATUS_SUCCESS: u16 = 0;
const STATUS_NO_ADDRS_AVAIL: u16 = 2;
const STATUS_NO_BINDING: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V6MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
}

impl V6MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Solicit,
            2 => Self::Advertise,
            3 => Self::Request,
            4 => Self::Confirm,
            5 => Self::Renew,
            6 => Self::Rebind,
            7 => Self::Reply,
            8 => Self::Release,
            9 => Self::Decline,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V6Option {
    ClientId(Vec<u8>),
    ServerId(Vec<u8>),
    IaNa {
        iaid: u32,
        t1: u32,
        t2: u32,
        options: Vec<V6Option>,
    },
    IaAddr {
        addr: Ipv6Addr,
        preferred: u32,
        valid: u32,
    },
    RapidCommit,
    StatusCode {
        code: u16,
        message: String,
    },
    DnsServers(Vec<Ipv6Addr>),
    Unknown(u16, Vec<u8>),
}

impl V6Option {
    fn code(&self) -> u16 {
        match self {
            Self::ClientId(_) => 1,
            Self::ServerId(_) => 2,
            Self::IaNa { .. } => 3,
            Self::IaAddr { .. } => 5,
            Self::RapidCommit => 14,
            Self::StatusCode { .. } => 13,
            Self::DnsServers(_) => 23,
            Self::Unknown(code, _) => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::ClientId(id) | Self::ServerId(id) => id.clone(),
            Self::IaNa { iaid, t1, t2, options } => {
                let mut out = Vec::new();
                out.extend_from_slice(&iaid.to_be_bytes());
                out.extend_from_slice(&t1.to_be_bytes());
                out.extend_from_slice(&t2.to_be_bytes());
                out.extend_from_slice(&encode_options(options));
                out
            }
            Self::IaAddr { addr, preferred, valid } => {
                let mut out = addr.octets().to_vec();
                out.extend_from_slice(&preferred.to_be_bytes());
                out.extend_from_slice(&valid.to_be_bytes());
                out
            }
            Self::RapidCommit => Vec::new(),
            Self::StatusCode { code, message } => {
                let mut out = code.to_be_bytes().to_vec();
                out.extend_from_slice(message.as_bytes());
                out
            }
            Self::DnsServers(list) => list.iter().flat_map(|ip| ip.octets()).collect(),
            Self::Unknown(_, bytes) => bytes.clone(),
        }
    }

    fn parse(code: u16, bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(match code {
            1 => Self::ClientId(bytes.to_vec()),
            2 => Self::ServerId(bytes.to_vec()),
            3 => {
                if bytes.len() < 12 {
                    return Err(DecodeError::Truncated("dhcpv6 IA_NA"));
                }
                Self::IaNa {
                    iaid: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    t1: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                    t2: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
                    options: decode_options(&bytes[12..])?,
                }
            }
            5 => {
                if bytes.len() < 24 {
                    return Err(DecodeError::Truncated("dhcpv6 IAADDR"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                Self::IaAddr {
                    addr: Ipv6Addr::from(octets),
                    preferred: u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
                    valid: u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
                }
            }
            13 => {
                if bytes.len() < 2 {
                    return Err(DecodeError::Truncated("dhcpv6 status"));
                }
                Self::StatusCode {
                    code: u16::from_be_bytes([bytes[0], bytes[1]]),
                    message: String::from_utf8_lossy(&bytes[2..]).into_owned(),
                }
            }
            14 => Self::RapidCommit,
            23 => Self::DnsServers(
                bytes
                    .chunks_exact(16)
                    .map(|c| {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(c);
                        Ipv6Addr::from(octets)
                    })
                    .collect(),
            ),
            _ => Self::Unknown(code, bytes.to_vec()),
        })
    }
}

fn encode_options(options: &[V6Option]) -> Vec<u8> {
    let mut out = Vec::new();
    for option in options {
        let payload = option.payload();
        out.extend_from_slice(&option.code().to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&payload);
    }
    out
}

fn decode_options(mut bytes: &[u8]) -> Result<Vec<V6Option>, DecodeError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(DecodeError::Truncated("dhcpv6 option header"));
        }
        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Err(DecodeError::Truncated("dhcpv6 option body"));
        }
        out.push(V6Option::parse(code, &bytes[4..4 + len])?);
        bytes = &bytes[4 + len..];
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpV6Packet {
    pub msg_type: V6MessageType,
    pub txid: [u8; 3],
    pub options: Vec<V6Option>,
}

impl DhcpV6Packet {
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < 4 {
            return Err(DecodeError::Truncated("dhcpv6"));
        }
        let msg_type = V6MessageType::from_u8(raw[0]).ok_or(DecodeError::Unsupported {
            what: "dhcpv6 message type",
            value: raw[0] as u32,
        })?;
        Ok(Self {
            msg_type,
            txid: [raw[1], raw[2], raw[3]],
            options: decode_options(&raw[4..])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.msg_type as u8, self.txid[0], self.txid[1], self.txid[2]];
        out.extend_from_slice(&encode_options(&self.options));
        out
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            V6Option::ClientId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn ia_na(&self) -> Option<(u32, &[V6Option])> {
        self.options.iter().find_map(|o| match o {
            V6Option::IaNa { iaid, options, .. } => Some((*iaid, options.as_slice())),
            _ => None,
        })
    }

    pub fn rapid_commit(&self) -> bool {
        self.options.iter().any(|o| matches!(o, V6Option::RapidCommit))
    }
}

pub struct DhcpV6Server {
    pools: Vec<DhcpPoolV6>,
    leases: Mutex<LeaseTable<Ipv6Addr>>,
    server_duid: Vec<u8>,
}

impl DhcpV6Server {
    /// Server identity is a DUID-LL derived from the device MAC.
    pub fn new(cfg: &DhcpV6Config, mac: pnet::util::MacAddr) -> Self {
        let mut duid = vec![0, 3, 0, 1];
        duid.extend_from_slice(&mac.octets());
        Self {
            pools: cfg.pools.clone(),
            leases: Mutex::new(LeaseTable::new()),
            server_duid: duid,
        }
    }

    pub fn sweep_interval(&self) -> StdDuration {
        let shortest = self
            .pools
            .iter()
            .map(|p| p.lease_time)
            .min()
            .unwrap_or(crate::config::DEFAULT_LEASE_SECS);
        StdDuration::from_secs((shortest as u64 / 10).max(1))
    }

    pub fn sweep(&self) -> usize {
        let mut table = self.leases.lock().expect("lease lock poisoned");
        table.sweep(Utc::now())
    }

    pub fn bound_count(&self) -> usize {
        let table = self.leases.lock().expect("lease lock poisoned");
        table.bound_count(Utc::now())
    }

    pub fn handle(&self, request: &DhcpV6Packet) -> Option<DhcpV6Packet> {
        let duid = request.client_id()?.to_vec();
        match request.msg_type {
            V6MessageType::Solicit => self.solicit(request, duid),
            V6MessageType::Request => self.bind(request, duid, V6MessageType::Reply),
            V6MessageType::Renew => self.renew(request, duid),
            V6MessageType::Release => self.release(request, duid),
            _ => None,
        }
    }

    fn solicit(&self, request: &DhcpV6Packet, duid: Vec<u8>) -> Option<DhcpV6Packet> {
        if request.rapid_commit() {
            // Rapid Commit skips ADVERTISE and binds immediately.
            let mut reply = self.bind(request, duid, V6MessageType::Reply)?;
            reply.options.push(V6Option::RapidCommit);
            return Some(reply);
        }
        let now = Utc::now();
        let mut table = self.leases.lock().expect("lease lock poisoned");

        let (address, pool) = if let Some(existing) = table.find(&duid) {
            if existing.holds_address(now) {
                let addr = existing.address;
                (addr, self.pool_for(addr)?)
            } else {
                self.allocate(&table, now)?
            }
        } else {
            self.allocate(&table, now)?
        };

        table.insert(Lease {
            client_id: duid,
            address,
            state: LeaseState::Offered,
            acquired: now,
            duration: Duration::seconds(60.min(pool.lease_time as i64)),
        });
        Some(self.build_reply(request, V6MessageType::Advertise, Some((address, pool)), STATUS_SUCCESS))
    }

    fn bind(
        &self,
        request: &DhcpV6Packet,
        duid: Vec<u8>,
        kind: V6MessageType,
    ) -> Option<DhcpV6Packet> {
        let now = Utc::now();
        let mut table = self.leases.lock().expect("lease lock poisoned");

        let address = match table.find(&duid) {
            Some(lease) if lease.holds_address(now) => lease.address,
            _ => match self.allocate(&table, now) {
                Some((addr, _)) => addr,
                None => {
                    return Some(self.build_reply(request, kind, None, STATUS_NO_ADDRS_AVAIL));
                }
            },
        };
        let pool = self.pool_for(address)?;
        table.insert(Lease {
            client_id: duid.clone(),
            address,
            state: LeaseState::Bound,
            acquired: now,
            duration: Duration::seconds(pool.lease_time as i64),
        });
        info!("bound {address} to DUID {:02x?}", &duid[..duid.len().min(8)]);
        Some(self.build_reply(request, kind, Some((address, pool)), STATUS_SUCCESS))
    }

    fn renew(&self, request: &DhcpV6Packet, duid: Vec<u8>) -> Option<DhcpV6Packet> {
        let now = Utc::now();
        let mut table = self.leases.lock().expect("lease lock poisoned");
        match table.find_mut(&duid) {
            Some(lease) if lease.state == LeaseState::Bound && !lease.is_expired(now) => {
                lease.acquired = now;
                let address = lease.address;
                let pool = self.pool_for(address)?;
                Some(self.build_reply(request, V6MessageType::Reply, Some((address, pool)), STATUS_SUCCESS))
            }
            _ => Some(self.build_reply(request, V6MessageType::Reply, None, STATUS_NO_BINDING)),
        }
    }

    fn release(&self, request: &DhcpV6Packet, duid: Vec<u8>) -> Option<DhcpV6Packet> {
        let mut table = self.leases.lock().expect("lease lock poisoned");
        if let Some(lease) = table.find_mut(&duid) {
            lease.state = LeaseState::Released;
            debug!("released {}", lease.address);
        }
        Some(self.build_reply(request, V6MessageType::Reply, None, STATUS_SUCCESS))
    }

    fn allocate<'a>(
        &'a self,
        table: &LeaseTable<Ipv6Addr>,
        now: chrono::DateTime<Utc>,
    ) -> Option<(Ipv6Addr, &'a DhcpPoolV6)> {
        for pool in &self.pools {
            let start = u128::from(pool.range_start);
            let end = u128::from(pool.range_end);
            let mut raw = start;
            while raw <= end {
                let candidate = Ipv6Addr::from(raw);
                if !table.address_in_use(candidate, now) {
                    return Some((candidate, pool));
                }
                raw += 1;
            }
        }
        info!("DHCPv6 pool exhausted, dropping SOLICIT");
        None
    }

    fn pool_for(&self, address: Ipv6Addr) -> Option<&DhcpPoolV6> {
        self.pools.iter().find(|p| {
            let raw = u128::from(address);
            raw >= u128::from(p.range_start) && raw <= u128::from(p.range_end)
        })
    }

    fn build_reply(
        &self,
        request: &DhcpV6Packet,
        kind: V6MessageType,
        assignment: Option<(Ipv6Addr, &DhcpPoolV6)>,
        status: u16,
    ) -> DhcpV6Packet {
        let mut options = vec![
            V6Option::ServerId(self.server_duid.clone()),
            V6Option::ClientId(request.client_id().unwrap_or_default().to_vec()),
        ];
        let iaid = request.ia_na().map(|(iaid, _)| iaid).unwrap_or(1);
        match assignment {
            Some((address, pool)) => {
                options.push(V6Option::IaNa {
                    iaid,
                    t1: pool.lease_time / 2,
                    t2: pool.lease_time / 5 * 4,
                    options: vec![V6Option::IaAddr {
                        addr: address,
                        preferred: pool.lease_time,
                        valid: pool.lease_time,
                    }],
                });
                if !pool.dns_servers.is_empty() {
                    options.push(V6Option::DnsServers(pool.dns_servers.clone()));
                }
            }
            None => {
                options.push(V6Option::IaNa {
                    iaid,
                    t1: 0,
                    t2: 0,
                    options: vec![V6Option::StatusCode {
                        code: status,
                        message: String::new(),
                    }],
                });
            }
        }
        DhcpV6Packet {
            msg_type: kind,
            txid: request.txid,
            options,
        }
    }
}

/// Link-local address from the EUI-64 expansion of the device MAC, used as
/// the reply source when the device has no configured IPv6 address.
pub fn link_local_for(mac: pnet::util::MacAddr) -> Ipv6Addr {
    let m = mac.octets();
    Ipv6Addr::new(
        0xfe80,
        0,
        0,
        0,
        u16::from_be_bytes([m[0] ^ 0x02, m[1]]),
        u16::from_be_bytes([m[2], 0xff]),
        u16::from_be_bytes([0xfe, m[3]]),
        u16::from_be_bytes([m[4], m[5]]),
    )
}

pub struct DhcpV6Handler {
    servers: HashMap<String, Arc<DhcpV6Server>>,
}

impl DhcpV6Handler {
    pub fn new(servers: HashMap<String, Arc<DhcpV6Server>>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ProtocolHandler for DhcpV6Handler {
    fn name(&self) -> &'static str {
        "dhcpv6"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::UdpPort(DHCPV6_SERVER_PORT)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().dhcpv6.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some(server) = self.servers.get(device.name()) else {
            return Ok(Vec::new());
        };
        let NetLayer::Ipv6(ref v6) = frame.net else {
            return Ok(Vec::new());
        };
        let Transport::Udp { src_port, ref payload, .. } = v6.transport else {
            return Ok(Vec::new());
        };
        let request = DhcpV6Packet::decode(payload)?;
        let Some(reply) = server.handle(&request) else {
            return Ok(Vec::new());
        };

        let src_ip = device
            .config()
            .first_ipv6()
            .unwrap_or_else(|| link_local_for(device.mac()));
        Ok(vec![frame::build_ipv6_udp(
            device.mac(),
            frame.src_mac,
            src_ip,
            v6.src,
            DHCPV6_SERVER_PORT,
            src_port,
            64,
            &reply.encode(),
        )])
    }
}
