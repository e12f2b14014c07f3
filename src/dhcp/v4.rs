//! Per-device DHCPv4 server: DISCOVER/OFFER, REQUEST/ACK-NAK, RELEASE,
//! DECLINE, plus the expiry sweeper.
//!
//! The lease table lock is held across the free-address scan and the insert,
//! so two concurrent DISCOVERs can never be offered the same address.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::{debug, info};

use crate::config::{DhcpPoolV4, DhcpV4Config};
use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{self, Frame, NetLayer, RawFrame, Transport};
use crate::dispatch::{DispatchKey, ProtocolHandler};

use super::lease::{Lease, LeaseState, LeaseTable};
use super::options::{
    DhcpMessageType, DhcpOption, DhcpV4Packet, DHCP_CLIENT_PORT, DHCP_SERVER_PORT,
};

/// How long an OFFER is held before the sweeper reclaims it.
const OFFER_TIMEOUT_SECS: i64 = 60;

pub struct DhcpV4Server {
    pools: Vec<DhcpPoolV4>,
    leases: Mutex<LeaseTable<Ipv4Addr>>,
    server_id: Ipv4Addr,
}

impl DhcpV4Server {
    pub fn new(cfg: &DhcpV4Config, server_id: Ipv4Addr) -> Self {
        Self {
            pools: cfg.pools.clone(),
            leases: Mutex::new(LeaseTable::new()),
            server_id,
        }
    }

    pub fn server_id(&self) -> Ipv4Addr {
        self.server_id
    }

    /// Sweep cadence: a tenth of the shortest lease, with a sane floor.
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

    pub fn handle(&self, request: &DhcpV4Packet) -> Option<DhcpV4Packet> {
        match request.message_type()? {
            DhcpMessageType::Discover => self.discover(request),
            DhcpMessageType::Request => self.request(request),
            DhcpMessageType::Release => {
                self.release(request);
                None
            }
            DhcpMessageType::Decline => {
                self.decline(request);
                None
            }
            _ => None,
        }
    }

    fn discover(&self, request: &DhcpV4Packet) -> Option<DhcpV4Packet> {
        let client = client_key(request);
        let now = Utc::now();
        let mut table = self.leases.lock().expect("lease lock poisoned");

        // An unexpired lease is re-offered as is.
        if let Some(existing) = table.find(&client) {
            if existing.holds_address(now) {
                let address = existing.address;
                let pool = self.pool_for(address)?;
                return Some(self.build_offer(request, address, pool, DhcpMessageType::Offer));
            }
        }

        let (address, pool) = self.allocate(&table, now)?;
        table.insert(Lease {
            client_id: client,
            address,
            state: LeaseState::Offered,
            acquired: now,
            duration: Duration::seconds(OFFER_TIMEOUT_SECS.min(pool.lease_time as i64)),
        });
        Some(self.build_offer(request, address, pool, DhcpMessageType::Offer))
    }

    fn request(&self, request: &DhcpV4Packet) -> Option<DhcpV4Packet> {
        let client = client_key(request);
        let requested = request
            .requested_ip()
            .or_else(|| (!request.ciaddr.is_unspecified()).then_some(request.ciaddr))?;
        let now = Utc::now();
        let mut table = self.leases.lock().expect("lease lock poisoned");

        let matches = table
            .find(&client)
            .map(|l| l.address == requested && l.holds_address(now))
            .unwrap_or(false);
        if !matches {
            // An address this server never offered (stale config, reboot).
            debug!("NAK for {requested} requested by unknown lease");
            return Some(self.build_nak(request));
        }

        let pool = self.pool_for(requested)?;
        let lease = table.find_mut(&client).expect("checked above");
        lease.state = LeaseState::Bound;
        lease.acquired = now;
        lease.duration = Duration::seconds(pool.lease_time as i64);
        info!("bound {requested} to {}", request.client_mac());
        Some(self.build_offer(request, requested, pool, DhcpMessageType::Ack))
    }

    fn release(&self, request: &DhcpV4Packet) {
        let client = client_key(request);
        let mut table = self.leases.lock().expect("lease lock poisoned");
        if let Some(lease) = table.find_mut(&client) {
            lease.state = LeaseState::Released;
            debug!("released {}", lease.address);
        }
    }

    fn decline(&self, request: &DhcpV4Packet) {
        let client = client_key(request);
        let mut table = self.leases.lock().expect("lease lock poisoned");
        if let Some(lease) = table.remove(&client) {
            debug!("declined {}", lease.address);
        }
    }

    /// Lowest free address across the pools, first-fit.
    fn allocate<'a>(
        &'a self,
        table: &LeaseTable<Ipv4Addr>,
        now: chrono::DateTime<Utc>,
    ) -> Option<(Ipv4Addr, &'a DhcpPoolV4)> {
        for pool in &self.pools {
            let start = u32::from(pool.range_start);
            let end = u32::from(pool.range_end);
            for raw in start..=end {
                let candidate = Ipv4Addr::from(raw);
                if !table.address_in_use(candidate, now) {
                    return Some((candidate, pool));
                }
            }
        }
        info!("DHCPv4 pool exhausted, dropping DISCOVER");
        None
    }

    fn pool_for(&self, address: Ipv4Addr) -> Option<&DhcpPoolV4> {
        self.pools.iter().find(|p| {
            let raw = u32::from(address);
            raw >= u32::from(p.range_start) && raw <= u32::from(p.range_end)
        })
    }

    fn build_offer(
        &self,
        request: &DhcpV4Packet,
        address: Ipv4Addr,
        pool: &DhcpPoolV4,
        kind: DhcpMessageType,
    ) -> DhcpV4Packet {
        let mut reply = DhcpV4Packet::reply_to(request);
        reply.yiaddr = address;
        reply.siaddr = pool.gateway.unwrap_or(self.server_id);
        reply.options.push(DhcpOption::MessageType(kind));
        reply.options.push(DhcpOption::ServerId(self.server_id));
        reply.options.push(DhcpOption::LeaseTime(pool.lease_time));
        reply
            .options
            .push(DhcpOption::RenewalTime(pool.lease_time / 2));
        reply
            .options
            .push(DhcpOption::RebindingTime(pool.lease_time / 4 * 3));
        reply
            .options
            .push(DhcpOption::SubnetMask(pool.network.netmask()));
        if let Some(gw) = pool.gateway {
            reply.options.push(DhcpOption::Router(vec![gw]));
        }
        if !pool.dns_servers.is_empty() {
            reply
                .options
                .push(DhcpOption::DomainNameServer(pool.dns_servers.clone()));
        }
        if let Some(domain) = &pool.domain_name {
            reply.options.push(DhcpOption::DomainName(domain.clone()));
        }
        reply
    }

    fn build_nak(&self, request: &DhcpV4Packet) -> DhcpV4Packet {
        let mut reply = DhcpV4Packet::reply_to(request);
        reply.options.push(DhcpOption::MessageType(DhcpMessageType::Nak));
        reply.options.push(DhcpOption::ServerId(self.server_id));
        reply
    }
}

fn client_key(request: &DhcpV4Packet) -> Vec<u8> {
    let hlen = (request.hlen as usize).clamp(1, 16);
    request.chaddr[..hlen].to_vec()
}

/// Dispatcher-facing handler over the per-device servers.
pub struct DhcpV4Handler {
    servers: HashMap<String, Arc<DhcpV4Server>>,
}

impl DhcpV4Handler {
    pub fn new(servers: HashMap<String, Arc<DhcpV4Server>>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ProtocolHandler for DhcpV4Handler {
    fn name(&self) -> &'static str {
        "dhcpv4"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::UdpPort(DHCP_SERVER_PORT)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().dhcp.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some(server) = self.servers.get(device.name()) else {
            return Ok(Vec::new());
        };
        let NetLayer::Ipv4(ref v4) = frame.net else {
            return Ok(Vec::new());
        };
        let Transport::Udp { ref payload, .. } = v4.transport else {
            return Ok(Vec::new());
        };
        let request = DhcpV4Packet::decode(payload)?;
        let Some(reply) = server.handle(&request) else {
            return Ok(Vec::new());
        };

        // Replies to clients without an address go to broadcast; renewals
        // with a live ciaddr are unicast.
        let (dst_mac, dst_ip) = if request.ciaddr.is_unspecified() {
            let mac = if request.flags & 0x8000 != 0 {
                pnet::util::MacAddr::broadcast()
            } else {
                request.client_mac()
            };
            (mac, Ipv4Addr::BROADCAST)
        } else {
            (request.client_mac(), request.ciaddr)
        };

        Ok(vec![frame::build_ipv4_udp(
            device.mac(),
            dst_mac,
            server.server_id(),
            dst_ip,
            DHCP_SERVER_PORT,
            DHCP_CLIENT_PORT,
            64,
            &reply.encode(),
        )])
    }
}
