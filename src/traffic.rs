//! Per-device outgoing traffic generator: periodic gratuitous ARP, ICMP
//! echo requests to configured targets, and small random UDP datagrams.
//! Everything goes through the rate-limited sink and stops with the run.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpCode, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::util::MacAddr;
use rand::Rng;
use tokio::sync::watch;

use crate::core::device::Device;
use crate::core::frame::{self, RawFrame};
use crate::netio::capture::FrameSink;
use crate::netio::ratelimit::RateLimiter;
use crate::proto::arp;

pub struct TrafficGenerator {
    device: Arc<Device>,
    sink: Arc<dyn FrameSink>,
    limiter: Arc<RateLimiter>,
}

impl TrafficGenerator {
    pub fn new(device: Arc<Device>, sink: Arc<dyn FrameSink>, limiter: Arc<RateLimiter>) -> Self {
        Self { device, sink, limiter }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let cfg = self.device.config().traffic.clone();
        let garp_interval = cfg.gratuitous_arp_interval.unwrap_or(Duration::from_secs(120));
        let mut garp_ticker = tokio::time::interval(garp_interval);
        let mut ping_ticker = tokio::time::interval(cfg.ping_interval);
        let mut udp_ticker = tokio::time::interval(cfg.random_udp_interval);
        garp_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        udp_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = garp_ticker.tick() => {
                    if cfg.gratuitous_arp_interval.is_some() {
                        self.emit_gratuitous_arp().await;
                    }
                }
                _ = ping_ticker.tick() => {
                    for target in &cfg.ping_targets {
                        self.emit_ping(*target).await;
                    }
                }
                _ = udp_ticker.tick() => {
                    if cfg.random_udp {
                        self.emit_random_udp().await;
                    }
                }
            }
        }
        debug!("traffic generator for {} exited", self.device.name());
    }

    async fn emit(&self, frame: RawFrame) {
        if !self.device.is_up() {
            return;
        }
        if self.limiter.acquire().await {
            let len = frame.len();
            if self.sink.send_frame(frame).await.is_ok() {
                self.device.counters().record_out(len);
            }
        }
    }

    async fn emit_gratuitous_arp(&self) {
        let Some(ip) = self.device.config().first_ipv4() else {
            return;
        };
        trace!("gratuitous ARP from {}", self.device.name());
        self.emit(arp::build_gratuitous(self.device.mac(), ip)).await;
    }

    async fn emit_ping(&self, target: Ipv4Addr) {
        let Some(src_ip) = self.device.config().first_ipv4() else {
            return;
        };
        let frame = build_echo_request(
            self.device.mac(),
            src_ip,
            target,
            rand::thread_rng().gen(),
            self.device.config().icmp.ttl.max(1),
        );
        self.emit(frame).await;
    }

    async fn emit_random_udp(&self) {
        let Some(src_ip) = self.device.config().first_ipv4() else {
            return;
        };
        let (payload, dst_ip, src_port, dst_port) = {
            let mut rng = rand::thread_rng();
            let payload: Vec<u8> = (0..rng.gen_range(16..128)).map(|_| rng.gen()).collect();
            let dst_ip = Ipv4Addr::new(
                src_ip.octets()[0],
                src_ip.octets()[1],
                src_ip.octets()[2],
                rng.gen_range(1..255),
            );
            let src_port = rng.gen_range(1024..65535);
            let dst_port = rng.gen_range(1024..65535);
            (payload, dst_ip, src_port, dst_port)
        };
        let frame = frame::build_ipv4_udp(
            self.device.mac(),
            MacAddr::broadcast(),
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            64,
            &payload,
        );
        self.emit(frame).await;
    }
}

/// Echo request addressed to the broadcast MAC; real peers answer via their
/// own ARP state, observers just see the probe.
fn build_echo_request(
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ident: u16,
    ttl: u8,
) -> RawFrame {
    let mut icmp_buf = vec![0u8; 16];
    {
        let mut pkt = MutableEchoRequestPacket::new(&mut icmp_buf).expect("sized above");
        pkt.set_icmp_type(IcmpTypes::EchoRequest);
        pkt.set_icmp_code(IcmpCode(0));
        pkt.set_identifier(ident);
        pkt.set_sequence_number(1);
        pkt.set_payload(&[0x6e, 0x64, 0x73, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }
    let checksum = icmp::checksum(&IcmpPacket::new(&icmp_buf).expect("sized above"));
    {
        let mut pkt = MutableIcmpPacket::new(&mut icmp_buf).expect("sized above");
        pkt.set_checksum(checksum);
    }
    let ip = frame::build_ipv4(src_ip, dst_ip, IpNextHeaderProtocols::Icmp.0, ttl, &icmp_buf);
    frame::build_ethernet(
        MacAddr::broadcast(),
        src_mac,
        pnet::packet::ethernet::EtherTypes::Ipv4.0,
        &ip,
    )
}
