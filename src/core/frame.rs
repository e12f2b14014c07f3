//! Decoded representation of a captured Ethernet frame.
//!
//! A [`Frame`] is built once by the dispatcher and is immutable afterwards;
//! handlers that answer a frame build a new raw frame instead of mutating the
//! decoded one. Decoding tolerates truncation at every layer by returning
//! [`DecodeError::Truncated`], which the dispatcher counts and drops.

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::arp::ArpPacket;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;
use pnet::util::MacAddr;

use super::errors::DecodeError;

/// An owned raw Ethernet frame, ready for the wire.
pub type RawFrame = Vec<u8>;

pub const ETHERTYPE_LLDP: u16 = 0x88cc;

#[derive(Debug, Clone)]
pub struct Frame {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    /// VLAN identifier when the frame carried one 802.1Q tag.
    pub vlan: Option<u16>,
    /// EtherType after the optional VLAN tag.
    pub ethertype: u16,
    pub net: NetLayer,
}

#[derive(Debug, Clone)]
pub enum NetLayer {
    Arp(ArpView),
    Ipv4(Ipv4View),
    Ipv6(Ipv6View),
    /// L2 payloads the core does not model (LLDP, BPDUs from real bridges...).
    Other(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ArpView {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct Ipv4View {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub transport: Transport,
}

#[derive(Debug, Clone)]
pub struct Ipv6View {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub transport: Transport,
}

#[derive(Debug, Clone)]
pub enum Transport {
    Udp {
        src_port: u16,
        dst_port: u16,
        payload: Vec<u8>,
    },
    Tcp {
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload: Vec<u8>,
    },
    /// Whole ICMP message including its header, for re-parsing by handlers.
    Icmp { bytes: Vec<u8> },
    /// Whole ICMPv6 message including its header.
    Icmpv6 { bytes: Vec<u8> },
    Other { protocol: u8, payload: Vec<u8> },
}

impl Frame {
    /// True when the destination is the Ethernet broadcast or a multicast group.
    pub fn is_broadcast_or_multicast(&self) -> bool {
        self.dst_mac == MacAddr::broadcast() || self.dst_mac.0 & 0x01 != 0
    }

    pub fn udp(&self) -> Option<(u16, u16, &[u8])> {
        let transport = match &self.net {
            NetLayer::Ipv4(v4) => &v4.transport,
            NetLayer::Ipv6(v6) => &v6.transport,
            _ => return None,
        };
        match transport {
            Transport::Udp { src_port, dst_port, payload } => Some((*src_port, *dst_port, payload.as_slice())),
            _ => None,
        }
    }
}

/// Decodes Ethernet, at most one 802.1Q tag, then the network and transport
/// layers. Unknown protocols land in `Other` variants rather than erroring so
/// that handlers keyed on raw EtherTypes still see them.
pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
    let eth = EthernetPacket::new(raw).ok_or(DecodeError::Truncated("ethernet"))?;
    let dst_mac = eth.get_destination();
    let src_mac = eth.get_source();

    let mut ethertype = eth.get_ethertype();
    let mut vlan = None;
    let mut l3: Vec<u8> = eth.payload().to_vec();

    if ethertype == EtherTypes::Vlan {
        let tag = VlanPacket::new(&l3).ok_or(DecodeError::Truncated("vlan"))?;
        vlan = Some(tag.get_vlan_identifier());
        ethertype = tag.get_ethertype();
        l3 = tag.payload().to_vec();
    }

    let net = match ethertype {
        EtherTypes::Arp => NetLayer::Arp(decode_arp(&l3)?),
        EtherTypes::Ipv4 => NetLayer::Ipv4(decode_ipv4(&l3)?),
        EtherTypes::Ipv6 => NetLayer::Ipv6(decode_ipv6(&l3)?),
        _ => NetLayer::Other(l3),
    };

    Ok(Frame {
        dst_mac,
        src_mac,
        vlan,
        ethertype: ethertype.0,
        net,
    })
}

fn decode_arp(bytes: &[u8]) -> Result<ArpView, DecodeError> {
    let arp = ArpPacket::new(bytes).ok_or(DecodeError::Truncated("arp"))?;
    Ok(ArpView {
        operation: arp.get_operation().0,
        sender_mac: arp.get_sender_hw_addr(),
        sender_ip: arp.get_sender_proto_addr(),
        target_mac: arp.get_target_hw_addr(),
        target_ip: arp.get_target_proto_addr(),
    })
}

fn decode_ipv4(bytes: &[u8]) -> Result<Ipv4View, DecodeError> {
    let ip = Ipv4Packet::new(bytes).ok_or(DecodeError::Truncated("ipv4"))?;
    if ip.get_version() != 4 {
        return Err(DecodeError::Unsupported { what: "ip version", value: ip.get_version() as u32 });
    }
    let protocol = ip.get_next_level_protocol().0;
    let transport = decode_transport(protocol, ip.payload())?;
    Ok(Ipv4View {
        src: ip.get_source(),
        dst: ip.get_destination(),
        protocol,
        ttl: ip.get_ttl(),
        transport,
    })
}

fn decode_ipv6(bytes: &[u8]) -> Result<Ipv6View, DecodeError> {
    let ip = Ipv6Packet::new(bytes).ok_or(DecodeError::Truncated("ipv6"))?;
    let next_header = ip.get_next_header().0;
    let transport = decode_transport(next_header, ip.payload())?;
    Ok(Ipv6View {
        src: ip.get_source(),
        dst: ip.get_destination(),
        next_header,
        hop_limit: ip.get_hop_limit(),
        transport,
    })
}

fn decode_transport(protocol: u8, payload: &[u8]) -> Result<Transport, DecodeError> {
    if protocol == IpNextHeaderProtocols::Udp.0 {
        let udp = UdpPacket::new(payload).ok_or(DecodeError::Truncated("udp"))?;
        Ok(Transport::Udp {
            src_port: udp.get_source(),
            dst_port: udp.get_destination(),
            payload: udp.payload().to_vec(),
        })
    } else if protocol == IpNextHeaderProtocols::Tcp.0 {
        let tcp = TcpPacket::new(payload).ok_or(DecodeError::Truncated("tcp"))?;
        Ok(Transport::Tcp {
            src_port: tcp.get_source(),
            dst_port: tcp.get_destination(),
            seq: tcp.get_sequence(),
            ack: tcp.get_acknowledgement(),
            flags: tcp.get_flags(),
            window: tcp.get_window(),
            payload: tcp.payload().to_vec(),
        })
    } else if protocol == IpNextHeaderProtocols::Icmp.0 {
        if payload.len() < 4 {
            return Err(DecodeError::Truncated("icmp"));
        }
        Ok(Transport::Icmp { bytes: payload.to_vec() })
    } else if protocol == IpNextHeaderProtocols::Icmpv6.0 {
        if payload.len() < 4 {
            return Err(DecodeError::Truncated("icmpv6"));
        }
        Ok(Transport::Icmpv6 { bytes: payload.to_vec() })
    } else {
        Ok(Transport::Other { protocol, payload: payload.to_vec() })
    }
}

/// Wraps a payload in an Ethernet header.
pub fn build_ethernet(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> RawFrame {
    let mut buf = vec![0u8; 14 + payload.len()];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf).expect("sized above");
        eth.set_destination(dst);
        eth.set_source(src);
        eth.set_ethertype(pnet::packet::ethernet::EtherType(ethertype));
        eth.set_payload(payload);
    }
    buf
}

/// Builds a complete Ethernet + IPv4 + UDP frame with checksums filled in.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_udp(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    payload: &[u8],
) -> RawFrame {
    let udp_len = 8 + payload.len();
    let mut datagram = vec![0u8; udp_len];
    {
        let mut udp_pkt = MutableUdpPacket::new(&mut datagram).expect("sized above");
        udp_pkt.set_source(src_port);
        udp_pkt.set_destination(dst_port);
        udp_pkt.set_length(udp_len as u16);
        udp_pkt.set_payload(payload);
        let checksum = udp::ipv4_checksum(&udp_pkt.to_immutable(), &src_ip, &dst_ip);
        udp_pkt.set_checksum(checksum);
    }
    let ip_payload = build_ipv4(src_ip, dst_ip, IpNextHeaderProtocols::Udp.0, ttl, &datagram);
    build_ethernet(dst_mac, src_mac, EtherTypes::Ipv4.0, &ip_payload)
}

/// Builds an IPv4 packet (header + payload) with the header checksum set.
pub fn build_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut buf = vec![0u8; total];
    {
        let mut ip = MutableIpv4Packet::new(&mut buf).expect("sized above");
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_identification(0);
        ip.set_ttl(ttl);
        ip.set_next_level_protocol(pnet::packet::ip::IpNextHeaderProtocol(protocol));
        ip.set_source(src);
        ip.set_destination(dst);
        ip.set_payload(payload);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    buf
}

/// Builds a complete Ethernet + IPv6 + UDP frame with the UDP checksum set.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv6_udp(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    hop_limit: u8,
    payload: &[u8],
) -> RawFrame {
    let udp_len = 8 + payload.len();
    let mut datagram = vec![0u8; udp_len];
    {
        let mut udp_pkt = MutableUdpPacket::new(&mut datagram).expect("sized above");
        udp_pkt.set_source(src_port);
        udp_pkt.set_destination(dst_port);
        udp_pkt.set_length(udp_len as u16);
        udp_pkt.set_payload(payload);
        let checksum = udp::ipv6_checksum(&udp_pkt.to_immutable(), &src_ip, &dst_ip);
        udp_pkt.set_checksum(checksum);
    }
    let ip_payload = build_ipv6(src_ip, dst_ip, IpNextHeaderProtocols::Udp.0, hop_limit, &datagram);
    build_ethernet(dst_mac, src_mac, EtherTypes::Ipv6.0, &ip_payload)
}

/// Builds an IPv6 packet (header + payload).
pub fn build_ipv6(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, hop_limit: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 40 + payload.len()];
    {
        let mut ip = MutableIpv6Packet::new(&mut buf).expect("sized above");
        ip.set_version(6);
        ip.set_payload_length(payload.len() as u16);
        ip.set_next_header(pnet::packet::ip::IpNextHeaderProtocol(next_header));
        ip.set_hop_limit(hop_limit);
        ip.set_source(src);
        ip.set_destination(dst);
        ip.set_payload(payload);
    }
    buf
}

/// Converts the configured MAC type into the wire representation.
pub fn wire_mac(mac: &mac_address::MacAddress) -> MacAddr {
    let b = mac.bytes();
    MacAddr::new(b[0], b[1], b[2], b[3], b[4], b[5])
}
