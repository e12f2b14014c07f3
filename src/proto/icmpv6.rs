//! ICMPv6 echo responder and NDP neighbor discovery.
//!
//! Neighbor solicitations are only answered when the inbound hop limit is
//! exactly 255, as RFC 4861 requires; anything else is assumed to be off-link
//! forgery and ignored.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use pnet::packet::icmpv6::ndp::{MutableNeighborAdvertPacket, NdpOption, NdpOptionTypes, NeighborSolicitPacket};
use pnet::packet::icmpv6::{self, Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{self, Frame, NetLayer, RawFrame, Transport};
use crate::dispatch::{DispatchKey, ProtocolHandler};

const NDP_HOP_LIMIT: u8 = 255;
/// Solicited + Override.
const NA_FLAGS: u8 = 0x60;

pub struct Icmpv6Handler;

#[async_trait]
impl ProtocolHandler for Icmpv6Handler {
    fn name(&self) -> &'static str {
        "icmpv6"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::IpProto(IpNextHeaderProtocols::Icmpv6.0)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().icmpv6.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let NetLayer::Ipv6(ref v6) = frame.net else {
            return Ok(Vec::new());
        };
        let Transport::Icmpv6 { ref bytes } = v6.transport else {
            return Ok(Vec::new());
        };
        let Some(packet) = Icmpv6Packet::new(bytes) else {
            return Ok(Vec::new());
        };

        match packet.get_icmpv6_type() {
            Icmpv6Types::NeighborSolicit => {
                if v6.hop_limit != NDP_HOP_LIMIT {
                    return Ok(Vec::new());
                }
                self.neighbor_advert(frame, device, v6.src, bytes)
            }
            Icmpv6Types::EchoRequest => self.echo_reply(frame, device, v6.src, v6.dst, bytes),
            _ => Ok(Vec::new()),
        }
    }
}

impl Icmpv6Handler {
    fn neighbor_advert(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
        requester: Ipv6Addr,
        bytes: &[u8],
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some(ns) = NeighborSolicitPacket::new(bytes) else {
            return Ok(Vec::new());
        };
        let target = ns.get_target_addr();
        if !device.has_ip(&IpAddr::V6(target)) {
            return Ok(Vec::new());
        }

        // 24-byte advert header plus one 8-byte target link-layer option.
        let mut na = vec![0u8; 32];
        {
            let mut pkt = MutableNeighborAdvertPacket::new(&mut na).expect("sized above");
            pkt.set_icmpv6_type(Icmpv6Types::NeighborAdvert);
            pkt.set_icmpv6_code(Icmpv6Code(0));
            pkt.set_flags(NA_FLAGS);
            pkt.set_target_addr(target);
            pkt.set_options(&[NdpOption {
                option_type: NdpOptionTypes::TargetLLAddr,
                length: 1,
                data: device.mac().octets().to_vec(),
            }]);
        }
        // An unspecified source solicits to the all-nodes group.
        let dst = if requester.is_unspecified() {
            "ff02::1".parse().expect("constant")
        } else {
            requester
        };
        finish_icmpv6(&mut na, target, dst);

        let ip_packet = frame::build_ipv6(
            target,
            dst,
            IpNextHeaderProtocols::Icmpv6.0,
            NDP_HOP_LIMIT,
            &na,
        );
        Ok(vec![frame::build_ethernet(
            frame.src_mac,
            device.mac(),
            pnet::packet::ethernet::EtherTypes::Ipv6.0,
            &ip_packet,
        )])
    }

    fn echo_reply(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
        requester: Ipv6Addr,
        queried: Ipv6Addr,
        bytes: &[u8],
    ) -> Result<Vec<RawFrame>, HandlerError> {
        if bytes.len() < 8 {
            return Ok(Vec::new());
        }
        let src_ip = if device.has_ip(&IpAddr::V6(queried)) {
            queried
        } else {
            match device.config().first_ipv6() {
                Some(ip) => ip,
                None => return Ok(Vec::new()),
            }
        };

        let mut reply = bytes.to_vec();
        {
            let mut pkt = MutableIcmpv6Packet::new(&mut reply).expect("len checked");
            pkt.set_icmpv6_type(Icmpv6Types::EchoReply);
            pkt.set_icmpv6_code(Icmpv6Code(0));
        }
        finish_icmpv6(&mut reply, src_ip, requester);

        let hop_limit = device.config().icmpv6.hop_limit;
        let ip_packet = frame::build_ipv6(
            src_ip,
            requester,
            IpNextHeaderProtocols::Icmpv6.0,
            hop_limit,
            &reply,
        );
        Ok(vec![frame::build_ethernet(
            frame.src_mac,
            device.mac(),
            pnet::packet::ethernet::EtherTypes::Ipv6.0,
            &ip_packet,
        )])
    }
}

/// Computes and patches the ICMPv6 checksum in place.
fn finish_icmpv6(buf: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) {
    let checksum = icmpv6::checksum(&Icmpv6Packet::new(buf).expect("caller sizes buf"), &src, &dst);
    let mut pkt = MutableIcmpv6Packet::new(buf).expect("caller sizes buf");
    pkt.set_checksum(checksum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::device::DeviceState;
    use crate::core::frame::decode;
    use mac_address::MacAddress;
    use pnet::packet::icmpv6::ndp::MutableNeighborSolicitPacket;
    use pnet::util::MacAddr;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("2001:db8::5".parse::<IpAddr>().unwrap());
        cfg.icmpv6.enabled = true;
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    fn solicit_frame(target: Ipv6Addr, hop_limit: u8) -> RawFrame {
        let mut ns = vec![0u8; 24];
        {
            let mut pkt = MutableNeighborSolicitPacket::new(&mut ns).unwrap();
            pkt.set_icmpv6_type(Icmpv6Types::NeighborSolicit);
            pkt.set_icmpv6_code(Icmpv6Code(0));
            pkt.set_target_addr(target);
        }
        let src: Ipv6Addr = "fe80::9".parse().unwrap();
        let dst: Ipv6Addr = "ff02::1:ff00:5".parse().unwrap();
        finish_icmpv6(&mut ns, src, dst);
        let ip = frame::build_ipv6(src, dst, IpNextHeaderProtocols::Icmpv6.0, hop_limit, &ns);
        frame::build_ethernet(
            MacAddr::new(0x33, 0x33, 0xff, 0, 0, 5),
            MacAddr::new(2, 0, 0, 0, 0, 9),
            pnet::packet::ethernet::EtherTypes::Ipv6.0,
            &ip,
        )
    }

    #[tokio::test]
    async fn valid_solicitation_is_answered_with_advert() {
        let device = device();
        let parsed = decode(&solicit_frame("2001:db8::5".parse().unwrap(), 255)).unwrap();
        let replies = Icmpv6Handler.handle(&parsed, &device).await.unwrap();
        assert_eq!(replies.len(), 1);

        let reply = decode(&replies[0]).unwrap();
        let NetLayer::Ipv6(v6) = reply.net else { panic!("not ipv6") };
        assert_eq!(v6.hop_limit, 255);
        let Transport::Icmpv6 { bytes } = v6.transport else { panic!("not icmpv6") };
        let pkt = Icmpv6Packet::new(&bytes).unwrap();
        assert_eq!(pkt.get_icmpv6_type(), Icmpv6Types::NeighborAdvert);
    }

    #[tokio::test]
    async fn solicitation_with_wrong_hop_limit_is_ignored() {
        let device = device();
        let parsed = decode(&solicit_frame("2001:db8::5".parse().unwrap(), 64)).unwrap();
        assert!(Icmpv6Handler.handle(&parsed, &device).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn solicitation_for_other_target_is_ignored() {
        let device = device();
        let parsed = decode(&solicit_frame("2001:db8::99".parse().unwrap(), 255)).unwrap();
        assert!(Icmpv6Handler.handle(&parsed, &device).await.unwrap().is_empty());
    }
}
