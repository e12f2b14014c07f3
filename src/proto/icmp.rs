//! ICMPv4 echo responder.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use pnet::packet::icmp::echo_reply::MutableEchoReplyPacket;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::icmp::{self, IcmpCode, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{self, Frame, NetLayer, RawFrame, Transport};
use crate::dispatch::{DispatchKey, ProtocolHandler};

pub struct IcmpHandler;

#[async_trait]
impl ProtocolHandler for IcmpHandler {
    fn name(&self) -> &'static str {
        "icmp"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::IpProto(IpNextHeaderProtocols::Icmp.0)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().icmp.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let NetLayer::Ipv4(ref v4) = frame.net else {
            return Ok(Vec::new());
        };
        let Transport::Icmp { ref bytes } = v4.transport else {
            return Ok(Vec::new());
        };
        let Some(request) = IcmpPacket::new(bytes) else {
            return Ok(Vec::new());
        };
        if request.get_icmp_type() != IcmpTypes::EchoRequest {
            return Ok(Vec::new());
        }
        let Some(echo) = EchoRequestPacket::new(bytes) else {
            return Ok(Vec::new());
        };

        let mut reply = vec![0u8; bytes.len()];
        {
            let mut pkt = MutableEchoReplyPacket::new(&mut reply).expect("len checked");
            pkt.set_icmp_type(IcmpTypes::EchoReply);
            pkt.set_icmp_code(IcmpCode(0));
            pkt.set_identifier(echo.get_identifier());
            pkt.set_sequence_number(echo.get_sequence_number());
            pkt.set_payload(echo.payload());
        }
        let checksum = icmp::checksum(&IcmpPacket::new(&reply).expect("sized above"));
        {
            let mut pkt = MutableIcmpPacket::new(&mut reply).expect("sized above");
            pkt.set_checksum(checksum);
        }

        let src_ip = if device.has_ip(&IpAddr::V4(v4.dst)) {
            v4.dst
        } else {
            match device.config().first_ipv4() {
                Some(ip) => ip,
                None => return Ok(Vec::new()),
            }
        };
        let ip_packet = frame::build_ipv4(
            src_ip,
            v4.src,
            IpNextHeaderProtocols::Icmp.0,
            device.config().icmp.ttl,
            &reply,
        );
        Ok(vec![frame::build_ethernet(
            frame.src_mac,
            device.mac(),
            pnet::packet::ethernet::EtherTypes::Ipv4.0,
            &ip_packet,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::device::DeviceState;
    use crate::core::frame::decode;
    use mac_address::MacAddress;
    use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
    use pnet::util::MacAddr;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        cfg.icmp.enabled = true;
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    fn echo_request_frame(payload: &[u8]) -> RawFrame {
        let mut icmp_buf = vec![0u8; 8 + payload.len()];
        {
            let mut pkt = MutableEchoRequestPacket::new(&mut icmp_buf).unwrap();
            pkt.set_icmp_type(IcmpTypes::EchoRequest);
            pkt.set_icmp_code(IcmpCode(0));
            pkt.set_identifier(0x77);
            pkt.set_sequence_number(3);
            pkt.set_payload(payload);
        }
        let checksum = icmp::checksum(&IcmpPacket::new(&icmp_buf).unwrap());
        {
            let mut pkt = MutableIcmpPacket::new(&mut icmp_buf).unwrap();
            pkt.set_checksum(checksum);
        }
        let ip = frame::build_ipv4(
            "10.0.0.9".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            IpNextHeaderProtocols::Icmp.0,
            64,
            &icmp_buf,
        );
        frame::build_ethernet(
            MacAddr::new(2, 0, 0, 0, 0, 1),
            MacAddr::new(2, 0, 0, 0, 0, 9),
            pnet::packet::ethernet::EtherTypes::Ipv4.0,
            &ip,
        )
    }

    #[tokio::test]
    async fn echo_request_gets_echo_reply_with_same_id_and_payload() {
        let device = device();
        let parsed = decode(&echo_request_frame(b"abcdefgh")).unwrap();
        let replies = IcmpHandler.handle(&parsed, &device).await.unwrap();
        assert_eq!(replies.len(), 1);

        let reply = decode(&replies[0]).unwrap();
        let NetLayer::Ipv4(v4) = reply.net else { panic!("not ipv4") };
        assert_eq!(v4.src, "10.0.0.5".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(v4.ttl, 64);
        let Transport::Icmp { bytes } = v4.transport else { panic!("not icmp") };
        let pkt = IcmpPacket::new(&bytes).unwrap();
        assert_eq!(pkt.get_icmp_type(), IcmpTypes::EchoReply);
        let echo = EchoRequestPacket::new(&bytes).unwrap();
        assert_eq!(echo.get_identifier(), 0x77);
        assert_eq!(echo.get_sequence_number(), 3);
        assert_eq!(echo.payload(), b"abcdefgh");
    }
}
