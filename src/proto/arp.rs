//! ARP responder and the gratuitous ARP builder used by the traffic
//! generator and the device-start announcement.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::EtherTypes;
use pnet::util::MacAddr;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{self, Frame, NetLayer, RawFrame};
use crate::dispatch::{DispatchKey, ProtocolHandler};

const ARP_PACKET_LEN: usize = 28;

pub struct ArpHandler;

#[async_trait]
impl ProtocolHandler for ArpHandler {
    fn name(&self) -> &'static str {
        "arp"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::EtherType(EtherTypes::Arp.0)]
    }

    /// Any device with an IPv4 address answers ARP.
    fn enabled_for(&self, device: &Device) -> bool {
        device.ips().iter().any(|ip| ip.is_ipv4())
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let NetLayer::Arp(ref arp) = frame.net else {
            return Ok(Vec::new());
        };
        if arp.operation != ArpOperations::Request.0 {
            return Ok(Vec::new());
        }
        if !device.has_ip(&IpAddr::V4(arp.target_ip)) {
            return Ok(Vec::new());
        }
        Ok(vec![build_reply(
            device.mac(),
            arp.target_ip,
            arp.sender_mac,
            arp.sender_ip,
        )])
    }
}

fn build_arp(
    operation: pnet::packet::arp::ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buf = vec![0u8; ARP_PACKET_LEN];
    {
        let mut arp = MutableArpPacket::new(&mut buf).expect("sized above");
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(operation);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(target_mac);
        arp.set_target_proto_addr(target_ip);
    }
    buf
}

pub fn build_reply(
    device_mac: MacAddr,
    device_ip: Ipv4Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv4Addr,
) -> RawFrame {
    let arp = build_arp(
        ArpOperations::Reply,
        device_mac,
        device_ip,
        requester_mac,
        requester_ip,
    );
    frame::build_ethernet(requester_mac, device_mac, EtherTypes::Arp.0, &arp)
}

/// Request for our own address, broadcast to announce presence.
pub fn build_gratuitous(device_mac: MacAddr, device_ip: Ipv4Addr) -> RawFrame {
    let arp = build_arp(
        ArpOperations::Request,
        device_mac,
        device_ip,
        MacAddr::zero(),
        device_ip,
    );
    frame::build_ethernet(MacAddr::broadcast(), device_mac, EtherTypes::Arp.0, &arp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::device::DeviceState;
    use crate::core::frame::decode;
    use mac_address::MacAddress;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d", "server", MacAddress::new([0x02, 0, 0, 0, 0, 0x01]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    fn who_has(target: Ipv4Addr, sender: Ipv4Addr) -> RawFrame {
        let arp = build_arp(
            ArpOperations::Request,
            MacAddr::new(2, 0, 0, 0, 0, 0x09),
            sender,
            MacAddr::zero(),
            target,
        );
        frame::build_ethernet(
            MacAddr::broadcast(),
            MacAddr::new(2, 0, 0, 0, 0, 0x09),
            EtherTypes::Arp.0,
            &arp,
        )
    }

    #[tokio::test]
    async fn request_for_our_ip_gets_exactly_one_reply() {
        let device = device();
        let raw = who_has("10.0.0.5".parse().unwrap(), "10.0.0.9".parse().unwrap());
        let parsed = decode(&raw).unwrap();
        let replies = ArpHandler.handle(&parsed, &device).await.unwrap();
        assert_eq!(replies.len(), 1);

        let reply = decode(&replies[0]).unwrap();
        let NetLayer::Arp(arp) = reply.net else { panic!("not arp") };
        assert_eq!(arp.operation, ArpOperations::Reply.0);
        assert_eq!(arp.sender_mac, MacAddr::new(0x02, 0, 0, 0, 0, 0x01));
        assert_eq!(arp.sender_ip, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(arp.target_ip, "10.0.0.9".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn request_for_other_ip_is_ignored() {
        let device = device();
        let raw = who_has("10.0.0.77".parse().unwrap(), "10.0.0.9".parse().unwrap());
        let parsed = decode(&raw).unwrap();
        assert!(ArpHandler.handle(&parsed, &device).await.unwrap().is_empty());
    }

    #[test]
    fn gratuitous_arp_announces_own_address() {
        let raw = build_gratuitous(MacAddr::new(2, 0, 0, 0, 0, 1), "10.0.0.5".parse().unwrap());
        let parsed = decode(&raw).unwrap();
        assert!(parsed.is_broadcast_or_multicast());
        let NetLayer::Arp(arp) = parsed.net else { panic!("not arp") };
        assert_eq!(arp.sender_ip, arp.target_ip);
    }
}
