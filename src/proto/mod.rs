//! Per-protocol responders and the periodic discovery advertisers.

pub mod arp;
pub mod discovery;
pub mod dns;
pub mod ftp;
pub mod http;
pub mod icmp;
pub mod icmpv6;
pub mod netbios;
pub mod stp;
pub mod tcp;

use std::net::IpAddr;

use crate::core::device::Device;
use crate::core::frame::{self, Frame, NetLayer, RawFrame};

/// Builds the UDP reply frame for a request that arrived in `frame`,
/// swapping ports and addressing. The source address is the one the request
/// was sent to when the device owns it, else the device's first address of
/// the matching family.
pub(crate) fn udp_reply(
    frame: &Frame,
    device: &Device,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Option<RawFrame> {
    match &frame.net {
        NetLayer::Ipv4(v4) => {
            let src_ip = if device.has_ip(&IpAddr::V4(v4.dst)) {
                v4.dst
            } else {
                device.config().first_ipv4()?
            };
            Some(frame::build_ipv4_udp(
                device.mac(),
                frame.src_mac,
                src_ip,
                v4.src,
                src_port,
                dst_port,
                64,
                payload,
            ))
        }
        NetLayer::Ipv6(v6) => {
            let src_ip = if device.has_ip(&IpAddr::V6(v6.dst)) {
                v6.dst
            } else {
                device.config().first_ipv6()?
            };
            Some(frame::build_ipv6_udp(
                device.mac(),
                frame.src_mac,
                src_ip,
                v6.src,
                src_port,
                dst_port,
                64,
                payload,
            ))
        }
        _ => None,
    }
}
