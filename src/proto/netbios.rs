//! NetBIOS name service responder (UDP 137): answers name queries for the
//! configured name with a positive node-status style response.

use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{Frame, RawFrame};
use crate::dispatch::{DispatchKey, ProtocolHandler};

pub const NETBIOS_NS_PORT: u16 = 137;

const TYPE_NB: u16 = 0x0020;
const CLASS_IN: u16 = 1;
/// Response, authoritative, recursion-desired echoed.
const RESPONSE_FLAGS: u16 = 0x8500;
const DEFAULT_TTL: u32 = 300_000;

pub struct NetbiosHandler;

#[async_trait]
impl ProtocolHandler for NetbiosHandler {
    fn name(&self) -> &'static str {
        "netbios"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::UdpPort(NETBIOS_NS_PORT)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().netbios.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some((src_port, _, payload)) = frame.udp() else {
            return Ok(Vec::new());
        };
        let Some(query) = NameQuery::parse(payload) else {
            return Ok(Vec::new());
        };
        if !query
            .name
            .eq_ignore_ascii_case(&device.config().netbios.name)
        {
            return Ok(Vec::new());
        }
        let Some(ip) = device.config().first_ipv4() else {
            return Ok(Vec::new());
        };
        trace!("NBNS query for {} answered by {}", query.name, device.name());

        let mut out = Vec::with_capacity(62);
        out.extend_from_slice(&query.id.to_be_bytes());
        out.extend_from_slice(&RESPONSE_FLAGS.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&query.encoded_name);
        out.extend_from_slice(&TYPE_NB.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&DEFAULT_TTL.to_be_bytes());
        out.extend_from_slice(&6u16.to_be_bytes());
        // NB flags: unique name, B-node.
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&ip.octets());

        Ok(
            super::udp_reply(frame, device, NETBIOS_NS_PORT, src_port, &out)
                .into_iter()
                .collect(),
        )
    }
}

struct NameQuery {
    id: u16,
    name: String,
    /// Full encoded question name, echoed into the answer.
    encoded_name: Vec<u8>,
}

impl NameQuery {
    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 12 + 34 + 4 {
            return None;
        }
        let id = u16::from_be_bytes([payload[0], payload[1]]);
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        if flags & 0x8000 != 0 {
            return None;
        }
        let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
        if qdcount != 1 {
            return None;
        }
        if payload[12] != 0x20 || payload[12 + 33] != 0 {
            return None;
        }
        let encoded = &payload[13..13 + 32];
        let qtype = u16::from_be_bytes([payload[46], payload[47]]);
        if qtype != TYPE_NB {
            return None;
        }
        Some(Self {
            id,
            name: decode_name(encoded),
            encoded_name: payload[12..12 + 34].to_vec(),
        })
    }
}

/// First-level decoding: pairs of 'A'-offset nibbles form 16 bytes, of which
/// the first 15 are the space-padded name and the last is the suffix type.
fn decode_name(encoded: &[u8]) -> String {
    let mut raw = Vec::with_capacity(16);
    for pair in encoded.chunks_exact(2) {
        let hi = pair[0].wrapping_sub(b'A') & 0x0f;
        let lo = pair[1].wrapping_sub(b'A') & 0x0f;
        raw.push((hi << 4) | lo);
    }
    raw.truncate(15);
    String::from_utf8_lossy(&raw).trim_end().to_string()
}

/// First-level encoding of a ≤15-char name with the given suffix byte.
pub fn encode_name(name: &str, suffix: u8) -> Vec<u8> {
    let mut raw = [b' '; 16];
    let upper = name.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let n = bytes.len().min(15);
    raw[..n].copy_from_slice(&bytes[..n]);
    raw[15] = suffix;

    let mut out = Vec::with_capacity(34);
    out.push(0x20);
    for b in raw {
        out.push(b'A' + (b >> 4));
        out.push(b'A' + (b & 0x0f));
    }
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::device::DeviceState;
    use crate::core::frame::{self, decode};
    use mac_address::MacAddress;
    use pnet::util::MacAddr;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        cfg.netbios.enabled = true;
        cfg.netbios.name = "FILESRV".into();
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    fn name_query(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xBEEFu16.to_be_bytes());
        out.extend_from_slice(&0x0110u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0u8; 6]);
        out.extend_from_slice(&encode_name(name, 0x00));
        out.extend_from_slice(&TYPE_NB.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    #[test]
    fn name_encoding_round_trips() {
        let encoded = encode_name("FILESRV", 0x00);
        assert_eq!(encoded.len(), 34);
        assert_eq!(decode_name(&encoded[1..33]), "FILESRV");
    }

    #[tokio::test]
    async fn query_for_our_name_gets_positive_response_with_ip() {
        let device = device();
        let raw = frame::build_ipv4_udp(
            MacAddr::new(2, 0, 0, 0, 0, 9),
            MacAddr::broadcast(),
            "10.0.0.9".parse().unwrap(),
            "10.0.0.255".parse().unwrap(),
            NETBIOS_NS_PORT,
            NETBIOS_NS_PORT,
            64,
            &name_query("filesrv"),
        );
        let parsed = decode(&raw).unwrap();
        let replies = NetbiosHandler.handle(&parsed, &device).await.unwrap();
        assert_eq!(replies.len(), 1);

        let reply = decode(&replies[0]).unwrap();
        let (_, _, payload) = reply.udp().unwrap();
        assert_eq!(&payload[..2], &0xBEEFu16.to_be_bytes());
        assert_eq!(&payload[payload.len() - 4..], &[10, 0, 0, 5]);
    }

    #[tokio::test]
    async fn query_for_other_name_is_ignored() {
        let device = device();
        let raw = frame::build_ipv4_udp(
            MacAddr::new(2, 0, 0, 0, 0, 9),
            MacAddr::broadcast(),
            "10.0.0.9".parse().unwrap(),
            "10.0.0.255".parse().unwrap(),
            NETBIOS_NS_PORT,
            NETBIOS_NS_PORT,
            64,
            &name_query("OTHERBOX"),
        );
        let parsed = decode(&raw).unwrap();
        assert!(NetbiosHandler.handle(&parsed, &device).await.unwrap().is_empty());
    }
}
