//! Authoritative DNS responder: A/AAAA from the device's static forward
//! records, NXDOMAIN for everything else. No recursion, no zone transfers.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::core::device::Device;
use crate::core::errors::HandlerError;
use crate::core::frame::{Frame, RawFrame};
use crate::dispatch::{DispatchKey, ProtocolHandler};

pub const DNS_PORT: u16 = 53;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const RCODE_NXDOMAIN: u16 = 3;

pub struct DnsHandler;

#[async_trait]
impl ProtocolHandler for DnsHandler {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn keys(&self) -> Vec<DispatchKey> {
        vec![DispatchKey::UdpPort(DNS_PORT)]
    }

    fn enabled_for(&self, device: &Device) -> bool {
        device.config().dns.enabled
    }

    async fn handle(
        &self,
        frame: &Frame,
        device: &Arc<Device>,
    ) -> Result<Vec<RawFrame>, HandlerError> {
        let Some((src_port, _, payload)) = frame.udp() else {
            return Ok(Vec::new());
        };
        let Some(query) = Query::parse(payload) else {
            return Ok(Vec::new());
        };
        trace!("DNS query for {} type {}", query.name, query.qtype);

        let response = answer(device, &query);
        Ok(super::udp_reply(frame, device, DNS_PORT, src_port, &response)
            .into_iter()
            .collect())
    }
}

struct Query {
    id: u16,
    rd: bool,
    name: String,
    qtype: u16,
    qclass: u16,
    /// Raw question section, echoed back in the response.
    question: Vec<u8>,
}

impl Query {
    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 12 {
            return None;
        }
        let id = u16::from_be_bytes([payload[0], payload[1]]);
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        // Only standard queries.
        if flags & FLAG_QR != 0 || (flags >> 11) & 0xf != 0 {
            return None;
        }
        let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
        if qdcount != 1 {
            return None;
        }

        let mut pos = 12;
        let mut labels = Vec::new();
        loop {
            let len = *payload.get(pos)? as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            // Compression never appears in a question we originate answers to.
            if len & 0xc0 != 0 {
                return None;
            }
            let label = payload.get(pos..pos + len)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            pos += len;
        }
        let qtype = u16::from_be_bytes([*payload.get(pos)?, *payload.get(pos + 1)?]);
        let qclass = u16::from_be_bytes([*payload.get(pos + 2)?, *payload.get(pos + 3)?]);
        let question = payload.get(12..pos + 4)?.to_vec();

        Some(Self {
            id,
            rd: flags & FLAG_RD != 0,
            name: labels.join("."),
            qtype,
            qclass,
            question,
        })
    }
}

fn answer(device: &Device, query: &Query) -> Vec<u8> {
    let record = device.config().dns.forward_records.iter().find(|r| {
        r.name.trim_end_matches('.').eq_ignore_ascii_case(&query.name)
    });

    let matching = record.and_then(|r| match (query.qtype, r.ip) {
        (TYPE_A, IpAddr::V4(ip)) => Some((r.ttl, ip.octets().to_vec())),
        (TYPE_AAAA, IpAddr::V6(ip)) => Some((r.ttl, ip.octets().to_vec())),
        _ => None,
    });

    let name_known = record.is_some() && query.qclass == CLASS_IN;
    let mut flags = FLAG_QR | FLAG_AA;
    if query.rd {
        flags |= FLAG_RD;
    }
    if !name_known {
        flags |= RCODE_NXDOMAIN;
    }
    let ancount: u16 = matching.is_some() as u16;

    let mut out = Vec::with_capacity(12 + query.question.len() + 32);
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&query.question);

    if let Some((ttl, rdata)) = matching {
        // Name pointer to the question at offset 12.
        out.extend_from_slice(&0xc00cu16.to_be_bytes());
        out.extend_from_slice(&query.qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DnsRecord};
    use crate::core::device::DeviceState;
    use crate::core::frame::{self, decode};
    use mac_address::MacAddress;
    use pnet::util::MacAddr;

    fn device() -> Arc<Device> {
        let mut cfg = DeviceConfig::new("d", "server", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse().unwrap());
        cfg.dns.enabled = true;
        cfg.dns.forward_records.push(DnsRecord::new(
            "host.example.com",
            "192.0.2.7".parse().unwrap(),
        ));
        let dev = Arc::new(Device::bare(cfg));
        dev.set_state(DeviceState::Up);
        dev
    }

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x1234u16.to_be_bytes());
        out.extend_from_slice(&FLAG_RD.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0u8; 6]);
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    fn query_frame(device: &Device, payload: &[u8]) -> Frame {
        let raw = frame::build_ipv4_udp(
            MacAddr::new(2, 0, 0, 0, 0, 9),
            device.mac(),
            "10.0.0.9".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            40000,
            DNS_PORT,
            64,
            payload,
        );
        decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn known_name_returns_a_record() {
        let device = device();
        let parsed = query_frame(&device, &query("host.example.com", TYPE_A));
        let replies = DnsHandler.handle(&parsed, &device).await.unwrap();
        assert_eq!(replies.len(), 1);

        let reply = decode(&replies[0]).unwrap();
        let (_, _, payload) = reply.udp().unwrap();
        assert_eq!(&payload[..2], &0x1234u16.to_be_bytes());
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        assert_eq!(flags & 0xf, 0, "expected NOERROR");
        let ancount = u16::from_be_bytes([payload[6], payload[7]]);
        assert_eq!(ancount, 1);
        // rdata is the last four bytes of the answer.
        assert_eq!(&payload[payload.len() - 4..], &[192, 0, 2, 7]);
    }

    #[tokio::test]
    async fn unknown_name_is_nxdomain() {
        let device = device();
        let parsed = query_frame(&device, &query("missing.example.com", TYPE_A));
        let replies = DnsHandler.handle(&parsed, &device).await.unwrap();
        let reply = decode(&replies[0]).unwrap();
        let (_, _, payload) = reply.udp().unwrap();
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        assert_eq!(flags & 0xf, RCODE_NXDOMAIN);
        assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 0);
    }

    #[tokio::test]
    async fn wrong_type_for_known_name_is_noerror_with_no_answers() {
        let device = device();
        let parsed = query_frame(&device, &query("host.example.com", TYPE_AAAA));
        let replies = DnsHandler.handle(&parsed, &device).await.unwrap();
        let reply = decode(&replies[0]).unwrap();
        let (_, _, payload) = reply.udp().unwrap();
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        assert_eq!(flags & 0xf, 0);
        assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 0);
    }
}
