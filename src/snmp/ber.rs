//! ASN.1 BER subset for SNMPv2c messages.
//!
//! Covers exactly what the agent speaks: the universal types, the SNMP
//! application types (IpAddress through Counter64), the context PDU tags
//! 0xa0..0xa7 and the v2c exception markers. The reader tolerates long-form
//! lengths and redundant integer padding; the writer always emits minimal
//! definite-length encodings.

use std::net::Ipv4Addr;

use thiserror::Error;

use super::oid::Oid;
use super::value::MibValue;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IPADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

pub const PDU_GET: u8 = 0xa0;
pub const PDU_GETNEXT: u8 = 0xa1;
pub const PDU_RESPONSE: u8 = 0xa2;
pub const PDU_SET: u8 = 0xa3;
pub const PDU_GETBULK: u8 = 0xa5;
pub const PDU_TRAP_V2: u8 = 0xa7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BerError {
    #[error("message truncated")]
    Truncated,

    #[error("length field too large")]
    BadLength,

    #[error("unexpected tag {0:#04x}")]
    UnexpectedTag(u8),

    #[error("integer out of range")]
    IntegerRange,

    #[error("malformed OID")]
    BadOid,

    #[error("unknown PDU tag {0:#04x}")]
    UnknownPdu(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduKind {
    Get,
    GetNext,
    Response,
    Set,
    GetBulk,
    TrapV2,
}

impl PduKind {
    fn tag(self) -> u8 {
        match self {
            Self::Get => PDU_GET,
            Self::GetNext => PDU_GETNEXT,
            Self::Response => PDU_RESPONSE,
            Self::Set => PDU_SET,
            Self::GetBulk => PDU_GETBULK,
            Self::TrapV2 => PDU_TRAP_V2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, BerError> {
        match tag {
            PDU_GET => Ok(Self::Get),
            PDU_GETNEXT => Ok(Self::GetNext),
            PDU_RESPONSE => Ok(Self::Response),
            PDU_SET => Ok(Self::Set),
            PDU_GETBULK => Ok(Self::GetBulk),
            PDU_TRAP_V2 => Ok(Self::TrapV2),
            other => Err(BerError::UnknownPdu(other)),
        }
    }
}

/// One variable binding slot. Exceptions travel in the value position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundValue {
    Value(MibValue),
    Unspecified,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub kind: PduKind,
    pub request_id: i32,
    /// For GETBULK this field carries non-repeaters.
    pub error_status: i32,
    /// For GETBULK this field carries max-repetitions.
    pub error_index: i32,
    pub bindings: Vec<(Oid, BoundValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnmpMessage {
    pub version: i64,
    pub community: Vec<u8>,
    pub pdu: Pdu,
}

pub fn encode_message(msg: &SnmpMessage) -> Vec<u8> {
    let mut content = encode_integer(msg.version);
    content.extend_from_slice(&wrap(TAG_OCTET_STRING, &msg.community));
    content.extend_from_slice(&encode_pdu(&msg.pdu));
    wrap(TAG_SEQUENCE, &content)
}

pub fn decode_message(bytes: &[u8]) -> Result<SnmpMessage, BerError> {
    let mut outer = BerReader::new(bytes);
    let (tag, content) = outer.read_tlv()?;
    if tag != TAG_SEQUENCE {
        return Err(BerError::UnexpectedTag(tag));
    }
    let mut reader = BerReader::new(content);
    let version = reader.read_integer()?;
    let community = reader.read_octets()?.to_vec();
    let (pdu_tag, pdu_content) = reader.read_tlv()?;
    let kind = PduKind::from_tag(pdu_tag)?;

    let mut pdu_reader = BerReader::new(pdu_content);
    let request_id = pdu_reader.read_integer()? as i32;
    let error_status = pdu_reader.read_integer()? as i32;
    let error_index = pdu_reader.read_integer()? as i32;
    let (vb_tag, vb_content) = pdu_reader.read_tlv()?;
    if vb_tag != TAG_SEQUENCE {
        return Err(BerError::UnexpectedTag(vb_tag));
    }

    let mut bindings = Vec::new();
    let mut vb_reader = BerReader::new(vb_content);
    while !vb_reader.done() {
        let (entry_tag, entry) = vb_reader.read_tlv()?;
        if entry_tag != TAG_SEQUENCE {
            return Err(BerError::UnexpectedTag(entry_tag));
        }
        let mut entry_reader = BerReader::new(entry);
        let (oid_tag, oid_content) = entry_reader.read_tlv()?;
        if oid_tag != TAG_OID {
            return Err(BerError::UnexpectedTag(oid_tag));
        }
        let oid = parse_oid(oid_content)?;
        let (val_tag, val_content) = entry_reader.read_tlv()?;
        bindings.push((oid, decode_bound_value(val_tag, val_content)?));
    }

    Ok(SnmpMessage {
        version,
        community,
        pdu: Pdu { kind, request_id, error_status, error_index, bindings },
    })
}

fn encode_pdu(pdu: &Pdu) -> Vec<u8> {
    let mut content = encode_integer(pdu.request_id as i64);
    content.extend_from_slice(&encode_integer(pdu.error_status as i64));
    content.extend_from_slice(&encode_integer(pdu.error_index as i64));

    let mut varbinds = Vec::new();
    for (oid, value) in &pdu.bindings {
        let mut entry = encode_oid(oid);
        entry.extend_from_slice(&encode_bound_value(value));
        varbinds.extend_from_slice(&wrap(TAG_SEQUENCE, &entry));
    }
    content.extend_from_slice(&wrap(TAG_SEQUENCE, &varbinds));
    wrap(pdu.kind.tag(), &content)
}

fn encode_bound_value(value: &BoundValue) -> Vec<u8> {
    match value {
        BoundValue::Value(v) => encode_value(v),
        BoundValue::Unspecified => wrap(TAG_NULL, &[]),
        BoundValue::NoSuchObject => wrap(TAG_NO_SUCH_OBJECT, &[]),
        BoundValue::NoSuchInstance => wrap(TAG_NO_SUCH_INSTANCE, &[]),
        BoundValue::EndOfMibView => wrap(TAG_END_OF_MIB_VIEW, &[]),
    }
}

fn decode_bound_value(tag: u8, content: &[u8]) -> Result<BoundValue, BerError> {
    let value = match tag {
        TAG_NULL => return Ok(BoundValue::Unspecified),
        TAG_NO_SUCH_OBJECT => return Ok(BoundValue::NoSuchObject),
        TAG_NO_SUCH_INSTANCE => return Ok(BoundValue::NoSuchInstance),
        TAG_END_OF_MIB_VIEW => return Ok(BoundValue::EndOfMibView),
        TAG_INTEGER => {
            let v = parse_i64(content)?;
            if v < i32::MIN as i64 || v > i32::MAX as i64 {
                return Err(BerError::IntegerRange);
            }
            MibValue::Integer32(v as i32)
        }
        TAG_OCTET_STRING => MibValue::OctetString(content.to_vec()),
        TAG_OID => MibValue::Oid(parse_oid(content)?),
        TAG_IPADDRESS => {
            if content.len() != 4 {
                return Err(BerError::Truncated);
            }
            MibValue::IpAddress(Ipv4Addr::new(content[0], content[1], content[2], content[3]))
        }
        TAG_COUNTER32 => MibValue::Counter32(parse_u64(content)?.try_into().map_err(|_| BerError::IntegerRange)?),
        TAG_GAUGE32 => MibValue::Gauge32(parse_u64(content)?.try_into().map_err(|_| BerError::IntegerRange)?),
        TAG_TIMETICKS => MibValue::TimeTicks(parse_u64(content)?.try_into().map_err(|_| BerError::IntegerRange)?),
        TAG_COUNTER64 => MibValue::Counter64(parse_u64(content)?),
        other => return Err(BerError::UnexpectedTag(other)),
    };
    Ok(BoundValue::Value(value))
}

pub fn encode_value(value: &MibValue) -> Vec<u8> {
    match value {
        MibValue::Integer32(v) => encode_integer(*v as i64),
        MibValue::OctetString(bytes) => wrap(TAG_OCTET_STRING, bytes),
        MibValue::Oid(oid) => encode_oid(oid),
        MibValue::IpAddress(ip) => wrap(TAG_IPADDRESS, &ip.octets()),
        MibValue::Counter32(v) => encode_unsigned(TAG_COUNTER32, *v as u64),
        MibValue::Gauge32(v) => encode_unsigned(TAG_GAUGE32, *v as u64),
        MibValue::TimeTicks(v) => encode_unsigned(TAG_TIMETICKS, *v as u64),
        MibValue::Counter64(v) => encode_unsigned(TAG_COUNTER64, *v),
        MibValue::Null => wrap(TAG_NULL, &[]),
    }
}

/// Tag + definite length + content.
pub fn wrap(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    write_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = (len as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let trimmed = &bytes[skip..];
        out.push(0x80 | trimmed.len() as u8);
        out.extend_from_slice(trimmed);
    }
}

pub fn encode_integer(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        let redundant = (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    wrap(TAG_INTEGER, &bytes[start..])
}

pub fn encode_unsigned(tag: u8, v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    let mut content = bytes[skip..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    wrap(tag, &content)
}

pub fn encode_oid(oid: &Oid) -> Vec<u8> {
    let parts = oid.parts();
    let mut content = Vec::new();
    match parts.len() {
        0 => content.push(0),
        1 => content.push((parts[0] * 40) as u8),
        _ => {
            content.push((parts[0] * 40 + parts[1]) as u8);
            for &arc in &parts[2..] {
                push_base128(&mut content, arc);
            }
        }
    }
    wrap(TAG_OID, &content)
}

fn push_base128(out: &mut Vec<u8>, value: u32) {
    let mut chunks = [0u8; 5];
    let mut n = 0;
    let mut v = value;
    loop {
        chunks[n] = (v & 0x7f) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let mut byte = chunks[i];
        if i != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
}

pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), BerError> {
        let tag = *self.data.get(self.pos).ok_or(BerError::Truncated)?;
        self.pos += 1;
        let first = *self.data.get(self.pos).ok_or(BerError::Truncated)?;
        self.pos += 1;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            if n == 0 || n > 4 {
                return Err(BerError::BadLength);
            }
            let mut len = 0usize;
            for _ in 0..n {
                let b = *self.data.get(self.pos).ok_or(BerError::Truncated)?;
                self.pos += 1;
                len = (len << 8) | b as usize;
            }
            len
        };
        let end = self.pos.checked_add(len).ok_or(BerError::BadLength)?;
        if end > self.data.len() {
            return Err(BerError::Truncated);
        }
        let content = &self.data[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn read_integer(&mut self) -> Result<i64, BerError> {
        let (tag, content) = self.read_tlv()?;
        if tag != TAG_INTEGER {
            return Err(BerError::UnexpectedTag(tag));
        }
        parse_i64(content)
    }

    fn read_octets(&mut self) -> Result<&'a [u8], BerError> {
        let (tag, content) = self.read_tlv()?;
        if tag != TAG_OCTET_STRING {
            return Err(BerError::UnexpectedTag(tag));
        }
        Ok(content)
    }
}

fn parse_i64(content: &[u8]) -> Result<i64, BerError> {
    if content.is_empty() || content.len() > 8 {
        return Err(BerError::IntegerRange);
    }
    let mut v: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        v = (v << 8) | b as i64;
    }
    Ok(v)
}

fn parse_u64(content: &[u8]) -> Result<u64, BerError> {
    let trimmed = if !content.is_empty() && content[0] == 0 {
        &content[1..]
    } else {
        content
    };
    if trimmed.len() > 8 {
        return Err(BerError::IntegerRange);
    }
    let mut v: u64 = 0;
    for &b in trimmed {
        v = (v << 8) | b as u64;
    }
    Ok(v)
}

fn parse_oid(content: &[u8]) -> Result<Oid, BerError> {
    if content.is_empty() {
        return Err(BerError::BadOid);
    }
    let mut parts = Vec::new();
    let first = content[0] as u32;
    parts.push((first / 40).min(2));
    parts.push(first - parts[0] * 40);
    let mut acc: u32 = 0;
    for &b in &content[1..] {
        acc = acc.checked_mul(128).ok_or(BerError::BadOid)? + (b & 0x7f) as u32;
        if b & 0x80 == 0 {
            parts.push(acc);
            acc = 0;
        }
    }
    Ok(Oid::new(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request(oid: &str) -> SnmpMessage {
        SnmpMessage {
            version: 1,
            community: b"public".to_vec(),
            pdu: Pdu {
                kind: PduKind::Get,
                request_id: 42,
                error_status: 0,
                error_index: 0,
                bindings: vec![(oid.parse().unwrap(), BoundValue::Unspecified)],
            },
        }
    }

    #[test]
    fn message_round_trip() {
        let msg = get_request("1.3.6.1.2.1.1.1.0");
        let bytes = encode_message(&msg);
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn exception_values_round_trip() {
        let msg = SnmpMessage {
            version: 1,
            community: b"public".to_vec(),
            pdu: Pdu {
                kind: PduKind::Response,
                request_id: -7,
                error_status: 0,
                error_index: 0,
                bindings: vec![
                    ("1.3.6.1".parse().unwrap(), BoundValue::NoSuchObject),
                    ("1.3.6.2".parse().unwrap(), BoundValue::EndOfMibView),
                ],
            },
        };
        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn all_value_types_round_trip() {
        let values = vec![
            MibValue::Integer32(-1234),
            MibValue::OctetString(b"test string".to_vec()),
            MibValue::Oid("1.3.6.1.4.1.51515.1.1".parse().unwrap()),
            MibValue::IpAddress("192.0.2.1".parse().unwrap()),
            MibValue::Counter32(4_000_000_000),
            MibValue::Counter64(18_000_000_000_000_000_000),
            MibValue::Gauge32(100),
            MibValue::TimeTicks(123456),
            MibValue::Null,
        ];
        let bindings: Vec<_> = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let oid: Oid = format!("1.3.6.1.9.{i}").parse().unwrap();
                (oid, BoundValue::Value(v))
            })
            .collect();
        let msg = SnmpMessage {
            version: 1,
            community: b"c".to_vec(),
            pdu: Pdu {
                kind: PduKind::Response,
                request_id: 1,
                error_status: 0,
                error_index: 0,
                bindings,
            },
        };
        assert_eq!(decode_message(&encode_message(&msg)).unwrap(), msg);
    }

    #[test]
    fn long_form_length_survives() {
        let msg = SnmpMessage {
            version: 1,
            community: b"public".to_vec(),
            pdu: Pdu {
                kind: PduKind::Response,
                request_id: 9,
                error_status: 0,
                error_index: 0,
                bindings: vec![(
                    "1.3.6.1.2.1.1.1.0".parse().unwrap(),
                    BoundValue::Value(MibValue::OctetString(vec![0x55; 300])),
                )],
            },
        };
        let bytes = encode_message(&msg);
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn multibyte_oid_arcs() {
        let oid: Oid = "1.3.6.1.4.1.51515.22.7".parse().unwrap();
        let encoded = encode_oid(&oid);
        let mut reader = BerReader::new(&encoded);
        let (tag, content) = reader.read_tlv().unwrap();
        assert_eq!(tag, 0x06);
        assert_eq!(parse_oid(content).unwrap(), oid);
    }

    #[test]
    fn truncated_message_is_an_error() {
        let bytes = encode_message(&get_request("1.3.6.1.2.1.1.1.0"));
        assert!(decode_message(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_message(&[0xff, 0x03, 0x01]).is_err());
        assert!(decode_message(&[]).is_err());
    }
}
