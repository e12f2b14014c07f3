//! snmpwalk-format ingest: one `oid = TYPE: value` record per line.
//!
//! The parser is deliberately tolerant. Quoting, stray whitespace, timetick
//! clock renderings and hex strings all occur in real walk dumps; anything it
//! cannot make sense of is skipped and counted rather than failing the load.

use std::net::Ipv4Addr;
use std::path::Path;

use log::{debug, warn};

use super::oid::Oid;
use super::value::MibValue;

#[derive(Debug, Default)]
pub struct WalkReport {
    pub entries: Vec<(Oid, MibValue)>,
    pub skipped: usize,
}

pub fn load_walk_file(path: &Path) -> std::io::Result<WalkReport> {
    let text = std::fs::read_to_string(path)?;
    let report = parse_walk(&text);
    if report.skipped > 0 {
        warn!(
            "walk file {}: skipped {} malformed line(s)",
            path.display(),
            report.skipped
        );
    }
    Ok(report)
}

pub fn parse_walk(text: &str) -> WalkReport {
    let mut report = WalkReport::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some(entry) => report.entries.push(entry),
            None => {
                debug!("skipping walk line {line:?}");
                report.skipped += 1;
            }
        }
    }
    report
}

fn parse_line(line: &str) -> Option<(Oid, MibValue)> {
    let (oid_part, rest) = line.split_once('=')?;
    let oid: Oid = oid_part.trim().parse().ok()?;
    let rest = rest.trim();

    // "OID = TYPE: value"; a missing type renders as a bare string value.
    let (type_part, value_part) = match rest.split_once(':') {
        Some((t, v)) if is_known_type(t.trim()) || looks_like_type(t.trim()) => {
            (t.trim(), v.trim())
        }
        _ => ("STRING", rest),
    };

    let value = match type_part {
        "STRING" => MibValue::OctetString(unquote(value_part).into_bytes()),
        "Hex-STRING" => MibValue::OctetString(parse_hex(value_part)?),
        "INTEGER" => MibValue::Integer32(parse_integer(value_part)?),
        "Counter32" => MibValue::Counter32(first_number(value_part)? as u32),
        "Counter64" => MibValue::Counter64(first_number(value_part)?),
        "Gauge32" | "Gauge" | "Unsigned32" => MibValue::Gauge32(first_number(value_part)? as u32),
        "Timeticks" => MibValue::TimeTicks(parse_timeticks(value_part)? as u32),
        "OID" => MibValue::Oid(value_part.trim().parse().ok()?),
        "IpAddress" | "Network Address" => {
            let ip: Ipv4Addr = value_part.trim().parse().ok()?;
            MibValue::IpAddress(ip)
        }
        "NULL" => MibValue::Null,
        // Unknown types are recorded verbatim as octet strings.
        _ => MibValue::OctetString(unquote(value_part).into_bytes()),
    };
    Some((oid, value))
}

fn is_known_type(t: &str) -> bool {
    matches!(
        t,
        "STRING"
            | "Hex-STRING"
            | "INTEGER"
            | "Counter32"
            | "Counter64"
            | "Gauge32"
            | "Gauge"
            | "Unsigned32"
            | "Timeticks"
            | "OID"
            | "IpAddress"
            | "Network Address"
            | "NULL"
            | "BITS"
            | "Opaque"
    )
}

/// A type token is one bare word; quoted values containing colons are not.
fn looks_like_type(t: &str) -> bool {
    !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for token in s.split_whitespace() {
        out.push(u8::from_str_radix(token, 16).ok()?);
    }
    Some(out)
}

/// INTEGER values show up as "5", "up(1)" or "up (1)"; the enum label wins a
/// parenthesized number when both are present.
fn parse_integer(s: &str) -> Option<i32> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i32>() {
        return Some(v);
    }
    if let (Some(open), Some(close)) = (s.rfind('('), s.rfind(')')) {
        if open < close {
            return s[open + 1..close].trim().parse().ok();
        }
    }
    None
}

/// "(123456) 0:20:34.56" or a bare tick count.
fn parse_timeticks(s: &str) -> Option<u64> {
    let s = s.trim();
    if let (Some(open), Some(close)) = (s.find('('), s.find(')')) {
        if open < close {
            return s[open + 1..close].trim().parse().ok();
        }
    }
    first_number(s)
}

fn first_number(s: &str) -> Option<u64> {
    let digits: String = s
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
