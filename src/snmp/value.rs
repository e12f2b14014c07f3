//! Typed values stored in the MIB.

use std::fmt;
use std::net::Ipv4Addr;

use super::oid::Oid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MibValue {
    Integer32(i32),
    OctetString(Vec<u8>),
    Oid(Oid),
    IpAddress(Ipv4Addr),
    Counter32(u32),
    Counter64(u64),
    Gauge32(u32),
    TimeTicks(u32),
    Null,
}

impl MibValue {
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::OctetString(s.as_ref().as_bytes().to_vec())
    }

    pub fn tag_name(&self) -> &'static str {
        match self {
            Self::Integer32(_) => "INTEGER",
            Self::OctetString(_) => "STRING",
            Self::Oid(_) => "OID",
            Self::IpAddress(_) => "IpAddress",
            Self::Counter32(_) => "Counter32",
            Self::Counter64(_) => "Counter64",
            Self::Gauge32(_) => "Gauge32",
            Self::TimeTicks(_) => "Timeticks",
            Self::Null => "NULL",
        }
    }

    /// Numeric view used by the threshold poller; strings and OIDs have none.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer32(v) if *v >= 0 => Some(*v as u64),
            Self::Counter32(v) | Self::Gauge32(v) | Self::TimeTicks(v) => Some(*v as u64),
            Self::Counter64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MibValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer32(v) => write!(f, "{v}"),
            Self::OctetString(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => write!(f, "{s}"),
                Err(_) => {
                    for b in bytes {
                        write!(f, "{b:02X} ")?;
                    }
                    Ok(())
                }
            },
            Self::Oid(oid) => write!(f, "{oid}"),
            Self::IpAddress(ip) => write!(f, "{ip}"),
            Self::Counter32(v) | Self::Gauge32(v) | Self::TimeTicks(v) => write!(f, "{v}"),
            Self::Counter64(v) => write!(f, "{v}"),
            Self::Null => write!(f, "NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_helper_builds_octets() {
        assert_eq!(
            MibValue::string("abc"),
            MibValue::OctetString(b"abc".to_vec())
        );
    }

    #[test]
    fn numeric_view() {
        assert_eq!(MibValue::Gauge32(90).as_u64(), Some(90));
        assert_eq!(MibValue::Integer32(-1).as_u64(), None);
        assert_eq!(MibValue::string("x").as_u64(), None);
    }
}
