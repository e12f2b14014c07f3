//! Object identifiers as numeric sequences.
//!
//! Ordering is the derived `Vec<u32>` ordering, which is exactly the
//! component-wise lexicographic order SNMP requires: at the first differing
//! index the smaller component wins, and a prefix sorts before any of its
//! extensions (1.3 < 1.3.1 < 1.10).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Oid(Vec<u32>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OidParseError {
    #[error("empty OID")]
    Empty,

    #[error("invalid OID component {0:?}")]
    BadComponent(String),
}

impl Oid {
    pub fn new(parts: Vec<u32>) -> Self {
        Self(parts)
    }

    pub fn from_slice(parts: &[u32]) -> Self {
        Self(parts.to_vec())
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns this OID extended with one more arc.
    pub fn child(&self, arc: u32) -> Oid {
        let mut parts = self.0.clone();
        parts.push(arc);
        Oid(parts)
    }

    /// Returns this OID extended with several arcs.
    pub fn extend(&self, arcs: &[u32]) -> Oid {
        let mut parts = self.0.clone();
        parts.extend_from_slice(arcs);
        Oid(parts)
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl FromStr for Oid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            return Err(OidParseError::Empty);
        }
        let mut parts = Vec::new();
        for piece in trimmed.split('.') {
            let arc = piece
                .parse::<u32>()
                .map_err(|_| OidParseError::BadComponent(piece.to_string()))?;
            parts.push(arc);
        }
        Ok(Oid(parts))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if first {
                write!(f, "{arc}")?;
                first = false;
            } else {
                write!(f, ".{arc}")?;
            }
        }
        Ok(())
    }
}

impl From<&[u32]> for Oid {
    fn from(parts: &[u32]) -> Self {
        Oid::from_slice(parts)
    }
}
