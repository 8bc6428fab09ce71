/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! The variant value type stored against a key.
//!
//! The source models strings, numeric vectors, and the synthetic composite
//! key families (`__meta:`, `__obj:`, `__graph:adj:`) as one tagged sum; the
//! composite families are a key-naming convention layered on top of `Str`,
//! not a fourth payload.

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(Vec<u8>),
    Vector(Vec<f32>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(b) => Some(b),
            Self::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Self::Vector(v) => Some(v),
            Self::Str(_) => None,
        }
    }
}

/// A stored key's full record: its value, optional absolute expiry (ms since
/// the Unix epoch), and the watch-version token bumped on every write.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at_ms: Option<i64>,
    pub version: u64,
}

impl Entry {
    pub fn new(value: Value, version: u64) -> Self {
        Self {
            value,
            expires_at_ms: None,
            version,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(t) if now_ms >= t)
    }
}
