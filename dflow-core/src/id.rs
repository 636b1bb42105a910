//! Flow and operation identifiers.
//!
//! A [`FlowId`] is a 12-byte opaque handle made of three 32-bit words. The
//! canonical string form is the standard base64 encoding of the raw bytes.
//! The low bit of the last byte tags flow ids (a whole durable computation)
//! apart from operation ids (a sub-activation inside one); the remaining low
//! bits of that byte are reserved and cleared on generation.

use crate::error::FlowError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display};
use std::str::FromStr;

const BYTE_COUNT: usize = 12;
const TAG_BYTE: usize = BYTE_COUNT - 1;
const RESERVED_BITS_MASK: u8 = 0b0000_1111;
const FLOW_ID_MASK: u8 = 0b0000_0001;

/// Rendered in place of base64 for the unset id.
pub const UNSET_DISPLAY: &str = "<default>";

/// A unique identifier for a flow or for an operation within a flow.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FlowId {
    a: u32,
    b: u32,
    c: u32,
}

impl FlowId {
    /// The all-zero id. Never produced by the generators and never accepted
    /// from external input.
    pub const UNSET: FlowId = FlowId { a: 0, b: 0, c: 0 };

    /// Number of bytes in the raw representation.
    pub const LEN: usize = BYTE_COUNT;

    /// Generate a new id identifying an entire durable computation.
    pub fn new_flow() -> Self {
        let mut bytes = Self::random_bytes();
        bytes[TAG_BYTE] |= FLOW_ID_MASK;
        Self::from_array(bytes)
    }

    /// Generate a new id identifying a sub-activation within a flow.
    pub fn new_operation() -> Self {
        Self::from_array(Self::random_bytes())
    }

    fn random_bytes() -> [u8; BYTE_COUNT] {
        let mut bytes = [0u8; BYTE_COUNT];
        let mut rng = rand::thread_rng();
        loop {
            rng.fill_bytes(&mut bytes);
            bytes[TAG_BYTE] &= !RESERVED_BITS_MASK;
            if bytes.iter().any(|b| *b != 0) {
                return bytes;
            }
        }
    }

    fn from_array(bytes: [u8; BYTE_COUNT]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            a: word(0),
            b: word(4),
            c: word(8),
        }
    }

    /// Whether this is the reserved all-zero value.
    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    /// Whether this id was generated by [`FlowId::new_flow`].
    pub fn is_flow_id(&self) -> bool {
        self.to_byte_array()[TAG_BYTE] & FLOW_ID_MASK == FLOW_ID_MASK
    }

    /// The raw 12-byte representation.
    pub fn to_byte_array(&self) -> [u8; BYTE_COUNT] {
        let mut bytes = [0u8; BYTE_COUNT];
        bytes[0..4].copy_from_slice(&self.a.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.b.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.c.to_le_bytes());
        bytes
    }

    /// Write the raw bytes into `destination`.
    ///
    /// Returns `false`, leaving `destination` untouched, when it is shorter
    /// than [`FlowId::LEN`].
    pub fn try_write_bytes(&self, destination: &mut [u8]) -> bool {
        if destination.len() < BYTE_COUNT {
            return false;
        }
        destination[..BYTE_COUNT].copy_from_slice(&self.to_byte_array());
        true
    }

    /// Read an id from its raw bytes.
    ///
    /// Reserved bits are not validated so that ids tagged by newer versions
    /// still round-trip.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidFormat`] when `bytes` is not exactly
    /// 12 bytes long or encodes the unset id.
    pub fn read_bytes(bytes: &[u8]) -> Result<Self, FlowError> {
        Self::try_read_bytes(bytes).ok_or_else(|| {
            FlowError::InvalidFormat(format!(
                "expected {} non-zero bytes for a flow id, got {}",
                BYTE_COUNT,
                bytes.len()
            ))
        })
    }

    /// Non-failing variant of [`FlowId::read_bytes`].
    pub fn try_read_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; BYTE_COUNT] = bytes.try_into().ok()?;
        let id = Self::from_array(array);
        (!id.is_unset()).then_some(id)
    }

    /// Parse the canonical base64 string form.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidFormat`] on invalid base64, a decoded
    /// length other than 12 bytes, or the unset id.
    pub fn parse(value: &str) -> Result<Self, FlowError> {
        Self::try_parse(value).ok_or_else(|| {
            FlowError::InvalidFormat(format!("'{}' does not represent a valid flow id", value))
        })
    }

    /// Non-failing variant of [`FlowId::parse`].
    pub fn try_parse(value: &str) -> Option<Self> {
        let bytes = STANDARD.decode(value).ok()?;
        Self::try_read_bytes(&bytes)
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return f.write_str(UNSET_DISPLAY);
        }
        f.write_str(&STANDARD.encode(self.to_byte_array()))
    }
}

impl fmt::Debug for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowId({})", self)
    }
}

impl FromStr for FlowId {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FlowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FlowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value == UNSET_DISPLAY {
            return Ok(Self::UNSET);
        }
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
