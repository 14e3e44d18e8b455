//! A little-endian byte-backed bitfield.
//!
//! SSZ bitlists and bitvectors are both carried as their raw serialized bytes;
//! callers that know the field length (from duty assignments) index into the
//! raw bits directly, which keeps the container independent of statically
//! known list maxima. For bitlists the length-delimiter bit sits above the
//! highest data bit and is never addressed by well-formed callers.

use serde::{Deserialize, Serialize};
use ssz::{Decode, DecodeError, Encode};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bitfield(pub Vec<u8>);

impl Bitfield {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// A bitfield with capacity for `bits` data bits, all unset.
    pub fn with_capacity(bits: usize) -> Self {
        Self(vec![0; bits.div_ceil(8)])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The raw bit at `index`, or `false` when out of range.
    pub fn bit(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    pub fn set_bit(&mut self, index: usize) {
        if let Some(byte) = self.0.get_mut(index / 8) {
            *byte |= 1 << (index % 8);
        }
    }

    /// Number of set bits among the first `bits` positions.
    pub fn count_set_bits(&self, bits: usize) -> usize {
        (0..bits).filter(|index| self.bit(*index)).count()
    }
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Bitfield(0x{})", hex::encode(&self.0))
    }
}

impl Encode for Bitfield {
    fn is_ssz_fixed_len() -> bool {
        false
    }

    fn ssz_bytes_len(&self) -> usize {
        self.0.len()
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0)
    }
}

impl Decode for Bitfield {
    fn is_ssz_fixed_len() -> bool {
        false
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(bytes.to_vec()))
    }
}
