//! Opaque fixed-length byte containers.
//!
//! The indexer never verifies BLS signatures or KZG commitments, so these are
//! plain byte wrappers with SSZ and hex-serde support rather than real
//! cryptographic types.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssz::{Decode, DecodeError, Encode};
use std::fmt;

macro_rules! fixed_bytes_struct {
    ($type: ident, $len: expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $type(pub [u8; $len]);

        impl $type {
            pub const LEN: usize = $len;

            pub fn empty() -> Self {
                Self([0; $len])
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let mut out = [0; $len];
                if bytes.len() != $len {
                    return None;
                }
                out.copy_from_slice(bytes);
                Some(Self(out))
            }
        }

        impl Default for $type {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($type), hex::encode(self.0))
            }
        }

        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let string = String::deserialize(deserializer)?;
                let stripped = string.strip_prefix("0x").unwrap_or(&string);
                let bytes = hex::decode(stripped).map_err(D::Error::custom)?;
                Self::from_slice(&bytes)
                    .ok_or_else(|| D::Error::custom(format!("expected {} bytes", $len)))
            }
        }

        impl Encode for $type {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                $len
            }

            fn ssz_bytes_len(&self) -> usize {
                $len
            }

            fn ssz_append(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.0)
            }
        }

        impl Decode for $type {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                $len
            }

            fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
                Self::from_slice(bytes).ok_or(DecodeError::InvalidByteLength {
                    len: bytes.len(),
                    expected: $len,
                })
            }
        }
    };
}

fixed_bytes_struct!(PublicKeyBytes, 48);
fixed_bytes_struct!(SignatureBytes, 96);
fixed_bytes_struct!(KzgCommitment, 48);
fixed_bytes_struct!(Graffiti, 32);
fixed_bytes_struct!(LogsBloom, 256);

impl Graffiti {
    /// Best-effort printable rendition, with trailing zero padding removed.
    pub fn as_utf8_lossy(&self) -> String {
        let trimmed = self
            .0
            .iter()
            .rposition(|byte| *byte != 0)
            .map(|pos| &self.0[..=pos])
            .unwrap_or(&[]);
        String::from_utf8_lossy(trimmed).into_owned()
    }
}
