use crate::{Hash256, SignatureBytes, Slot};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash;

/// A header of a `BeaconBlock`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

impl BeaconBlockHeader {
    /// Returns the `tree_hash_root` of the header, which is the block root.
    pub fn canonical_root(&self) -> Hash256 {
        Hash256::from_slice(self.tree_hash_root().as_bytes())
    }
}

/// A `BeaconBlockHeader` and a signature from its proposer.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    pub signature: SignatureBytes,
}

impl SignedBeaconBlockHeader {
    pub fn canonical_root(&self) -> Hash256 {
        self.message.canonical_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode, Encode};

    fn header() -> SignedBeaconBlockHeader {
        SignedBeaconBlockHeader {
            message: BeaconBlockHeader {
                slot: Slot::new(42),
                proposer_index: 7,
                parent_root: Hash256::repeat_byte(0xaa),
                state_root: Hash256::repeat_byte(0xbb),
                body_root: Hash256::repeat_byte(0xcc),
            },
            signature: SignatureBytes([1; 96]),
        }
    }

    #[test]
    fn ssz_round_trip() {
        let signed = header();
        let bytes = signed.as_ssz_bytes();
        // Fixed-size container: 8 + 8 + 3 * 32 + 96.
        assert_eq!(bytes.len(), 208);
        assert_eq!(
            SignedBeaconBlockHeader::from_ssz_bytes(&bytes).unwrap(),
            signed
        );
    }

    #[test]
    fn root_is_stable() {
        let signed = header();
        // The root covers the message only, not the signature.
        let mut resigned = signed.clone();
        resigned.signature = SignatureBytes([9; 96]);
        assert_eq!(signed.canonical_root(), resigned.canonical_root());
        assert_ne!(signed.canonical_root(), Hash256::zero());
    }
}
