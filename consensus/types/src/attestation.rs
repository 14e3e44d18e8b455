use crate::{Bitfield, Epoch, Hash256, SignatureBytes, Slot};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use superstruct::superstruct;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: u64,
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

/// An attestation as carried in a block body.
///
/// Electra moved the committee index out of `AttestationData` into a
/// dedicated `committee_bits` field so a single aggregate can span every
/// committee of a slot.
#[superstruct(
    variants(Base, Electra),
    variant_attributes(derive(
        Debug,
        Clone,
        PartialEq,
        Serialize,
        Deserialize,
        Encode,
        Decode
    )),
    cast_error(ty = "crate::TypeError", expr = "crate::TypeError::IncorrectVariant"),
    partial_getter_error(ty = "crate::TypeError", expr = "crate::TypeError::IncorrectVariant")
)]
#[derive(Debug, Clone, PartialEq)]
pub struct Attestation {
    pub aggregation_bits: Bitfield,
    pub data: AttestationData,
    pub signature: SignatureBytes,
    #[superstruct(only(Electra))]
    pub committee_bits: Bitfield,
}

impl<'a> AttestationRef<'a> {
    /// Committee indices this aggregate covers, given the committee count of
    /// the slot. Pre-electra attestations always cover exactly one.
    pub fn committee_indices(&self, committees_per_slot: u64) -> Vec<u64> {
        match self {
            AttestationRef::Base(att) => vec![att.data.index],
            AttestationRef::Electra(att) => (0..committees_per_slot)
                .filter(|index| att.committee_bits.bit(*index as usize))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode, Encode};

    fn data() -> AttestationData {
        AttestationData {
            slot: Slot::new(9),
            index: 2,
            beacon_block_root: Hash256::repeat_byte(1),
            source: Checkpoint {
                epoch: Epoch::new(0),
                root: Hash256::repeat_byte(2),
            },
            target: Checkpoint {
                epoch: Epoch::new(1),
                root: Hash256::repeat_byte(3),
            },
        }
    }

    #[test]
    fn base_ssz_round_trip() {
        let att = AttestationBase {
            aggregation_bits: Bitfield::new(vec![0b101, 0b1]),
            data: data(),
            signature: SignatureBytes::empty(),
        };
        let bytes = att.as_ssz_bytes();
        assert_eq!(AttestationBase::from_ssz_bytes(&bytes).unwrap(), att);
    }

    #[test]
    fn committee_indices() {
        let base = AttestationBase {
            aggregation_bits: Bitfield::default(),
            data: data(),
            signature: SignatureBytes::empty(),
        };
        assert_eq!(
            AttestationRef::Base(&base).committee_indices(4),
            vec![2u64]
        );

        let electra = AttestationElectra {
            aggregation_bits: Bitfield::default(),
            data: data(),
            signature: SignatureBytes::empty(),
            committee_bits: Bitfield::new(vec![0b1010]),
        };
        assert_eq!(
            AttestationRef::Electra(&electra).committee_indices(4),
            vec![1, 3]
        );
    }
}
