use crate::{AttestationData, SignatureBytes, SignedBeaconBlockHeader};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};

/// An attestation with its participants expanded to explicit indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct IndexedAttestation {
    pub attesting_indices: Vec<u64>,
    pub data: AttestationData,
    pub signature: SignatureBytes,
}

/// Two conflicting attestations; every validator attesting in both is
/// slashed. The container shape is identical across forks, only the list
/// maxima differ, which this dynamic-spec crate does not enforce statically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AttesterSlashing {
    pub attestation_1: IndexedAttestation,
    pub attestation_2: IndexedAttestation,
}

impl AttesterSlashing {
    /// Validator indices present in both attestations, in ascending order.
    ///
    /// Both attesting-index lists are sorted per the consensus spec, so this
    /// is a plain ordered intersection.
    pub fn slashed_indices(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let mut rhs = self.attestation_2.attesting_indices.iter().peekable();

        for index in &self.attestation_1.attesting_indices {
            while rhs.next_if(|other| *other < index).is_some() {}
            if rhs.peek() == Some(&index) {
                out.push(*index);
            }
        }

        out
    }
}

/// Two conflicting signed headers from one proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ProposerSlashing {
    pub signed_header_1: SignedBeaconBlockHeader,
    pub signed_header_2: SignedBeaconBlockHeader,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Checkpoint, Epoch, Hash256, Slot};

    fn indexed(indices: Vec<u64>) -> IndexedAttestation {
        IndexedAttestation {
            attesting_indices: indices,
            data: AttestationData {
                slot: Slot::new(0),
                index: 0,
                beacon_block_root: Hash256::zero(),
                source: Checkpoint {
                    epoch: Epoch::new(0),
                    root: Hash256::zero(),
                },
                target: Checkpoint {
                    epoch: Epoch::new(1),
                    root: Hash256::zero(),
                },
            },
            signature: SignatureBytes::empty(),
        }
    }

    #[test]
    fn slashed_indices_is_the_intersection() {
        let slashing = AttesterSlashing {
            attestation_1: indexed(vec![1, 3, 5, 7, 9]),
            attestation_2: indexed(vec![2, 3, 4, 7, 10]),
        };
        assert_eq!(slashing.slashed_indices(), vec![3, 7]);

        let disjoint = AttesterSlashing {
            attestation_1: indexed(vec![1, 2]),
            attestation_2: indexed(vec![3, 4]),
        };
        assert!(disjoint.slashed_indices().is_empty());
    }
}
