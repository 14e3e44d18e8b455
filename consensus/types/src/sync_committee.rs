use crate::{Bitfield, PublicKeyBytes, SignatureBytes};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};

/// The aggregate sync-committee signature carried in post-altair blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SyncAggregate {
    pub sync_committee_bits: Bitfield,
    pub sync_committee_signature: SignatureBytes,
}

impl SyncAggregate {
    /// Participation over an `assigned` sized committee, in `0.0..=1.0`.
    pub fn participation(&self, assigned: usize) -> f32 {
        if assigned == 0 {
            return 0.0;
        }
        self.sync_committee_bits.count_set_bits(assigned) as f32 / assigned as f32
    }
}

/// The sync committee of a period, as carried in the beacon state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SyncCommittee {
    pub pubkeys: Vec<PublicKeyBytes>,
    pub aggregate_pubkey: PublicKeyBytes,
}
