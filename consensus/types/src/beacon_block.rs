use crate::{
    AttestationBase, AttestationElectra, AttestationRef, AttesterSlashing, Deposit, Eth1Data,
    ExecutionPayloadBellatrix, ExecutionPayloadCapella, ExecutionPayloadDeneb,
    ExecutionPayloadRef, ExecutionRequests, ForkName, Graffiti, Hash256, KzgCommitment,
    ProposerSlashing, SignatureBytes, SignedBlsToExecutionChange, SignedVoluntaryExit, Slot,
    SyncAggregate,
};
use serde::{Deserialize, Serialize};
use ssz::Decode;
use ssz_derive::{Decode, Encode};
use superstruct::superstruct;

/// The body of a beacon block, containing operations.
///
/// This *superstruct* abstracts over the hard-fork.
#[superstruct(
    variants(Base, Altair, Bellatrix, Capella, Deneb, Electra),
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
pub struct BeaconBlockBody {
    pub randao_reveal: SignatureBytes,
    pub eth1_data: Eth1Data,
    pub graffiti: Graffiti,
    pub proposer_slashings: Vec<ProposerSlashing>,
    pub attester_slashings: Vec<AttesterSlashing>,
    #[superstruct(
        only(Base, Altair, Bellatrix, Capella, Deneb),
        partial_getter(rename = "attestations_base")
    )]
    pub attestations: Vec<AttestationBase>,
    #[superstruct(only(Electra), partial_getter(rename = "attestations_electra"))]
    pub attestations: Vec<AttestationElectra>,
    pub deposits: Vec<Deposit>,
    pub voluntary_exits: Vec<SignedVoluntaryExit>,
    #[superstruct(only(Altair, Bellatrix, Capella, Deneb, Electra))]
    pub sync_aggregate: SyncAggregate,
    #[superstruct(
        only(Bellatrix),
        partial_getter(rename = "execution_payload_bellatrix")
    )]
    pub execution_payload: ExecutionPayloadBellatrix,
    #[superstruct(only(Capella), partial_getter(rename = "execution_payload_capella"))]
    pub execution_payload: ExecutionPayloadCapella,
    #[superstruct(
        only(Deneb, Electra),
        partial_getter(rename = "execution_payload_deneb")
    )]
    pub execution_payload: ExecutionPayloadDeneb,
    #[superstruct(only(Capella, Deneb, Electra))]
    pub bls_to_execution_changes: Vec<SignedBlsToExecutionChange>,
    #[superstruct(only(Deneb, Electra))]
    pub blob_kzg_commitments: Vec<KzgCommitment>,
    #[superstruct(only(Electra))]
    pub execution_requests: ExecutionRequests,
}

impl<'a> BeaconBlockBodyRef<'a> {
    /// All attestations of the body, behind the fork-spanning reference enum.
    pub fn attestations(&self) -> Vec<AttestationRef<'a>> {
        match self {
            BeaconBlockBodyRef::Electra(body) => body
                .attestations
                .iter()
                .map(AttestationRef::Electra)
                .collect(),
            BeaconBlockBodyRef::Base(body) => {
                body.attestations.iter().map(AttestationRef::Base).collect()
            }
            BeaconBlockBodyRef::Altair(body) => {
                body.attestations.iter().map(AttestationRef::Base).collect()
            }
            BeaconBlockBodyRef::Bellatrix(body) => {
                body.attestations.iter().map(AttestationRef::Base).collect()
            }
            BeaconBlockBodyRef::Capella(body) => {
                body.attestations.iter().map(AttestationRef::Base).collect()
            }
            BeaconBlockBodyRef::Deneb(body) => {
                body.attestations.iter().map(AttestationRef::Base).collect()
            }
        }
    }

    pub fn attestation_count(&self) -> usize {
        match self {
            BeaconBlockBodyRef::Base(body) => body.attestations.len(),
            BeaconBlockBodyRef::Altair(body) => body.attestations.len(),
            BeaconBlockBodyRef::Bellatrix(body) => body.attestations.len(),
            BeaconBlockBodyRef::Capella(body) => body.attestations.len(),
            BeaconBlockBodyRef::Deneb(body) => body.attestations.len(),
            BeaconBlockBodyRef::Electra(body) => body.attestations.len(),
        }
    }

    /// The execution payload, absent before bellatrix.
    pub fn execution_payload(&self) -> Option<ExecutionPayloadRef<'a>> {
        match self {
            BeaconBlockBodyRef::Base(_) | BeaconBlockBodyRef::Altair(_) => None,
            BeaconBlockBodyRef::Bellatrix(body) => {
                Some(ExecutionPayloadRef::Bellatrix(&body.execution_payload))
            }
            BeaconBlockBodyRef::Capella(body) => {
                Some(ExecutionPayloadRef::Capella(&body.execution_payload))
            }
            BeaconBlockBodyRef::Deneb(body) => {
                Some(ExecutionPayloadRef::Deneb(&body.execution_payload))
            }
            BeaconBlockBodyRef::Electra(body) => {
                Some(ExecutionPayloadRef::Deneb(&body.execution_payload))
            }
        }
    }

    /// Count of BLS credential changes; zero before capella.
    pub fn bls_change_count(&self) -> usize {
        self.bls_to_execution_changes()
            .map(|changes| changes.len())
            .unwrap_or(0)
    }
}

/// A block of the beacon chain.
#[superstruct(
    variants(Base, Altair, Bellatrix, Capella, Deneb, Electra),
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
#[derive(Debug, Clone, PartialEq, Encode)]
#[ssz(enum_behaviour = "transparent")]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    #[superstruct(only(Base), partial_getter(rename = "body_base"))]
    pub body: BeaconBlockBodyBase,
    #[superstruct(only(Altair), partial_getter(rename = "body_altair"))]
    pub body: BeaconBlockBodyAltair,
    #[superstruct(only(Bellatrix), partial_getter(rename = "body_bellatrix"))]
    pub body: BeaconBlockBodyBellatrix,
    #[superstruct(only(Capella), partial_getter(rename = "body_capella"))]
    pub body: BeaconBlockBodyCapella,
    #[superstruct(only(Deneb), partial_getter(rename = "body_deneb"))]
    pub body: BeaconBlockBodyDeneb,
    #[superstruct(only(Electra), partial_getter(rename = "body_electra"))]
    pub body: BeaconBlockBodyElectra,
}

impl BeaconBlock {
    /// SSZ decode with the fork variant chosen by the caller.
    pub fn from_ssz_bytes(bytes: &[u8], fork: ForkName) -> Result<Self, ssz::DecodeError> {
        Ok(match fork {
            ForkName::Base => BeaconBlock::Base(BeaconBlockBase::from_ssz_bytes(bytes)?),
            ForkName::Altair => BeaconBlock::Altair(BeaconBlockAltair::from_ssz_bytes(bytes)?),
            ForkName::Bellatrix => {
                BeaconBlock::Bellatrix(BeaconBlockBellatrix::from_ssz_bytes(bytes)?)
            }
            ForkName::Capella => BeaconBlock::Capella(BeaconBlockCapella::from_ssz_bytes(bytes)?),
            ForkName::Deneb => BeaconBlock::Deneb(BeaconBlockDeneb::from_ssz_bytes(bytes)?),
            ForkName::Electra => BeaconBlock::Electra(BeaconBlockElectra::from_ssz_bytes(bytes)?),
        })
    }

    /// The fork this block's container belongs to.
    pub fn fork_name(&self) -> ForkName {
        match self {
            BeaconBlock::Base(_) => ForkName::Base,
            BeaconBlock::Altair(_) => ForkName::Altair,
            BeaconBlock::Bellatrix(_) => ForkName::Bellatrix,
            BeaconBlock::Capella(_) => ForkName::Capella,
            BeaconBlock::Deneb(_) => ForkName::Deneb,
            BeaconBlock::Electra(_) => ForkName::Electra,
        }
    }

    /// Accessor for the block's body as a ref.
    pub fn body(&self) -> BeaconBlockBodyRef<'_> {
        match self {
            BeaconBlock::Base(block) => BeaconBlockBodyRef::Base(&block.body),
            BeaconBlock::Altair(block) => BeaconBlockBodyRef::Altair(&block.body),
            BeaconBlock::Bellatrix(block) => BeaconBlockBodyRef::Bellatrix(&block.body),
            BeaconBlock::Capella(block) => BeaconBlockBodyRef::Capella(&block.body),
            BeaconBlock::Deneb(block) => BeaconBlockBodyRef::Deneb(&block.body),
            BeaconBlock::Electra(block) => BeaconBlockBodyRef::Electra(&block.body),
        }
    }
}

/// A `BeaconBlock` and a signature from its proposer.
#[superstruct(
    variants(Base, Altair, Bellatrix, Capella, Deneb, Electra),
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
#[derive(Debug, Clone, PartialEq, Encode)]
#[ssz(enum_behaviour = "transparent")]
pub struct SignedBeaconBlock {
    #[superstruct(only(Base), partial_getter(rename = "message_base"))]
    pub message: BeaconBlockBase,
    #[superstruct(only(Altair), partial_getter(rename = "message_altair"))]
    pub message: BeaconBlockAltair,
    #[superstruct(only(Bellatrix), partial_getter(rename = "message_bellatrix"))]
    pub message: BeaconBlockBellatrix,
    #[superstruct(only(Capella), partial_getter(rename = "message_capella"))]
    pub message: BeaconBlockCapella,
    #[superstruct(only(Deneb), partial_getter(rename = "message_deneb"))]
    pub message: BeaconBlockDeneb,
    #[superstruct(only(Electra), partial_getter(rename = "message_electra"))]
    pub message: BeaconBlockElectra,
    pub signature: SignatureBytes,
}

impl SignedBeaconBlock {
    /// SSZ decode with the fork variant chosen by the caller.
    ///
    /// This is the decoding half of the fork-versioned codec: the fork tag is
    /// stored next to the payload (recovery log) or derived from the slot via
    /// the chain spec (network responses).
    pub fn from_ssz_bytes(bytes: &[u8], fork: ForkName) -> Result<Self, ssz::DecodeError> {
        Ok(match fork {
            ForkName::Base => SignedBeaconBlock::Base(SignedBeaconBlockBase::from_ssz_bytes(bytes)?),
            ForkName::Altair => {
                SignedBeaconBlock::Altair(SignedBeaconBlockAltair::from_ssz_bytes(bytes)?)
            }
            ForkName::Bellatrix => {
                SignedBeaconBlock::Bellatrix(SignedBeaconBlockBellatrix::from_ssz_bytes(bytes)?)
            }
            ForkName::Capella => {
                SignedBeaconBlock::Capella(SignedBeaconBlockCapella::from_ssz_bytes(bytes)?)
            }
            ForkName::Deneb => {
                SignedBeaconBlock::Deneb(SignedBeaconBlockDeneb::from_ssz_bytes(bytes)?)
            }
            ForkName::Electra => {
                SignedBeaconBlock::Electra(SignedBeaconBlockElectra::from_ssz_bytes(bytes)?)
            }
        })
    }

    pub fn fork_name(&self) -> ForkName {
        self.message().fork_name()
    }

    /// Accessor for the block's `message` field as a ref.
    pub fn message(&self) -> BeaconBlockRef<'_> {
        match self {
            SignedBeaconBlock::Base(block) => BeaconBlockRef::Base(&block.message),
            SignedBeaconBlock::Altair(block) => BeaconBlockRef::Altair(&block.message),
            SignedBeaconBlock::Bellatrix(block) => BeaconBlockRef::Bellatrix(&block.message),
            SignedBeaconBlock::Capella(block) => BeaconBlockRef::Capella(&block.message),
            SignedBeaconBlock::Deneb(block) => BeaconBlockRef::Deneb(&block.message),
            SignedBeaconBlock::Electra(block) => BeaconBlockRef::Electra(&block.message),
        }
    }

    pub fn body(&self) -> BeaconBlockBodyRef<'_> {
        match self {
            SignedBeaconBlock::Base(block) => BeaconBlockBodyRef::Base(&block.message.body),
            SignedBeaconBlock::Altair(block) => BeaconBlockBodyRef::Altair(&block.message.body),
            SignedBeaconBlock::Bellatrix(block) => {
                BeaconBlockBodyRef::Bellatrix(&block.message.body)
            }
            SignedBeaconBlock::Capella(block) => BeaconBlockBodyRef::Capella(&block.message.body),
            SignedBeaconBlock::Deneb(block) => BeaconBlockBodyRef::Deneb(&block.message.body),
            SignedBeaconBlock::Electra(block) => BeaconBlockBodyRef::Electra(&block.message.body),
        }
    }

    /// Convenience accessor for the block's slot.
    pub fn slot(&self) -> Slot {
        *self.message().slot()
    }

    /// Convenience accessor for the block's parent root.
    pub fn parent_root(&self) -> Hash256 {
        *self.message().parent_root()
    }

    /// Convenience accessor for the block's state root.
    pub fn state_root(&self) -> Hash256 {
        *self.message().state_root()
    }

    pub fn proposer_index(&self) -> u64 {
        *self.message().proposer_index()
    }
}

impl<'a> BeaconBlockRef<'a> {
    pub fn fork_name(&self) -> ForkName {
        match self {
            BeaconBlockRef::Base(_) => ForkName::Base,
            BeaconBlockRef::Altair(_) => ForkName::Altair,
            BeaconBlockRef::Bellatrix(_) => ForkName::Bellatrix,
            BeaconBlockRef::Capella(_) => ForkName::Capella,
            BeaconBlockRef::Deneb(_) => ForkName::Deneb,
            BeaconBlockRef::Electra(_) => ForkName::Electra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::Encode;

    fn base_block(slot: u64) -> SignedBeaconBlock {
        SignedBeaconBlock::Base(SignedBeaconBlockBase {
            message: BeaconBlockBase {
                slot: Slot::new(slot),
                proposer_index: 3,
                parent_root: Hash256::repeat_byte(1),
                state_root: Hash256::repeat_byte(2),
                body: BeaconBlockBodyBase {
                    randao_reveal: SignatureBytes::empty(),
                    eth1_data: Eth1Data {
                        deposit_root: Hash256::zero(),
                        deposit_count: 0,
                        block_hash: Hash256::zero(),
                    },
                    graffiti: Graffiti::empty(),
                    proposer_slashings: vec![],
                    attester_slashings: vec![],
                    attestations: vec![],
                    deposits: vec![],
                    voluntary_exits: vec![],
                },
            },
            signature: SignatureBytes::empty(),
        })
    }

    #[test]
    fn fork_versioned_round_trip() {
        let block = base_block(11);
        let bytes = block.as_ssz_bytes();
        let decoded = SignedBeaconBlock::from_ssz_bytes(&bytes, ForkName::Base).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.slot(), Slot::new(11));
        assert_eq!(decoded.fork_name(), ForkName::Base);

        // The same bytes do not decode as a post-altair container.
        assert!(SignedBeaconBlock::from_ssz_bytes(&bytes, ForkName::Altair).is_err());
    }

    #[test]
    fn body_accessors_gate_on_fork() {
        let block = base_block(0);
        assert!(block.body().sync_aggregate().is_err());
        assert!(block.body().execution_payload().is_none());
        assert!(block.body().execution_requests().is_err());
        assert_eq!(block.body().bls_change_count(), 0);
        assert_eq!(block.body().attestation_count(), 0);
    }
}
