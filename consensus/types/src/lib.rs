//! Consensus-layer primitives and containers for the beacon indexer.
//!
//! The containers are dynamic-spec: list maxima are not enforced through the
//! type system, and multi-fork containers decode through an explicit
//! `ForkName` rather than compile-time presets.

mod attestation;
mod beacon_block;
mod bitfield;
mod bls_change;
mod chain_spec;
mod deposit;
mod execution_payload;
mod execution_requests;
mod exit;
mod fixed_bytes;
mod fork_name;
mod header;
mod slashing;
mod slot_epoch;
mod state;
mod sync_committee;

pub use attestation::{
    Attestation, AttestationBase, AttestationData, AttestationElectra, AttestationRef, Checkpoint,
};
pub use beacon_block::{
    BeaconBlock, BeaconBlockAltair, BeaconBlockBase, BeaconBlockBellatrix, BeaconBlockBody,
    BeaconBlockBodyAltair, BeaconBlockBodyBase, BeaconBlockBodyBellatrix, BeaconBlockBodyCapella,
    BeaconBlockBodyDeneb, BeaconBlockBodyElectra, BeaconBlockBodyRef, BeaconBlockCapella,
    BeaconBlockDeneb, BeaconBlockElectra, BeaconBlockRef, SignedBeaconBlock,
    SignedBeaconBlockAltair, SignedBeaconBlockBase, SignedBeaconBlockBellatrix,
    SignedBeaconBlockCapella, SignedBeaconBlockDeneb, SignedBeaconBlockElectra,
};
pub use bitfield::Bitfield;
pub use bls_change::{BlsToExecutionChange, SignedBlsToExecutionChange};
pub use chain_spec::{ChainSpec, Domain};
pub use deposit::{Deposit, DepositData, Eth1Data};
pub use execution_payload::{
    ExecutionPayload, ExecutionPayloadBellatrix, ExecutionPayloadCapella, ExecutionPayloadDeneb,
    ExecutionPayloadRef, ExecutionSummary, Transaction, Withdrawal,
};
pub use execution_requests::{
    Consolidation, ConsolidationRequest, DepositRequest, ExecutionRequests, WithdrawalRequest,
};
pub use exit::{SignedVoluntaryExit, VoluntaryExit};
pub use fixed_bytes::{Graffiti, KzgCommitment, LogsBloom, PublicKeyBytes, SignatureBytes};
pub use fork_name::ForkName;
pub use header::{BeaconBlockHeader, SignedBeaconBlockHeader};
pub use slashing::{AttesterSlashing, IndexedAttestation, ProposerSlashing};
pub use slot_epoch::{Epoch, Slot};
pub use state::{BeaconState, Validator};
pub use sync_committee::{SyncAggregate, SyncCommittee};

pub type Hash256 = ethereum_types::H256;
pub type Address = ethereum_types::H160;
pub type Uint256 = ethereum_types::U256;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TypeError {
    IncorrectVariant,
}
