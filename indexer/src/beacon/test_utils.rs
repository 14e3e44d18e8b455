//! Shared builders for cache and aggregation tests.

#![cfg(test)]

use types::{
    AttestationBase, AttestationData, BeaconBlockBase, BeaconBlockBodyBase, BeaconBlockHeader,
    BeaconState, Bitfield, ChainSpec, Checkpoint, Epoch, Eth1Data, Graffiti, Hash256,
    PublicKeyBytes, SignatureBytes, SignedBeaconBlock, SignedBeaconBlockBase,
    SignedBeaconBlockHeader, Slot, SyncCommittee, Validator,
};

pub fn header_at(slot: u64, parent_root: Hash256) -> SignedBeaconBlockHeader {
    SignedBeaconBlockHeader {
        message: BeaconBlockHeader {
            slot: Slot::new(slot),
            proposer_index: slot % 8,
            parent_root,
            state_root: Hash256::repeat_byte(0xfe),
            body_root: Hash256::repeat_byte(0xfd),
        },
        signature: SignatureBytes::empty(),
    }
}

pub fn empty_body() -> BeaconBlockBodyBase {
    BeaconBlockBodyBase {
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
    }
}

pub fn signed_block_with_body(
    slot: u64,
    parent_root: Hash256,
    body: BeaconBlockBodyBase,
) -> SignedBeaconBlock {
    SignedBeaconBlock::Base(SignedBeaconBlockBase {
        message: BeaconBlockBase {
            slot: Slot::new(slot),
            proposer_index: slot % 8,
            parent_root,
            state_root: Hash256::repeat_byte(0xfe),
            body,
        },
        signature: SignatureBytes::empty(),
    })
}

pub fn signed_block(slot: u64, parent_root: Hash256) -> SignedBeaconBlock {
    signed_block_with_body(slot, parent_root, empty_body())
}

pub fn signed_block_with_attestations(
    slot: u64,
    parent_root: Hash256,
    attestations: Vec<AttestationBase>,
) -> SignedBeaconBlock {
    let mut body = empty_body();
    body.attestations = attestations;
    signed_block_with_body(slot, parent_root, body)
}

/// An attestation for `slot`/`committee_index` with the given aggregation
/// bit positions set.
pub fn attestation(
    slot: u64,
    committee_index: u64,
    target_root: Hash256,
    head_root: Hash256,
    positions: &[usize],
) -> AttestationBase {
    let mut bits = Bitfield::with_capacity(positions.iter().max().map(|p| p + 1).unwrap_or(1));
    for position in positions {
        bits.set_bit(*position);
    }
    AttestationBase {
        aggregation_bits: bits,
        data: AttestationData {
            slot: Slot::new(slot),
            index: committee_index,
            beacon_block_root: head_root,
            source: Checkpoint {
                epoch: Epoch::new(0),
                root: Hash256::zero(),
            },
            target: Checkpoint {
                epoch: Epoch::new(slot / 8),
                root: target_root,
            },
        },
        signature: SignatureBytes::empty(),
    }
}

fn pubkey(index: usize) -> PublicKeyBytes {
    let mut bytes = [0u8; 48];
    bytes[..8].copy_from_slice(&(index as u64).to_le_bytes());
    PublicKeyBytes(bytes)
}

/// A state with `count` active validators, distinct pubkeys, 32 ETH
/// effective balances, and the first 8 validators on the sync committee.
pub fn test_state(count: usize, spec: &ChainSpec) -> BeaconState {
    let validators: Vec<Validator> = (0..count)
        .map(|index| Validator {
            pubkey: pubkey(index),
            withdrawal_credentials: Hash256::zero(),
            effective_balance: 32_000_000_000,
            slashed: false,
            activation_eligibility_epoch: Epoch::new(0),
            activation_epoch: Epoch::new(0),
            exit_epoch: Epoch::max_value(),
            withdrawable_epoch: Epoch::max_value(),
        })
        .collect();

    BeaconState {
        slot: Slot::new(0),
        balances: vec![32_000_000_000; count],
        randao_mixes: (0..spec.epochs_per_historical_vector)
            .map(|index| Hash256::repeat_byte((index % 251) as u8))
            .collect(),
        eth1_deposit_index: 0,
        current_sync_committee: Some(SyncCommittee {
            pubkeys: (0..8.min(count)).map(pubkey).collect(),
            aggregate_pubkey: PublicKeyBytes::empty(),
        }),
        validators,
    }
}
