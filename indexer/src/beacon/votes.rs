//! Per-epoch vote aggregation.
//!
//! Walks the canonical blocks of an epoch and its successor, because
//! attestations for epoch `E` may be included up to the end of epoch `E+1`.
//! All amounts are gwei of effective balance, deduplicated per validator.

use crate::beacon::block_cache::Block;
use crate::beacon::epoch_cache::EpochStatsValues;
use crate::consensus::ChainState;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use types::{Epoch, Hash256, Slot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteAmounts {
    pub target_vote_amount: u64,
    pub head_vote_amount: u64,
    pub total_vote_amount: u64,
}

/// Vote totals of one epoch, split by the epoch the including block sits in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochVotes {
    pub current_epoch: VoteAmounts,
    pub next_epoch: VoteAmounts,
    /// The canonical target root the epoch's attesters should vote for.
    pub target_root: Hash256,
}

impl EpochVotes {
    pub fn voted_target(&self) -> u64 {
        self.current_epoch.target_vote_amount + self.next_epoch.target_vote_amount
    }

    pub fn voted_head(&self) -> u64 {
        self.current_epoch.head_vote_amount + self.next_epoch.head_vote_amount
    }

    pub fn voted_total(&self) -> u64 {
        self.current_epoch.total_vote_amount + self.next_epoch.total_vote_amount
    }
}

/// Aggregate the votes for `epoch` over the canonical `chain_blocks`
/// (ascending, spanning at least epochs `epoch` and `epoch + 1`).
///
/// Deterministic for a fixed `(blocks, duties)` input, and idempotent: a
/// validator's effective balance is counted at most once.
pub fn aggregate_epoch_votes(
    epoch: Epoch,
    chain_blocks: &[Arc<Block>],
    stats_values: &EpochStatsValues,
    chain_state: &ChainState,
) -> EpochVotes {
    let epoch_start = chain_state.epoch_start_slot(epoch);

    // Canonical root per slot; the head vote of slot `s` is the latest
    // canonical block at or before `s`.
    let slot_roots: BTreeMap<Slot, Hash256> = chain_blocks
        .iter()
        .map(|block| (block.slot, block.root))
        .collect();
    let head_root_at = |slot: Slot| -> Option<Hash256> {
        slot_roots
            .range(..=slot)
            .next_back()
            .map(|(_, root)| *root)
    };
    let target_root = head_root_at(epoch_start).unwrap_or_else(Hash256::zero);

    let mut votes = EpochVotes {
        target_root,
        ..EpochVotes::default()
    };
    let mut voted_validators: HashSet<u64> = HashSet::new();

    for block in chain_blocks {
        let block_epoch = chain_state.epoch_of_slot(block.slot);
        let is_next_epoch = if block_epoch == epoch {
            false
        } else if block_epoch == epoch + 1 {
            true
        } else {
            continue;
        };

        let Some(body) = block.body() else {
            continue;
        };

        for attestation in body.body().attestations() {
            let data = attestation.data();
            if chain_state.epoch_of_slot(data.slot) != epoch {
                continue;
            }

            let slot_index = chain_state.slot_index(data.slot) as usize;
            let Some(committees) = stats_values.attester_duties.get(slot_index) else {
                continue;
            };
            let committees_per_slot = committees.len() as u64;

            let mut amount: u64 = 0;
            let mut bit_offset = 0usize;
            for committee_index in attestation.committee_indices(committees_per_slot) {
                let Some(committee) = committees.get(committee_index as usize) else {
                    continue;
                };
                for (position, validator_index) in committee.iter().enumerate() {
                    if attestation.aggregation_bits().bit(bit_offset + position)
                        && voted_validators.insert(*validator_index)
                    {
                        amount = amount
                            .saturating_add(stats_values.effective_balance_of(*validator_index));
                    }
                }
                bit_offset += committee.len();
            }

            if amount == 0 {
                continue;
            }

            let amounts = if is_next_epoch {
                &mut votes.next_epoch
            } else {
                &mut votes.current_epoch
            };
            amounts.total_vote_amount += amount;
            if data.target.root == target_root {
                amounts.target_vote_amount += amount;
            }
            if head_root_at(data.slot) == Some(data.beacon_block_root) {
                amounts.head_vote_amount += amount;
            }
        }
    }

    votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::block_cache::BlockCache;
    use crate::beacon::test_utils::{attestation, header_at, signed_block_with_attestations};
    use types::ChainSpec;

    // 8 validators over the minimal preset (8 slots per epoch), one
    // single-member committee per slot.
    fn stats() -> EpochStatsValues {
        EpochStatsValues {
            active_validators: 8,
            effective_balance: 8 * 32,
            active_balance: 8 * 32,
            first_deposit_index: 0,
            effective_balances: vec![32; 8],
            proposer_duties: (0..8).collect(),
            attester_duties: (0..8).map(|i| vec![vec![i]]).collect(),
            sync_committee_duties: vec![],
        }
    }

    struct Chain {
        cache: BlockCache,
        blocks: Vec<Arc<Block>>,
    }

    // Build a canonical chain at the given slots. Blocks carry the provided
    // attestations keyed by position.
    fn chain(slots: &[u64], attestations: &[(usize, Vec<types::AttestationBase>)]) -> Chain {
        let cache = BlockCache::new();
        let mut blocks = Vec::new();
        let mut parent = Hash256::zero();
        for (position, slot) in slots.iter().enumerate() {
            let root = Hash256::repeat_byte(position as u8 + 1);
            let (block, _) = cache.create_or_get_block(root, Slot::new(*slot));
            cache.set_header(&block, header_at(*slot, parent));
            let atts = attestations
                .iter()
                .find(|(p, _)| *p == position)
                .map(|(_, atts)| atts.clone())
                .unwrap_or_default();
            block.set_block(signed_block_with_attestations(*slot, parent, atts));
            blocks.push(block);
            parent = root;
        }
        Chain { cache, blocks }
    }

    #[test]
    fn counts_gwei_with_dedup_across_epochs() {
        let chain_state = ChainState::new(ChainSpec::minimal(), 0);
        let stats = stats();

        // Epoch 1 spans slots 8..=15; target is the block at slot 8
        // (position 0). Validator 2 attests twice: once included in epoch 1,
        // once in epoch 2. It must be counted once.
        let target = Hash256::repeat_byte(1);
        let att_a = attestation(10, 0, target, Hash256::repeat_byte(2), &[0]);
        let att_b = attestation(10, 0, target, Hash256::repeat_byte(2), &[0]);
        let att_c = attestation(12, 0, target, Hash256::repeat_byte(9), &[0]);

        let chain = chain(
            &[8, 10, 12, 16, 17],
            &[(2, vec![att_a]), (3, vec![att_b]), (4, vec![att_c])],
        );
        drop(chain.cache);

        let epoch = Epoch::new(1);
        let votes = aggregate_epoch_votes(epoch, &chain.blocks, &stats, &chain_state);

        assert_eq!(votes.target_root, target);
        // att_a credits validator 2 (32 gwei) in the current epoch; att_b is
        // fully deduplicated.
        assert_eq!(votes.current_epoch.total_vote_amount, 32);
        // att_c credits validator 4 through an epoch-2 block.
        assert_eq!(votes.next_epoch.total_vote_amount, 32);
        assert_eq!(votes.voted_total(), 64);
        assert_eq!(votes.voted_target(), 64);
    }

    #[test]
    fn head_votes_match_the_slot_root() {
        let chain_state = ChainState::new(ChainSpec::minimal(), 0);
        let stats = stats();
        let target = Hash256::repeat_byte(1);

        // Correct head for slot 9 is the block at slot 9 (root 2).
        let good_head = attestation(9, 0, target, Hash256::repeat_byte(2), &[0]);
        // Wrong head for slot 10.
        let bad_head = attestation(10, 0, target, Hash256::repeat_byte(9), &[0]);

        let chain = chain(&[8, 9, 10, 11], &[(3, vec![good_head, bad_head])]);
        let votes = aggregate_epoch_votes(Epoch::new(1), &chain.blocks, &stats, &chain_state);

        assert_eq!(votes.current_epoch.total_vote_amount, 64);
        assert_eq!(votes.current_epoch.head_vote_amount, 32);
        assert_eq!(votes.current_epoch.target_vote_amount, 64);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let chain_state = ChainState::new(ChainSpec::minimal(), 0);
        let stats = stats();
        let target = Hash256::repeat_byte(1);
        let att = attestation(8, 0, target, target, &[0]);

        let chain = chain(&[8, 9], &[(1, vec![att])]);
        let first = aggregate_epoch_votes(Epoch::new(1), &chain.blocks, &stats, &chain_state);
        let second = aggregate_epoch_votes(Epoch::new(1), &chain.blocks, &stats, &chain_state);
        assert_eq!(first, second);
    }
}
