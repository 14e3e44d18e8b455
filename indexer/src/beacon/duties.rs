//! Pure duty derivation from a beacon-state view.
//!
//! Everything here is deterministic in `(state, epoch, spec)`; two correctly
//! replying clients produce byte-equal duty sets for the same dependent root,
//! which is what makes epoch stats comparable across sources.

use crate::beacon::epoch_cache::EpochStatsValues;
use ethereum_hashing::hash;
use std::collections::HashMap;
use types::{BeaconState, ChainSpec, Domain, Epoch, ForkName, Hash256};

const MAX_RANDOM_BYTE: u64 = u8::MAX as u64;
const MAX_RANDOM_VALUE: u64 = u16::MAX as u64;

/// Swap-or-not shuffle of a single index, per the consensus spec.
///
/// Applying this to every position yields the same permutation as the
/// list-based shuffle; the indexer favours the obviously-correct form over
/// the optimized batch version.
fn compute_shuffled_index(mut index: u64, index_count: u64, seed: Hash256, rounds: u8) -> u64 {
    if index_count <= 1 {
        return index;
    }

    for round in 0..rounds {
        let mut pivot_preimage = seed.as_bytes().to_vec();
        pivot_preimage.push(round);
        let pivot_hash = hash(&pivot_preimage);
        let pivot = u64::from_le_bytes(
            pivot_hash[..8]
                .try_into()
                .expect("hash output is 32 bytes"),
        ) % index_count;

        let flip = (pivot + index_count - index) % index_count;
        let position = index.max(flip);

        let mut source_preimage = seed.as_bytes().to_vec();
        source_preimage.push(round);
        source_preimage.extend_from_slice(&((position / 256) as u32).to_le_bytes());
        let source = hash(&source_preimage);

        let byte = source[((position % 256) / 8) as usize];
        let bit = (byte >> (position % 8)) & 1;
        if bit == 1 {
            index = flip;
        }
    }

    index
}

/// The full shuffling of `indices` under `seed`.
fn shuffle_indices(indices: &[u64], seed: Hash256, rounds: u8) -> Vec<u64> {
    let count = indices.len() as u64;
    (0..count)
        .map(|position| indices[compute_shuffled_index(position, count, seed, rounds) as usize])
        .collect()
}

fn committees_per_slot(active_count: u64, spec: &ChainSpec) -> u64 {
    (active_count / spec.slots_per_epoch / spec.target_committee_size)
        .clamp(1, spec.max_committees_per_slot)
}

/// Effective-balance weighted proposer sampling.
fn compute_proposer_index(
    state: &BeaconState,
    active_indices: &[u64],
    seed: Hash256,
    fork: ForkName,
    spec: &ChainSpec,
) -> Option<u64> {
    if active_indices.is_empty() {
        return None;
    }

    let max_effective_balance = spec.max_effective_balance_for_fork(fork);
    let total = active_indices.len() as u64;

    let mut attempt: u64 = 0;
    loop {
        let shuffled =
            compute_shuffled_index(attempt % total, total, seed, spec.shuffle_round_count);
        let candidate = active_indices[shuffled as usize];
        let effective_balance = state
            .validators
            .get(candidate as usize)
            .map(|validator| validator.effective_balance)
            .unwrap_or(0);

        let mut preimage = seed.as_bytes().to_vec();
        if fork >= ForkName::Electra {
            preimage.extend_from_slice(&(attempt / 16).to_le_bytes());
            let digest = hash(&preimage);
            let offset = ((attempt % 16) * 2) as usize;
            let random_value =
                u16::from_le_bytes([digest[offset], digest[offset + 1]]) as u64;
            if effective_balance * MAX_RANDOM_VALUE >= max_effective_balance * random_value {
                return Some(candidate);
            }
        } else {
            preimage.extend_from_slice(&(attempt / 32).to_le_bytes());
            let digest = hash(&preimage);
            let random_byte = digest[(attempt % 32) as usize] as u64;
            if effective_balance * MAX_RANDOM_BYTE >= max_effective_balance * random_byte {
                return Some(candidate);
            }
        }

        attempt += 1;
        // The sampling loop terminates with overwhelming probability long
        // before this; bail out instead of spinning on a degenerate state.
        if attempt >= total * 1024 {
            return Some(active_indices[0]);
        }
    }
}

/// Derive the full duty set of `epoch` from a state at its dependent root.
pub fn derive_epoch_stats(
    state: &BeaconState,
    epoch: Epoch,
    spec: &ChainSpec,
) -> EpochStatsValues {
    let fork = spec.fork_name_at_epoch(epoch);
    let active_indices = state.active_validator_indices(epoch);
    let active_count = active_indices.len() as u64;

    let mut active_balance: u64 = 0;
    let mut effective_balance: u64 = 0;
    let mut effective_balances = vec![0u64; state.validators.len()];
    for (index, validator) in state.validators.iter().enumerate() {
        effective_balances[index] = validator.effective_balance;
        if validator.is_active_at(epoch) {
            effective_balance = effective_balance.saturating_add(validator.effective_balance);
            active_balance = active_balance
                .saturating_add(state.balances.get(index).copied().unwrap_or(0));
        }
    }

    // Proposer duties: one per slot, seeded per-slot from the proposer seed.
    let proposer_seed = state.seed(epoch, Domain::BeaconProposer, spec);
    let proposer_duties = epoch
        .slot_iter(spec.slots_per_epoch)
        .map(|slot| {
            let mut preimage = proposer_seed.as_bytes().to_vec();
            preimage.extend_from_slice(&slot.as_u64().to_le_bytes());
            let slot_seed = Hash256::from_slice(&hash(&preimage));
            compute_proposer_index(state, &active_indices, slot_seed, fork, spec)
                .unwrap_or(u64::MAX)
        })
        .collect();

    // Attester committees: one shuffling split over all committees of the
    // epoch.
    let attester_seed = state.seed(epoch, Domain::BeaconAttester, spec);
    let shuffled = shuffle_indices(&active_indices, attester_seed, spec.shuffle_round_count);
    let per_slot = committees_per_slot(active_count, spec);
    let committee_count = per_slot * spec.slots_per_epoch;
    let attester_duties: Vec<Vec<Vec<u64>>> = (0..spec.slots_per_epoch)
        .map(|slot_index| {
            (0..per_slot)
                .map(|committee_index| {
                    let global = slot_index * per_slot + committee_index;
                    let start = (active_count * global / committee_count.max(1)) as usize;
                    let end = (active_count * (global + 1) / committee_count.max(1)) as usize;
                    shuffled[start..end].to_vec()
                })
                .collect()
        })
        .collect();

    // Sync-committee duties: the state's committee pubkeys resolved against
    // the registry. Empty before altair.
    let sync_committee_duties = if fork >= ForkName::Altair {
        let by_pubkey: HashMap<_, _> = state
            .validators
            .iter()
            .enumerate()
            .map(|(index, validator)| (validator.pubkey, index as u64))
            .collect();
        state
            .current_sync_committee
            .as_ref()
            .map(|committee| {
                committee
                    .pubkeys
                    .iter()
                    .filter_map(|pubkey| by_pubkey.get(pubkey).copied())
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    EpochStatsValues {
        active_validators: active_count,
        effective_balance,
        active_balance,
        first_deposit_index: state.eth1_deposit_index,
        effective_balances,
        proposer_duties,
        attester_duties,
        sync_committee_duties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::test_utils::test_state;
    use std::collections::HashSet;

    #[test]
    fn shuffle_is_a_permutation() {
        let indices: Vec<u64> = (0..100).collect();
        let seed = Hash256::repeat_byte(42);
        let shuffled = shuffle_indices(&indices, seed, 10);

        assert_eq!(shuffled.len(), indices.len());
        let unique: HashSet<_> = shuffled.iter().collect();
        assert_eq!(unique.len(), indices.len());
        assert_ne!(shuffled, indices);
    }

    #[test]
    fn shuffle_depends_on_seed() {
        let indices: Vec<u64> = (0..50).collect();
        let a = shuffle_indices(&indices, Hash256::repeat_byte(1), 10);
        let b = shuffle_indices(&indices, Hash256::repeat_byte(2), 10);
        assert_ne!(a, b);
    }

    #[test]
    fn derived_stats_are_deterministic_and_complete() {
        let spec = ChainSpec::minimal();
        let state = test_state(64, &spec);
        let epoch = Epoch::new(1);

        let a = derive_epoch_stats(&state, epoch, &spec);
        let b = derive_epoch_stats(&state, epoch, &spec);
        assert_eq!(a, b);

        assert_eq!(a.active_validators, 64);
        assert_eq!(a.proposer_duties.len(), spec.slots_per_epoch as usize);
        assert_eq!(a.attester_duties.len(), spec.slots_per_epoch as usize);

        // Every proposer is an active validator.
        for proposer in &a.proposer_duties {
            assert!(*proposer < 64);
        }

        // Committees partition the active set.
        let mut seen = HashSet::new();
        for slot_committees in &a.attester_duties {
            for committee in slot_committees {
                for validator in committee {
                    assert!(seen.insert(*validator), "validator in two committees");
                }
            }
        }
        assert_eq!(seen.len(), 64);

        assert_eq!(a.effective_balance, 64 * 32_000_000_000);
    }

    #[test]
    fn sync_duties_resolve_pubkeys() {
        let spec = ChainSpec::minimal();
        let state = test_state(32, &spec);
        let stats = derive_epoch_stats(&state, Epoch::new(1), &spec);

        // test_state assigns the first 8 validators to the sync committee.
        assert_eq!(stats.sync_committee_duties, (0..8).collect::<Vec<_>>());
    }
}
