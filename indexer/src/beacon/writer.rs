//! Translates cache objects into relational rows.
//!
//! Row building is pure; the persist functions run inside the caller's
//! transaction so an epoch is either fully visible or not at all.

use crate::beacon::block_cache::Block;
use crate::beacon::epoch_cache::EpochStatsValues;
use crate::beacon::fork_cache::ForkKey;
use crate::beacon::votes::EpochVotes;
use crate::consensus::ChainState;
use crate::database::{
    self,
    models::{
        DepositRow, EpochRow, SlashingReason, SlashingRow, SlotRow, SlotStatus,
        SyncAssignmentRow, VoluntaryExitRow,
    },
};
use diesel::PgConnection;
use log::error;
use std::sync::Arc;
use types::{Epoch, ForkName, Slot};

/// Placeholder proposer for slots whose duty assignment is unknown.
const UNKNOWN_PROPOSER: i64 = i64::MAX;

fn proposer_for_slot(
    chain_state: &ChainState,
    stats_values: Option<&EpochStatsValues>,
    slot: Slot,
) -> i64 {
    stats_values
        .and_then(|values| {
            values
                .proposer_duties
                .get(chain_state.slot_index(slot) as usize)
                .copied()
        })
        .map(|proposer| proposer as i64)
        .unwrap_or(UNKNOWN_PROPOSER)
}

/// Build the slot row of an observed block from its header and summary.
///
/// `override_fork_id` lets finality processing force canonical rows to fork
/// 0 while orphaned siblings keep their real fork ids.
pub fn build_slot_row(
    block: &Arc<Block>,
    stats_values: Option<&EpochStatsValues>,
    orphaned: bool,
    override_fork_id: Option<ForkKey>,
) -> Option<SlotRow> {
    let header = block.header()?;
    let index = block.block_index()?;

    let status = if orphaned {
        SlotStatus::Orphaned
    } else {
        SlotStatus::Canonical
    };
    let fork_id = override_fork_id.unwrap_or_else(|| block.fork_id());

    let sync_participation = index.sync_committee_bits.as_ref().map(|bits| {
        let assigned = stats_values
            .map(|values| values.sync_committee_duties.len())
            // Without duty assignments the bit count is the best available
            // denominator.
            .unwrap_or(bits.as_bytes().len() * 8);
        if assigned == 0 {
            0.0
        } else {
            bits.count_set_bits(assigned) as f32 / assigned as f32
        }
    });

    let mut row = SlotRow {
        slot: block.slot.as_u64() as i64,
        root: block.root.as_bytes().to_vec(),
        parent_root: Some(header.message.parent_root.as_bytes().to_vec()),
        state_root: Some(header.message.state_root.as_bytes().to_vec()),
        proposer: header.message.proposer_index as i64,
        status: status.as_i16(),
        fork_id: fork_id.as_i64(),
        graffiti: Some(index.graffiti.as_bytes().to_vec()),
        graffiti_text: Some(index.graffiti.as_utf8_lossy()),
        attestation_count: index.attestation_count as i32,
        deposit_count: index.deposit_count as i32,
        exit_count: index.exit_count as i32,
        proposer_slashing_count: index.proposer_slashing_count as i32,
        attester_slashing_count: index.attester_slashing_count as i32,
        bls_change_count: index.bls_change_count as i32,
        sync_participation: sync_participation.unwrap_or(0.0),
        eth_block_number: None,
        eth_block_hash: None,
        eth_block_extra: None,
        eth_block_extra_text: None,
        eth_transaction_count: 0,
        withdraw_count: 0,
        withdraw_amount: 0,
    };

    if let Some(execution) = &index.execution {
        row.eth_block_number = Some(execution.block_number as i64);
        row.eth_block_hash = Some(execution.block_hash.as_bytes().to_vec());
        row.eth_block_extra = Some(execution.extra_data.clone());
        row.eth_block_extra_text = Some(execution.extra_data_text());
        row.eth_transaction_count = execution.transaction_count as i32;
        row.withdraw_count = execution.withdrawals.len() as i32;
        row.withdraw_amount = execution
            .withdrawals
            .iter()
            .map(|withdrawal| withdrawal.amount as i64)
            .sum();
    }

    Some(row)
}

/// A slot with a known proposer duty but no observed block.
pub fn build_missing_slot_row(
    chain_state: &ChainState,
    stats_values: Option<&EpochStatsValues>,
    slot: Slot,
) -> SlotRow {
    SlotRow {
        slot: slot.as_u64() as i64,
        root: Vec::new(),
        parent_root: None,
        state_root: None,
        proposer: proposer_for_slot(chain_state, stats_values, slot),
        status: SlotStatus::Missing.as_i16(),
        fork_id: ForkKey::CANONICAL.as_i64(),
        graffiti: None,
        graffiti_text: None,
        attestation_count: 0,
        deposit_count: 0,
        exit_count: 0,
        proposer_slashing_count: 0,
        attester_slashing_count: 0,
        bls_change_count: 0,
        sync_participation: 0.0,
        eth_block_number: None,
        eth_block_hash: None,
        eth_block_extra: None,
        eth_block_extra_text: None,
        eth_transaction_count: 0,
        withdraw_count: 0,
        withdraw_amount: 0,
    }
}

/// Aggregate the epoch row over the canonical blocks of the epoch.
pub fn build_epoch_row(
    chain_state: &ChainState,
    epoch: Epoch,
    canonical_blocks: &[Arc<Block>],
    orphaned_count: usize,
    stats_values: Option<&EpochStatsValues>,
    votes: Option<&EpochVotes>,
) -> EpochRow {
    let slots_per_epoch = chain_state.spec().slots_per_epoch;

    let mut row = EpochRow {
        epoch: epoch.as_u64() as i64,
        orphaned_count: orphaned_count as i16,
        ..EpochRow::default()
    };

    if let Some(votes) = votes {
        row.voted_target = votes.voted_target() as i64;
        row.voted_head = votes.voted_head() as i64;
        row.voted_total = votes.voted_total() as i64;
    }
    if let Some(values) = stats_values {
        row.validator_count = values.active_validators as i64;
        row.validator_balance = values.active_balance as i64;
        row.eligible = values.effective_balance as i64;
    }

    let mut sync_assigned_total = 0usize;
    let mut sync_voted_total = 0usize;

    for block in canonical_blocks {
        debug_assert_eq!(chain_state.epoch_of_slot(block.slot), epoch);
        row.block_count += 1;

        let Some(index) = block.block_index() else {
            error!(
                "Block {:?} at slot {} has no body summary during aggregation",
                block.root, block.slot
            );
            continue;
        };

        row.attestation_count += index.attestation_count as i32;
        row.deposit_count += index.deposit_count as i32;
        row.exit_count += index.exit_count as i32;
        row.proposer_slashing_count += index.proposer_slashing_count as i32;
        row.attester_slashing_count += index.attester_slashing_count as i32;
        row.bls_change_count += index.bls_change_count as i32;

        if let (Some(bits), Some(values)) = (&index.sync_committee_bits, stats_values) {
            let assigned = values.sync_committee_duties.len();
            sync_assigned_total += assigned;
            sync_voted_total += bits.count_set_bits(assigned);
        }

        if let Some(execution) = &index.execution {
            row.eth_transaction_count += execution.transaction_count as i32;
            row.withdraw_count += execution.withdrawals.len() as i32;
            row.withdraw_amount += execution
                .withdrawals
                .iter()
                .map(|withdrawal| withdrawal.amount as i64)
                .sum::<i64>();
        }
    }

    row.missing_count = (slots_per_epoch as i16).saturating_sub(row.block_count);
    if sync_assigned_total > 0 {
        row.sync_participation = sync_voted_total as f32 / sync_assigned_total as f32;
    }

    row
}

/// Deposit rows for one block. The running `deposit_index` is carried across
/// the canonical blocks of an epoch, starting from the epoch's first deposit
/// index; orphaned blocks persist without one.
pub fn build_deposit_rows(
    block: &Arc<Block>,
    deposit_index: &mut Option<u64>,
    orphaned: bool,
    override_fork_id: Option<ForkKey>,
) -> Vec<DepositRow> {
    let Some(body) = block.body() else {
        return Vec::new();
    };
    let fork_id = override_fork_id.unwrap_or_else(|| block.fork_id());

    body.body()
        .deposits()
        .iter()
        .enumerate()
        .map(|(index, deposit)| {
            let row_index = deposit_index.map(|value| value as i64);
            if let Some(value) = deposit_index.as_mut() {
                *value += 1;
            }
            DepositRow {
                slot_root: block.root.as_bytes().to_vec(),
                slot_index: index as i32,
                slot_number: block.slot.as_u64() as i64,
                orphaned,
                fork_id: fork_id.as_i64(),
                deposit_index: row_index,
                public_key: deposit.data.pubkey.as_bytes().to_vec(),
                withdrawal_credentials: deposit.data.withdrawal_credentials.as_bytes().to_vec(),
                amount: deposit.data.amount as i64,
            }
        })
        .collect()
}

pub fn build_voluntary_exit_rows(
    block: &Arc<Block>,
    orphaned: bool,
    override_fork_id: Option<ForkKey>,
) -> Vec<VoluntaryExitRow> {
    let Some(body) = block.body() else {
        return Vec::new();
    };
    let fork_id = override_fork_id.unwrap_or_else(|| block.fork_id());

    body.body()
        .voluntary_exits()
        .iter()
        .enumerate()
        .map(|(index, exit)| VoluntaryExitRow {
            slot_root: block.root.as_bytes().to_vec(),
            slot_index: index as i32,
            slot_number: block.slot.as_u64() as i64,
            orphaned,
            fork_id: fork_id.as_i64(),
            validator_index: exit.message.validator_index as i64,
        })
        .collect()
}

/// Slashing rows: proposer slashings one per header pair, attester slashings
/// expanded to one row per slashed validator (the intersection of the two
/// attesting-index sets).
pub fn build_slashing_rows(
    block: &Arc<Block>,
    orphaned: bool,
    override_fork_id: Option<ForkKey>,
) -> Vec<SlashingRow> {
    let Some(body) = block.body() else {
        return Vec::new();
    };
    let fork_id = override_fork_id.unwrap_or_else(|| block.fork_id());
    let slasher_index = body.proposer_index() as i64;

    let mut rows = Vec::new();
    let mut slot_index = 0i32;

    for slashing in body.body().proposer_slashings() {
        rows.push(SlashingRow {
            slot_root: block.root.as_bytes().to_vec(),
            slot_index,
            slot_number: block.slot.as_u64() as i64,
            orphaned,
            fork_id: fork_id.as_i64(),
            validator_index: slashing.signed_header_1.message.proposer_index as i64,
            slasher_index,
            reason: SlashingReason::ProposerSlashing.as_i16(),
        });
        slot_index += 1;
    }

    for slashing in body.body().attester_slashings() {
        for validator_index in slashing.slashed_indices() {
            rows.push(SlashingRow {
                slot_root: block.root.as_bytes().to_vec(),
                slot_index,
                slot_number: block.slot.as_u64() as i64,
                orphaned,
                fork_id: fork_id.as_i64(),
                validator_index: validator_index as i64,
                slasher_index,
                reason: SlashingReason::AttesterSlashing.as_i16(),
            });
            slot_index += 1;
        }
    }

    rows
}

pub fn build_sync_assignment_rows(
    period: u64,
    stats_values: &EpochStatsValues,
) -> Vec<SyncAssignmentRow> {
    stats_values
        .sync_committee_duties
        .iter()
        .enumerate()
        .map(|(index, validator)| SyncAssignmentRow {
            period: period as i64,
            committee_index: index as i32,
            validator_index: *validator as i64,
        })
        .collect()
}

/// Persist one block's slot row and child objects.
pub fn persist_block_data(
    conn: &mut PgConnection,
    block: &Arc<Block>,
    stats_values: Option<&EpochStatsValues>,
    deposit_index: &mut Option<u64>,
    orphaned: bool,
    override_fork_id: Option<ForkKey>,
) -> Result<(), database::Error> {
    let Some(row) = build_slot_row(block, stats_values, orphaned, override_fork_id) else {
        return Err(database::Error::Other(format!(
            "block {:?} at slot {} has no header or summary",
            block.root, block.slot
        )));
    };
    database::insert_slot(conn, &row)?;

    let deposits = build_deposit_rows(block, deposit_index, orphaned, override_fork_id);
    if !deposits.is_empty() {
        database::insert_deposits(conn, &deposits)?;
    }

    let exits = build_voluntary_exit_rows(block, orphaned, override_fork_id);
    if !exits.is_empty() {
        database::insert_voluntary_exits(conn, &exits)?;
    }

    let slashings = build_slashing_rows(block, orphaned, override_fork_id);
    if !slashings.is_empty() {
        database::insert_slashings(conn, &slashings)?;
    }

    block.set_in_finalized_db(true);
    Ok(())
}

/// Persist one finalized epoch: the epoch row, canonical slot rows (forced
/// to fork 0), orphaned siblings under their real fork ids, and the missing
/// slots in between.
#[allow(clippy::too_many_arguments)]
pub fn persist_epoch_data(
    conn: &mut PgConnection,
    chain_state: &ChainState,
    epoch: Epoch,
    canonical_blocks: &[Arc<Block>],
    orphaned_blocks: &[Arc<Block>],
    stats_values: Option<&EpochStatsValues>,
    votes: Option<&EpochVotes>,
) -> Result<(), database::Error> {
    let epoch_row = build_epoch_row(
        chain_state,
        epoch,
        canonical_blocks,
        orphaned_blocks.len(),
        stats_values,
        votes,
    );

    let mut deposit_index = stats_values.map(|values| values.first_deposit_index);
    for block in canonical_blocks {
        persist_block_data(
            conn,
            block,
            stats_values,
            &mut deposit_index,
            false,
            Some(ForkKey::CANONICAL),
        )?;
    }

    let mut no_deposit_index = None;
    for block in orphaned_blocks {
        persist_block_data(conn, block, stats_values, &mut no_deposit_index, true, None)?;
    }

    // Missing slots between the canonical blocks.
    let mut block_iter = canonical_blocks.iter().peekable();
    for slot in epoch.slot_iter(chain_state.spec().slots_per_epoch) {
        if block_iter.peek().map(|block| block.slot) == Some(slot) {
            block_iter.next();
            continue;
        }
        let row = build_missing_slot_row(chain_state, stats_values, slot);
        database::insert_missing_slot(conn, &row)?;
    }

    database::insert_epoch(conn, &epoch_row)?;
    Ok(())
}

/// Insert the sync-committee assignments when `epoch` starts a new period
/// (or the period has not been written yet).
pub fn persist_sync_assignments(
    conn: &mut PgConnection,
    chain_state: &ChainState,
    epoch: Epoch,
    stats_values: Option<&EpochStatsValues>,
) -> Result<(), database::Error> {
    let spec = chain_state.spec();
    if spec.fork_name_at_epoch(epoch) < ForkName::Altair {
        // No sync committees before altair.
        return Ok(());
    }
    let Some(values) = stats_values else {
        return Ok(());
    };

    let period = epoch.sync_committee_period(spec);
    let is_period_start = epoch == Epoch::new(period * spec.epochs_per_sync_committee_period);
    if !is_period_start && database::is_sync_committee_synchronized(conn, period as i64)? {
        return Ok(());
    }

    let rows = build_sync_assignment_rows(period, values);
    if !rows.is_empty() {
        database::insert_sync_assignments(conn, &rows)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::block_cache::BlockCache;
    use crate::beacon::test_utils::{
        attestation, empty_body, header_at, signed_block_with_body,
    };
    use types::{
        AttestationData, AttesterSlashing, ChainSpec, Checkpoint, Deposit, DepositData, Hash256,
        IndexedAttestation, PublicKeyBytes, SignatureBytes, SignedVoluntaryExit, VoluntaryExit,
    };

    fn chain_state() -> ChainState {
        ChainState::new(ChainSpec::minimal(), 0)
    }

    fn stats() -> EpochStatsValues {
        EpochStatsValues {
            active_validators: 8,
            effective_balance: 8 * 32_000_000_000,
            active_balance: 8 * 32_000_000_000,
            first_deposit_index: 100,
            effective_balances: vec![32_000_000_000; 8],
            proposer_duties: (0..8).collect(),
            attester_duties: (0..8).map(|i| vec![vec![i]]).collect(),
            sync_committee_duties: (0..8).collect(),
        }
    }

    struct EpochBlocks {
        _cache: BlockCache,
        blocks: Vec<Arc<Block>>,
    }

    // Canonical blocks of epoch 1 (slots 8..=15), skipping `skip` slots.
    fn epoch_blocks(skip: &[u64]) -> EpochBlocks {
        let cache = BlockCache::new();
        let mut blocks = Vec::new();
        let mut parent = Hash256::repeat_byte(0xaa);
        for slot in 8..16u64 {
            if skip.contains(&slot) {
                continue;
            }
            let root = Hash256::repeat_byte(slot as u8);
            let (block, _) = cache.create_or_get_block(root, Slot::new(slot));
            cache.set_header(&block, header_at(slot, parent));
            block.set_block(signed_block_with_body(slot, parent, empty_body()));
            blocks.push(block);
            parent = root;
        }
        EpochBlocks {
            _cache: cache,
            blocks,
        }
    }

    #[test]
    fn full_epoch_has_no_missing_slots() {
        let chain_state = chain_state();
        let epoch = epoch_blocks(&[]);
        let stats = stats();

        let row = build_epoch_row(
            &chain_state,
            Epoch::new(1),
            &epoch.blocks,
            0,
            Some(&stats),
            None,
        );
        assert_eq!(row.block_count, 8);
        assert_eq!(row.missing_count, 0);
        assert_eq!(row.block_count + row.missing_count, 8);
        assert_eq!(row.validator_count, 8);
        assert_eq!(row.eligible, 8 * 32_000_000_000);

        for block in &epoch.blocks {
            let slot_row =
                build_slot_row(block, Some(&stats), false, Some(ForkKey::CANONICAL)).unwrap();
            assert_eq!(slot_row.status, SlotStatus::Canonical.as_i16());
            assert_eq!(slot_row.fork_id, 0);
        }
    }

    #[test]
    fn missing_slot_carries_the_proposer_duty() {
        let chain_state = chain_state();
        let epoch = epoch_blocks(&[15]);
        let stats = stats();

        let row = build_epoch_row(
            &chain_state,
            Epoch::new(1),
            &epoch.blocks,
            0,
            Some(&stats),
            None,
        );
        assert_eq!(row.block_count, 7);
        assert_eq!(row.missing_count, 1);

        let missing = build_missing_slot_row(&chain_state, Some(&stats), Slot::new(15));
        assert_eq!(missing.status, SlotStatus::Missing.as_i16());
        // Slot 15 is position 7 in the epoch; proposer duty 7.
        assert_eq!(missing.proposer, 7);
        assert!(missing.root.is_empty());
    }

    #[test]
    fn orphaned_rows_keep_their_fork_id() {
        let cache = BlockCache::new();
        let parent = Hash256::repeat_byte(0xaa);
        let root = Hash256::repeat_byte(0xbb);
        let (block, _) = cache.create_or_get_block(root, Slot::new(9));
        cache.set_header(&block, header_at(9, parent));
        block.set_block(signed_block_with_body(9, parent, empty_body()));
        block.set_fork_id(ForkKey(5));

        let row = build_slot_row(&block, None, true, None).unwrap();
        assert_eq!(row.status, SlotStatus::Orphaned.as_i16());
        assert_eq!(row.fork_id, 5);

        // Canonical persistence of the same block forces fork 0.
        let row = build_slot_row(&block, None, false, Some(ForkKey::CANONICAL)).unwrap();
        assert_eq!(row.fork_id, 0);
    }

    #[test]
    fn deposit_index_is_monotonic_across_blocks() {
        let cache = BlockCache::new();
        let mut deposit_index = Some(100u64);
        let mut all_rows = Vec::new();

        let deposit = |byte: u8| Deposit {
            proof: vec![],
            data: DepositData {
                pubkey: PublicKeyBytes([byte; 48]),
                withdrawal_credentials: Hash256::zero(),
                amount: 32_000_000_000,
                signature: SignatureBytes::empty(),
            },
        };

        for (slot, count) in [(8u64, 2usize), (9, 1), (10, 3)] {
            let root = Hash256::repeat_byte(slot as u8);
            let (block, _) = cache.create_or_get_block(root, Slot::new(slot));
            cache.set_header(&block, header_at(slot, Hash256::zero()));
            let mut body = empty_body();
            body.deposits = (0..count).map(|i| deposit(i as u8)).collect();
            block.set_block(signed_block_with_body(slot, Hash256::zero(), body));

            all_rows.extend(build_deposit_rows(
                &block,
                &mut deposit_index,
                false,
                Some(ForkKey::CANONICAL),
            ));
        }

        let indices: Vec<_> = all_rows
            .iter()
            .map(|row| row.deposit_index.unwrap())
            .collect();
        assert_eq!(indices, vec![100, 101, 102, 103, 104, 105]);
        assert_eq!(deposit_index, Some(106));

        // Orphaned blocks do not consume indices.
        let orphan_rows = build_deposit_rows(
            &cache.get_block(&Hash256::repeat_byte(8)).unwrap(),
            &mut None,
            true,
            None,
        );
        assert!(orphan_rows.iter().all(|row| row.deposit_index.is_none()));
    }

    #[test]
    fn attester_slashing_expands_to_the_index_intersection() {
        let cache = BlockCache::new();
        let root = Hash256::repeat_byte(1);
        let (block, _) = cache.create_or_get_block(root, Slot::new(8));
        cache.set_header(&block, header_at(8, Hash256::zero()));

        let data = AttestationData {
            slot: Slot::new(7),
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
        };
        let indexed = |indices: Vec<u64>| IndexedAttestation {
            attesting_indices: indices,
            data: data.clone(),
            signature: SignatureBytes::empty(),
        };

        let mut body = empty_body();
        body.attester_slashings = vec![AttesterSlashing {
            attestation_1: indexed(vec![1, 2, 5, 8]),
            attestation_2: indexed(vec![2, 3, 8, 9]),
        }];
        body.voluntary_exits = vec![SignedVoluntaryExit {
            message: VoluntaryExit {
                epoch: Epoch::new(1),
                validator_index: 77,
            },
            signature: SignatureBytes::empty(),
        }];
        block.set_block(signed_block_with_body(8, Hash256::zero(), body));

        let slashings = build_slashing_rows(&block, false, None);
        let slashed: Vec<_> = slashings.iter().map(|row| row.validator_index).collect();
        assert_eq!(slashed, vec![2, 8]);
        assert!(slashings
            .iter()
            .all(|row| row.reason == SlashingReason::AttesterSlashing.as_i16()));

        let exits = build_voluntary_exit_rows(&block, false, None);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].validator_index, 77);
    }

    #[test]
    fn sync_assignments_cover_the_committee() {
        let stats = stats();
        let rows = build_sync_assignment_rows(3, &stats);
        assert_eq!(rows.len(), 8);
        assert!(rows
            .iter()
            .enumerate()
            .all(|(i, row)| row.period == 3 && row.committee_index == i as i32));
    }

    #[test]
    fn epoch_aggregates_count_canonical_attestations() {
        let chain_state = chain_state();
        let cache = BlockCache::new();
        let target = Hash256::repeat_byte(1);

        let root = Hash256::repeat_byte(2);
        let (block, _) = cache.create_or_get_block(root, Slot::new(9));
        cache.set_header(&block, header_at(9, target));
        let mut body = empty_body();
        body.attestations = vec![
            attestation(8, 0, target, target, &[0]),
            attestation(8, 0, target, target, &[0]),
        ];
        block.set_block(signed_block_with_body(9, target, body));

        let row = build_epoch_row(
            &chain_state,
            Epoch::new(1),
            &[block.clone()],
            0,
            None,
            None,
        );
        assert_eq!(row.attestation_count, 2);

        let slot_row = build_slot_row(&block, None, false, None).unwrap();
        assert_eq!(slot_row.attestation_count, 2);
        // Sum over slot rows equals the epoch aggregate.
        assert_eq!(row.attestation_count, slot_row.attestation_count);
    }
}
