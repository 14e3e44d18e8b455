//! The in-memory consensus-state tracker.
//!
//! Ties the block, epoch and fork caches together with the per-client
//! loops, the finality/pruning loop and restart recovery.

pub mod block_cache;
pub mod client;
pub mod duties;
pub mod epoch_cache;
mod error;
pub mod fork_cache;
pub mod synchronizer;
mod test_utils;
pub mod votes;
pub mod writer;

pub use block_cache::{Block, BlockCache, BlockIndex, ProcessingStatus};
pub use client::{Client, ClientState};
pub use epoch_cache::{EpochCache, EpochStats, EpochStatsValues};
pub use error::Error;
pub use fork_cache::{Fork, ForkCache, ForkKey, PruneState};
pub use synchronizer::Synchronizer;
pub use votes::EpochVotes;

use crate::config::Config;
use crate::consensus::{ChainState, ConsensusClient, ConsensusPool, FinalityEvent};
use crate::database::{self, models::UnfinalizedBlockRow, PgPool};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use ssz::{Decode as _, Encode as _};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use types::{Epoch, ForkName, Hash256, SignedBeaconBlock, SignedBeaconBlockHeader, Slot};

/// Recovery-log schema version for block headers.
const HEADER_SCHEMA_VERSION: i16 = 1;
/// Compression scheme bytes prefixed to recovery-log block payloads.
const SCHEME_RAW: u8 = 0;
const SCHEME_SNAPPY: u8 = 1;
/// Restart rehydration parallelism.
const RESTORE_PARALLELISM: usize = 10;
/// Pause before the controller loop restarts after a panic.
const LOOP_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Process-wide pointers owned by the controller. Only the controller loop
/// mutates these; everything else reads them through the indexer.
#[derive(Debug, Clone, Copy, Default)]
struct ControllerState {
    running: bool,
    last_finalized_epoch: Epoch,
    last_pruned_epoch: Epoch,
    last_prune_run_epoch: Epoch,
    /// First epoch that still needs finalized persistence.
    next_persist_epoch: Epoch,
}

/// The beacon-chain indexer core.
pub struct Indexer {
    consensus_pool: Arc<ConsensusPool>,
    chain_state: Arc<ChainState>,
    db: Option<PgPool>,

    write_db: bool,
    disable_sync: bool,
    block_compression: bool,
    in_memory_epochs: u16,
    cache_persistence_delay: u16,

    block_cache: Arc<BlockCache>,
    epoch_cache: Arc<EpochCache>,
    fork_cache: Arc<ForkCache>,

    clients: RwLock<Vec<Arc<Client>>>,
    state: Mutex<ControllerState>,
    cancel: CancellationToken,
}

impl Indexer {
    pub fn new(consensus_pool: Arc<ConsensusPool>, db: Option<PgPool>, config: &Config) -> Arc<Self> {
        let indexer_config = &config.indexer;
        let in_memory_epochs = indexer_config.in_memory_epochs.max(2);
        let cache_persistence_delay = indexer_config.cache_persistence_delay.max(2);
        let max_parallel_state_calls =
            indexer_config.max_parallel_validator_set_requests.max(2) as usize;

        let block_cache = Arc::new(BlockCache::new());
        let fork_cache = Arc::new(ForkCache::new(block_cache.clone()));
        let chain_state = consensus_pool.chain_state();

        Arc::new(Self {
            consensus_pool,
            chain_state,
            db,
            write_db: !indexer_config.disable_index_writer,
            disable_sync: indexer_config.disable_synchronizer,
            block_compression: !config.kill_switch.disable_block_compression,
            in_memory_epochs,
            cache_persistence_delay,
            block_cache,
            epoch_cache: Arc::new(EpochCache::new(max_parallel_state_calls)),
            fork_cache,
            clients: RwLock::new(Vec::new()),
            state: Mutex::new(ControllerState::default()),
            cancel: CancellationToken::new(),
        })
    }

    /*
     * Accessors
     */

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    pub fn epoch_cache(&self) -> &Arc<EpochCache> {
        &self.epoch_cache
    }

    pub fn fork_cache(&self) -> &Arc<ForkCache> {
        &self.fork_cache
    }

    pub fn chain_state(&self) -> Arc<ChainState> {
        self.chain_state.clone()
    }

    pub fn db(&self) -> Option<&PgPool> {
        self.db.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().clone()
    }

    pub fn last_finalized_epoch(&self) -> Epoch {
        self.state.lock().last_finalized_epoch
    }

    pub fn last_pruned_epoch(&self) -> Epoch {
        self.state.lock().last_pruned_epoch
    }

    /// The lowest epoch whose blocks stay in memory.
    pub fn min_in_memory_epoch(&self) -> Epoch {
        let state = self.state.lock();
        let anchor = state.last_finalized_epoch.max(state.last_pruned_epoch);
        anchor.saturating_sub(self.in_memory_epochs as u64 - 1)
    }

    pub fn min_in_memory_slot(&self) -> Slot {
        self.chain_state.epoch_start_slot(self.min_in_memory_epoch())
    }

    /// Register a new consensus-pool client with the indexer.
    pub fn add_client(
        &self,
        index: u16,
        client: Arc<dyn ConsensusClient>,
        priority: i32,
        archive: bool,
        skip_validators: bool,
    ) -> Arc<Client> {
        let client = Arc::new(Client::new(index, client, priority, archive, skip_validators));
        self.clients.write().push(client.clone());
        client
    }

    /// Classify a freshly connected block into the fork tree and make sure
    /// the epoch stats it depends on are being resolved.
    pub fn process_new_block(self: &Arc<Self>, block: &Arc<Block>) {
        self.fork_cache.add_block(block);
        self.ensure_epoch_stats(block);
    }

    fn ensure_epoch_stats(self: &Arc<Self>, block: &Arc<Block>) {
        let epoch = self.chain_state.epoch_of_slot(block.slot);
        for target_epoch in [epoch, epoch + 1] {
            let Some(dependent_root) =
                self.block_cache
                    .dependent_root(&self.chain_state, block, target_epoch)
            else {
                continue;
            };
            let (stats, created) = self
                .epoch_cache
                .create_or_get_epoch_stats(target_epoch, dependent_root);
            if created || !stats.is_ready() {
                self.epoch_cache.schedule_state_request(
                    stats,
                    self.clients(),
                    self.chain_state.clone(),
                    self.cancel.child_token(),
                );
            }
        }
    }

    /*
     * Startup & recovery
     */

    /// Start the indexing process: restore the in-memory state from the
    /// recovery log, then launch the client loops, the controller loop and
    /// the synchronizer.
    pub async fn start_indexer(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }

        let finalized_epoch = self.chain_state.finalized_epoch();
        let finalized_slot = self.chain_state.finalized_slot();

        // Restore the pruning cursor, clamped to the current finality.
        let mut prune_state = PruneState::default();
        if let Some(db) = &self.db {
            match database::get_connection(db)
                .and_then(|mut conn| database::get_explorer_state(&mut conn, "indexer.prunestate"))
            {
                Ok(Some(state)) => prune_state = state,
                Ok(None) => {}
                Err(e) => warn!("Failed loading prune state: {e}"),
            }
        }

        {
            let mut state = self.state.lock();
            state.last_finalized_epoch = finalized_epoch;
            state.last_pruned_epoch = Epoch::new(prune_state.epoch).max(finalized_epoch);
            state.last_prune_run_epoch = self.chain_state.current_epoch();
            state.next_persist_epoch = state.last_pruned_epoch;
        }

        if Epoch::new(prune_state.epoch) < finalized_epoch && self.write_db {
            if let Some(db) = &self.db {
                if let Err(e) = database::run_db_transaction(db, |conn| {
                    self.fork_cache.update_pruning_state(conn, finalized_epoch)?;
                    Ok(())
                }) {
                    error!("Error while updating prune state: {e}");
                }
            }
        }

        if let Err(e) = self.restore_from_db(finalized_epoch, finalized_slot).await {
            error!("Failed restoring unfinalized state from the recovery log: {e}");
        }

        // Start indexing for all clients.
        for client in self.clients() {
            tokio::spawn(client.run(self.clone()));
        }

        self.spawn_indexer_loop();

        if !self.disable_sync && self.write_db && self.db.is_some() {
            let synchronizer = Synchronizer::new(self.clone());
            tokio::spawn(synchronizer.run());
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn restore_from_db(
        self: &Arc<Self>,
        finalized_epoch: Epoch,
        finalized_slot: Slot,
    ) -> Result<(), Error> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let mut conn = database::get_connection(db)?;

        // Unfinalized forks.
        for row in database::get_unfinalized_forks(&mut conn, finalized_slot.as_u64() as i64)? {
            self.fork_cache.restore_fork(&row);
        }

        // Unfinalized duties; duty rehydration decodes the full arrays, so
        // it is spread over a bounded worker pool.
        let mut duty_rows = Vec::new();
        database::stream_unfinalized_duties(&mut conn, |row| {
            if Epoch::new(row.epoch as u64) >= finalized_epoch {
                duty_rows.push(row);
            }
        })?;

        let timer = Instant::now();
        let restored = stream::iter(duty_rows)
            .map(|row| {
                let indexer = self.clone();
                async move {
                    let epoch = Epoch::new(row.epoch as u64);
                    let dependent_root = Hash256::from_slice(&row.dependent_root);
                    let (stats, _) = indexer
                        .epoch_cache
                        .create_or_get_epoch_stats(epoch, dependent_root);
                    match stats.restore_values_ssz(&row.duties_ssz) {
                        Ok(()) => {
                            stats.set_in_db(true);
                            if epoch < indexer.last_pruned_epoch() {
                                stats.prune_values();
                            }
                            1usize
                        }
                        Err(e) => {
                            error!(
                                "Failed restoring epoch stats for epoch {} ({:?}) from db: {:?}",
                                epoch, dependent_root, e
                            );
                            0
                        }
                    }
                }
            })
            .buffer_unordered(RESTORE_PARALLELISM)
            .fold(0usize, |acc, n| async move { acc + n })
            .await;
        info!(
            "Restored {} unfinalized epoch stats from DB ({:.3} sec)",
            restored,
            timer.elapsed().as_secs_f64()
        );

        // Unfinalized epoch aggregations.
        let mut restored_aggregations = 0usize;
        database::stream_unfinalized_epochs(&mut conn, |row| {
            let epoch = Epoch::new(row.epoch as u64);
            let dependent_root = Hash256::from_slice(&row.dependent_root);
            match self.epoch_cache.get_epoch_stats(epoch, dependent_root) {
                Some(stats) => {
                    stats.add_pruned_epoch_aggregation(row);
                    restored_aggregations += 1;
                }
                None => warn!(
                    "Failed restoring epoch aggregation for epoch {} ({:?}): epoch stats not found",
                    epoch, dependent_root
                ),
            }
        })?;
        info!("Restored {restored_aggregations} unfinalized epoch aggregations from DB");

        // Unfinalized blocks.
        let timer = Instant::now();
        let mut restored_blocks = 0usize;
        let mut restored_bodies = 0usize;
        database::stream_unfinalized_blocks(&mut conn, |row| {
            if Slot::new(row.slot as u64) < finalized_slot {
                return;
            }
            match self.restore_unfinalized_block(&row) {
                Ok(with_body) => {
                    restored_blocks += 1;
                    if with_body {
                        restored_bodies += 1;
                    }
                }
                Err(e) => warn!(
                    "Could not restore unfinalized block {} [{}] from db: {}",
                    row.slot,
                    hex::encode(&row.root),
                    e
                ),
            }
        })?;
        info!(
            "Restored {} unfinalized blocks from DB ({} with bodies, {:.3} sec)",
            restored_blocks,
            restored_bodies,
            timer.elapsed().as_secs_f64()
        );

        Ok(())
    }

    /// Rebuild one cached block from its recovery-log row. Returns whether
    /// the full body was re-attached.
    fn restore_unfinalized_block(&self, row: &UnfinalizedBlockRow) -> Result<bool, Error> {
        if row.header_ver != HEADER_SCHEMA_VERSION {
            return Err(Error::MissingData(format!(
                "unsupported header version {}",
                row.header_ver
            )));
        }

        let root = Hash256::from_slice(&row.root);
        let (block, _) = self
            .block_cache
            .create_or_get_block(root, Slot::new(row.slot as u64));
        block.set_fork_id(ForkKey::from_i64(row.fork_id));
        block.try_mark_fork_processed();
        block.set_in_unfinalized_db(true);

        let status = ProcessingStatus::from_i16(row.status)
            .ok_or_else(|| Error::MissingData(format!("unknown block status {}", row.status)))?;
        block.set_status(status);

        let header = SignedBeaconBlockHeader::from_ssz_bytes(&row.header_ssz)?;
        self.block_cache.set_header(&block, header);

        let fork = ForkName::from_u8(row.block_ver as u8)
            .ok_or_else(|| Error::MissingData(format!("unknown block version {}", row.block_ver)))?;
        let body_ssz = decompress_payload(&row.block_ssz)?;
        let body = SignedBeaconBlock::from_ssz_bytes(&body_ssz, fork)?;

        if status == ProcessingStatus::FinalizedIndexed {
            // Only the summary is needed in memory.
            block.set_block_index(&body);
            block.set_in_finalized_db(true);
            Ok(false)
        } else {
            // Unfinalized blocks keep their body until finality releases it.
            block.set_block(body);
            block.set_status(status);
            Ok(true)
        }
    }

    /*
     * Controller loop
     */

    /// Spawn the finality/pruning loop. Panics are caught at the loop
    /// boundary; the loop restarts after a short pause.
    fn spawn_indexer_loop(self: &Arc<Self>) {
        let indexer = self.clone();
        tokio::spawn(async move {
            loop {
                let inner = indexer.clone();
                let handle = tokio::spawn(async move { inner.run_indexer_loop().await });
                match handle.await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(
                            "Uncaught panic in indexer loop: {:?}; restarting in {:?}",
                            e, LOOP_RESTART_DELAY
                        );
                        tokio::time::sleep(LOOP_RESTART_DELAY).await;
                    }
                }
            }
        });
    }

    async fn run_indexer_loop(self: Arc<Self>) {
        let mut finality_events = self.consensus_pool.subscribe_finalized_event(10);
        let mut wallclock_events = self.consensus_pool.subscribe_wallclock_slot_event(1);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,

                event = finality_events.recv() => {
                    let Some(event) = event else { return };
                    if let Err(e) = self.process_finality_event(&event) {
                        error!(
                            "Error processing finality event (epoch: {}, root: {:?}): {}",
                            event.finalized.epoch, event.finalized.root, e
                        );
                    }

                    let run_prune = {
                        let mut state = self.state.lock();
                        if state.last_finalized_epoch > state.last_pruned_epoch {
                            state.last_pruned_epoch = state.last_finalized_epoch;
                            true
                        } else {
                            false
                        }
                    };
                    if run_prune {
                        self.persist_prune_state();
                    }

                    if let Err(e) = self.run_cache_pruning() {
                        error!("Failed pruning cache: {e}");
                    }
                    self.state.lock().last_prune_run_epoch = self.chain_state.current_epoch();
                }

                event = wallclock_events.recv() => {
                    let Some(event) = event else { return };
                    let slot_index = self.chain_state.slot_index(event.slot);
                    let halfway = self.chain_state.spec().slots_per_epoch / 2;

                    // Prune when the last run is outdated and we are at
                    // least 50% into the current epoch; this covers long
                    // spans without finality.
                    let due = {
                        let state = self.state.lock();
                        event.epoch > state.last_prune_run_epoch && slot_index >= halfway
                    };
                    if due {
                        if let Err(e) = self.run_cache_pruning() {
                            error!("Failed pruning cache: {e}");
                        }
                        self.state.lock().last_prune_run_epoch = event.epoch;
                    }
                }
            }
        }
    }

    fn persist_prune_state(&self) {
        if !self.write_db {
            return;
        }
        let Some(db) = &self.db else { return };
        let epoch = self.state.lock().last_pruned_epoch;
        if let Err(e) = database::run_db_transaction(db, |conn| {
            self.fork_cache.update_pruning_state(conn, epoch)?;
            Ok(())
        }) {
            error!("Error while updating prune state: {e}");
        }
    }

    /// Handle a finality advance: select the canonical chain, persist every
    /// newly finalized epoch in its own transaction and mark the affected
    /// blocks.
    pub fn process_finality_event(self: &Arc<Self>, event: &FinalityEvent) -> Result<(), Error> {
        let finalized_epoch = event.finalized.epoch;
        {
            let mut state = self.state.lock();
            if finalized_epoch < state.last_finalized_epoch {
                return Err(Error::Fatal(format!(
                    "finalized epoch moved backwards: {} < {}",
                    finalized_epoch, state.last_finalized_epoch
                )));
            }
            state.last_finalized_epoch = finalized_epoch;
        }

        let next_persist = self.state.lock().next_persist_epoch;
        if next_persist >= finalized_epoch {
            return Ok(());
        }

        let chain = self.fork_cache.select_canonical_chain(Hash256::zero())?;
        for root in [event.finalized.root, event.justified.root] {
            if !root.is_zero() && !chain.iter().any(|block| block.root == root) {
                return Err(Error::Fatal(format!(
                    "canonical chain selection cannot reach checkpoint {root:?}"
                )));
            }
        }

        // Epoch persistence is strictly ascending; a gap (missing duty data)
        // stops the walk and is retried on the next finality event.
        for epoch in next_persist.as_u64()..finalized_epoch.as_u64() {
            let epoch = Epoch::new(epoch);
            match self.persist_finalized_epoch(epoch, &chain) {
                Ok(()) => {
                    self.state.lock().next_persist_epoch = epoch + 1;
                }
                Err(Error::MissingData(message)) => {
                    warn!("Skipping persistence of epoch {epoch} for now: {message}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn persist_finalized_epoch(
        self: &Arc<Self>,
        epoch: Epoch,
        chain: &[Arc<Block>],
    ) -> Result<(), Error> {
        let canonical_blocks: Vec<_> = chain
            .iter()
            .filter(|block| self.chain_state.epoch_of_slot(block.slot) == epoch)
            .cloned()
            .collect();

        // Anchor for the dependent-root walk: any canonical block at or
        // above the epoch.
        let anchor = chain
            .iter()
            .find(|block| self.chain_state.epoch_of_slot(block.slot) >= epoch)
            .or_else(|| chain.last())
            .ok_or_else(|| Error::MissingData("canonical chain is empty".into()))?;
        let dependent_root = self
            .block_cache
            .dependent_root(&self.chain_state, anchor, epoch)
            .ok_or_else(|| Error::MissingData("dependent root not resolvable".into()))?;

        let stats = self.epoch_cache.get_epoch_stats(epoch, dependent_root);
        let values = stats.as_ref().and_then(|stats| stats.values());
        let aggregation = stats.as_ref().and_then(|stats| {
            stats
                .pruned_epoch_aggregations()
                .into_iter()
                .find(|row| row.dependent_root == dependent_root.as_bytes().to_vec())
        });
        if values.is_none() && aggregation.is_none() {
            return Err(Error::MissingData(format!(
                "no epoch stats for epoch {epoch} (dependent root {dependent_root:?})"
            )));
        }

        let epoch_votes = values
            .as_ref()
            .map(|values| votes::aggregate_epoch_votes(epoch, chain, values, &self.chain_state));

        // Blocks of the epoch that lost against the canonical chain.
        let mut orphaned_blocks = Vec::new();
        for slot in epoch.slot_iter(self.chain_state.spec().slots_per_epoch) {
            for block in self.block_cache.blocks_by_slot(slot) {
                if canonical_blocks.iter().any(|b| b.root == block.root) {
                    continue;
                }
                if block.block_index().is_none() {
                    warn!(
                        "Orphaned block {:?} at slot {} has no body, skipping",
                        block.root, block.slot
                    );
                    continue;
                }
                orphaned_blocks.push(block);
            }
        }

        if self.write_db {
            if let Some(db) = &self.db {
                let chain_state = self.chain_state.clone();
                database::run_db_transaction(db, |conn| {
                    match (&values, &aggregation) {
                        (Some(values), _) => writer::persist_epoch_data(
                            conn,
                            &chain_state,
                            epoch,
                            &canonical_blocks,
                            &orphaned_blocks,
                            Some(values.as_ref()),
                            epoch_votes.as_ref(),
                        )?,
                        (None, Some(aggregation)) => {
                            // Pruned duty data: reuse the aggregation stored
                            // before pruning, persist rows without duties.
                            writer::persist_epoch_data(
                                conn,
                                &chain_state,
                                epoch,
                                &canonical_blocks,
                                &orphaned_blocks,
                                None,
                                None,
                            )?;
                            let row = aggregation.decode_epoch_data().map_err(|e| {
                                database::Error::Other(format!(
                                    "undecodable epoch aggregation: {e}"
                                ))
                            })?;
                            database::insert_epoch(conn, &row)?;
                        }
                        (None, None) => unreachable!("checked above"),
                    }

                    writer::persist_sync_assignments(
                        conn,
                        &chain_state,
                        epoch,
                        values.as_deref(),
                    )?;

                    // Keep the recovery log consistent with the finalized
                    // history.
                    for block in canonical_blocks.iter().chain(orphaned_blocks.iter()) {
                        if block.is_in_unfinalized_db() {
                            database::update_unfinalized_block_status(
                                conn,
                                block.root.as_bytes(),
                                ProcessingStatus::FinalizedIndexed.as_i16(),
                                block.fork_id().as_i64(),
                            )?;
                        }
                    }
                    Ok(())
                })?;
            }
        }

        // Transition the epoch's blocks to their terminal state and release
        // the bodies.
        for block in &canonical_blocks {
            block.set_fork_id(ForkKey::CANONICAL);
            block.set_status(ProcessingStatus::FinalizedIndexed);
            block.set_in_finalized_db(true);
            block.demote_body();
        }
        for block in &orphaned_blocks {
            block.set_status(ProcessingStatus::FinalizedIndexed);
            block.set_in_finalized_db(true);
            block.demote_body();
        }

        debug!(
            "Persisted epoch {epoch}: {} canonical, {} orphaned",
            canonical_blocks.len(),
            orphaned_blocks.len()
        );
        Ok(())
    }

    /*
     * Pruning & recovery-log flush
     */

    /// Flush the unfinalized recovery log and evict finalized entries from
    /// memory.
    pub fn run_cache_pruning(self: &Arc<Self>) -> Result<(), Error> {
        let min_epoch = self.min_in_memory_epoch();
        let min_slot = self.min_in_memory_slot();
        let (last_pruned, finalized_epoch) = {
            let state = self.state.lock();
            (state.last_pruned_epoch, state.last_finalized_epoch)
        };
        let finalized_slot = self.chain_state.epoch_start_slot(finalized_epoch);

        // 1. Flush blocks, duties and forks that are old enough to survive a
        // restart.
        let flush_epoch = self
            .chain_state
            .current_epoch()
            .saturating_sub(self.cache_persistence_delay as u64);
        let flush_slot = self.chain_state.epoch_start_slot(flush_epoch + 1);

        if self.write_db {
            if let Some(db) = &self.db {
                let mut flushed_blocks = Vec::new();
                let mut flushed_duties = Vec::new();

                for block in self.block_cache.blocks_with_slot_below(flush_slot) {
                    if block.is_in_unfinalized_db() || block.is_in_finalized_db() {
                        continue;
                    }
                    if let Some(row) = self.build_unfinalized_block_row(&block) {
                        flushed_blocks.push((block, row));
                    }
                }

                for stats in self.epoch_cache.all_epoch_stats() {
                    if stats.is_in_db() || stats.epoch > flush_epoch {
                        continue;
                    }
                    if let Some(ssz) = stats.encode_values_ssz() {
                        flushed_duties.push((stats, ssz));
                    }
                }

                let fork_rows = self.fork_cache.fork_rows();

                database::run_db_transaction(db, |conn| {
                    for (_, row) in &flushed_blocks {
                        database::upsert_unfinalized_block(conn, row)?;
                    }
                    for (stats, ssz) in &flushed_duties {
                        database::insert_unfinalized_duty(
                            conn,
                            &database::models::UnfinalizedDutyRow {
                                epoch: stats.epoch.as_u64() as i64,
                                dependent_root: stats.dependent_root.as_bytes().to_vec(),
                                duties_ssz: ssz.clone(),
                            },
                        )?;
                    }
                    for row in &fork_rows {
                        database::upsert_unfinalized_fork(conn, row)?;
                    }

                    // Entries below finality have graduated to the
                    // finalized tables.
                    database::delete_unfinalized_blocks_below(
                        conn,
                        finalized_slot.as_u64() as i64,
                    )?;
                    database::delete_unfinalized_duties_below(
                        conn,
                        finalized_epoch.as_u64() as i64,
                    )?;
                    database::delete_unfinalized_epochs_below(
                        conn,
                        finalized_epoch.as_u64() as i64,
                    )?;
                    database::delete_unfinalized_forks_below(
                        conn,
                        finalized_slot.as_u64() as i64,
                    )?;
                    Ok(())
                })?;

                for (block, _) in flushed_blocks {
                    block.set_in_unfinalized_db(true);
                }
                for (stats, _) in flushed_duties {
                    stats.set_in_db(true);
                }
            }
        }

        // 2. Flush aggregations and drop duty arrays of pruned epochs.
        for stats in self.epoch_cache.all_epoch_stats() {
            if stats.epoch <= last_pruned && !stats.is_pruned() && stats.is_ready() {
                if let Err(e) = self.flush_epoch_aggregation(&stats) {
                    debug!(
                        "Could not flush aggregation for epoch {}: {}",
                        stats.epoch, e
                    );
                }
                stats.prune_values();
            }
        }

        // 3. Evict finalized entries from memory.
        let mut pruned_blocks = 0usize;
        for block in self.block_cache.blocks_with_slot_below(min_slot + 1) {
            if self.block_cache.prune_block(&block.root, min_slot) {
                pruned_blocks += 1;
            }
        }

        for stats in self.epoch_cache.all_epoch_stats() {
            if stats.epoch < min_epoch {
                self.epoch_cache
                    .remove_epoch_stats(stats.epoch, stats.dependent_root);
            }
        }

        self.fork_cache.prune(finalized_slot, min_slot);

        debug!(
            "Cache pruning done: {} blocks evicted, {} blocks cached, {} epoch stats cached",
            pruned_blocks,
            self.block_cache.block_count(),
            self.epoch_cache.entry_count()
        );
        Ok(())
    }

    /// Store the epoch aggregation row so a restart can re-finalize the
    /// epoch without recomputing duties.
    fn flush_epoch_aggregation(self: &Arc<Self>, stats: &Arc<EpochStats>) -> Result<(), Error> {
        if !self.write_db {
            return Ok(());
        }
        let Some(db) = &self.db else {
            return Ok(());
        };
        let Some(values) = stats.values() else {
            return Ok(());
        };

        let chain = self.fork_cache.select_canonical_chain(Hash256::zero())?;
        let canonical_blocks: Vec<_> = chain
            .iter()
            .filter(|block| self.chain_state.epoch_of_slot(block.slot) == stats.epoch)
            .cloned()
            .collect();
        let epoch_votes =
            votes::aggregate_epoch_votes(stats.epoch, &chain, &values, &self.chain_state);
        let row = writer::build_epoch_row(
            &self.chain_state,
            stats.epoch,
            &canonical_blocks,
            0,
            Some(values.as_ref()),
            Some(&epoch_votes),
        );

        database::run_db_transaction(db, |conn| {
            database::insert_unfinalized_epoch(
                conn,
                &database::models::UnfinalizedEpochRow {
                    epoch: stats.epoch.as_u64() as i64,
                    dependent_root: stats.dependent_root.as_bytes().to_vec(),
                    epoch_data: serde_json::to_value(&row)?,
                },
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Encode a block for the recovery log.
    fn build_unfinalized_block_row(&self, block: &Arc<Block>) -> Option<UnfinalizedBlockRow> {
        let header = block.header()?;
        let body = block.body()?;

        let body_ssz = body.as_ssz_bytes();
        let block_ssz = match compress_payload(&body_ssz, self.block_compression) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed compressing block {:?}: {}", block.root, e);
                return None;
            }
        };

        Some(UnfinalizedBlockRow {
            root: block.root.as_bytes().to_vec(),
            slot: block.slot.as_u64() as i64,
            fork_id: block.fork_id().as_i64(),
            status: block.status().as_i16(),
            header_ver: HEADER_SCHEMA_VERSION,
            header_ssz: header.as_ssz_bytes(),
            block_ver: body.fork_name().as_u8() as i16,
            block_ssz,
        })
    }
}

/*
 * Recovery-log payload codec
 */

fn compress_payload(bytes: &[u8], compression: bool) -> Result<Vec<u8>, Error> {
    if !compression {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(SCHEME_RAW);
        out.extend_from_slice(bytes);
        return Ok(out);
    }

    let compressed = snap::raw::Encoder::new()
        .compress_vec(bytes)
        .map_err(|e| Error::MissingData(format!("snappy compression failed: {e}")))?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(SCHEME_SNAPPY);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decompress_payload(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    match bytes.split_first() {
        Some((&SCHEME_RAW, payload)) => Ok(payload.to_vec()),
        Some((&SCHEME_SNAPPY, payload)) => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| Error::MissingData(format!("snappy decompression failed: {e}"))),
        _ => Err(Error::MissingData("empty recovery payload".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::test_utils::{header_at, signed_block};
    use crate::config::Config;
    use crate::consensus::ConsensusPool;
    use ssz::Encode as _;
    use types::{ChainSpec, Checkpoint};

    fn test_indexer() -> Arc<Indexer> {
        let pool = Arc::new(ConsensusPool::new(ChainSpec::minimal(), 0));
        Indexer::new(pool, None, &Config::default())
    }

    // Connect a canonical chain r1..=rN at slots 1..=N with bodies.
    fn feed_chain(indexer: &Arc<Indexer>, slots: std::ops::RangeInclusive<u64>) -> Vec<Hash256> {
        let mut roots = Vec::new();
        let mut parent = Hash256::zero();
        for slot in slots {
            let root = Hash256::repeat_byte(slot as u8);
            let (block, _) = indexer.block_cache().create_or_get_block(root, Slot::new(slot));
            indexer.block_cache().set_header(&block, header_at(slot, parent));
            block.set_block(signed_block(slot, parent));
            indexer.process_new_block(&block);
            roots.push(root);
            parent = root;
        }
        roots
    }

    fn finality_event(epoch: u64, root: Hash256) -> FinalityEvent {
        let finalized = Checkpoint {
            epoch: Epoch::new(epoch),
            root,
        };
        FinalityEvent {
            finalized,
            justified: finalized,
            previous_justified: finalized,
        }
    }

    #[tokio::test]
    async fn finality_marks_canonical_blocks() {
        let indexer = test_indexer();
        // Epochs are 8 slots; fill epoch 0 (slots 1..=7) and epoch 1.
        let roots = feed_chain(&indexer, 1..=15);

        // Stats for epoch 0 at its dependent root (block at slot 1).
        let tip = indexer.block_cache().get_block(&roots[14]).unwrap();
        let dependent_root = indexer
            .block_cache()
            .dependent_root(&indexer.chain_state(), &tip, Epoch::new(0))
            .unwrap();
        let (stats, _) = indexer
            .epoch_cache()
            .create_or_get_epoch_stats(Epoch::new(0), dependent_root);
        stats.set_values(EpochStatsValues {
            active_validators: 8,
            effective_balance: 8,
            active_balance: 8,
            first_deposit_index: 0,
            effective_balances: vec![1; 8],
            proposer_duties: (0..8).collect(),
            attester_duties: (0..8).map(|i| vec![vec![i]]).collect(),
            sync_committee_duties: vec![],
        });

        indexer
            .process_finality_event(&finality_event(1, roots[6]))
            .unwrap();

        // Epoch 0 blocks are finalized and demoted to their summaries.
        for root in &roots[..7] {
            let block = indexer.block_cache().get_block(root).unwrap();
            assert_eq!(block.status(), ProcessingStatus::FinalizedIndexed);
            assert_eq!(block.fork_id(), ForkKey::CANONICAL);
            assert!(block.body().is_none());
            assert!(block.block_index().is_some());
            assert!(block.is_in_finalized_db());
        }
        // Epoch 1 blocks are untouched.
        let later = indexer.block_cache().get_block(&roots[8]).unwrap();
        assert_eq!(later.status(), ProcessingStatus::Indexed);
        assert!(later.body().is_some());
    }

    #[tokio::test]
    async fn missing_stats_defer_persistence() {
        let indexer = test_indexer();
        let roots = feed_chain(&indexer, 1..=15);

        // No epoch stats registered: the epoch is skipped and retried, not
        // treated as fatal.
        indexer
            .process_finality_event(&finality_event(1, roots[6]))
            .unwrap();
        let block = indexer.block_cache().get_block(&roots[0]).unwrap();
        assert_eq!(block.status(), ProcessingStatus::Indexed);
        assert_eq!(indexer.state.lock().next_persist_epoch, Epoch::new(0));
    }

    #[tokio::test]
    async fn finality_regression_is_fatal() {
        let indexer = test_indexer();
        let roots = feed_chain(&indexer, 1..=15);
        indexer
            .process_finality_event(&finality_event(1, roots[6]))
            .unwrap();

        let result = indexer.process_finality_event(&finality_event(0, roots[0]));
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn unreachable_checkpoint_is_fatal() {
        let indexer = test_indexer();
        feed_chain(&indexer, 1..=15);

        let bogus = Hash256::repeat_byte(0xef);
        let result = indexer.process_finality_event(&finality_event(1, bogus));
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn restart_recovery_restores_blocks_and_duties() {
        let indexer = test_indexer();

        // Simulate rows that a previous run left in the recovery log.
        let values = EpochStatsValues {
            active_validators: 8,
            effective_balance: 8,
            active_balance: 8,
            first_deposit_index: 3,
            effective_balances: vec![1; 8],
            proposer_duties: (0..8).collect(),
            attester_duties: (0..8).map(|i| vec![vec![i]]).collect(),
            sync_committee_duties: (0..4).collect(),
        };
        let dependent_root = Hash256::repeat_byte(0x11);

        // Duties restore through the SSZ payload.
        let (stats, _) = indexer
            .epoch_cache()
            .create_or_get_epoch_stats(Epoch::new(1), dependent_root);
        stats.restore_values_ssz(&values.as_ssz_bytes()).unwrap();
        stats.set_in_db(true);
        assert_eq!(stats.values().unwrap().as_ref(), &values);

        // Blocks restore through the versioned, compressed payload.
        let parent = Hash256::repeat_byte(0x22);
        let body = signed_block(9, parent);
        let header = header_at(9, parent);
        let root = Hash256::repeat_byte(0x33);
        let row = UnfinalizedBlockRow {
            root: root.as_bytes().to_vec(),
            slot: 9,
            fork_id: 2,
            status: ProcessingStatus::Received.as_i16(),
            header_ver: HEADER_SCHEMA_VERSION,
            header_ssz: header.as_ssz_bytes(),
            block_ver: body.fork_name().as_u8() as i16,
            block_ssz: compress_payload(&body.as_ssz_bytes(), true).unwrap(),
        };

        let with_body = indexer.restore_unfinalized_block(&row).unwrap();
        assert!(with_body);

        let block = indexer.block_cache().get_block(&root).unwrap();
        assert!(block.is_in_unfinalized_db());
        assert_eq!(block.fork_id(), ForkKey(2));
        assert_eq!(block.header().unwrap().message.parent_root, parent);
        assert_eq!(block.body().unwrap().as_ref(), &body);
    }

    #[tokio::test]
    async fn restore_rejects_unknown_schema() {
        let indexer = test_indexer();
        let row = UnfinalizedBlockRow {
            root: Hash256::repeat_byte(1).as_bytes().to_vec(),
            slot: 1,
            fork_id: 0,
            status: 0,
            header_ver: 9,
            header_ssz: vec![],
            block_ver: 1,
            block_ssz: vec![SCHEME_RAW],
        };
        assert!(indexer.restore_unfinalized_block(&row).is_err());
    }

    #[test]
    fn payload_codec_round_trips() {
        let payload = vec![7u8; 4096];

        let compressed = compress_payload(&payload, true).unwrap();
        assert_eq!(compressed[0], SCHEME_SNAPPY);
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress_payload(&compressed).unwrap(), payload);

        let raw = compress_payload(&payload, false).unwrap();
        assert_eq!(raw[0], SCHEME_RAW);
        assert_eq!(decompress_payload(&raw).unwrap(), payload);

        assert!(decompress_payload(&[]).is_err());
    }

    #[tokio::test]
    async fn pruning_evicts_finalized_blocks() {
        let indexer = test_indexer();
        let roots = feed_chain(&indexer, 1..=31);

        let tip = indexer.block_cache().get_block(&roots[30]).unwrap();
        for epoch in [0u64, 1, 2] {
            let dependent_root = indexer
                .block_cache()
                .dependent_root(&indexer.chain_state(), &tip, Epoch::new(epoch))
                .unwrap();
            let (stats, _) = indexer
                .epoch_cache()
                .create_or_get_epoch_stats(Epoch::new(epoch), dependent_root);
            stats.set_values(EpochStatsValues {
                active_validators: 8,
                effective_balance: 8,
                active_balance: 8,
                first_deposit_index: 0,
                effective_balances: vec![1; 8],
                proposer_duties: (0..8).collect(),
                attester_duties: (0..8).map(|i| vec![vec![i]]).collect(),
                sync_committee_duties: vec![],
            });
        }

        // Finalize epoch 3: epochs 0..=2 are persisted and marked.
        indexer
            .process_finality_event(&finality_event(3, roots[23]))
            .unwrap();
        {
            let mut state = indexer.state.lock();
            state.last_pruned_epoch = state.last_finalized_epoch;
        }

        indexer.run_cache_pruning().unwrap();

        // Default config keeps 3 epochs: min epoch 1, min slot 8. Blocks of
        // epoch 0 are gone, newer finalized blocks are retained.
        assert!(indexer.block_cache().get_block(&roots[0]).is_none());
        assert!(indexer.block_cache().get_block(&roots[10]).is_some());
        // Epoch stats below the window were dropped.
        assert!(indexer
            .epoch_cache()
            .all_epoch_stats()
            .iter()
            .all(|stats| stats.epoch >= indexer.min_in_memory_epoch()));
    }
}
