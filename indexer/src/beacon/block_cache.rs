//! The block cache: every observed block keyed by root, with slot and parent
//! indices, per-block load state and a deduplicating body loader.

use crate::beacon::error::Error;
use crate::beacon::fork_cache::ForkKey;
use crate::consensus::ChainState;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use types::{
    ExecutionSummary, Graffiti, Hash256, SignedBeaconBlock, SignedBeaconBlockHeader, Slot,
};

/// Lifecycle state of a block within the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Header (and possibly body) seen, not yet written anywhere.
    Received,
    /// Summary extracted and written to the unfinalized store; the body is
    /// retained while the block is unfinalized.
    Indexed,
    /// Finalized and persisted; only the summary is kept.
    FinalizedIndexed,
}

impl ProcessingStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ProcessingStatus::Received => 0,
            ProcessingStatus::Indexed => 1,
            ProcessingStatus::FinalizedIndexed => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(ProcessingStatus::Received),
            1 => Some(ProcessingStatus::Indexed),
            2 => Some(ProcessingStatus::FinalizedIndexed),
            _ => None,
        }
    }
}

/// The summary a block leaves behind once its body is released.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockIndex {
    pub graffiti: Graffiti,
    pub attestation_count: usize,
    pub deposit_count: usize,
    pub exit_count: usize,
    pub proposer_slashing_count: usize,
    pub attester_slashing_count: usize,
    pub bls_change_count: usize,
    pub sync_committee_bits: Option<types::Bitfield>,
    pub execution: Option<ExecutionSummary>,
}

impl BlockIndex {
    pub fn from_block(block: &SignedBeaconBlock) -> Self {
        let body = block.body();
        Self {
            graffiti: *body.graffiti(),
            attestation_count: body.attestation_count(),
            deposit_count: body.deposits().len(),
            exit_count: body.voluntary_exits().len(),
            proposer_slashing_count: body.proposer_slashings().len(),
            attester_slashing_count: body.attester_slashings().len(),
            bls_change_count: body.bls_change_count(),
            sync_committee_bits: body
                .sync_aggregate()
                .ok()
                .map(|aggregate| aggregate.sync_committee_bits.clone()),
            execution: body.execution_payload().map(|payload| payload.summary()),
        }
    }
}

/// A single cached block. Owned by the block cache; other caches refer to it
/// by root only.
pub struct Block {
    pub root: Hash256,
    pub slot: Slot,
    header: RwLock<Option<Arc<SignedBeaconBlockHeader>>>,
    body: RwLock<Option<Arc<SignedBeaconBlock>>>,
    block_index: RwLock<Option<Arc<BlockIndex>>>,
    fork_id: RwLock<ForkKey>,
    status: RwLock<ProcessingStatus>,
    in_unfinalized_db: AtomicBool,
    in_finalized_db: AtomicBool,
    fork_processed: AtomicBool,
    /// Serializes body loads; see `BlockCache::load_body`.
    body_latch: tokio::sync::Mutex<()>,
}

impl Block {
    fn new(root: Hash256, slot: Slot) -> Self {
        Self {
            root,
            slot,
            header: RwLock::new(None),
            body: RwLock::new(None),
            block_index: RwLock::new(None),
            fork_id: RwLock::new(ForkKey::CANONICAL),
            status: RwLock::new(ProcessingStatus::Received),
            in_unfinalized_db: AtomicBool::new(false),
            in_finalized_db: AtomicBool::new(false),
            fork_processed: AtomicBool::new(false),
            body_latch: tokio::sync::Mutex::new(()),
        }
    }

    pub fn header(&self) -> Option<Arc<SignedBeaconBlockHeader>> {
        self.header.read().clone()
    }

    pub fn parent_root(&self) -> Option<Hash256> {
        self.header.read().as_ref().map(|h| h.message.parent_root)
    }

    pub fn body(&self) -> Option<Arc<SignedBeaconBlock>> {
        self.body.read().clone()
    }

    /// Set the block body and extract its summary. Write-once; returns
    /// whether this call stored it. Moves `received` blocks to `indexed`
    /// (the transition is idempotent).
    pub fn set_block(&self, body: SignedBeaconBlock) -> bool {
        let mut slot = self.body.write();
        if slot.is_some() {
            return false;
        }
        *self.block_index.write() = Some(Arc::new(BlockIndex::from_block(&body)));
        *slot = Some(Arc::new(body));

        let mut status = self.status.write();
        if *status == ProcessingStatus::Received {
            *status = ProcessingStatus::Indexed;
        }
        true
    }

    /// Store the extracted summary without retaining the body. Used when
    /// restoring already-indexed blocks.
    pub fn set_block_index(&self, body: &SignedBeaconBlock) {
        *self.block_index.write() = Some(Arc::new(BlockIndex::from_block(body)));
    }

    pub fn block_index(&self) -> Option<Arc<BlockIndex>> {
        self.block_index.read().clone()
    }

    /// Release the body, keeping only the summary. Idempotent; only the
    /// controller calls this during finality processing.
    pub fn demote_body(&self) {
        *self.body.write() = None;
    }

    pub fn fork_id(&self) -> ForkKey {
        *self.fork_id.read()
    }

    pub fn set_fork_id(&self, fork_id: ForkKey) {
        *self.fork_id.write() = fork_id;
    }

    pub fn status(&self) -> ProcessingStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ProcessingStatus) {
        *self.status.write() = status;
    }

    pub fn is_in_unfinalized_db(&self) -> bool {
        self.in_unfinalized_db.load(Ordering::Acquire)
    }

    pub fn set_in_unfinalized_db(&self, value: bool) {
        self.in_unfinalized_db.store(value, Ordering::Release)
    }

    pub fn is_in_finalized_db(&self) -> bool {
        self.in_finalized_db.load(Ordering::Acquire)
    }

    /// Claim the one-time fork classification of this block. Returns `false`
    /// when another path already classified it.
    pub fn try_mark_fork_processed(&self) -> bool {
        !self.fork_processed.swap(true, Ordering::AcqRel)
    }

    pub fn set_in_finalized_db(&self, value: bool) {
        self.in_finalized_db.store(value, Ordering::Release)
    }
}

#[derive(Default)]
struct BlockCacheState {
    blocks: HashMap<Hash256, Arc<Block>>,
    slot_map: BTreeMap<Slot, Vec<Hash256>>,
    parent_map: HashMap<Hash256, Vec<Hash256>>,
}

/// Root-keyed cache of all blocks in the unfinalized window.
#[derive(Default)]
pub struct BlockCache {
    state: Mutex<BlockCacheState>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent create-or-get. Concurrent calls for the same root observe
    /// exactly one creation.
    pub fn create_or_get_block(&self, root: Hash256, slot: Slot) -> (Arc<Block>, bool) {
        let mut state = self.state.lock();
        if let Some(block) = state.blocks.get(&root) {
            return (block.clone(), false);
        }

        let block = Arc::new(Block::new(root, slot));
        state.blocks.insert(root, block.clone());
        state.slot_map.entry(slot).or_default().push(root);
        (block, true)
    }

    pub fn get_block(&self, root: &Hash256) -> Option<Arc<Block>> {
        self.state.lock().blocks.get(root).cloned()
    }

    pub fn blocks_by_slot(&self, slot: Slot) -> Vec<Arc<Block>> {
        let state = self.state.lock();
        state
            .slot_map
            .get(&slot)
            .map(|roots| {
                roots
                    .iter()
                    .filter_map(|root| state.blocks.get(root).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn blocks_by_parent(&self, parent_root: &Hash256) -> Vec<Arc<Block>> {
        let state = self.state.lock();
        state
            .parent_map
            .get(parent_root)
            .map(|roots| {
                roots
                    .iter()
                    .filter_map(|root| state.blocks.get(root).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All blocks with `slot` in `range`, ascending by slot.
    pub fn blocks_with_slot_below(&self, threshold: Slot) -> Vec<Arc<Block>> {
        let state = self.state.lock();
        state
            .slot_map
            .range(..threshold)
            .flat_map(|(_, roots)| roots.iter())
            .filter_map(|root| state.blocks.get(root).cloned())
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Attach the header to a block. The header is frozen after the first
    /// set; repeated calls are no-ops returning `false`.
    pub fn set_header(&self, block: &Arc<Block>, header: SignedBeaconBlockHeader) -> bool {
        let parent_root = header.message.parent_root;
        {
            let mut slot = block.header.write();
            if slot.is_some() {
                return false;
            }
            *slot = Some(Arc::new(header));
        }
        self.state
            .lock()
            .parent_map
            .entry(parent_root)
            .or_default()
            .push(block.root);
        true
    }

    /// Load the block body through `loader`, deduplicating concurrent calls.
    ///
    /// The first caller owns the load; concurrent callers wait on the latch
    /// and receive the stored outcome. A failed load releases the latch so
    /// the next caller retries. This bounds the system to at most one
    /// concurrent body fetch per root.
    pub async fn load_body<F, Fut>(
        &self,
        block: &Arc<Block>,
        loader: F,
    ) -> Result<Arc<SignedBeaconBlock>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SignedBeaconBlock, Error>>,
    {
        if let Some(body) = block.body() {
            return Ok(body);
        }

        let _latch = block.body_latch.lock().await;
        if let Some(body) = block.body() {
            return Ok(body);
        }

        let body = loader().await?;
        block.set_block(body);
        Ok(block.body().expect("body was just set"))
    }

    /// Walk the ancestry of `from` to the block whose slot is at or below
    /// the dependent slot of `epoch` and return its root.
    ///
    /// Returns `None` when the ancestry breaks before reaching the target
    /// (parent not cached yet).
    pub fn dependent_root(
        &self,
        chain_state: &ChainState,
        from: &Arc<Block>,
        epoch: types::Epoch,
    ) -> Option<Hash256> {
        let target_slot = chain_state
            .epoch_start_slot(epoch.saturating_sub(1u64))
            .saturating_sub(1u64);

        let mut current = from.clone();
        loop {
            if current.slot <= target_slot {
                return Some(current.root);
            }
            let parent_root = current.parent_root()?;
            match self.get_block(&parent_root) {
                Some(parent) => current = parent,
                // The parent chain left the cache; the dependent root is the
                // parent itself when it sits at or below the target slot.
                None => return Some(parent_root),
            }
        }
    }

    /// Drop a block from the cache.
    ///
    /// Only permitted once the block is at or below `min_in_memory_slot` and
    /// its final disposition (canonical or orphaned) has been persisted.
    pub fn prune_block(&self, root: &Hash256, min_in_memory_slot: Slot) -> bool {
        let mut state = self.state.lock();
        let Some(block) = state.blocks.get(root) else {
            return false;
        };
        if block.slot > min_in_memory_slot || !block.is_in_finalized_db() {
            return false;
        }

        let slot = block.slot;
        let parent_root = block.parent_root();
        state.blocks.remove(root);
        if let Some(roots) = state.slot_map.get_mut(&slot) {
            roots.retain(|r| r != root);
            if roots.is_empty() {
                state.slot_map.remove(&slot);
            }
        }
        if let Some(parent_root) = parent_root {
            if let Some(children) = state.parent_map.get_mut(&parent_root) {
                children.retain(|r| r != root);
                if children.is_empty() {
                    state.parent_map.remove(&parent_root);
                }
            }
        }
        true
    }

    /// Unconditional removal, for blocks whose parents never arrived.
    pub fn remove_block(&self, root: &Hash256) {
        let mut state = self.state.lock();
        if let Some(block) = state.blocks.remove(root) {
            let slot = block.slot;
            if let Some(roots) = state.slot_map.get_mut(&slot) {
                roots.retain(|r| r != root);
                if roots.is_empty() {
                    state.slot_map.remove(&slot);
                }
            }
            if let Some(parent_root) = block.parent_root() {
                if let Some(children) = state.parent_map.get_mut(&parent_root) {
                    children.retain(|r| r != root);
                    if children.is_empty() {
                        state.parent_map.remove(&parent_root);
                    }
                }
            }
        }
    }
}
