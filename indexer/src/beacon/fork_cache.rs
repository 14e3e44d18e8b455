//! The fork cache: a tree of live forks over the unfinalized range.
//!
//! Fork 0 is the canonical chain by convention. A block extending the sole
//! child-line of its parent inherits the parent's fork id; a branch point
//! retires the parent's fork id for its descendants and assigns fresh ids to
//! every branch.

use crate::beacon::block_cache::{Block, BlockCache};
use crate::beacon::error::Error;
use crate::database::{self, models::UnfinalizedForkRow};
use diesel::PgConnection;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use types::{Epoch, Hash256, Slot};

/// Identifier of a fork. Monotonically increasing; 0 is the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForkKey(pub u64);

impl ForkKey {
    pub const CANONICAL: ForkKey = ForkKey(0);

    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Self {
        ForkKey(value as u64)
    }

    pub fn is_canonical(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ForkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One divergent branch in the unfinalized window.
#[derive(Debug, Clone)]
pub struct Fork {
    pub fork_id: ForkKey,
    pub parent_fork: ForkKey,
    /// Slot and root at which the fork diverged.
    pub base_slot: Slot,
    pub base_root: Hash256,
    pub head_slot: Slot,
    pub head_root: Hash256,
    /// Clients currently reporting this fork's head as their head.
    pub leader_clients: HashSet<u16>,
}

/// The cursor persisted as `indexer.prunestate`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PruneState {
    pub epoch: u64,
}

#[derive(Default)]
struct ForkCacheState {
    forks: HashMap<ForkKey, Fork>,
    next_fork_id: u64,
    /// Blocks whose parents have not arrived, keyed by the missing parent.
    pending_blocks: HashMap<Hash256, Vec<Hash256>>,
    client_heads: HashMap<u16, (Hash256, Slot)>,
}

pub struct ForkCache {
    state: Mutex<ForkCacheState>,
    block_cache: Arc<BlockCache>,
}

impl ForkCache {
    pub fn new(block_cache: Arc<BlockCache>) -> Self {
        let mut state = ForkCacheState::default();
        state.next_fork_id = 1;
        Self {
            state: Mutex::new(state),
            block_cache,
        }
    }

    pub fn get_fork(&self, fork_id: ForkKey) -> Option<Fork> {
        self.state.lock().forks.get(&fork_id).cloned()
    }

    pub fn fork_count(&self) -> usize {
        self.state.lock().forks.len()
    }

    /// Snapshot of all fork heads with their current leader clients.
    pub fn get_fork_heads(&self) -> Vec<Fork> {
        let state = self.state.lock();
        state
            .forks
            .values()
            .map(|fork| {
                let mut fork = fork.clone();
                fork.leader_clients = state
                    .client_heads
                    .iter()
                    .filter(|(_, (root, _))| *root == fork.head_root)
                    .map(|(client, _)| *client)
                    .collect();
                fork
            })
            .collect()
    }

    /// Record a client's reported head; used as tie-break during canonical
    /// selection.
    pub fn report_client_head(&self, client_index: u16, root: Hash256, slot: Slot) {
        self.state
            .lock()
            .client_heads
            .insert(client_index, (root, slot));
    }

    /// Classify `block` into a fork and return the assigned fork id.
    ///
    /// Missing parents are tolerated: the block is parked and re-processed
    /// when the parent arrives. Arrival order within a fork does not change
    /// the assignment because descendants are re-labelled on branching.
    pub fn add_block(&self, block: &Arc<Block>) -> ForkKey {
        if !block.try_mark_fork_processed() {
            return block.fork_id();
        }

        let mut state = self.state.lock();
        let fork_id = self.classify_block(&mut state, block);
        block.set_fork_id(fork_id);

        // A newly connected block may unblock parked children.
        let mut queue = VecDeque::from([block.root]);
        while let Some(parent_root) = queue.pop_front() {
            let Some(children) = state.pending_blocks.remove(&parent_root) else {
                continue;
            };
            for child_root in children {
                if let Some(child) = self.block_cache.get_block(&child_root) {
                    let child_fork = self.classify_block(&mut state, &child);
                    child.set_fork_id(child_fork);
                    queue.push_back(child_root);
                }
            }
        }

        fork_id
    }

    fn classify_block(&self, state: &mut ForkCacheState, block: &Arc<Block>) -> ForkKey {
        let Some(parent_root) = block.parent_root() else {
            // No header yet; the caller retries once it is set.
            return ForkKey::CANONICAL;
        };

        match self.block_cache.get_block(&parent_root) {
            Some(parent) => self.classify_with_parent(state, block, &parent),
            None => {
                // The parent may have left the in-memory window while its
                // fork is still alive.
                if let Some(fork_id) = state
                    .forks
                    .values()
                    .find(|fork| fork.head_root == parent_root)
                    .map(|fork| fork.fork_id)
                {
                    let fork = state.forks.get_mut(&fork_id).expect("fork exists");
                    if block.slot > fork.head_slot {
                        fork.head_slot = block.slot;
                        fork.head_root = block.root;
                    }
                    return fork_id;
                }

                if state.forks.is_empty() {
                    // Bootstrap: the first observed chain is canonical.
                    state.forks.insert(
                        ForkKey::CANONICAL,
                        Fork {
                            fork_id: ForkKey::CANONICAL,
                            parent_fork: ForkKey::CANONICAL,
                            base_slot: block.slot,
                            base_root: block.root,
                            head_slot: block.slot,
                            head_root: block.root,
                            leader_clients: HashSet::new(),
                        },
                    );
                    return ForkKey::CANONICAL;
                }

                debug!(
                    "Parent {:?} of block {:?} not cached, holding for retry",
                    parent_root, block.root
                );
                state
                    .pending_blocks
                    .entry(parent_root)
                    .or_default()
                    .push(block.root);
                ForkKey::CANONICAL
            }
        }
    }

    fn classify_with_parent(
        &self,
        state: &mut ForkCacheState,
        block: &Arc<Block>,
        parent: &Arc<Block>,
    ) -> ForkKey {
        let parent_fork_id = parent.fork_id();
        let siblings: Vec<_> = self
            .block_cache
            .blocks_by_parent(&parent.root)
            .into_iter()
            .filter(|sibling| sibling.root != block.root)
            .collect();

        if siblings.is_empty() {
            // Unique successor: inherit the parent's fork and advance its
            // head when this extends it.
            if let Some(fork) = state.forks.get_mut(&parent_fork_id) {
                if block.slot > fork.head_slot {
                    fork.head_slot = block.slot;
                    fork.head_root = block.root;
                }
            }
            return parent_fork_id;
        }

        // Branch point: the parent's fork id is retired for descendants.
        // Siblings that inherited it (including their subtrees) move onto
        // fresh fork ids; this block gets one of its own.
        for sibling in &siblings {
            if sibling.fork_id() == parent_fork_id {
                let new_fork = self.create_fork(state, parent_fork_id, sibling);
                self.relabel_subtree(sibling, parent_fork_id, new_fork, state);
            }
        }

        // The retired fork now heads at the branch point.
        if let Some(fork) = state.forks.get_mut(&parent_fork_id) {
            if fork.head_slot > parent.slot {
                fork.head_slot = parent.slot;
                fork.head_root = parent.root;
            }
        }

        self.create_fork(state, parent_fork_id, block)
    }

    fn create_fork(
        &self,
        state: &mut ForkCacheState,
        parent_fork: ForkKey,
        base_block: &Arc<Block>,
    ) -> ForkKey {
        let fork_id = ForkKey(state.next_fork_id);
        state.next_fork_id += 1;
        state.forks.insert(
            fork_id,
            Fork {
                fork_id,
                parent_fork,
                base_slot: base_block.slot,
                base_root: base_block.root,
                head_slot: base_block.slot,
                head_root: base_block.root,
                leader_clients: HashSet::new(),
            },
        );
        fork_id
    }

    /// Move every cached descendant of `from` that still carries `old_fork`
    /// onto `new_fork`, tracking the deepest block as the fork head.
    fn relabel_subtree(
        &self,
        from: &Arc<Block>,
        old_fork: ForkKey,
        new_fork: ForkKey,
        state: &mut ForkCacheState,
    ) {
        let mut head = (from.slot, from.root);
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            current.set_fork_id(new_fork);
            if current.slot > head.0 {
                head = (current.slot, current.root);
            }
            for child in self.block_cache.blocks_by_parent(&current.root) {
                if child.fork_id() == old_fork {
                    queue.push_back(child);
                }
            }
        }

        if let Some(fork) = state.forks.get_mut(&new_fork) {
            fork.head_slot = head.0;
            fork.head_root = head.1;
        }
    }

    /// Select the canonical chain from `justified_root` to the best head.
    ///
    /// The best head is the fork head with the most client reports behind
    /// it, ties broken by slot then root. The returned blocks are ascending
    /// by slot and all connected by parent links.
    pub fn select_canonical_chain(
        &self,
        justified_root: Hash256,
    ) -> Result<Vec<Arc<Block>>, Error> {
        let heads = self.get_fork_heads();

        let mut candidates: Vec<(usize, Slot, Hash256)> = heads
            .iter()
            .map(|fork| (fork.leader_clients.len(), fork.head_slot, fork.head_root))
            .collect();
        // Stand-alone client heads may be ahead of any fork head briefly.
        {
            let state = self.state.lock();
            for (root, slot) in state.client_heads.values() {
                if self.block_cache.get_block(root).is_some()
                    && !candidates.iter().any(|(_, _, r)| r == root)
                {
                    let weight = state
                        .client_heads
                        .values()
                        .filter(|(r, _)| r == root)
                        .count();
                    candidates.push((weight, *slot, *root));
                }
            }
        }
        candidates.sort_by(|a, b| b.cmp(a));

        for (_, _, head_root) in candidates {
            if let Some(chain) = self.walk_to_root(head_root, justified_root) {
                return Ok(chain);
            }
        }

        Err(Error::Fatal(format!(
            "canonical chain selection cannot reach justified root {justified_root:?}"
        )))
    }

    /// Walk parent links from `head_root` down to `target_root`, returning
    /// the ascending block list, or `None` when the target is unreachable.
    fn walk_to_root(&self, head_root: Hash256, target_root: Hash256) -> Option<Vec<Arc<Block>>> {
        let mut chain = Vec::new();
        let mut current_root = head_root;

        loop {
            if current_root == target_root {
                chain.reverse();
                return Some(chain);
            }
            let block = self.block_cache.get_block(&current_root)?;
            let parent_root = block.parent_root()?;
            chain.push(block);
            // A zero target accepts the bottom of the in-memory window.
            if target_root.is_zero() && self.block_cache.get_block(&parent_root).is_none() {
                chain.reverse();
                return Some(chain);
            }
            current_root = parent_root;
        }
    }

    /*
     * Recovery-log interface
     */

    /// Persist the pruning cursor (`indexer.prunestate`) inside the
    /// caller's transaction.
    pub fn update_pruning_state(
        &self,
        conn: &mut PgConnection,
        epoch: Epoch,
    ) -> Result<(), database::Error> {
        database::set_explorer_state(
            conn,
            "indexer.prunestate",
            &PruneState {
                epoch: epoch.as_u64(),
            },
        )
    }

    pub fn restore_fork(&self, row: &UnfinalizedForkRow) {
        let mut state = self.state.lock();
        let fork_id = ForkKey::from_i64(row.fork_id);
        if fork_id.is_canonical() && state.forks.contains_key(&fork_id) {
            // A second fork 0 would corrupt canonical selection.
            warn!("Ignoring duplicate canonical fork in recovery log");
            return;
        }
        state.next_fork_id = state.next_fork_id.max(fork_id.0 + 1);
        state.forks.insert(
            fork_id,
            Fork {
                fork_id,
                parent_fork: ForkKey::from_i64(row.parent_fork_id),
                base_slot: Slot::new(row.base_slot as u64),
                base_root: Hash256::from_slice(&row.base_root),
                head_slot: Slot::new(row.head_slot as u64),
                head_root: Hash256::from_slice(&row.head_root),
                leader_clients: HashSet::new(),
            },
        );
    }

    pub fn fork_rows(&self) -> Vec<UnfinalizedForkRow> {
        self.state
            .lock()
            .forks
            .values()
            .map(|fork| UnfinalizedForkRow {
                fork_id: fork.fork_id.as_i64(),
                base_slot: fork.base_slot.as_u64() as i64,
                base_root: fork.base_root.as_bytes().to_vec(),
                parent_fork_id: fork.parent_fork.as_i64(),
                head_slot: fork.head_slot.as_u64() as i64,
                head_root: fork.head_root.as_bytes().to_vec(),
            })
            .collect()
    }

    /*
     * Pruning
     */

    /// Drop forks that ended below the finalized slot and blocks that were
    /// parked for parents which never arrived.
    pub fn prune(&self, finalized_slot: Slot, min_in_memory_slot: Slot) {
        let mut state = self.state.lock();
        state.forks.retain(|fork_id, fork| {
            fork_id.is_canonical() || fork.head_slot >= finalized_slot
        });

        let mut dropped = Vec::new();
        state.pending_blocks.retain(|parent_root, children| {
            children.retain(|child_root| {
                let keep = self
                    .block_cache
                    .get_block(child_root)
                    .map(|block| block.slot >= min_in_memory_slot)
                    .unwrap_or(false);
                if !keep {
                    dropped.push((*parent_root, *child_root));
                }
                keep
            });
            !children.is_empty()
        });

        for (parent_root, child_root) in dropped {
            warn!(
                "Dropping block {:?}: parent {:?} never arrived before the slot left the window",
                child_root, parent_root
            );
            self.block_cache.remove_block(&child_root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::test_utils::header_at;

    struct Tester {
        block_cache: Arc<BlockCache>,
        fork_cache: ForkCache,
    }

    impl Tester {
        fn new() -> Self {
            let block_cache = Arc::new(BlockCache::new());
            let fork_cache = ForkCache::new(block_cache.clone());
            Self {
                block_cache,
                fork_cache,
            }
        }

        fn add(&self, root_byte: u8, slot: u64, parent_byte: u8) -> (Arc<Block>, ForkKey) {
            let root = Hash256::repeat_byte(root_byte);
            let parent = if parent_byte == 0 {
                Hash256::zero()
            } else {
                Hash256::repeat_byte(parent_byte)
            };
            let (block, _) = self.block_cache.create_or_get_block(root, Slot::new(slot));
            self.block_cache.set_header(&block, header_at(slot, parent));
            let fork = self.fork_cache.add_block(&block);
            (block, fork)
        }
    }

    #[test]
    fn linear_chain_stays_canonical() {
        let tester = Tester::new();
        let (_, f1) = tester.add(1, 1, 0);
        let (_, f2) = tester.add(2, 2, 1);
        let (_, f3) = tester.add(3, 3, 2);

        assert_eq!(f1, ForkKey::CANONICAL);
        assert_eq!(f2, ForkKey::CANONICAL);
        assert_eq!(f3, ForkKey::CANONICAL);
        assert_eq!(tester.fork_cache.fork_count(), 1);

        let head = tester.fork_cache.get_fork(ForkKey::CANONICAL).unwrap();
        assert_eq!(head.head_slot, Slot::new(3));
    }

    #[test]
    fn branch_point_assigns_fresh_fork_ids() {
        let tester = Tester::new();
        tester.add(1, 1, 0);
        tester.add(2, 2, 1);
        // Two children of block 2 at slot 3.
        let (block_a, fork_a) = tester.add(3, 3, 2);
        let (block_b, fork_b) = tester.add(4, 3, 2);

        // The earlier child was re-labelled when the branch appeared.
        let fork_a = block_a.fork_id();
        assert_ne!(fork_a, ForkKey::CANONICAL);
        assert_ne!(fork_b, ForkKey::CANONICAL);
        assert_ne!(fork_a, fork_b);
        assert_eq!(block_b.fork_id(), fork_b);

        // Both new forks hang off the canonical fork.
        assert_eq!(
            tester.fork_cache.get_fork(fork_a).unwrap().parent_fork,
            ForkKey::CANONICAL
        );
        assert_eq!(
            tester.fork_cache.get_fork(fork_b).unwrap().parent_fork,
            ForkKey::CANONICAL
        );
        // The canonical fork's head retreated to the branch point.
        assert_eq!(
            tester
                .fork_cache
                .get_fork(ForkKey::CANONICAL)
                .unwrap()
                .head_slot,
            Slot::new(2)
        );
    }

    #[test]
    fn descendants_are_relabelled_on_late_branch() {
        let tester = Tester::new();
        tester.add(1, 1, 0);
        let (block_a, _) = tester.add(2, 2, 1);
        let (block_c, _) = tester.add(3, 3, 2);
        // block_c extends block_a; both canonical so far.
        assert_eq!(block_c.fork_id(), ForkKey::CANONICAL);

        // A competing child of block 1 arrives late.
        let (block_b, fork_b) = tester.add(4, 2, 1);

        // block_a's whole subtree moved onto a fresh fork.
        let fork_a = block_a.fork_id();
        assert_ne!(fork_a, ForkKey::CANONICAL);
        assert_eq!(block_c.fork_id(), fork_a);
        assert_ne!(fork_b, fork_a);
        assert_eq!(block_b.fork_id(), fork_b);

        // The re-labelled fork's head is the subtree tip.
        assert_eq!(
            tester.fork_cache.get_fork(fork_a).unwrap().head_root,
            block_c.root
        );
    }

    #[test]
    fn pending_blocks_are_classified_once_the_parent_arrives() {
        let tester = Tester::new();
        tester.add(1, 1, 0);

        // Child arrives before its parent (slot 2).
        let (orphan, _) = tester.add(3, 3, 2);
        // Parked: not classified into any real fork yet.
        assert_eq!(tester.fork_cache.fork_count(), 1);

        // The missing parent arrives and connects to the chain.
        let (_, parent_fork) = tester.add(2, 2, 1);
        assert_eq!(parent_fork, ForkKey::CANONICAL);
        assert_eq!(orphan.fork_id(), ForkKey::CANONICAL);

        let head = tester.fork_cache.get_fork(ForkKey::CANONICAL).unwrap();
        assert_eq!(head.head_slot, Slot::new(3));
    }

    #[test]
    fn canonical_selection_prefers_client_backed_heads() {
        let tester = Tester::new();
        tester.add(1, 1, 0);
        tester.add(2, 2, 1);
        let (block_a, _) = tester.add(3, 3, 2);
        let (block_b, _) = tester.add(4, 3, 2);

        // Two clients report head B, one reports head A.
        tester
            .fork_cache
            .report_client_head(0, block_a.root, block_a.slot);
        tester
            .fork_cache
            .report_client_head(1, block_b.root, block_b.slot);
        tester
            .fork_cache
            .report_client_head(2, block_b.root, block_b.slot);

        let chain = tester
            .fork_cache
            .select_canonical_chain(Hash256::zero())
            .unwrap();
        let tip = chain.last().unwrap();
        assert_eq!(tip.root, block_b.root);
        assert_eq!(chain.len(), 3);
        // Ascending and parent-linked.
        assert_eq!(chain[0].slot, Slot::new(1));
        assert_eq!(chain[1].slot, Slot::new(2));
    }

    #[test]
    fn selection_fails_without_a_path_to_the_justified_root() {
        let tester = Tester::new();
        tester.add(1, 1, 0);
        tester.add(2, 2, 1);

        let missing = Hash256::repeat_byte(0xee);
        assert!(tester
            .fork_cache
            .select_canonical_chain(missing)
            .is_err());
    }
}
