//! The epoch cache: duty assignments and balance totals per
//! `(epoch, dependent root)`, with semaphore-bounded state downloads.

use crate::beacon::client::{Client, REQUEST_TIMEOUT};
use crate::beacon::duties;
use crate::consensus::{ChainState, ClientError, StateRef};
use crate::database::models::UnfinalizedEpochRow;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use ssz::{Decode as _, Encode as _};
use ssz_derive::{Decode, Encode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use types::{Epoch, Hash256};

/// The duty assignments and balance totals of one epoch, derived from the
/// state at its dependent root. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EpochStatsValues {
    pub active_validators: u64,
    /// Sum of effective balances of active validators, in gwei.
    pub effective_balance: u64,
    /// Sum of actual balances of active validators, in gwei.
    pub active_balance: u64,
    /// The state's eth1 deposit index at the epoch boundary.
    pub first_deposit_index: u64,
    /// Effective balance per validator index, in gwei.
    pub effective_balances: Vec<u64>,
    /// Proposer per slot of the epoch; `u64::MAX` marks an unfilled duty.
    pub proposer_duties: Vec<u64>,
    /// `attester_duties[slot_index][committee_index]` lists the committee's
    /// validator indices in committee order.
    pub attester_duties: Vec<Vec<Vec<u64>>>,
    pub sync_committee_duties: Vec<u64>,
}

impl EpochStatsValues {
    pub fn committees_per_slot(&self) -> u64 {
        self.attester_duties
            .first()
            .map(|committees| committees.len() as u64)
            .unwrap_or(0)
    }

    pub fn effective_balance_of(&self, validator_index: u64) -> u64 {
        self.effective_balances
            .get(validator_index as usize)
            .copied()
            .unwrap_or(0)
    }
}

/// Per-`(epoch, dependent_root)` stats entry. Owned by the epoch cache.
pub struct EpochStats {
    pub epoch: Epoch,
    pub dependent_root: Hash256,
    values: RwLock<Option<Arc<EpochStatsValues>>>,
    is_in_db: AtomicBool,
    pruned: AtomicBool,
    request_scheduled: AtomicBool,
    /// Epoch aggregations restored from the recovery log after a restart;
    /// consumed when the epoch finalizes without recomputation.
    pruned_epoch_aggregations: Mutex<Vec<UnfinalizedEpochRow>>,
}

impl EpochStats {
    fn new(epoch: Epoch, dependent_root: Hash256) -> Self {
        Self {
            epoch,
            dependent_root,
            values: RwLock::new(None),
            is_in_db: AtomicBool::new(false),
            pruned: AtomicBool::new(false),
            request_scheduled: AtomicBool::new(false),
            pruned_epoch_aggregations: Mutex::new(Vec::new()),
        }
    }

    pub fn values(&self) -> Option<Arc<EpochStatsValues>> {
        self.values.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.values.read().is_some()
    }

    /// Store the derived values. Write-once; later calls are ignored unless
    /// the values were pruned in between.
    pub fn set_values(&self, values: EpochStatsValues) -> bool {
        let mut slot = self.values.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(values));
        self.pruned.store(false, Ordering::Release);
        true
    }

    /// Drop the large duty arrays; they remain reconstructable from the
    /// recovery log (unfinalized) or the finalized tables.
    pub fn prune_values(&self) {
        let mut slot = self.values.write();
        if slot.take().is_some() {
            self.pruned.store(true, Ordering::Release);
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned.load(Ordering::Acquire)
    }

    pub fn is_in_db(&self) -> bool {
        self.is_in_db.load(Ordering::Acquire)
    }

    pub fn set_in_db(&self, value: bool) {
        self.is_in_db.store(value, Ordering::Release)
    }

    pub fn encode_values_ssz(&self) -> Option<Vec<u8>> {
        self.values().map(|values| values.as_ssz_bytes())
    }

    /// Re-materialize pruned values from their recovery-log encoding.
    pub fn restore_values_ssz(&self, bytes: &[u8]) -> Result<(), ssz::DecodeError> {
        let values = EpochStatsValues::from_ssz_bytes(bytes)?;
        self.set_values(values);
        Ok(())
    }

    pub fn add_pruned_epoch_aggregation(&self, row: UnfinalizedEpochRow) {
        self.pruned_epoch_aggregations.lock().push(row);
    }

    pub fn pruned_epoch_aggregations(&self) -> Vec<UnfinalizedEpochRow> {
        self.pruned_epoch_aggregations.lock().clone()
    }
}

/// Cache of epoch stats keyed by `(epoch, dependent root)`.
///
/// Multiple forks through an epoch yield multiple entries, each tracked
/// independently because the duty assignments differ per dependent root.
pub struct EpochCache {
    state: Mutex<HashMap<(Epoch, Hash256), Arc<EpochStats>>>,
    state_call_limiter: Arc<Semaphore>,
}

impl EpochCache {
    pub fn new(max_parallel_state_calls: usize) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            state_call_limiter: Arc::new(Semaphore::new(max_parallel_state_calls.max(2))),
        }
    }

    /// Idempotent on `(epoch, dependent_root)`.
    pub fn create_or_get_epoch_stats(
        &self,
        epoch: Epoch,
        dependent_root: Hash256,
    ) -> (Arc<EpochStats>, bool) {
        let mut state = self.state.lock();
        if let Some(stats) = state.get(&(epoch, dependent_root)) {
            return (stats.clone(), false);
        }
        let stats = Arc::new(EpochStats::new(epoch, dependent_root));
        state.insert((epoch, dependent_root), stats.clone());
        (stats, true)
    }

    pub fn get_epoch_stats(&self, epoch: Epoch, dependent_root: Hash256) -> Option<Arc<EpochStats>> {
        self.state.lock().get(&(epoch, dependent_root)).cloned()
    }

    pub fn all_epoch_stats(&self) -> Vec<Arc<EpochStats>> {
        self.state.lock().values().cloned().collect()
    }

    pub fn remove_epoch_stats(&self, epoch: Epoch, dependent_root: Hash256) {
        self.state.lock().remove(&(epoch, dependent_root));
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Enqueue a state download to derive the values of `stats`.
    ///
    /// The download prefers archive clients with the lowest priority and
    /// rotates to the next candidate on failure; a data mismatch demotes the
    /// offending client. The global semaphore bounds outstanding state reads.
    pub fn schedule_state_request(
        &self,
        stats: Arc<EpochStats>,
        clients: Vec<Arc<Client>>,
        chain_state: Arc<ChainState>,
        cancel: CancellationToken,
    ) {
        if stats.is_ready() || stats.request_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let limiter = self.state_call_limiter.clone();
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };

            let mut backoff = Duration::from_secs(1);
            loop {
                if cancel.is_cancelled() || stats.is_ready() {
                    return;
                }

                let mut candidates: Vec<_> = clients
                    .iter()
                    .filter(|client| client.archive && !client.skip_validators)
                    .cloned()
                    .collect();
                candidates.sort_by_key(|client| client.priority());

                if candidates.is_empty() {
                    warn!(
                        "No archive client available for state at {:?}, epoch {}",
                        stats.dependent_root, stats.epoch
                    );
                }

                for client in candidates {
                    let request = client
                        .consensus()
                        .get_beacon_state(StateRef::Root(stats.dependent_root));
                    let state = match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
                        Ok(Ok(state)) => state,
                        Ok(Err(ClientError::Mismatch(message))) => {
                            warn!(
                                "State mismatch from {} for {:?}: {}",
                                client.name(),
                                stats.dependent_root,
                                message
                            );
                            client.demote_priority();
                            continue;
                        }
                        Ok(Err(e)) => {
                            debug!(
                                "State request against {} failed: {}",
                                client.name(),
                                e
                            );
                            continue;
                        }
                        Err(_) => {
                            debug!("State request against {} timed out", client.name());
                            continue;
                        }
                    };

                    let values = duties::derive_epoch_stats(&state, stats.epoch, chain_state.spec());
                    stats.set_values(values);
                    info!(
                        "Epoch {} stats ready (dependent root {:?})",
                        stats.epoch, stats.dependent_root
                    );
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode as _, Encode as _};

    #[test]
    fn create_or_get_is_idempotent_per_key() {
        let cache = EpochCache::new(2);
        let root_a = Hash256::repeat_byte(1);
        let root_b = Hash256::repeat_byte(2);

        let (a1, created_a1) = cache.create_or_get_epoch_stats(Epoch::new(3), root_a);
        let (a2, created_a2) = cache.create_or_get_epoch_stats(Epoch::new(3), root_a);
        let (_b, created_b) = cache.create_or_get_epoch_stats(Epoch::new(3), root_b);

        assert!(created_a1);
        assert!(!created_a2);
        assert!(created_b);
        assert!(Arc::ptr_eq(&a1, &a2));
        // Two dependent roots for the same epoch are tracked independently.
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn values_are_write_once_until_pruned() {
        let stats = EpochStats::new(Epoch::new(1), Hash256::repeat_byte(1));
        let values = EpochStatsValues {
            active_validators: 4,
            effective_balance: 128,
            active_balance: 130,
            first_deposit_index: 7,
            effective_balances: vec![32; 4],
            proposer_duties: vec![0, 1, 2, 3],
            attester_duties: vec![vec![vec![0, 1]], vec![vec![2, 3]]],
            sync_committee_duties: vec![],
        };

        assert!(stats.set_values(values.clone()));
        let mut other = values.clone();
        other.active_validators = 99;
        assert!(!stats.set_values(other));
        assert_eq!(stats.values().unwrap().active_validators, 4);

        stats.prune_values();
        assert!(stats.is_pruned());
        assert!(stats.values().is_none());

        // Pruned values are re-materialized from their SSZ encoding.
        let bytes = values.as_ssz_bytes();
        stats.restore_values_ssz(&bytes).unwrap();
        assert_eq!(stats.values().unwrap().as_ref(), &values);
    }

    #[test]
    fn duties_ssz_round_trip() {
        let values = EpochStatsValues {
            active_validators: 2,
            effective_balance: 64,
            active_balance: 65,
            first_deposit_index: 0,
            effective_balances: vec![32, 32],
            proposer_duties: vec![1, 0],
            attester_duties: vec![vec![vec![0], vec![1]], vec![vec![1], vec![0]]],
            sync_committee_duties: vec![0, 1],
        };
        let decoded = EpochStatsValues::from_ssz_bytes(&values.as_ssz_bytes()).unwrap();
        assert_eq!(decoded, values);
    }
}
