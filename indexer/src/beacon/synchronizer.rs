//! Historical catch-up below the finalized checkpoint.
//!
//! Runs against a single archive client, one epoch per batch, each batch in
//! one transaction together with the persisted sync cursor.

use crate::beacon::block_cache::BlockCache;
use crate::beacon::client::{Client, REQUEST_TIMEOUT};
use crate::beacon::duties;
use crate::beacon::error::Error;
use crate::beacon::votes;
use crate::beacon::writer;
use crate::beacon::Indexer;
use crate::consensus::{BlockId, ClientError, StateRef};
use crate::database;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use types::{Epoch, Hash256, Slot};

/// The cursor persisted as `indexer.syncstate`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub epoch: u64,
}

pub struct Synchronizer {
    indexer: Arc<Indexer>,
}

impl Synchronizer {
    pub fn new(indexer: Arc<Indexer>) -> Self {
        Self { indexer }
    }

    /// Run until the cursor catches up with the finalized checkpoint, then
    /// keep following it. Transient failures retry the same epoch with
    /// backoff; a corrupt epoch is fatal.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);

        loop {
            if self.indexer.cancel_token().is_cancelled() {
                return;
            }

            let finalized_epoch = self.indexer.chain_state().finalized_epoch();
            let cursor = match self.load_cursor() {
                Ok(cursor) => cursor,
                Err(e) => {
                    warn!("Synchronizer failed reading cursor: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                    continue;
                }
            };

            if cursor >= finalized_epoch {
                debug!("Synchronizer is caught up at epoch {cursor}");
                let wait = Duration::from_secs(
                    self.indexer.chain_state().spec().seconds_per_slot
                        * self.indexer.chain_state().spec().slots_per_epoch,
                );
                tokio::select! {
                    _ = self.indexer.cancel_token().cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            match self.sync_epoch(cursor).await {
                Ok(()) => {
                    info!("Synchronized epoch {cursor}");
                    backoff = Duration::from_secs(1);
                }
                Err(Error::Fatal(message)) => {
                    error!("Synchronizer hit a fatal error at epoch {cursor}: {message}");
                    return;
                }
                Err(e) => {
                    warn!("Synchronizer failed at epoch {cursor}, retrying: {e}");
                    tokio::select! {
                        _ = self.indexer.cancel_token().cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    fn load_cursor(&self) -> Result<Epoch, Error> {
        let Some(db) = self.indexer.db() else {
            return Err(Error::MissingData("no database configured".into()));
        };
        let mut conn = database::get_connection(db)?;
        let state: Option<SyncState> = database::get_explorer_state(&mut conn, "indexer.syncstate")?;
        Ok(Epoch::new(state.map(|state| state.epoch).unwrap_or(0)))
    }

    fn pick_client(&self) -> Result<Arc<Client>, Error> {
        let mut candidates: Vec<_> = self
            .indexer
            .clients()
            .into_iter()
            .filter(|client| client.archive)
            .collect();
        candidates.sort_by_key(|client| client.priority());
        candidates.into_iter().next().ok_or_else(|| {
            Error::MissingData("no archive client available for synchronization".into())
        })
    }

    /// Fetch, rebuild and persist one finalized epoch.
    async fn sync_epoch(&self, epoch: Epoch) -> Result<(), Error> {
        let chain_state = self.indexer.chain_state();
        let client = self.pick_client()?;

        // A detached cache: the synchronizer never touches the live one.
        let local_cache = BlockCache::new();
        let mut chain_blocks = Vec::new();

        // Blocks of the epoch and its successor (for boundary-crossing
        // attestations).
        let first_slot = chain_state.epoch_start_slot(epoch);
        let last_slot = chain_state.epoch_start_slot(epoch + 2);
        let mut slot = first_slot;
        while slot < last_slot {
            let header = tokio::time::timeout(
                REQUEST_TIMEOUT,
                client.consensus().get_header(BlockId::Slot(slot)),
            )
            .await
            .map_err(|_| Error::Client(ClientError::Timeout))??;

            if let Some(header) = header {
                if header.message.slot != slot {
                    // Canonical lookups by slot return the last block at or
                    // before the slot on some implementations; skip slots.
                    slot += 1;
                    continue;
                }
                let root = header.canonical_root();
                let (block, _) = local_cache.create_or_get_block(root, slot);
                local_cache.set_header(&block, header);

                let body = tokio::time::timeout(
                    REQUEST_TIMEOUT,
                    client.consensus().get_block_body(root),
                )
                .await
                .map_err(|_| Error::Client(ClientError::Timeout))??;
                let Some(body) = body else {
                    // A canonical header without a body is unrecoverable.
                    return Err(Error::Fatal(format!(
                        "missing body for canonical block {root:?} at slot {slot}"
                    )));
                };
                block.set_block(body);
                chain_blocks.push(block);
            }
            slot += 1;
        }

        // Duty derivation from the state at the epoch's dependent root.
        let dependent_root = self.resolve_dependent_root(&client, epoch).await?;
        let state = tokio::time::timeout(
            REQUEST_TIMEOUT,
            client.consensus().get_beacon_state(StateRef::Root(dependent_root)),
        )
        .await
        .map_err(|_| Error::Client(ClientError::Timeout))??;
        let stats_values = duties::derive_epoch_stats(&state, epoch, chain_state.spec());

        let canonical_blocks: Vec<_> = chain_blocks
            .iter()
            .filter(|block| chain_state.epoch_of_slot(block.slot) == epoch)
            .cloned()
            .collect();
        let epoch_votes =
            votes::aggregate_epoch_votes(epoch, &chain_blocks, &stats_values, &chain_state);

        let Some(db) = self.indexer.db() else {
            return Err(Error::MissingData("no database configured".into()));
        };
        let cursor = SyncState {
            epoch: epoch.as_u64() + 1,
        };
        database::run_db_transaction(db, |conn| {
            writer::persist_epoch_data(
                conn,
                &chain_state,
                epoch,
                &canonical_blocks,
                &[],
                Some(&stats_values),
                Some(&epoch_votes),
            )?;
            writer::persist_sync_assignments(conn, &chain_state, epoch, Some(&stats_values))?;
            database::set_explorer_state(conn, "indexer.syncstate", &cursor)?;
            Ok(())
        })?;

        Ok(())
    }

    /// The last canonical block at or before the epoch's dependent slot.
    async fn resolve_dependent_root(
        &self,
        client: &Arc<Client>,
        epoch: Epoch,
    ) -> Result<Hash256, Error> {
        let chain_state = self.indexer.chain_state();
        let mut slot = chain_state
            .epoch_start_slot(epoch.saturating_sub(1u64))
            .saturating_sub(1u64);

        loop {
            let header = tokio::time::timeout(
                REQUEST_TIMEOUT,
                client.consensus().get_header(BlockId::Slot(slot)),
            )
            .await
            .map_err(|_| Error::Client(ClientError::Timeout))??;

            if let Some(header) = header {
                return Ok(header.canonical_root());
            }
            if slot == Slot::new(0) {
                return Err(Error::Fatal(
                    "cannot resolve dependent root down to genesis".into(),
                ));
            }
            slot = slot.saturating_sub(1u64);
        }
    }
}
