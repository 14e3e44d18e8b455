//! The per-client indexing loop: one task per upstream beacon node that
//! tracks its head, backfills gaps and feeds the caches.

use crate::beacon::error::Error;
use crate::beacon::Indexer;
use crate::consensus::{BlockId, ClientError, ConsensusClient, HeadEvent};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use types::{Hash256, SignedBeaconBlockHeader};

/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Per-request timeout for RPC calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Concurrent background body fetches per client.
const BODY_FETCH_PARALLELISM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    HeadTracking,
    Backfilling,
}

/// Indexer-side view of one beacon node.
pub struct Client {
    pub index: u16,
    pub archive: bool,
    pub skip_validators: bool,
    priority: AtomicI32,
    client: Arc<dyn ConsensusClient>,
    state: RwLock<ClientState>,
    head: RwLock<Option<HeadEvent>>,
    body_fetch_limiter: Arc<Semaphore>,
}

impl Client {
    pub fn new(
        index: u16,
        client: Arc<dyn ConsensusClient>,
        priority: i32,
        archive: bool,
        skip_validators: bool,
    ) -> Self {
        Self {
            index,
            archive,
            skip_validators,
            priority: AtomicI32::new(priority),
            client,
            state: RwLock::new(ClientState::Disconnected),
            head: RwLock::new(None),
            body_fetch_limiter: Arc::new(Semaphore::new(BODY_FETCH_PARALLELISM)),
        }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusClient> {
        &self.client
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Demote the client for state reads after a data mismatch.
    pub fn demote_priority(&self) {
        self.priority.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn head(&self) -> Option<HeadEvent> {
        *self.head.read()
    }

    /// Fetch and sanity-check a header by root.
    pub async fn fetch_header(
        &self,
        root: Hash256,
    ) -> Result<Option<SignedBeaconBlockHeader>, Error> {
        let header = tokio::time::timeout(REQUEST_TIMEOUT, self.client.get_header(BlockId::Root(root)))
            .await
            .map_err(|_| Error::Client(ClientError::Timeout))??;

        if let Some(header) = &header {
            if header.canonical_root() != root {
                self.demote_priority();
                return Err(Error::Client(ClientError::Mismatch(format!(
                    "header root mismatch from {}: requested {:?}",
                    self.name(),
                    root
                ))));
            }
        }
        Ok(header)
    }

    /// The steady-state loop: subscribe to heads, follow them, reconnect
    /// with exponential backoff on failure.
    pub async fn run(self: Arc<Self>, indexer: Arc<Indexer>) {
        let mut backoff = Duration::from_secs(1);

        loop {
            if indexer.cancel_token().is_cancelled() {
                return;
            }

            *self.state.write() = ClientState::Connecting;
            let mut events = match self.client.subscribe_head_events().await {
                Ok(events) => {
                    backoff = Duration::from_secs(1);
                    *self.state.write() = ClientState::HeadTracking;
                    info!("Client {} head subscription established", self.name());
                    events
                }
                Err(e) => {
                    *self.state.write() = ClientState::Disconnected;
                    debug!("Client {} connect failed: {}", self.name(), e);
                    tokio::select! {
                        _ = indexer.cancel_token().cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            loop {
                let event = tokio::select! {
                    _ = indexer.cancel_token().cancelled() => return,
                    event = events.recv() => event,
                };
                let Some(head) = event else {
                    warn!("Client {} head stream ended", self.name());
                    *self.state.write() = ClientState::Disconnected;
                    break;
                };

                if let Err(e) = self.process_head(&indexer, head).await {
                    warn!(
                        "Client {} failed processing head {:?} at slot {}: {}",
                        self.name(),
                        head.root,
                        head.slot,
                        e
                    );
                }
            }
        }
    }

    /// Handle one head report: pull the header, backfill unknown ancestors,
    /// hand new blocks to the fork/epoch caches and kick off body fetches.
    async fn process_head(&self, indexer: &Arc<Indexer>, head: HeadEvent) -> Result<(), Error> {
        let previous_head = self.head.read().map(|event| event.slot);
        if let Some(previous) = previous_head {
            if head.slot > previous + 1 {
                *self.state.write() = ClientState::Backfilling;
            }
        }

        let min_slot = indexer.min_in_memory_slot();
        let mut new_blocks = Vec::new();

        // Ensure the reported head itself is cached with a header.
        let (block, created) = indexer.block_cache().create_or_get_block(head.root, head.slot);
        if block.header().is_none() {
            let Some(header) = self.fetch_header(head.root).await? else {
                warn!(
                    "Client {} reported unknown block {:?}",
                    self.name(),
                    head.root
                );
                return Ok(());
            };
            indexer.block_cache().set_header(&block, header);
            new_blocks.push(block.clone());
        } else if created {
            new_blocks.push(block.clone());
        }

        // Follow parent roots backwards until we reach a cached block or the
        // bottom of the in-memory window.
        let mut current = block;
        loop {
            if current.slot <= min_slot {
                break;
            }
            let Some(parent_root) = current.parent_root() else {
                break;
            };
            if indexer.block_cache().get_block(&parent_root).is_some() {
                break;
            }

            // Parent slot is unknown until its header arrives; fetch it now.
            let Some(parent_header) = self.fetch_header(parent_root).await? else {
                debug!(
                    "Client {} cannot resolve parent {:?}, held for retry",
                    self.name(),
                    parent_root
                );
                break;
            };
            let parent_slot = parent_header.message.slot;
            let (parent_block, _) = indexer
                .block_cache()
                .create_or_get_block(parent_root, parent_slot);
            indexer.block_cache().set_header(&parent_block, parent_header);
            new_blocks.push(parent_block.clone());
            current = parent_block;
        }

        // Oldest first, so fork assignment sees parents before children.
        new_blocks.reverse();
        for block in &new_blocks {
            indexer.process_new_block(block);
            self.spawn_body_fetch(indexer, block.clone());
        }

        *self.head.write() = Some(head);
        *self.state.write() = ClientState::HeadTracking;
        indexer.fork_cache().report_client_head(self.index, head.root, head.slot);

        Ok(())
    }

    /// Fetch the body in the background, bounded per client and deduplicated
    /// per root by the block cache latch.
    fn spawn_body_fetch(&self, indexer: &Arc<Indexer>, block: Arc<crate::beacon::Block>) {
        if block.body().is_some() {
            return;
        }

        let limiter = self.body_fetch_limiter.clone();
        let client = self.client.clone();
        let name = self.name().to_string();
        let indexer = indexer.clone();
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let root = block.root;
            let result = indexer
                .block_cache()
                .load_body(&block, || async move {
                    let body = tokio::time::timeout(REQUEST_TIMEOUT, client.get_block_body(root))
                        .await
                        .map_err(|_| Error::Client(ClientError::Timeout))??;
                    body.ok_or_else(|| {
                        Error::MissingData(format!("body for {:?} not available", root))
                    })
                })
                .await;

            match result {
                Ok(_) => debug!("Loaded body for {:?}", root),
                Err(e) => debug!("Body fetch for {:?} via {} failed: {}", root, name, e),
            }
        });
    }
}
