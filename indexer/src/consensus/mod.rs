//! Contract surface of the consensus-client collaborator.
//!
//! The actual RPC transport lives outside this crate; the indexer only
//! depends on the trait below plus the pool's chain state and event
//! subscriptions.

mod chain_state;
mod pool;

pub use chain_state::ChainState;
pub use pool::{ConsensusPool, Subscription};

use async_trait::async_trait;
use std::fmt;
use types::{BeaconState, Checkpoint, Epoch, Hash256, SignedBeaconBlock, SignedBeaconBlockHeader, Slot};

/// Identifies a block towards the beacon node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Head,
    Root(Hash256),
    Slot(Slot),
}

/// Identifies a state towards the beacon node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRef {
    Head,
    Root(Hash256),
    Slot(Slot),
}

/// The finality checkpoints reported by a beacon node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalityCheckpoints {
    pub finalized: Checkpoint,
    pub justified: Checkpoint,
    pub previous_justified: Checkpoint,
}

/// A finality advance observed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalityEvent {
    pub finalized: Checkpoint,
    pub justified: Checkpoint,
    pub previous_justified: Checkpoint,
}

/// A chain head reported by a single beacon node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadEvent {
    pub slot: Slot,
    pub root: Hash256,
}

/// A wall-clock slot tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallclockSlotEvent {
    pub slot: Slot,
    pub epoch: Epoch,
}

#[derive(Debug)]
pub enum ClientError {
    /// The request did not complete in time.
    Timeout,
    /// Transport-level failure; the client should be retried later.
    Unavailable(String),
    /// The node answered with data that contradicts the request.
    Mismatch(String),
    /// The subscription stream ended.
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single upstream beacon node.
///
/// Implementations translate these calls onto the beacon API; `None` results
/// represent 404s (unknown root, empty slot).
#[async_trait]
pub trait ConsensusClient: Send + Sync {
    fn name(&self) -> &str;

    async fn get_header(
        &self,
        block_id: BlockId,
    ) -> Result<Option<SignedBeaconBlockHeader>, ClientError>;

    async fn get_block_body(&self, root: Hash256)
        -> Result<Option<SignedBeaconBlock>, ClientError>;

    async fn get_beacon_state(&self, state_ref: StateRef) -> Result<BeaconState, ClientError>;

    async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpoints, ClientError>;

    /// Subscribe to head updates of this node. The stream ends on disconnect;
    /// callers re-subscribe with backoff.
    async fn subscribe_head_events(
        &self,
    ) -> Result<tokio::sync::mpsc::Receiver<HeadEvent>, ClientError>;
}
