use super::{
    ChainState, ConsensusClient, FinalityCheckpoints, FinalityEvent, WallclockSlotEvent,
};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use types::{ChainSpec, Slot};

/// A typed single-consumer event subscription.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// The pool of upstream beacon nodes.
///
/// Owns the shared chain state, produces wall-clock slot ticks from the
/// genesis time, and folds the per-node finality reports into a single
/// monotonic event stream.
pub struct ConsensusPool {
    chain_state: Arc<ChainState>,
    clients: Mutex<Vec<Arc<dyn ConsensusClient>>>,
    last_dispatched_finality: Mutex<Option<types::Epoch>>,
    finality_subscribers: Mutex<Vec<mpsc::Sender<FinalityEvent>>>,
    wallclock_subscribers: Mutex<Vec<mpsc::Sender<WallclockSlotEvent>>>,
}

impl ConsensusPool {
    pub fn new(spec: ChainSpec, genesis_time: u64) -> Self {
        Self {
            chain_state: Arc::new(ChainState::new(spec, genesis_time)),
            clients: Mutex::new(Vec::new()),
            last_dispatched_finality: Mutex::new(None),
            finality_subscribers: Mutex::new(Vec::new()),
            wallclock_subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn chain_state(&self) -> Arc<ChainState> {
        self.chain_state.clone()
    }

    pub fn add_client(&self, client: Arc<dyn ConsensusClient>) {
        self.clients.lock().push(client);
    }

    pub fn subscribe_finalized_event(&self, buffer: usize) -> Subscription<FinalityEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        self.finality_subscribers.lock().push(tx);
        Subscription { rx }
    }

    pub fn subscribe_wallclock_slot_event(&self, buffer: usize) -> Subscription<WallclockSlotEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        self.wallclock_subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Dispatch a wall-clock tick. Slow consumers drop extras.
    pub fn dispatch_wallclock_slot(&self, slot: Slot) {
        let event = WallclockSlotEvent {
            slot,
            epoch: self.chain_state.epoch_of_slot(slot),
        };
        self.wallclock_subscribers
            .lock()
            .retain(|tx| match tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    /// Fold a node's finality report into the shared state and, if finality
    /// advanced, notify subscribers.
    pub fn report_finality(&self, checkpoints: FinalityCheckpoints) {
        let previous = self.chain_state.finalized_epoch();
        if !self.chain_state.update_finality(checkpoints) {
            warn!(
                "Discarded finality report moving backwards: {} < {}",
                checkpoints.finalized.epoch, previous
            );
            return;
        }
        {
            let mut last = self.last_dispatched_finality.lock();
            if *last == Some(checkpoints.finalized.epoch) {
                return;
            }
            *last = Some(checkpoints.finalized.epoch);
        }

        let event = FinalityEvent {
            finalized: checkpoints.finalized,
            justified: checkpoints.justified,
            previous_justified: checkpoints.previous_justified,
        };
        self.finality_subscribers
            .lock()
            .retain(|tx| match tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Finality subscriber is lagging, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    /// Run the wall-clock ticker and finality poller until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let chain_state = self.chain_state.clone();
        let seconds_per_slot = chain_state.spec().seconds_per_slot.max(1);

        loop {
            let slot = chain_state.current_slot();
            let next_slot_time = chain_state.time_of_slot(slot + 1);
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0);
            let wait = Duration::from_secs(next_slot_time.saturating_sub(now).clamp(1, seconds_per_slot));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let slot = chain_state.current_slot();
            debug!("Wallclock slot {slot}");
            self.dispatch_wallclock_slot(slot);

            // Poll finality once per slot; any one healthy node suffices.
            let clients: Vec<_> = self.clients.lock().clone();
            for client in clients {
                match tokio::time::timeout(
                    Duration::from_secs(seconds_per_slot),
                    client.get_finality_checkpoints(),
                )
                .await
                {
                    Ok(Ok(checkpoints)) => {
                        self.report_finality(checkpoints);
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!("Finality poll against {} failed: {}", client.name(), e);
                    }
                    Err(_) => {
                        debug!("Finality poll against {} timed out", client.name());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Checkpoint, Epoch, Hash256};

    fn checkpoints(epoch: u64) -> FinalityCheckpoints {
        let checkpoint = Checkpoint {
            epoch: Epoch::new(epoch),
            root: Hash256::repeat_byte(epoch as u8),
        };
        FinalityCheckpoints {
            finalized: checkpoint,
            justified: checkpoint,
            previous_justified: checkpoint,
        }
    }

    #[tokio::test]
    async fn finality_events_are_deduplicated() {
        let pool = ConsensusPool::new(ChainSpec::minimal(), 0);
        let mut sub = pool.subscribe_finalized_event(10);

        pool.report_finality(checkpoints(1));
        pool.report_finality(checkpoints(1));
        pool.report_finality(checkpoints(2));

        assert_eq!(sub.recv().await.unwrap().finalized.epoch, Epoch::new(1));
        assert_eq!(sub.recv().await.unwrap().finalized.epoch, Epoch::new(2));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wallclock_extras_are_dropped() {
        let pool = ConsensusPool::new(ChainSpec::minimal(), 0);
        let mut sub = pool.subscribe_wallclock_slot_event(1);

        pool.dispatch_wallclock_slot(Slot::new(1));
        pool.dispatch_wallclock_slot(Slot::new(2));
        pool.dispatch_wallclock_slot(Slot::new(3));

        // Only the first tick fits the capacity-1 buffer.
        assert_eq!(sub.recv().await.unwrap().slot, Slot::new(1));
        assert!(sub.rx.try_recv().is_err());
    }
}
