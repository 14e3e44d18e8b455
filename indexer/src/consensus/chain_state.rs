use super::FinalityCheckpoints;
use parking_lot::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use types::{ChainSpec, Checkpoint, Epoch, Hash256, Slot};

/// The only place slot/epoch/wall-clock math lives.
///
/// Every other component converts through this type, so the spec constants
/// are consulted in exactly one spot.
pub struct ChainState {
    spec: ChainSpec,
    genesis_time: u64,
    finality: RwLock<FinalityCheckpoints>,
}

impl ChainState {
    pub fn new(spec: ChainSpec, genesis_time: u64) -> Self {
        let genesis_checkpoint = Checkpoint {
            epoch: Epoch::new(0),
            root: Hash256::zero(),
        };
        Self {
            spec,
            genesis_time,
            finality: RwLock::new(FinalityCheckpoints {
                finalized: genesis_checkpoint,
                justified: genesis_checkpoint,
                previous_justified: genesis_checkpoint,
            }),
        }
    }

    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    pub fn genesis_time(&self) -> u64 {
        self.genesis_time
    }

    pub fn epoch_of_slot(&self, slot: Slot) -> Epoch {
        slot.epoch(self.spec.slots_per_epoch)
    }

    pub fn epoch_start_slot(&self, epoch: Epoch) -> Slot {
        epoch.start_slot(self.spec.slots_per_epoch)
    }

    /// Position of `slot` within its epoch.
    pub fn slot_index(&self, slot: Slot) -> u64 {
        slot % self.spec.slots_per_epoch
    }

    pub fn slot_at_time(&self, timestamp: u64) -> Slot {
        let elapsed = timestamp.saturating_sub(self.genesis_time);
        Slot::new(elapsed / self.spec.seconds_per_slot.max(1))
    }

    pub fn time_of_slot(&self, slot: Slot) -> u64 {
        self.genesis_time
            .saturating_add(slot.as_u64().saturating_mul(self.spec.seconds_per_slot))
    }

    pub fn current_slot(&self) -> Slot {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.slot_at_time(now)
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epoch_of_slot(self.current_slot())
    }

    pub fn finality_checkpoints(&self) -> FinalityCheckpoints {
        *self.finality.read()
    }

    pub fn finalized_checkpoint(&self) -> Checkpoint {
        self.finality.read().finalized
    }

    pub fn finalized_epoch(&self) -> Epoch {
        self.finality.read().finalized.epoch
    }

    pub fn finalized_slot(&self) -> Slot {
        self.epoch_start_slot(self.finalized_epoch())
    }

    /// Record newly observed checkpoints. Returns `false` when the update
    /// would move finality backwards, which callers treat as a node fault.
    pub fn update_finality(&self, checkpoints: FinalityCheckpoints) -> bool {
        let mut finality = self.finality.write();
        if checkpoints.finalized.epoch < finality.finalized.epoch {
            return false;
        }
        *finality = checkpoints;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::ChainSpec;

    fn chain_state() -> ChainState {
        ChainState::new(ChainSpec::minimal(), 1_000_000)
    }

    #[test]
    fn wallclock_math() {
        let state = chain_state();
        // minimal preset: 6 second slots, 8 slots per epoch.
        assert_eq!(state.slot_at_time(1_000_000), Slot::new(0));
        assert_eq!(state.slot_at_time(1_000_005), Slot::new(0));
        assert_eq!(state.slot_at_time(1_000_006), Slot::new(1));
        assert_eq!(state.slot_at_time(999_000), Slot::new(0));
        assert_eq!(state.time_of_slot(Slot::new(10)), 1_000_060);
    }

    #[test]
    fn slot_math() {
        let state = chain_state();
        assert_eq!(state.epoch_of_slot(Slot::new(17)), Epoch::new(2));
        assert_eq!(state.epoch_start_slot(Epoch::new(2)), Slot::new(16));
        assert_eq!(state.slot_index(Slot::new(17)), 1);
    }

    #[test]
    fn finality_never_regresses() {
        let state = chain_state();
        let advance = |epoch: u64| FinalityCheckpoints {
            finalized: Checkpoint {
                epoch: Epoch::new(epoch),
                root: Hash256::repeat_byte(epoch as u8),
            },
            justified: Checkpoint {
                epoch: Epoch::new(epoch + 1),
                root: Hash256::zero(),
            },
            previous_justified: Checkpoint {
                epoch: Epoch::new(epoch),
                root: Hash256::zero(),
            },
        };

        assert!(state.update_finality(advance(5)));
        assert!(!state.update_finality(advance(4)));
        assert_eq!(state.finalized_epoch(), Epoch::new(5));
    }
}
