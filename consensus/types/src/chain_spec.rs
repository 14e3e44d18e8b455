use crate::{Epoch, ForkName, Slot};
use serde::{Deserialize, Serialize};

/// Each of the BLS signature domains consumed by duty derivation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Domain {
    BeaconProposer,
    BeaconAttester,
    SyncCommittee,
    Randao,
    Deposit,
    VoluntaryExit,
}

/// Holds the "constants" for a beacon chain.
///
/// The spec is dynamic: it is read from configuration at startup rather than
/// fixed at compile time, so networks with non-mainnet presets can be indexed
/// with the same binary.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSpec {
    pub config_name: String,

    /*
     * Time parameters
     */
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub min_seed_lookahead: Epoch,
    pub epochs_per_historical_vector: u64,
    pub epochs_per_sync_committee_period: u64,

    /*
     * Committees
     */
    pub max_committees_per_slot: u64,
    pub target_committee_size: u64,
    pub sync_committee_size: u64,
    pub shuffle_round_count: u8,

    /*
     * Gwei values
     */
    pub max_effective_balance: u64,
    pub max_effective_balance_electra: u64,
    pub effective_balance_increment: u64,

    /*
     * Fork schedule
     */
    pub altair_fork_epoch: Option<Epoch>,
    pub bellatrix_fork_epoch: Option<Epoch>,
    pub capella_fork_epoch: Option<Epoch>,
    pub deneb_fork_epoch: Option<Epoch>,
    pub electra_fork_epoch: Option<Epoch>,

    /*
     * Signature domains
     */
    domain_beacon_proposer: u32,
    domain_beacon_attester: u32,
    domain_sync_committee: u32,
    domain_randao: u32,
    domain_deposit: u32,
    domain_voluntary_exit: u32,

    pub far_future_epoch: Epoch,
}

impl ChainSpec {
    /// Returns the name of the fork active at `epoch`.
    pub fn fork_name_at_epoch(&self, epoch: Epoch) -> ForkName {
        let active = |fork_epoch: Option<Epoch>| fork_epoch.is_some_and(|at| epoch >= at);

        if active(self.electra_fork_epoch) {
            ForkName::Electra
        } else if active(self.deneb_fork_epoch) {
            ForkName::Deneb
        } else if active(self.capella_fork_epoch) {
            ForkName::Capella
        } else if active(self.bellatrix_fork_epoch) {
            ForkName::Bellatrix
        } else if active(self.altair_fork_epoch) {
            ForkName::Altair
        } else {
            ForkName::Base
        }
    }

    pub fn fork_name_at_slot(&self, slot: Slot) -> ForkName {
        self.fork_name_at_epoch(slot.epoch(self.slots_per_epoch))
    }

    /// The little-endian 4-byte constant for `domain`, as mixed into seeds.
    pub fn domain_bytes(&self, domain: Domain) -> [u8; 4] {
        let constant = match domain {
            Domain::BeaconProposer => self.domain_beacon_proposer,
            Domain::BeaconAttester => self.domain_beacon_attester,
            Domain::SyncCommittee => self.domain_sync_committee,
            Domain::Randao => self.domain_randao,
            Domain::Deposit => self.domain_deposit,
            Domain::VoluntaryExit => self.domain_voluntary_exit,
        };
        constant.to_le_bytes()
    }

    /// The highest effective balance a validator can carry under `fork`.
    pub fn max_effective_balance_for_fork(&self, fork: ForkName) -> u64 {
        if fork >= ForkName::Electra {
            self.max_effective_balance_electra
        } else {
            self.max_effective_balance
        }
    }

    /// Returns a mainnet spec.
    pub fn mainnet() -> Self {
        Self {
            config_name: "mainnet".to_string(),

            seconds_per_slot: 12,
            slots_per_epoch: 32,
            min_seed_lookahead: Epoch::new(1),
            epochs_per_historical_vector: 65_536,
            epochs_per_sync_committee_period: 256,

            max_committees_per_slot: 64,
            target_committee_size: 128,
            sync_committee_size: 512,
            shuffle_round_count: 90,

            max_effective_balance: 32_000_000_000,
            max_effective_balance_electra: 2_048_000_000_000,
            effective_balance_increment: 1_000_000_000,

            altair_fork_epoch: Some(Epoch::new(74_240)),
            bellatrix_fork_epoch: Some(Epoch::new(144_896)),
            capella_fork_epoch: Some(Epoch::new(194_048)),
            deneb_fork_epoch: Some(Epoch::new(269_568)),
            electra_fork_epoch: Some(Epoch::new(364_032)),

            domain_beacon_proposer: 0,
            domain_beacon_attester: 1,
            domain_sync_committee: 7,
            domain_randao: 2,
            domain_deposit: 3,
            domain_voluntary_exit: 4,

            far_future_epoch: Epoch::max_value(),
        }
    }

    /// Returns a spec following the minimal preset, suitable for tests.
    pub fn minimal() -> Self {
        Self {
            config_name: "minimal".to_string(),

            seconds_per_slot: 6,
            slots_per_epoch: 8,
            epochs_per_historical_vector: 64,
            epochs_per_sync_committee_period: 8,

            max_committees_per_slot: 4,
            target_committee_size: 4,
            sync_committee_size: 32,
            shuffle_round_count: 10,

            altair_fork_epoch: Some(Epoch::new(0)),
            bellatrix_fork_epoch: Some(Epoch::new(0)),
            capella_fork_epoch: Some(Epoch::new(0)),
            deneb_fork_epoch: Some(Epoch::new(0)),
            electra_fork_epoch: None,

            ..Self::mainnet()
        }
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::mainnet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_schedule() {
        let spec = ChainSpec::minimal();
        assert_eq!(spec.fork_name_at_epoch(Epoch::new(0)), ForkName::Deneb);

        let mut spec = ChainSpec::mainnet();
        assert_eq!(spec.fork_name_at_epoch(Epoch::new(0)), ForkName::Base);
        assert_eq!(
            spec.fork_name_at_epoch(Epoch::new(74_240)),
            ForkName::Altair
        );
        spec.electra_fork_epoch = Some(Epoch::new(10));
        assert_eq!(spec.fork_name_at_epoch(Epoch::new(11)), ForkName::Electra);
    }

    #[test]
    fn yaml_overrides() {
        let spec: ChainSpec =
            serde_yaml::from_str("slots_per_epoch: 16\nconfig_name: devnet").unwrap();
        assert_eq!(spec.slots_per_epoch, 16);
        assert_eq!(spec.config_name, "devnet");
        // Unspecified values fall back to mainnet.
        assert_eq!(spec.seconds_per_slot, 12);
    }
}
