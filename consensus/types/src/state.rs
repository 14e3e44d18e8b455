use crate::{ChainSpec, Domain, Epoch, Hash256, PublicKeyBytes, Slot, SyncCommittee};
use ethereum_hashing::hash;
use serde::{Deserialize, Serialize};

/// A validator record from the beacon state registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub pubkey: PublicKeyBytes,
    pub withdrawal_credentials: Hash256,
    pub effective_balance: u64,
    pub slashed: bool,
    pub activation_eligibility_epoch: Epoch,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
    pub withdrawable_epoch: Epoch,
}

impl Validator {
    /// Whether the validator is active at `epoch`.
    pub fn is_active_at(&self, epoch: Epoch) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }
}

/// The beacon-state view consumed by duty derivation.
///
/// The consensus client collaborator downloads states; only the fields the
/// indexer reads survive into this container, everything else stays with the
/// client.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconState {
    pub slot: Slot,
    pub validators: Vec<Validator>,
    pub balances: Vec<u64>,
    pub randao_mixes: Vec<Hash256>,
    pub eth1_deposit_index: u64,
    pub current_sync_committee: Option<SyncCommittee>,
}

impl BeaconState {
    /// The randao mix for `epoch`, indexed modulo the historical vector.
    pub fn randao_mix(&self, epoch: Epoch) -> Hash256 {
        let vector_len = self.randao_mixes.len().max(1) as u64;
        self.randao_mixes
            .get((epoch.as_u64() % vector_len) as usize)
            .copied()
            .unwrap_or_else(Hash256::zero)
    }

    /// The seed for duty shuffling at `epoch` under `domain`.
    ///
    /// `seed = hash(domain ++ epoch_le ++ mix)` where the mix is taken
    /// `MIN_SEED_LOOKAHEAD + 1` epochs back, per the consensus spec.
    pub fn seed(&self, epoch: Epoch, domain: Domain, spec: &ChainSpec) -> Hash256 {
        let lookahead = spec.min_seed_lookahead.as_u64() + 1;
        let mix_epoch = Epoch::new(
            epoch
                .as_u64()
                .wrapping_add(spec.epochs_per_historical_vector)
                .wrapping_sub(lookahead),
        );
        let mix = self.randao_mix(mix_epoch);

        let mut preimage = Vec::with_capacity(4 + 8 + 32);
        preimage.extend_from_slice(&spec.domain_bytes(domain));
        preimage.extend_from_slice(&epoch.as_u64().to_le_bytes());
        preimage.extend_from_slice(mix.as_bytes());
        Hash256::from_slice(&hash(&preimage))
    }

    /// Indices of validators active at `epoch`, in registry order.
    pub fn active_validator_indices(&self, epoch: Epoch) -> Vec<u64> {
        self.validators
            .iter()
            .enumerate()
            .filter(|(_, validator)| validator.is_active_at(epoch))
            .map(|(index, _)| index as u64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn validator(activation: u64, exit: u64) -> Validator {
        Validator {
            pubkey: PublicKeyBytes::empty(),
            withdrawal_credentials: Hash256::zero(),
            effective_balance: 32_000_000_000,
            slashed: false,
            activation_eligibility_epoch: Epoch::new(activation),
            activation_epoch: Epoch::new(activation),
            exit_epoch: Epoch::new(exit),
            withdrawable_epoch: Epoch::new(exit),
        }
    }

    #[test]
    fn active_indices() {
        let state = BeaconState {
            slot: Slot::new(0),
            validators: vec![validator(0, 10), validator(5, 10), validator(0, 3)],
            balances: vec![],
            randao_mixes: vec![Hash256::zero(); 8],
            eth1_deposit_index: 0,
            current_sync_committee: None,
        };

        assert_eq!(state.active_validator_indices(Epoch::new(0)), vec![0, 2]);
        assert_eq!(state.active_validator_indices(Epoch::new(4)), vec![0]);
        assert_eq!(state.active_validator_indices(Epoch::new(6)), vec![0, 1]);
    }

    #[test]
    fn seed_varies_with_domain_and_epoch() {
        let spec = ChainSpec::minimal();
        let state = BeaconState {
            slot: Slot::new(0),
            validators: vec![],
            balances: vec![],
            randao_mixes: (0..64).map(|byte| Hash256::repeat_byte(byte as u8)).collect(),
            eth1_deposit_index: 0,
            current_sync_committee: None,
        };

        let proposer = state.seed(Epoch::new(3), Domain::BeaconProposer, &spec);
        let attester = state.seed(Epoch::new(3), Domain::BeaconAttester, &spec);
        let later = state.seed(Epoch::new(4), Domain::BeaconProposer, &spec);

        assert_ne!(proposer, attester);
        assert_ne!(proposer, later);
    }
}
