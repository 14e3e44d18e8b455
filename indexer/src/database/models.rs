use crate::database::schema::{
    deposits, epochs, explorer_state, slashings, slots, sync_assignments, unfinalized_blocks,
    unfinalized_duties, unfinalized_epochs, unfinalized_forks, voluntary_exits,
};
use diesel::{Insertable, Queryable};
use serde::{Deserialize, Serialize};

/// Status of a slot row in the canonical history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Missing,
    Canonical,
    Orphaned,
}

impl SlotStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            SlotStatus::Missing => 0,
            SlotStatus::Canonical => 1,
            SlotStatus::Orphaned => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(SlotStatus::Missing),
            1 => Some(SlotStatus::Canonical),
            2 => Some(SlotStatus::Orphaned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashingReason {
    ProposerSlashing,
    AttesterSlashing,
}

impl SlashingReason {
    pub fn as_i16(self) -> i16 {
        match self {
            SlashingReason::ProposerSlashing => 1,
            SlashingReason::AttesterSlashing => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = slots)]
pub struct SlotRow {
    pub slot: i64,
    pub root: Vec<u8>,
    pub parent_root: Option<Vec<u8>>,
    pub state_root: Option<Vec<u8>>,
    pub proposer: i64,
    pub status: i16,
    pub fork_id: i64,
    pub graffiti: Option<Vec<u8>>,
    pub graffiti_text: Option<String>,
    pub attestation_count: i32,
    pub deposit_count: i32,
    pub exit_count: i32,
    pub proposer_slashing_count: i32,
    pub attester_slashing_count: i32,
    pub bls_change_count: i32,
    pub sync_participation: f32,
    pub eth_block_number: Option<i64>,
    pub eth_block_hash: Option<Vec<u8>>,
    pub eth_block_extra: Option<Vec<u8>>,
    pub eth_block_extra_text: Option<String>,
    pub eth_transaction_count: i32,
    pub withdraw_count: i32,
    pub withdraw_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = epochs)]
pub struct EpochRow {
    pub epoch: i64,
    pub validator_count: i64,
    pub validator_balance: i64,
    pub eligible: i64,
    pub voted_target: i64,
    pub voted_head: i64,
    pub voted_total: i64,
    pub block_count: i16,
    pub missing_count: i16,
    pub orphaned_count: i16,
    pub attestation_count: i32,
    pub deposit_count: i32,
    pub exit_count: i32,
    pub proposer_slashing_count: i32,
    pub attester_slashing_count: i32,
    pub bls_change_count: i32,
    pub sync_participation: f32,
    pub eth_transaction_count: i32,
    pub withdraw_count: i32,
    pub withdraw_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = deposits)]
pub struct DepositRow {
    pub slot_root: Vec<u8>,
    pub slot_index: i32,
    pub slot_number: i64,
    pub orphaned: bool,
    pub fork_id: i64,
    pub deposit_index: Option<i64>,
    pub public_key: Vec<u8>,
    pub withdrawal_credentials: Vec<u8>,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = voluntary_exits)]
pub struct VoluntaryExitRow {
    pub slot_root: Vec<u8>,
    pub slot_index: i32,
    pub slot_number: i64,
    pub orphaned: bool,
    pub fork_id: i64,
    pub validator_index: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = slashings)]
pub struct SlashingRow {
    pub slot_root: Vec<u8>,
    pub slot_index: i32,
    pub slot_number: i64,
    pub orphaned: bool,
    pub fork_id: i64,
    pub validator_index: i64,
    pub slasher_index: i64,
    pub reason: i16,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = sync_assignments)]
pub struct SyncAssignmentRow {
    pub period: i64,
    pub committee_index: i32,
    pub validator_index: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = unfinalized_blocks)]
pub struct UnfinalizedBlockRow {
    pub root: Vec<u8>,
    pub slot: i64,
    pub fork_id: i64,
    pub status: i16,
    pub header_ver: i16,
    pub header_ssz: Vec<u8>,
    pub block_ver: i16,
    pub block_ssz: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = unfinalized_duties)]
pub struct UnfinalizedDutyRow {
    pub epoch: i64,
    pub dependent_root: Vec<u8>,
    pub duties_ssz: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = unfinalized_epochs)]
pub struct UnfinalizedEpochRow {
    pub epoch: i64,
    pub dependent_root: Vec<u8>,
    pub epoch_data: serde_json::Value,
}

impl UnfinalizedEpochRow {
    pub fn decode_epoch_data(&self) -> Result<EpochRow, serde_json::Error> {
        serde_json::from_value(self.epoch_data.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = unfinalized_forks)]
pub struct UnfinalizedForkRow {
    pub fork_id: i64,
    pub base_slot: i64,
    pub base_root: Vec<u8>,
    pub parent_fork_id: i64,
    pub head_slot: i64,
    pub head_root: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = explorer_state)]
pub struct ExplorerStateRow {
    pub key: String,
    pub value: serde_json::Value,
}
