use crate::{Address, Graffiti, Hash256, LogsBloom, Uint256};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use superstruct::superstruct;

/// A withdrawal processed by the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Withdrawal {
    pub index: u64,
    pub validator_index: u64,
    pub address: Address,
    pub amount: u64,
}

pub type Transaction = Vec<u8>;

/// The execution payload embedded in post-bellatrix blocks.
///
/// Electra reuses the deneb payload shape, so it has no variant of its own.
#[superstruct(
    variants(Bellatrix, Capella, Deneb),
    variant_attributes(derive(
        Debug,
        Clone,
        PartialEq,
        Serialize,
        Deserialize,
        Encode,
        Decode
    )),
    cast_error(ty = "crate::TypeError", expr = "crate::TypeError::IncorrectVariant"),
    partial_getter_error(ty = "crate::TypeError", expr = "crate::TypeError::IncorrectVariant")
)]
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPayload {
    pub parent_hash: Hash256,
    pub fee_recipient: Address,
    pub state_root: Hash256,
    pub receipts_root: Hash256,
    pub logs_bloom: LogsBloom,
    pub prev_randao: Hash256,
    pub block_number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub base_fee_per_gas: Uint256,
    pub block_hash: Hash256,
    pub transactions: Vec<Transaction>,
    #[superstruct(only(Capella, Deneb))]
    pub withdrawals: Vec<Withdrawal>,
    #[superstruct(only(Deneb))]
    pub blob_gas_used: u64,
    #[superstruct(only(Deneb))]
    pub excess_blob_gas: u64,
}

/// The execution-layer facts the indexer extracts from a payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionSummary {
    pub block_number: u64,
    pub block_hash: Hash256,
    pub extra_data: Vec<u8>,
    pub transaction_count: usize,
    pub withdrawals: Vec<Withdrawal>,
}

impl<'a> ExecutionPayloadRef<'a> {
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            block_number: *self.block_number(),
            block_hash: *self.block_hash(),
            extra_data: self.extra_data().clone(),
            transaction_count: self.transactions().len(),
            withdrawals: match self {
                ExecutionPayloadRef::Bellatrix(_) => Vec::new(),
                ExecutionPayloadRef::Capella(payload) => payload.withdrawals.clone(),
                ExecutionPayloadRef::Deneb(payload) => payload.withdrawals.clone(),
            },
        }
    }
}

impl ExecutionSummary {
    /// Best-effort printable rendition of the extra-data bytes.
    pub fn extra_data_text(&self) -> String {
        let mut padded = self.extra_data.clone();
        padded.truncate(Graffiti::LEN);
        padded.resize(Graffiti::LEN, 0);
        Graffiti::from_slice(&padded)
            .map(|graffiti| graffiti.as_utf8_lossy())
            .unwrap_or_default()
    }
}
