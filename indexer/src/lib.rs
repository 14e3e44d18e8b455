//! An Ethereum beacon-chain indexer core.
//!
//! Ingests block/header/state events from a pool of redundant beacon nodes,
//! maintains a live fork tree across the unfinalized span, computes
//! per-epoch duty assignments and voting aggregations, and persists both an
//! unfinalized recovery log and a finalized canonical history to Postgres.
//!
//! The beacon-node RPC transport and the HTTP presentation layer live
//! outside this crate; see [`consensus::ConsensusClient`] for the contract
//! the embedding service implements.

pub mod beacon;
pub mod config;
pub mod consensus;
pub mod database;
pub mod logger;

pub use beacon::Indexer;
pub use config::Config;
