//! `ubt-consumer`: tails a blockchain outbox of state-diff/reorg events and
//! materializes state into a Unified Binary Trie. Library surface used by
//! the `ubt-consumer` binary and the diagnostic/maintenance tool binaries.

pub mod applier;
pub mod batch;
pub mod coalesce;
pub mod config;
pub mod consumer;
pub mod error;
pub mod genesis;
pub mod kv;
pub mod metrics;
pub mod outbox;
pub mod query;
pub mod recovery;
pub mod replay;
pub mod runner;
pub mod slot_index;
pub mod telemetry;
pub mod trie;
pub mod trie_impl;
pub mod types;
pub mod validator;
