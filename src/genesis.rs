//! Genesis import (spec §4.8/§9): the `backfill-direct` bootstrap walks the
//! upstream's `accountRange` pages and writes accounts/code/storage
//! directly through the Applier to construct a block-0 state, then hands
//! off to the ordinary tail protocol. Single-shot, orthogonal to the
//! steady-state consume loop -- it never touches `Consumer` directly,
//! instead producing the checkpoint and per-block index entries `Consumer`
//! will pick up on construction, the same way `recovery::run_startup_recovery`
//! hands back a `ConsumerCheckpoint` for `main.rs` to pass along.

use std::sync::Arc;

use rocksdb::DB;
use serde_json::Value;

use crate::applier::Applier;
use crate::batch::AtomicBatchWriter;
use crate::config::AppConfig;
use crate::error::ConsumerError;
use crate::kv::{block_hash_to_number_key, block_root_key, canonical_block_key, CF_BLOCKS, CF_META, CONSUMER_STATE_KEY};
use crate::outbox::OutboxReader;
use crate::types::{AccountUpdate, BlockSelector, CanonicalBlock, CodeUpdate, ConsumerCheckpoint, PendingStatus, QueuedDiff};

/// Page size requested per `accountRange` call; matches the teacher's
/// `address.rs` pagination default for large range scans.
const PAGE_SIZE: usize = 4_096;

/// Sentinel recorded as block 0's hash: the upstream's account-range RPC
/// carries no block identity, and the spec names no genesis hash source
/// (DESIGN.md Open Question), so block 0 is anchored by number alone with
/// an all-zero hash/parent-hash pair.
const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Runs the one-shot genesis import and returns the checkpoint `Consumer`
/// should be constructed with. Operates on raw `meta_db`/`trie_db` handles
/// rather than a `Consumer`, since no steady-state checkpoint exists yet.
pub async fn run_backfill_direct(meta_db: Arc<DB>, trie_db: Arc<DB>, outbox: &OutboxReader, _config: &AppConfig) -> Result<ConsumerCheckpoint, ConsumerError> {
    let mut applier = Applier::open(meta_db.clone(), trie_db, crate::types::EMPTY_ROOT).map_err(ConsumerError::from)?;
    let starting_root = applier.current_root();

    let mut start_key: Vec<u8> = Vec::new();
    let mut pages = 0u64;
    loop {
        let (accounts_value, next) = outbox.account_range(BlockSelector::Latest, &start_key, PAGE_SIZE).await.map_err(ConsumerError::from)?;
        let diff = decode_account_page(&accounts_value)?;
        if !diff.accounts.is_empty() || !diff.codes.is_empty() || !diff.storage.is_empty() {
            applier.apply_diff(diff, None, 0).map_err(ConsumerError::from)?;
        }
        pages += 1;
        tracing::info!(pages, "genesis import page applied");

        match next {
            Some(key) => start_key = key,
            None => break,
        }
    }

    let genesis_root = applier.commit_at(starting_root, 0).map_err(ConsumerError::from)?;

    let checkpoint = ConsumerCheckpoint {
        applied_seq: 0,
        applied_block: 0,
        applied_root: genesis_root,
        pending_seq: 0,
        pending_status: PendingStatus::None,
        pending_updated_at: 0,
    };

    let mut batch = AtomicBatchWriter::new(&meta_db);
    batch.put_cf(CF_BLOCKS, &block_root_key(0), &genesis_root).map_err(ConsumerError::from)?;
    let canonical = CanonicalBlock { hash: GENESIS_HASH, parent_hash: GENESIS_HASH };
    let canonical_bytes = bincode::serialize(&canonical).map_err(|e| ConsumerError::from(crate::error::ApplierError::Serialization(e.to_string())))?;
    batch.put_cf(CF_BLOCKS, &canonical_block_key(0), &canonical_bytes).map_err(ConsumerError::from)?;
    batch.put_cf(CF_BLOCKS, &block_hash_to_number_key(&GENESIS_HASH), &crate::kv::encode_u64(0)).map_err(ConsumerError::from)?;
    let checkpoint_bytes = crate::kv::encode_checkpoint(&checkpoint).map_err(ConsumerError::from)?;
    batch.put_cf(CF_META, CONSUMER_STATE_KEY, &checkpoint_bytes).map_err(ConsumerError::from)?;
    batch.commit().map_err(ConsumerError::from)?;

    tracing::info!(pages, root = %hex::encode(genesis_root), "genesis import complete, cutting over to tail mode");
    Ok(checkpoint)
}

fn decode_account_page(value: &Value) -> Result<QueuedDiff, ConsumerError> {
    let mut diff = QueuedDiff::default();
    let Some(accounts) = value.as_object() else {
        return Ok(diff);
    };

    for (address_hex, account) in accounts {
        let address_bytes = hex::decode(address_hex.trim_start_matches("0x")).map_err(|e| ConsumerError::InvariantViolation(format!("bad genesis address: {e}")))?;
        if address_bytes.len() != 20 {
            return Err(ConsumerError::InvariantViolation(format!("genesis address {address_hex} is not 20 bytes")));
        }
        let mut address = [0u8; 20];
        address.copy_from_slice(&address_bytes);

        let balance_hex = account.get("balance").and_then(Value::as_str).unwrap_or("0x");
        let balance = hex::decode(balance_hex.trim_start_matches("0x")).map_err(|e| ConsumerError::InvariantViolation(format!("bad genesis balance: {e}")))?;
        let nonce = account.get("nonce").and_then(Value::as_u64).unwrap_or(0);

        let code_hash_hex = account.get("codeHash").and_then(Value::as_str);
        let code_hash = match code_hash_hex {
            Some(hex_str) => {
                let bytes = hex::decode(hex_str.trim_start_matches("0x")).map_err(|e| ConsumerError::InvariantViolation(format!("bad genesis code hash: {e}")))?;
                let mut out = [0u8; 32];
                if bytes.len() == 32 {
                    out.copy_from_slice(&bytes);
                }
                out
            }
            None => [0u8; 32],
        };

        diff.accounts.push(AccountUpdate { address, nonce, balance, code_hash, alive: true });

        if let Some(code_hex) = account.get("code").and_then(Value::as_str) {
            let code = hex::decode(code_hex.trim_start_matches("0x")).map_err(|e| ConsumerError::InvariantViolation(format!("bad genesis code: {e}")))?;
            if !code.is_empty() {
                diff.codes.push(CodeUpdate { address, code_hash, code });
            }
        }

        if let Some(storage) = account.get("storage").and_then(Value::as_object) {
            for (slot_hex, value_hex) in storage {
                let slot_bytes = hex::decode(slot_hex.trim_start_matches("0x")).map_err(|e| ConsumerError::InvariantViolation(format!("bad genesis slot: {e}")))?;
                let value_bytes = hex::decode(value_hex.as_str().unwrap_or("0x").trim_start_matches("0x")).map_err(|e| ConsumerError::InvariantViolation(format!("bad genesis slot value: {e}")))?;
                let mut slot = [0u8; 32];
                let mut slot_value = [0u8; 32];
                if slot_bytes.len() == 32 {
                    slot.copy_from_slice(&slot_bytes);
                }
                if value_bytes.len() == 32 {
                    slot_value.copy_from_slice(&value_bytes);
                }
                diff.storage.push(crate::types::StorageUpdate { address, slot, value: slot_value });
            }
        }
    }

    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_account_page_parses_balance_nonce_and_storage() {
        let page = serde_json::json!({
            "0x1111111111111111111111111111111111111111": {
                "balance": "0x64",
                "nonce": 3,
                "storage": { "0x0000000000000000000000000000000000000000000000000000000000000001": "0x0000000000000000000000000000000000000000000000000000000000000002" }
            }
        });
        let diff = decode_account_page(&page).unwrap();
        assert_eq!(diff.accounts.len(), 1);
        assert_eq!(diff.accounts[0].nonce, 3);
        assert_eq!(diff.storage.len(), 1);
    }

    #[test]
    fn decode_account_page_handles_empty_object() {
        let diff = decode_account_page(&serde_json::json!({})).unwrap();
        assert!(diff.accounts.is_empty());
    }
}
