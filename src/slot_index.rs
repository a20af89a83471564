//! Slot Index (spec §4.7): auxiliary index of storage slots touched before
//! a configured fork block, used for correct account-deletion semantics
//! under a legacy rule regime. Freezes at the fork and prunes once the
//! history window has moved past it.

use std::sync::Arc;

use rocksdb::DB;

use crate::error::ApplierError;
use crate::kv::{slot_index_account_prefix, slot_index_key, CF_SLOTS, SLOT_INDEX_META_KEY};
use crate::types::{Address, BlockNumber, Hash32};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SlotIndexMeta {
    pub entry_count: u64,
    pub byte_size: u64,
    pub frozen: bool,
    pub frozen_at_block: BlockNumber,
    pub pruned: bool,
}

impl SlotIndexMeta {
    fn fresh() -> Self {
        Self { entry_count: 0, byte_size: 0, frozen: false, frozen_at_block: 0, pruned: false }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SlotEntry {
    block_created: BlockNumber,
    block_last_modified: BlockNumber,
}

/// Disk budget past which `track_slot` stops admitting new entries even if
/// not yet frozen; matches the "upsert with a disk-budget guard" clause.
const DEFAULT_BYTE_BUDGET: u64 = 8 * 1024 * 1024 * 1024;

pub struct SlotIndex {
    db: Arc<DB>,
    fork_block: BlockNumber,
    byte_budget: u64,
    meta: SlotIndexMeta,
}

impl SlotIndex {
    pub fn load(db: Arc<DB>, fork_block: BlockNumber) -> Result<Self, ApplierError> {
        let cf = db.cf_handle(CF_SLOTS).ok_or_else(|| ApplierError::TrieUpdate("slots column family missing".into()))?;
        let meta = match db.get_cf(&cf, SLOT_INDEX_META_KEY).map_err(ApplierError::DiskKv)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| ApplierError::Serialization(e.to_string()))?,
            None => SlotIndexMeta::fresh(),
        };
        Ok(Self { db, fork_block, byte_budget: DEFAULT_BYTE_BUDGET, meta })
    }

    fn persist_meta(&self) -> Result<(), ApplierError> {
        let cf = self.db.cf_handle(CF_SLOTS).ok_or_else(|| ApplierError::TrieUpdate("slots column family missing".into()))?;
        let bytes = bincode::serialize(&self.meta).map_err(|e| ApplierError::Serialization(e.to_string()))?;
        self.db.put_cf(&cf, SLOT_INDEX_META_KEY, bytes).map_err(ApplierError::DiskKv)
    }

    /// False once frozen; otherwise true while `block < forkBlock`. Crossing
    /// the fork auto-freezes.
    pub fn should_index(&mut self, block: BlockNumber) -> bool {
        if self.meta.frozen {
            return false;
        }
        if block >= self.fork_block {
            self.meta.frozen = true;
            self.meta.frozen_at_block = block;
            let _ = self.persist_meta();
            return false;
        }
        true
    }

    pub fn track_slot(&mut self, address: &Address, slot: &Hash32, block: BlockNumber) -> Result<(), ApplierError> {
        if self.meta.byte_size >= self.byte_budget {
            return Ok(());
        }
        let cf = self.db.cf_handle(CF_SLOTS).ok_or_else(|| ApplierError::TrieUpdate("slots column family missing".into()))?;
        let key = slot_index_key(address, slot);
        let existing = self.db.get_cf(&cf, &key).map_err(ApplierError::DiskKv)?;

        let entry = match existing {
            Some(bytes) => {
                let mut decoded: SlotEntry = bincode::deserialize(&bytes).map_err(|e| ApplierError::Serialization(e.to_string()))?;
                decoded.block_last_modified = block;
                decoded
            }
            None => {
                self.meta.entry_count += 1;
                self.meta.byte_size += key.len() as u64 + 16;
                SlotEntry { block_created: block, block_last_modified: block }
            }
        };

        let encoded = bincode::serialize(&entry).map_err(|e| ApplierError::Serialization(e.to_string()))?;
        self.db.put_cf(&cf, &key, encoded).map_err(ApplierError::DiskKv)?;
        self.persist_meta()
    }

    pub fn delete_slots_for_account(&mut self, address: &Address) -> Result<(), ApplierError> {
        let cf = self.db.cf_handle(CF_SLOTS).ok_or_else(|| ApplierError::TrieUpdate("slots column family missing".into()))?;
        let prefix = slot_index_account_prefix(address);
        let iter = self.db.prefix_iterator_cf(&cf, &prefix);
        let mut removed = 0u64;
        for item in iter {
            let (key, _value) = item.map_err(ApplierError::DiskKv)?;
            if !key.starts_with(&prefix) {
                break;
            }
            self.db.delete_cf(&cf, &key).map_err(ApplierError::DiskKv)?;
            removed += 1;
        }
        self.meta.entry_count = self.meta.entry_count.saturating_sub(removed);
        self.persist_meta()
    }

    /// Drops all entries once `currentBlock > forkBlock + stateHistory`.
    pub fn prune_if_safe(&mut self, current_block: BlockNumber, state_history: u64) -> Result<(), ApplierError> {
        if self.meta.pruned || current_block <= self.fork_block + state_history {
            return Ok(());
        }
        let cf = self.db.cf_handle(CF_SLOTS).ok_or_else(|| ApplierError::TrieUpdate("slots column family missing".into()))?;
        let prefix = b"UBTSlotIndex/";
        let iter = self.db.prefix_iterator_cf(&cf, prefix);
        for item in iter {
            let (key, _value) = item.map_err(ApplierError::DiskKv)?;
            if !key.starts_with(prefix) {
                break;
            }
            self.db.delete_cf(&cf, &key).map_err(ApplierError::DiskKv)?;
        }
        self.meta.entry_count = 0;
        self.meta.byte_size = 0;
        self.meta.pruned = true;
        self.persist_meta()
    }

    pub fn meta(&self) -> &SlotIndexMeta {
        &self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::open_db;

    #[test]
    fn should_index_freezes_at_fork_block() {
        let dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(open_db(dir.path()).unwrap());
        let mut index = SlotIndex::load(db, 100).unwrap();

        assert!(index.should_index(50));
        assert!(!index.should_index(100));
        assert!(!index.should_index(50));
        assert!(index.meta().frozen);
    }

    #[test]
    fn track_slot_upserts_and_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(open_db(dir.path()).unwrap());
        let mut index = SlotIndex::load(db, 100).unwrap();

        let address = [1u8; 20];
        let slot = [2u8; 32];
        index.track_slot(&address, &slot, 1).unwrap();
        index.track_slot(&address, &slot, 2).unwrap();
        assert_eq!(index.meta().entry_count, 1);
    }

    #[test]
    fn delete_slots_for_account_removes_only_that_accounts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(open_db(dir.path()).unwrap());
        let mut index = SlotIndex::load(db, 100).unwrap();

        let addr_a = [1u8; 20];
        let addr_b = [2u8; 20];
        index.track_slot(&addr_a, &[1u8; 32], 1).unwrap();
        index.track_slot(&addr_b, &[1u8; 32], 1).unwrap();
        index.delete_slots_for_account(&addr_a).unwrap();
        assert_eq!(index.meta().entry_count, 1);
    }
}
