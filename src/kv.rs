//! RocksDB key layout and checkpoint (de)serialization, adapted from the
//! teacher's `db_handles.rs`/`db_utils.rs` column-family-and-key-prefix
//! conventions (fixed string prefixes + big-endian numeric suffixes so
//! range scans stay lexicographically ordered).

use byteorder::{BigEndian, ByteOrder};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use crate::error::ApplierError;
use crate::types::{Address, BlockNumber, ConsumerCheckpoint, Hash32, RecoveryAnchorManifest, Seq};

pub const CF_META: &str = "meta";
pub const CF_BLOCKS: &str = "blocks";
pub const CF_SLOTS: &str = "slots";
pub const CF_CODE: &str = "code";
pub const CF_ANCHORS: &str = "anchors";

pub const CONSUMER_STATE_KEY: &[u8] = b"UBTConsumerState";
pub const ANCHOR_SNAPSHOT_COUNT_KEY: &[u8] = b"UBTAnchorSnapshotCount";
pub const RECOVERY_ANCHOR_COUNT_KEY: &[u8] = b"UBTRecoveryAnchorCount";
pub const RECOVERY_ANCHOR_LATEST_READY_KEY: &[u8] = b"UBTRecoveryAnchorLatestReady";
pub const SLOT_INDEX_META_KEY: &[u8] = b"UBTSlotIndexMeta";

/// Opens the daemon's metadata store: checkpoint, block-root/canonical
/// indices, anchor manifests, slot index, and code -- everything spec §5
/// calls "the disk KV for consumer checkpoints, root indices, anchors, and
/// code", kept in a directory distinct from the trie DB so it stays
/// reliably openable even when the trie DB needs corrupt-directory
/// rotation (see `trie_impl::open_trie_db`, `recovery::run_startup_recovery`).
pub fn open_db(path: &std::path::Path) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_SLOTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_CODE, Options::default()),
        ColumnFamilyDescriptor::new(CF_ANCHORS, Options::default()),
    ];

    DB::open_cf_descriptors(&opts, path, cfs)
}

/// `UBTBlockRoot/{n}` — committed trie root for block number `n`.
pub fn block_root_key(number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(14 + 8);
    key.extend_from_slice(b"UBTBlockRoot/");
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, number);
    key.extend_from_slice(&buf);
    key
}

/// `UBTCanonicalBlock/{n}` — `(hash, parentHash)` for block number `n`.
pub fn canonical_block_key(number: BlockNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(19 + 8);
    key.extend_from_slice(b"UBTCanonicalBlock/");
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, number);
    key.extend_from_slice(&buf);
    key
}

/// `UBTBlockHashToNumber/{hash}` — reverse index for selector-by-hash lookups.
pub fn block_hash_to_number_key(hash: &Hash32) -> Vec<u8> {
    let mut key = Vec::with_capacity(22 + 32);
    key.extend_from_slice(b"UBTBlockHashToNumber/");
    key.extend_from_slice(hash);
    key
}

/// `UBTAnchorSnapshot/{i}` — in-trie revert anchor at index `i`.
pub fn anchor_snapshot_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(18 + 8);
    key.extend_from_slice(b"UBTAnchorSnapshot/");
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, index);
    key.extend_from_slice(&buf);
    key
}

/// `UBTRecoveryAnchorManifest/{id}` — materialized recovery anchor metadata.
pub fn recovery_anchor_manifest_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(28 + 8);
    key.extend_from_slice(b"UBTRecoveryAnchorManifest/");
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, id);
    key.extend_from_slice(&buf);
    key
}

/// `UBTSlotIndex/{addr}/{slot}` — tracked storage slot for pruning (spec §4.7).
pub fn slot_index_key(address: &Address, slot: &Hash32) -> Vec<u8> {
    let mut key = Vec::with_capacity(14 + 20 + 1 + 32);
    key.extend_from_slice(b"UBTSlotIndex/");
    key.extend_from_slice(address);
    key.push(b'/');
    key.extend_from_slice(slot);
    key
}

/// Prefix for scanning all tracked slots of a single account.
pub fn slot_index_account_prefix(address: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(14 + 20 + 1);
    key.extend_from_slice(b"UBTSlotIndex/");
    key.extend_from_slice(address);
    key.push(b'/');
    key
}

/// `code/{codeHash}` — contract bytecode, content-addressed.
pub fn code_key(code_hash: &Hash32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + 32);
    key.extend_from_slice(b"code/");
    key.extend_from_slice(code_hash);
    key
}

pub fn encode_checkpoint(checkpoint: &ConsumerCheckpoint) -> Result<Vec<u8>, ApplierError> {
    bincode::serialize(checkpoint).map_err(|e| ApplierError::Serialization(e.to_string()))
}

pub fn decode_checkpoint(bytes: &[u8]) -> Result<ConsumerCheckpoint, ApplierError> {
    bincode::deserialize(bytes).map_err(|e| ApplierError::Serialization(e.to_string()))
}

pub fn encode_manifest(manifest: &RecoveryAnchorManifest) -> Result<Vec<u8>, ApplierError> {
    bincode::serialize(manifest).map_err(|e| ApplierError::Serialization(e.to_string()))
}

pub fn decode_manifest(bytes: &[u8]) -> Result<RecoveryAnchorManifest, ApplierError> {
    bincode::deserialize(bytes).map_err(|e| ApplierError::Serialization(e.to_string()))
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    buf
}

pub fn decode_u64(bytes: &[u8]) -> u64 {
    BigEndian::read_u64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_root_keys_sort_in_number_order() {
        let a = block_root_key(1);
        let b = block_root_key(2);
        let c = block_root_key(256);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn slot_index_account_prefix_is_a_true_prefix_of_slot_key() {
        let addr = [7u8; 20];
        let slot = [9u8; 32];
        let prefix = slot_index_account_prefix(&addr);
        let key = slot_index_key(&addr, &slot);
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn checkpoint_round_trips() {
        let checkpoint = ConsumerCheckpoint::fresh();
        let bytes = encode_checkpoint(&checkpoint).unwrap();
        let decoded = decode_checkpoint(&bytes).unwrap();
        assert_eq!(decoded.applied_seq, checkpoint.applied_seq);
        assert_eq!(decoded.applied_root, checkpoint.applied_root);
    }
}
