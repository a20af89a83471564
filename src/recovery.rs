//! Recovery (spec §4.4): in-trie anchor snapshots for fast revert,
//! materialized recovery anchors for when the live trie DB is unopenable,
//! and the startup recovery ladder run from `Consumer::new`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::DB;

use crate::error::RecoveryError;
use crate::kv::{anchor_snapshot_key, recovery_anchor_manifest_key, ANCHOR_SNAPSHOT_COUNT_KEY, CF_ANCHORS, CF_META, RECOVERY_ANCHOR_COUNT_KEY, RECOVERY_ANCHOR_LATEST_READY_KEY};
use crate::metrics::RECOVERY_ATTEMPTS;
use crate::types::{AnchorSnapshot, BlockNumber, ConsumerCheckpoint, Hash32, RecoveryAnchorManifest, RecoveryAnchorState, Seq};

pub struct AnchorStore {
    db: Arc<DB>,
}

impl AnchorStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    fn count(&self, key: &[u8]) -> Result<u64, RecoveryError> {
        let cf = self.db.cf_handle(CF_META).ok_or_else(|| RecoveryError::CorruptManifest("meta cf missing".into()))?;
        match self.db.get_cf(&cf, key).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))? {
            Some(bytes) => Ok(crate::kv::decode_u64(&bytes)),
            None => Ok(0),
        }
    }

    /// Append an in-trie anchor snapshot (spec §4.4 mechanism 1, §4.3
    /// commit procedure "occasionally create anchor snapshots").
    pub fn create_snapshot(&self, block_number: BlockNumber, block_root: Hash32, seq: Seq, timestamp: u64) -> Result<(), RecoveryError> {
        let index = self.count(ANCHOR_SNAPSHOT_COUNT_KEY)?;
        let snapshot = AnchorSnapshot { index, block_number, block_root, seq, timestamp };
        let bytes = bincode::serialize(&snapshot).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
        let cf_anchors = self.db.cf_handle(CF_ANCHORS).ok_or_else(|| RecoveryError::CorruptManifest("anchors cf missing".into()))?;
        let cf_meta = self.db.cf_handle(CF_META).ok_or_else(|| RecoveryError::CorruptManifest("meta cf missing".into()))?;
        self.db.put_cf(&cf_anchors, anchor_snapshot_key(index), bytes).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
        self.db
            .put_cf(&cf_meta, ANCHOR_SNAPSHOT_COUNT_KEY, crate::kv::encode_u64(index + 1))
            .map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
        Ok(())
    }

    /// Find the most recent anchor snapshot at or below `block_number`.
    pub fn find_usable_anchor(&self, block_number: BlockNumber) -> Result<Option<AnchorSnapshot>, RecoveryError> {
        let count = self.count(ANCHOR_SNAPSHOT_COUNT_KEY)?;
        let cf = self.db.cf_handle(CF_ANCHORS).ok_or_else(|| RecoveryError::CorruptManifest("anchors cf missing".into()))?;
        let mut best: Option<AnchorSnapshot> = None;
        for index in 0..count {
            if let Some(bytes) = self.db.get_cf(&cf, anchor_snapshot_key(index)).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))? {
                let snapshot: AnchorSnapshot = bincode::deserialize(&bytes).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
                if snapshot.block_number <= block_number && best.as_ref().map_or(true, |b| snapshot.block_number > b.block_number) {
                    best = Some(snapshot);
                }
            }
        }
        Ok(best)
    }
}

pub struct MaterializedAnchorStore {
    trie_db_path: PathBuf,
    anchors_root: PathBuf,
}

impl MaterializedAnchorStore {
    pub fn new(trie_db_path: PathBuf, anchors_root: PathBuf) -> Self {
        Self { trie_db_path, anchors_root }
    }

    /// Three-phase create (spec §4.4, §9 design note): write manifest as
    /// `building`, copy directory via temp+rename, flip to `ready`.
    pub fn create(&self, db: &DB, anchor_id: u64, seq: Seq, block_number: BlockNumber, block_root: Hash32) -> Result<(), RecoveryError> {
        let manifest = RecoveryAnchorManifest {
            anchor_id,
            seq,
            block_number,
            block_root,
            created_at: 0,
            format_version: 1,
            state: RecoveryAnchorState::Building,
        };
        self.write_manifest(db, &manifest)?;

        let final_dir = self.anchors_root.join(format!("anchor-{anchor_id}"));
        let tmp_dir = self.anchors_root.join(format!("anchor-{anchor_id}.tmp"));
        std::fs::create_dir_all(&self.anchors_root)?;
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        copy_dir_recursive(&self.trie_db_path, &tmp_dir)?;
        std::fs::rename(&tmp_dir, &final_dir)?;

        let ready_manifest = RecoveryAnchorManifest { state: RecoveryAnchorState::Ready, ..manifest };
        self.write_manifest(db, &ready_manifest)?;
        let cf = db.cf_handle(CF_META).ok_or_else(|| RecoveryError::CorruptManifest("meta cf missing".into()))?;
        db.put_cf(&cf, RECOVERY_ANCHOR_LATEST_READY_KEY, crate::kv::encode_u64(anchor_id))
            .map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
        Ok(())
    }

    fn write_manifest(&self, db: &DB, manifest: &RecoveryAnchorManifest) -> Result<(), RecoveryError> {
        let cf = db.cf_handle(CF_ANCHORS).ok_or_else(|| RecoveryError::CorruptManifest("anchors cf missing".into()))?;
        let bytes = crate::kv::encode_manifest(manifest).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
        db.put_cf(&cf, recovery_anchor_manifest_key(manifest.anchor_id), bytes)
            .map_err(|e| RecoveryError::CorruptManifest(e.to_string()))
    }

    pub fn latest_ready(&self, db: &DB) -> Result<Option<RecoveryAnchorManifest>, RecoveryError> {
        let cf = db.cf_handle(CF_META).ok_or_else(|| RecoveryError::CorruptManifest("meta cf missing".into()))?;
        let latest_id = match db.get_cf(&cf, RECOVERY_ANCHOR_LATEST_READY_KEY).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))? {
            Some(bytes) => crate::kv::decode_u64(&bytes),
            None => return Ok(None),
        };
        let cf_anchors = db.cf_handle(CF_ANCHORS).ok_or_else(|| RecoveryError::CorruptManifest("anchors cf missing".into()))?;
        match db
            .get_cf(&cf_anchors, recovery_anchor_manifest_key(latest_id))
            .map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?
        {
            Some(bytes) => Ok(Some(crate::kv::decode_manifest(&bytes).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Swap the anchor directory into the live trie DB path.
    pub fn restore(&self, anchor_id: u64) -> Result<(), RecoveryError> {
        let anchor_dir = self.anchors_root.join(format!("anchor-{anchor_id}"));
        if !anchor_dir.exists() {
            return Err(RecoveryError::NoUsableAnchor(0));
        }
        if self.trie_db_path.exists() {
            let rotated = self.trie_db_path.with_extension(format!("corrupt-{}", now_suffix()));
            std::fs::rename(&self.trie_db_path, rotated)?;
        }
        copy_dir_recursive(&anchor_dir, &self.trie_db_path)?;
        Ok(())
    }
}

fn now_suffix() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

/// Rotate a directory suspected corrupt aside with a timestamp suffix
/// (spec §4.4 startup recovery step 2).
pub fn rotate_corrupt_directory(path: &Path) -> Result<(), RecoveryError> {
    if !path.exists() {
        return Ok(());
    }
    let rotated = path.with_extension(format!("corrupt-{}", now_suffix()));
    std::fs::rename(path, rotated)?;
    Ok(())
}

/// The startup recovery ladder (spec §4.4 "Startup recovery"). Returns the
/// checkpoint to resume from (possibly reset to genesis) and whether a
/// fresh-start outbox-floor bootstrap is now permitted.
pub struct RecoveryOutcome {
    pub checkpoint: ConsumerCheckpoint,
    pub fresh: bool,
}

pub fn run_startup_recovery(
    meta_db: Arc<DB>,
    trie_db_path: &Path,
    anchors_root: &Path,
    checkpoint: ConsumerCheckpoint,
    recovery_strict: bool,
) -> Result<RecoveryOutcome, RecoveryError> {
    // Steps 1-2 (spec §4.4): the caller's own open attempt already failed.
    // For a content-addressed, lazily-read trie store there is no separate
    // root-pointer file to reset, so "retry at expected root" and "retry at
    // empty root" collapse into one check: reopen the RocksDB handle
    // (lock contention after an unclean shutdown is the common transient
    // case) and verify the checkpoint's expected root still resolves to
    // real node data -- a root equal to the sentinel empty root always
    // resolves trivially, covering the "empty root" case for free.
    if let Ok(trie_db) = crate::trie_impl::open_trie_db(trie_db_path) {
        let trie_db = Arc::new(trie_db);
        RECOVERY_ATTEMPTS.with_label_values(&["open_expected_root", "attempt"]).inc();
        let applier = crate::applier::Applier::open(meta_db.clone(), trie_db.clone(), checkpoint.applied_root)
            .map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
        if applier.root_is_resolvable(applier.current_root()).unwrap_or(false) {
            RECOVERY_ATTEMPTS.with_label_values(&["open_expected_root", "success"]).inc();
            return Ok(RecoveryOutcome { checkpoint, fresh: false });
        }

        // Step 4 (mechanism 1, "in-trie anchors (fast)"): the store itself
        // opened, so a known-good historical root recorded by
        // `AnchorStore::create_snapshot` is likely still present as a layer
        // even though the latest/expected root looks bad. Selecting it
        // costs nothing (no directory copy), so prefer it over the
        // materialized-anchor/genesis fallbacks below.
        let anchor_store = AnchorStore::new(meta_db.clone());
        if let Ok(Some(anchor)) = anchor_store.find_usable_anchor(checkpoint.applied_block) {
            RECOVERY_ATTEMPTS.with_label_values(&["in_trie_anchor", "attempt"]).inc();
            let applier = crate::applier::Applier::open(meta_db.clone(), trie_db.clone(), anchor.block_root).map_err(|e| RecoveryError::CorruptManifest(e.to_string()))?;
            if applier.root_is_resolvable(applier.current_root()).unwrap_or(false) {
                RECOVERY_ATTEMPTS.with_label_values(&["in_trie_anchor", "restore"]).inc();
                return Ok(RecoveryOutcome {
                    checkpoint: ConsumerCheckpoint {
                        applied_seq: anchor.seq,
                        applied_block: anchor.block_number,
                        applied_root: anchor.block_root,
                        pending_seq: 0,
                        pending_status: crate::types::PendingStatus::None,
                        pending_updated_at: 0,
                    },
                    fresh: false,
                });
            }
        }
        // `trie_db` drops here, releasing the RocksDB lock before step 3
        // below may rename the directory out from under it.
    }

    // Step 3 + mechanism 2 ("materialized anchors"): the live store is
    // unusable at any root we could find, so fall back to the last
    // directory-swap anchor, then strict failure or a genesis restart.
    RECOVERY_ATTEMPTS.with_label_values(&["rotate_corrupt_directory", "attempt"]).inc();
    let materialized = MaterializedAnchorStore::new(trie_db_path.to_path_buf(), anchors_root.to_path_buf());

    if let Ok(Some(manifest)) = materialized.latest_ready(&meta_db) {
        if manifest.block_number <= checkpoint.applied_block {
            RECOVERY_ATTEMPTS.with_label_values(&["materialized_anchor", "restore"]).inc();
            rotate_corrupt_directory(trie_db_path)?;
            materialized.restore(manifest.anchor_id)?;
            return Ok(RecoveryOutcome {
                checkpoint: ConsumerCheckpoint {
                    applied_seq: manifest.seq,
                    applied_block: manifest.block_number,
                    applied_root: manifest.block_root,
                    pending_seq: 0,
                    pending_status: crate::types::PendingStatus::None,
                    pending_updated_at: 0,
                },
                fresh: false,
            });
        }
    }

    if recovery_strict {
        RECOVERY_ATTEMPTS.with_label_values(&["strict", "failure"]).inc();
        return Err(RecoveryError::StrictRecoveryFailed);
    }

    RECOVERY_ATTEMPTS.with_label_values(&["genesis_fallback", "success"]).inc();
    rotate_corrupt_directory(trie_db_path)?;
    Ok(RecoveryOutcome { checkpoint: ConsumerCheckpoint::fresh(), fresh: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::open_db;

    #[test]
    fn create_and_find_usable_anchor_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(open_db(dir.path()).unwrap());
        let store = AnchorStore::new(db);

        store.create_snapshot(10, [1u8; 32], 9, 100).unwrap();
        store.create_snapshot(20, [2u8; 32], 19, 200).unwrap();

        let found = store.find_usable_anchor(15).unwrap().unwrap();
        assert_eq!(found.block_number, 10);

        let found = store.find_usable_anchor(25).unwrap().unwrap();
        assert_eq!(found.block_number, 20);
    }

    #[test]
    fn find_usable_anchor_returns_none_below_first_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(open_db(dir.path()).unwrap());
        let store = AnchorStore::new(db);
        store.create_snapshot(100, [1u8; 32], 99, 0).unwrap();
        assert!(store.find_usable_anchor(50).unwrap().is_none());
    }

    #[test]
    fn strict_recovery_fails_when_no_materialized_anchor_exists() {
        let dir = tempfile::tempdir().unwrap();
        let meta_db = Arc::new(open_db(&dir.path().join("meta")).unwrap());
        let trie_path = dir.path().join("trie");
        let anchors_path = dir.path().join("anchors");
        std::fs::create_dir_all(&trie_path).unwrap();

        let result = run_startup_recovery(meta_db, &trie_path, &anchors_path, ConsumerCheckpoint::fresh(), true);
        assert!(matches!(result, Err(RecoveryError::StrictRecoveryFailed)));
    }

    #[test]
    fn in_trie_anchor_is_preferred_when_the_store_reopens_but_the_checkpoint_root_cannot_be_verified() {
        let dir = tempfile::tempdir().unwrap();
        let meta_db = Arc::new(open_db(&dir.path().join("meta")).unwrap());
        let trie_path = dir.path().join("trie");
        let anchors_path = dir.path().join("anchors");
        {
            let trie_db = std::sync::Arc::new(crate::trie_impl::open_trie_db(&trie_path).unwrap());
            let mut applier = crate::applier::Applier::open(meta_db.clone(), trie_db, crate::types::EMPTY_ROOT).unwrap();
            let account = crate::types::AccountUpdate { address: [1u8; 20], nonce: 1, balance: vec![1], code_hash: [0u8; 32], alive: true };
            let diff = crate::types::QueuedDiff { accounts: vec![account], storage: vec![], codes: vec![] };
            let root = applier.apply_diff(diff, None, 5).unwrap();
            applier.commit_at(crate::types::EMPTY_ROOT, 5).unwrap();
            let store = AnchorStore::new(meta_db.clone());
            store.create_snapshot(5, root, 5, 0).unwrap();
        }

        // Checkpoint claims a later block/root than anything actually
        // committed, simulating the expected root having gone missing.
        let checkpoint = ConsumerCheckpoint {
            applied_seq: 9,
            applied_block: 9,
            applied_root: [0xAB; 32],
            pending_seq: 0,
            pending_status: crate::types::PendingStatus::None,
            pending_updated_at: 0,
        };
        let outcome = run_startup_recovery(meta_db, &trie_path, &anchors_path, checkpoint, false).unwrap();
        assert_eq!(outcome.checkpoint.applied_block, 5);
        assert!(!outcome.fresh);
    }
}
