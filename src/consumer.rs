//! Consumer (spec §4.3): the per-event state machine. `consume_next`
//! advances by exactly one outbox event, applying the crash-consistency
//! protocol (mark pending in-flight, mutate, commit) and the implicit- and
//! marker-driven reorg paths. The Runner drives this in a loop; this module
//! owns no loop of its own.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rocksdb::DB;

use crate::applier::Applier;
use crate::batch::AtomicBatchWriter;
use crate::config::AppConfig;
use crate::error::{ApplierError, ConsumerError};
use crate::kv::{self, block_hash_to_number_key, block_root_key, canonical_block_key, CF_BLOCKS, CF_META, CONSUMER_STATE_KEY};
use crate::metrics::{APPLIED_BLOCK, APPLIED_SEQ, COMMITS_TOTAL, COMMIT_DURATION, EVENTS_APPLIED, OUTBOX_LAG, REORGS_TOTAL};
use crate::outbox::{decode_diff_payload, decode_reorg_payload, OutboxReader};
use crate::recovery::{AnchorStore, MaterializedAnchorStore};
use crate::replay::ReplayClient;
use crate::slot_index::SlotIndex;
use crate::types::{BlockNumber, CanonicalBlock, ConsumerCheckpoint, EventKind, Hash32, OutboxEnvelope, PendingStatus, QueuedDiff, ReorgMarker, Seq};
use crate::validator::{is_sampled_block, ValidationMode, Validator};

fn now_unix() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// In-memory fields layered on top of the durable `ConsumerCheckpoint` (spec
/// §3/§4.3): `processed_seq` advances ahead of `applied_seq` within an
/// uncommitted batch; `None` means "fresh daemon, no checkpoint yet" (spec
/// §4.3 step 1 wrap sentinel).
struct ConsumerState {
    processed_seq: Option<Seq>,
    /// The durably-committed seq: only mutated in `commit()` and
    /// `handle_reorg_event()`, never inside an uncommitted batch. This is
    /// what `applied_seq()` reports -- `processed_seq` can run ahead of it
    /// while a batch is in flight, and callers computing a safe outbox
    /// compaction floor must never compact past what is actually durable.
    durable_seq: Option<Seq>,
    applied_block: BlockNumber,
    applied_root: Hash32,
    applied_block_hash: Hash32,
    last_block_hash: Option<(BlockNumber, Hash32)>,
    uncommitted_blocks: u64,
    last_commit_at: Instant,
    /// `(block, hash, parent_hash, root)` for every block applied since the
    /// last commit, in order; stride-filtered when written (spec §4.3
    /// "adaptive block-root stride").
    pending_block_roots: Vec<(BlockNumber, Hash32, Hash32, Hash32)>,
    pending_block: BlockNumber,
    pending_hash: Hash32,
    last_diff_for_validation: Option<(BlockNumber, Hash32, QueuedDiff)>,
    reorg_count: u64,
    outbox_lag: u64,
}

pub struct Consumer {
    meta_db: Arc<DB>,
    trie_db_path: PathBuf,
    applier: Applier,
    slot_index: Option<SlotIndex>,
    anchor_store: AnchorStore,
    materialized_anchors: MaterializedAnchorStore,
    outbox: OutboxReader,
    replay: Option<Arc<ReplayClient>>,
    validator: Validator,
    config: AppConfig,
    state: ConsumerState,
    prefetch: VecDeque<OutboxEnvelope>,
}

impl Consumer {
    /// `trie_db` must already be open at `checkpoint.applied_root`'s
    /// directory; the startup recovery ladder (`recovery::run_startup_recovery`)
    /// is expected to have run already if the initial open failed, with
    /// `checkpoint`/`fresh` reflecting its outcome.
    pub fn new(
        meta_db: Arc<DB>,
        trie_db: Arc<DB>,
        trie_db_path: PathBuf,
        anchors_root: PathBuf,
        config: AppConfig,
        checkpoint: ConsumerCheckpoint,
        fresh: bool,
    ) -> Result<Self, ConsumerError> {
        if checkpoint.pending_status == PendingStatus::InFlight {
            // Crash between "mark pending" and "commit" (spec §4.4
            // crash-consistency protocol): clear the stale marker now so the
            // next `consume_next` naturally retargets the same seq.
            let cleared = ConsumerCheckpoint { pending_seq: 0, pending_status: PendingStatus::None, pending_updated_at: 0, ..checkpoint.clone() };
            let cf = meta_db.cf_handle(CF_META).ok_or_else(|| ConsumerError::InvariantViolation("meta cf missing".into()))?;
            let bytes = kv::encode_checkpoint(&cleared).map_err(ConsumerError::from)?;
            meta_db.put_cf(&cf, CONSUMER_STATE_KEY, &bytes).map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))?;
        }

        let applier = Applier::open(meta_db.clone(), trie_db, checkpoint.applied_root).map_err(ConsumerError::from)?;
        let slot_index = if config.slot_index_enabled {
            Some(SlotIndex::load(meta_db.clone(), config.cancun_block).map_err(ConsumerError::from)?)
        } else {
            None
        };
        let anchor_store = AnchorStore::new(meta_db.clone());
        let materialized_anchors = MaterializedAnchorStore::new(trie_db_path.clone(), anchors_root);
        let outbox = OutboxReader::new(
            config.outbox_rpc_endpoint.clone(),
            Duration::from_millis(config.rpc_timeout_ms),
            Duration::from_millis(config.reconnect_delay_ms),
        );
        let replay = config
            .archive_rpc_endpoint
            .clone()
            .map(|endpoint| ReplayClient::new(endpoint, Duration::from_millis(config.rpc_timeout_ms)).map(Arc::new))
            .transpose()
            .map_err(ConsumerError::from)?;
        let validator = Validator::new(config.validation_halt_on_mismatch);

        let processed_seq = if fresh { None } else { Some(checkpoint.applied_seq) };
        let state = ConsumerState {
            processed_seq,
            durable_seq: processed_seq,
            applied_block: checkpoint.applied_block,
            applied_root: checkpoint.applied_root,
            applied_block_hash: [0u8; 32],
            last_block_hash: None,
            uncommitted_blocks: 0,
            last_commit_at: Instant::now(),
            pending_block_roots: Vec::new(),
            pending_block: checkpoint.applied_block,
            pending_hash: [0u8; 32],
            last_diff_for_validation: None,
            reorg_count: 0,
            outbox_lag: 0,
        };

        Ok(Self {
            meta_db,
            trie_db_path,
            applier,
            slot_index,
            anchor_store,
            materialized_anchors,
            outbox,
            replay,
            validator,
            config,
            state,
            prefetch: VecDeque::new(),
        })
    }

    /// The durably-committed seq (spec §4.5 `safeSeq`/§4.6 `status`): never
    /// ahead of the last successful `commit()`, unlike `processed_seq`
    /// which tracks the in-flight batch.
    pub fn applied_seq(&self) -> Seq {
        self.state.durable_seq.unwrap_or(0)
    }

    pub fn applied_block(&self) -> BlockNumber {
        self.state.applied_block
    }

    pub fn applied_root(&self) -> Hash32 {
        self.state.applied_root
    }

    pub fn outbox_lag(&self) -> u64 {
        self.state.outbox_lag
    }

    pub fn reorg_count(&self) -> u64 {
        self.state.reorg_count
    }

    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    pub fn outbox(&self) -> &OutboxReader {
        &self.outbox
    }

    pub fn triedb_state_history(&self) -> u64 {
        self.config.triedb_state_history
    }

    /// Public wrapper for the query facade's selector resolution (spec
    /// §4.6): looks up the committed root for a specific block number.
    pub fn block_root_for(&self, block: BlockNumber) -> Result<Option<Hash32>, ConsumerError> {
        self.block_root_at(block)
    }

    /// Reverse lookup used by the hash-selector resolution path (spec
    /// §4.6): `blockHash -> blockNumber`, then delegates to
    /// `canonical_block_at` to confirm canonicity.
    pub fn block_number_for_hash(&self, hash: &Hash32) -> Result<Option<BlockNumber>, ConsumerError> {
        let cf = self.meta_db.cf_handle(CF_BLOCKS).ok_or_else(|| ConsumerError::InvariantViolation("blocks cf missing".into()))?;
        match self.meta_db.get_cf(&cf, block_hash_to_number_key(hash)).map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))? {
            Some(bytes) if bytes.len() == 8 => Ok(Some(kv::decode_u64(&bytes))),
            Some(_) => Err(ConsumerError::InvariantViolation("corrupt hash-to-number entry".into())),
            None => Ok(None),
        }
    }

    pub fn canonical_block_for(&self, block: BlockNumber) -> Result<Option<CanonicalBlock>, ConsumerError> {
        self.canonical_block_at(block)
    }

    pub async fn refresh_lag(&mut self) -> Result<(), ConsumerError> {
        let latest = self.outbox.latest_seq().await.map_err(ConsumerError::from)?;
        let processed = self.state.processed_seq.unwrap_or(0);
        self.state.outbox_lag = latest.saturating_sub(processed);
        OUTBOX_LAG.set(self.state.outbox_lag as i64);
        Ok(())
    }

    pub async fn compact_outbox_below(&self, safe_seq: Seq) -> Result<(u64, Seq), ConsumerError> {
        self.outbox.compact_below(safe_seq).await.map_err(ConsumerError::from)
    }

    /// Drops stale per-block root and canonical-block entries below
    /// `floor_block` (spec §4.5 maintenance loop).
    pub fn prune_stale_indices_below(&mut self, floor_block: BlockNumber) -> Result<u64, ConsumerError> {
        let cf = self.meta_db.cf_handle(CF_BLOCKS).ok_or_else(|| ConsumerError::InvariantViolation("blocks cf missing".into()))?;
        let prefix = b"UBTBlockRoot/";
        let iter = self.meta_db.prefix_iterator_cf(&cf, prefix);
        let mut batch = AtomicBatchWriter::new(&self.meta_db);
        let mut pruned = 0u64;
        for item in iter {
            let (key, _) = item.map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))?;
            if !key.starts_with(prefix) {
                break;
            }
            let number = kv::decode_u64(&key[prefix.len()..]);
            if number >= floor_block {
                break;
            }
            batch.delete_cf(CF_BLOCKS, &key).map_err(ConsumerError::from)?;
            batch.delete_cf(CF_BLOCKS, &canonical_block_key(number)).map_err(ConsumerError::from)?;
            pruned += 1;
        }
        if !batch.is_empty() {
            batch.commit().map_err(ConsumerError::from)?;
        }
        Ok(pruned)
    }

    pub fn prune_slot_index_if_safe(&mut self, current_block: BlockNumber, state_history: u64) -> Result<(), ConsumerError> {
        if let Some(index) = self.slot_index.as_mut() {
            index.prune_if_safe(current_block, state_history).map_err(ConsumerError::from)?;
        }
        Ok(())
    }

    fn target_seq(&self) -> Seq {
        self.state.processed_seq.map(|s| s + 1).unwrap_or(0)
    }

    fn read_ahead_window(&self) -> u64 {
        let base = self.config.outbox_read_ahead as u64;
        if base == 0 {
            return 1;
        }
        let threshold = self.config.backpressure_lag_threshold;
        if threshold == 0 {
            return base;
        }
        let ratio = (self.state.outbox_lag / threshold).min(8);
        base.saturating_mul(1 + ratio).max(1)
    }

    async fn next_envelope(&mut self, target_seq: Seq) -> Result<Option<OutboxEnvelope>, ConsumerError> {
        if let Some(front) = self.prefetch.front() {
            if front.seq == target_seq {
                return Ok(self.prefetch.pop_front());
            }
            self.prefetch.clear();
        }

        let window = self.read_ahead_window();
        if window <= 1 {
            return self.outbox.read_event(target_seq).await.map_err(ConsumerError::from);
        }

        let to = target_seq + window - 1;
        let mut events = VecDeque::from(self.outbox.read_range(target_seq, to).await.map_err(ConsumerError::from)?);
        match events.front() {
            Some(first) if first.seq == target_seq => {
                let head = events.pop_front();
                self.prefetch = events;
                Ok(head)
            }
            _ => Ok(None),
        }
    }

    /// Attempts to advance by exactly one event (spec §4.3 `ConsumeNext`).
    pub async fn consume_next(&mut self) -> Result<(), ConsumerError> {
        let target_seq = self.target_seq();
        let envelope = match self.next_envelope(target_seq).await? {
            Some(envelope) => envelope,
            None => return self.handle_no_event(target_seq).await,
        };

        match envelope.kind {
            EventKind::Diff => {
                if self.detect_implicit_reorg(&envelope) {
                    return Ok(());
                }
                self.handle_diff(target_seq, envelope).await
            }
            EventKind::Reorg => self.handle_reorg_event(target_seq, envelope).await,
        }
    }

    async fn handle_no_event(&mut self, target_seq: Seq) -> Result<(), ConsumerError> {
        if self.state.processed_seq.is_none() {
            let lowest = self.outbox.lowest_seq().await.map_err(ConsumerError::from)?;
            if lowest > 0 {
                // The one place allowed to silently advance processedSeq
                // without applying an event (spec §4.4).
                self.state.processed_seq = Some(lowest - 1);
                self.state.durable_seq = Some(lowest - 1);
                let checkpoint = ConsumerCheckpoint {
                    applied_seq: lowest - 1,
                    applied_block: self.state.applied_block,
                    applied_root: self.state.applied_root,
                    pending_seq: 0,
                    pending_status: PendingStatus::None,
                    pending_updated_at: 0,
                };
                self.persist_checkpoint(&checkpoint)?;
                return Ok(());
            }
        }

        let lowest = self.outbox.lowest_seq().await.map_err(ConsumerError::from)?;
        if target_seq < lowest {
            return Err(ConsumerError::OutboxGap { required_seq: target_seq, retained_floor: lowest });
        }
        Err(ConsumerError::NoEventAvailable)
    }

    /// Spec §4.3 step 4: abort without advancing when a diff's parent hash
    /// doesn't match the last in-memory block hash.
    fn detect_implicit_reorg(&mut self, envelope: &OutboxEnvelope) -> bool {
        if let Some((_, last_hash)) = self.state.last_block_hash {
            if envelope.parent_hash != last_hash {
                let _ = self.applier.revert(self.state.applied_root);
                self.state.uncommitted_blocks = 0;
                self.state.pending_block_roots.clear();
                self.state.last_block_hash = Some((self.state.applied_block, self.state.applied_block_hash));
                self.state.reorg_count += 1;
                REORGS_TOTAL.with_label_values(&["implicit"]).inc();
                return true;
            }
        }
        false
    }

    fn persist_checkpoint(&self, checkpoint: &ConsumerCheckpoint) -> Result<(), ConsumerError> {
        let mut batch = AtomicBatchWriter::new(&self.meta_db);
        let bytes = kv::encode_checkpoint(checkpoint).map_err(ConsumerError::from)?;
        batch.put_meta(CONSUMER_STATE_KEY, &bytes).map_err(ConsumerError::from)?;
        batch.commit().map_err(ConsumerError::from)
    }

    fn should_validate_strict(&self, block: BlockNumber) -> bool {
        if self.config.backpressure_lag_threshold == 0 || self.state.outbox_lag <= self.config.backpressure_lag_threshold {
            return true;
        }
        is_sampled_block(block, self.config.validation_sample_rate)
    }

    async fn handle_diff(&mut self, target_seq: Seq, envelope: OutboxEnvelope) -> Result<(), ConsumerError> {
        let diff = decode_diff_payload(&envelope).map_err(ConsumerError::from)?;

        let pending_checkpoint = ConsumerCheckpoint {
            applied_seq: self.state.processed_seq.unwrap_or(0),
            applied_block: self.state.applied_block,
            applied_root: self.state.applied_root,
            pending_seq: target_seq,
            pending_status: PendingStatus::InFlight,
            pending_updated_at: now_unix(),
        };
        self.persist_checkpoint(&pending_checkpoint)?;

        // Validate-only mode (spec.md §8 scenario 6): advance AppliedSeq/
        // AppliedBlock exactly as a real apply would, but never touch the
        // trie, so AppliedRoot stays pinned at whatever it already was.
        // Comparing the local trie against the diff would be meaningless
        // here since nothing was written, so only the archive cross-check
        // runs, and it runs unconditionally rather than sampled/gated.
        if self.config.validate_only {
            if let Some(replay) = self.replay.clone() {
                self.validator.validate_against_archive(&replay, envelope.block_number, &diff).await?;
            }
            let root = self.state.applied_root;
            self.state.pending_block = envelope.block_number;
            self.state.pending_hash = envelope.block_hash;
            self.state.last_block_hash = Some((envelope.block_number, envelope.block_hash));
            self.state.pending_block_roots.push((envelope.block_number, envelope.block_hash, envelope.parent_hash, root));
            self.state.last_diff_for_validation = None;

            self.state.processed_seq = Some(target_seq);
            self.state.uncommitted_blocks += 1;

            if self.should_commit() {
                self.commit().await?;
            }

            return Ok(());
        }

        let root = self
            .applier
            .apply_diff(diff.clone(), self.slot_index.as_mut(), envelope.block_number)
            .map_err(ConsumerError::from)?;
        EVENTS_APPLIED.with_label_values(&["diff"]).inc();

        self.state.pending_block = envelope.block_number;
        self.state.pending_hash = envelope.block_hash;
        self.state.last_block_hash = Some((envelope.block_number, envelope.block_hash));
        self.state.pending_block_roots.push((envelope.block_number, envelope.block_hash, envelope.parent_hash, root));
        self.state.last_diff_for_validation = Some((envelope.block_number, root, diff.clone()));

        if self.config.validation_strict && self.should_validate_strict(envelope.block_number) {
            self.validator.validate_against_diff(&self.applier, root, envelope.block_number, &diff, ValidationMode::Strict)?;
            if let Some(replay) = self.replay.clone() {
                self.validator.validate_against_archive(&replay, envelope.block_number, &diff).await?;
            }
        }

        self.state.processed_seq = Some(target_seq);
        self.state.uncommitted_blocks += 1;

        if self.should_commit() {
            self.commit().await?;
        }

        Ok(())
    }

    fn commit_caps(&self) -> (u64, u64) {
        if self.config.backpressure_lag_threshold > 0 && self.state.outbox_lag > self.config.backpressure_lag_threshold {
            (self.config.apply_commit_interval.min(128), self.config.apply_commit_max_latency_ms.min(15_000))
        } else {
            (self.config.apply_commit_interval, self.config.apply_commit_max_latency_ms)
        }
    }

    fn should_commit(&self) -> bool {
        let (interval_cap, latency_cap_ms) = self.commit_caps();
        self.state.uncommitted_blocks >= interval_cap || self.state.last_commit_at.elapsed() >= Duration::from_millis(latency_cap_ms)
    }

    fn block_root_stride(&self) -> u64 {
        let threshold = self.config.backpressure_lag_threshold;
        let base = self.config.block_root_index_stride_high_lag.max(1);
        if threshold == 0 {
            return base;
        }
        let ratio = self.state.outbox_lag / threshold;
        match ratio {
            r if r >= 128 => 4096,
            r if r >= 64 => 2048,
            r if r >= 32 => 1024,
            r if r >= 16 => 256,
            r if r >= 8 => 128,
            r if r >= 4 => 64,
            _ => base,
        }
    }

    /// Spec §4.3 "commit procedure".
    async fn commit(&mut self) -> Result<(), ConsumerError> {
        let started = Instant::now();
        let committed_root = self.applier.commit_at(self.state.applied_root, self.state.pending_block).map_err(ConsumerError::from)?;

        let mut batch = AtomicBatchWriter::new(&self.meta_db);
        let stride = self.block_root_stride();
        let last_index = self.state.pending_block_roots.len().saturating_sub(1);
        for (i, (block, hash, parent_hash, root)) in self.state.pending_block_roots.iter().enumerate() {
            let unconditional = i == last_index;
            if unconditional || stride <= 1 || block % stride == 0 {
                batch.put_cf(CF_BLOCKS, &block_root_key(*block), root).map_err(ConsumerError::from)?;
                let canonical = CanonicalBlock { hash: *hash, parent_hash: *parent_hash };
                let canonical_bytes =
                    bincode::serialize(&canonical).map_err(|e| ConsumerError::from(ApplierError::Serialization(e.to_string())))?;
                batch.put_cf(CF_BLOCKS, &canonical_block_key(*block), &canonical_bytes).map_err(ConsumerError::from)?;
                batch.put_cf(CF_BLOCKS, &block_hash_to_number_key(hash), &kv::encode_u64(*block)).map_err(ConsumerError::from)?;
            }
        }

        let checkpoint = ConsumerCheckpoint {
            applied_seq: self.state.processed_seq.unwrap_or(0),
            applied_block: self.state.pending_block,
            applied_root: committed_root,
            pending_seq: 0,
            pending_status: PendingStatus::None,
            pending_updated_at: 0,
        };
        let checkpoint_bytes = kv::encode_checkpoint(&checkpoint).map_err(ConsumerError::from)?;
        batch.put_meta(CONSUMER_STATE_KEY, &checkpoint_bytes).map_err(ConsumerError::from)?;
        batch.commit().map_err(ConsumerError::from)?;

        self.state.applied_root = committed_root;
        self.state.applied_block = self.state.pending_block;
        self.state.applied_block_hash = self.state.pending_hash;
        self.state.durable_seq = Some(checkpoint.applied_seq);
        self.state.uncommitted_blocks = 0;
        self.state.last_commit_at = Instant::now();
        self.state.pending_block_roots.clear();

        COMMITS_TOTAL.inc();
        APPLIED_SEQ.set(checkpoint.applied_seq as i64);
        APPLIED_BLOCK.set(checkpoint.applied_block as i64);
        COMMIT_DURATION.observe(started.elapsed().as_secs_f64());

        if let Some((block, root, diff)) = self.state.last_diff_for_validation.take() {
            if !self.config.validation_strict && is_sampled_block(block, self.config.validation_sample_rate) {
                self.validator.validate_against_diff(&self.applier, root, block, &diff, ValidationMode::Sampled)?;
                if let Some(replay) = self.replay.clone() {
                    self.validator.validate_against_archive(&replay, block, &diff).await?;
                }
            }
        }

        if self.config.anchor_snapshot_interval > 0 && self.state.applied_block % self.config.anchor_snapshot_interval == 0 {
            self.anchor_store
                .create_snapshot(self.state.applied_block, committed_root, checkpoint.applied_seq, now_unix())
                .map_err(ConsumerError::from)?;
        }

        Ok(())
    }

    fn block_root_at(&self, block: BlockNumber) -> Result<Option<Hash32>, ConsumerError> {
        let cf = self.meta_db.cf_handle(CF_BLOCKS).ok_or_else(|| ConsumerError::InvariantViolation("blocks cf missing".into()))?;
        match self.meta_db.get_cf(&cf, block_root_key(block)).map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))? {
            Some(bytes) if bytes.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(Some(out))
            }
            Some(_) => Err(ConsumerError::InvariantViolation("corrupt block root entry".into())),
            None => Ok(None),
        }
    }

    fn canonical_block_at(&self, block: BlockNumber) -> Result<Option<CanonicalBlock>, ConsumerError> {
        let cf = self.meta_db.cf_handle(CF_BLOCKS).ok_or_else(|| ConsumerError::InvariantViolation("blocks cf missing".into()))?;
        match self.meta_db.get_cf(&cf, canonical_block_key(block)).map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))? {
            Some(bytes) => {
                let decoded = bincode::deserialize(&bytes).map_err(|e| ConsumerError::from(ApplierError::Serialization(e.to_string())))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    async fn handle_reorg_event(&mut self, target_seq: Seq, envelope: OutboxEnvelope) -> Result<(), ConsumerError> {
        let marker = decode_reorg_payload(&envelope).map_err(ConsumerError::from)?;
        if !marker.is_well_formed() {
            return Err(ConsumerError::InvariantViolation(format!("malformed reorg marker at seq {target_seq}")));
        }

        let pending_checkpoint = ConsumerCheckpoint {
            applied_seq: self.state.processed_seq.unwrap_or(0),
            applied_block: self.state.applied_block,
            applied_root: self.state.applied_root,
            pending_seq: target_seq,
            pending_status: PendingStatus::InFlight,
            pending_updated_at: now_unix(),
        };
        self.persist_checkpoint(&pending_checkpoint)?;

        self.handle_reorg(&marker).await?;

        self.state.processed_seq = Some(target_seq);
        self.state.durable_seq = Some(target_seq);
        let checkpoint = ConsumerCheckpoint {
            applied_seq: target_seq,
            applied_block: self.state.applied_block,
            applied_root: self.state.applied_root,
            pending_seq: 0,
            pending_status: PendingStatus::None,
            pending_updated_at: 0,
        };
        self.persist_checkpoint(&checkpoint)?;
        EVENTS_APPLIED.with_label_values(&["reorg"]).inc();
        Ok(())
    }

    /// Spec §4.3 `handleReorg`.
    async fn handle_reorg(&mut self, marker: &ReorgMarker) -> Result<(), ConsumerError> {
        let ancestor_block = marker.ancestor_number;
        if ancestor_block > marker.from_number {
            return Err(ConsumerError::InvariantViolation("reorg ancestor above fromNumber".into()));
        }

        if let Some(local_hash) = self.canonical_block_at(ancestor_block)?.map(|c| c.hash) {
            if local_hash != marker.ancestor_hash {
                tracing::warn!(ancestor_block, "local canonical hash mismatch at reorg ancestor");
            }
        }

        let depth = marker.from_number.saturating_sub(ancestor_block);
        if depth > self.config.max_recoverable_reorg_depth {
            return Err(ConsumerError::ReorgManualRequired { depth, max: self.config.max_recoverable_reorg_depth });
        }

        if let Some(ancestor_root) = self.block_root_at(ancestor_block)? {
            let old_applied_block = self.state.applied_block;
            self.applier.revert(ancestor_root).map_err(ConsumerError::from)?;

            let mut batch = AtomicBatchWriter::new(&self.meta_db);
            for block in (ancestor_block + 1)..=old_applied_block {
                if let Some(canonical) = self.canonical_block_at(block)? {
                    batch.delete_cf(CF_BLOCKS, &block_hash_to_number_key(&canonical.hash)).map_err(ConsumerError::from)?;
                }
                batch.delete_cf(CF_BLOCKS, &block_root_key(block)).map_err(ConsumerError::from)?;
                batch.delete_cf(CF_BLOCKS, &canonical_block_key(block)).map_err(ConsumerError::from)?;
            }
            if !batch.is_empty() {
                batch.commit().map_err(ConsumerError::from)?;
            }

            self.state.applied_root = ancestor_root;
            self.state.applied_block = ancestor_block;
            self.state.applied_block_hash = marker.ancestor_hash;
            self.state.last_block_hash = Some((ancestor_block, marker.ancestor_hash));
            self.state.uncommitted_blocks = 0;
            self.state.pending_block_roots.clear();
            REORGS_TOTAL.with_label_values(&["ancestor_known"]).inc();
            return Ok(());
        }

        if depth <= self.state.uncommitted_blocks {
            self.applier.revert(self.state.applied_root).map_err(ConsumerError::from)?;
            self.state.uncommitted_blocks = 0;
            self.state.pending_block_roots.clear();
            self.state.last_block_hash = Some((self.state.applied_block, self.state.applied_block_hash));
            REORGS_TOTAL.with_label_values(&["uncommitted_batch"]).inc();
            return Ok(());
        }

        if let Some(replay) = self.replay.clone() {
            self.restore_from_anchor_and_replay(ancestor_block, marker.ancestor_hash, replay).await?;
            REORGS_TOTAL.with_label_values(&["archive_replay"]).inc();
            return Ok(());
        }

        Err(ConsumerError::ReorgReplayRequired { ancestor_block })
    }

    /// Spec §4.3 `restoreFromAnchor` + forward replay from the archive.
    /// Reopening the trie DB handle requires dropping the live `Applier`
    /// first -- swapping the directory under an open RocksDB handle is not
    /// supported, so the old `Applier` (and its `Arc<DB>`) must be replaced
    /// before `materialized_anchors.restore` renames the directory.
    async fn restore_from_anchor_and_replay(
        &mut self,
        ancestor_block: BlockNumber,
        ancestor_hash: Hash32,
        replay: Arc<ReplayClient>,
    ) -> Result<(), ConsumerError> {
        let manifest = self
            .materialized_anchors
            .latest_ready(&self.meta_db)
            .map_err(ConsumerError::from)?
            .filter(|m| m.block_number <= ancestor_block)
            .ok_or(ConsumerError::ReorgReplayRequired { ancestor_block })?;

        let placeholder_db = crate::trie_impl::open_trie_db(&self.trie_db_path).map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))?;
        let placeholder = Applier::open(self.meta_db.clone(), Arc::new(placeholder_db), crate::types::EMPTY_ROOT).map_err(ConsumerError::from)?;
        drop(std::mem::replace(&mut self.applier, placeholder));

        self.materialized_anchors.restore(manifest.anchor_id).map_err(ConsumerError::from)?;

        let reopened = crate::trie_impl::open_trie_db(&self.trie_db_path).map_err(|e| ConsumerError::from(ApplierError::DiskKv(e)))?;
        self.applier = Applier::open(self.meta_db.clone(), Arc::new(reopened), manifest.block_root).map_err(ConsumerError::from)?;

        let mut cursor_block = manifest.block_number;
        let mut cursor_root = manifest.block_root;
        while cursor_block < ancestor_block {
            let next_block = cursor_block + 1;
            let diff = replay.diff_for_block(next_block).await.map_err(ConsumerError::from)?;
            self.applier.apply_diff(diff, self.slot_index.as_mut(), next_block).map_err(ConsumerError::from)?;
            cursor_root = self.applier.commit_at(cursor_root, next_block).map_err(ConsumerError::from)?;
            cursor_block = next_block;
        }

        self.state.applied_root = cursor_root;
        self.state.applied_block = ancestor_block;
        self.state.applied_block_hash = ancestor_hash;
        self.state.last_block_hash = Some((ancestor_block, ancestor_hash));
        self.state.uncommitted_blocks = 0;
        self.state.pending_block_roots.clear();
        Ok(())
    }

    /// Spec §4.2 `Close`/§5 shutdown sequence: "final commit if safe,
    /// journal trie, close stores". Commits any uncommitted batch first so
    /// a clean shutdown never discards work the daemon already applied,
    /// then journals the trie through the Applier.
    pub async fn close(mut self) -> Result<(), ConsumerError> {
        if self.state.uncommitted_blocks > 0 {
            self.commit().await?;
        }
        self.applier.close().map_err(ConsumerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(datadir: std::path::PathBuf) -> AppConfig {
        AppConfig {
            outbox_rpc_endpoint: "http://127.0.0.1:1".into(),
            archive_rpc_endpoint: None,
            datadir,
            apply_commit_interval: 4,
            apply_commit_max_latency_ms: 5_000,
            bootstrap_mode: crate::types::BootstrapMode::Tail,
            triedb_scheme: "path".into(),
            triedb_state_history: 1024,
            max_recoverable_reorg_depth: 64,
            backpressure_lag_threshold: 1000,
            outbox_read_ahead: 4,
            block_root_index_stride_high_lag: 64,
            anchor_snapshot_interval: 1000,
            recovery_anchor_interval: 10_000,
            recovery_strict: false,
            slot_index_enabled: false,
            cancun_block: 0,
            validation_strict: false,
            validation_halt_on_mismatch: false,
            validation_sample_rate: 100,
            validate_only: false,
            query_rpc_enabled: false,
            query_rpc_listen_addr: "0.0.0.0:0".into(),
            execution_class_rpc_enabled: false,
            rpc_timeout_ms: 1_000,
            reconnect_delay_ms: 1_000,
            compaction_safety_margin: 64,
            compaction_interval_secs: 30,
        }
    }

    fn new_consumer(dir: &tempfile::TempDir) -> Consumer {
        let meta_db = Arc::new(crate::kv::open_db(&dir.path().join("meta")).unwrap());
        let trie_db_path = dir.path().join("trie");
        let trie_db = Arc::new(crate::trie_impl::open_trie_db(&trie_db_path).unwrap());
        let anchors_root = dir.path().join("anchors");
        let config = base_config(dir.path().to_path_buf());
        Consumer::new(meta_db, trie_db, trie_db_path, anchors_root, config, ConsumerCheckpoint::fresh(), true).unwrap()
    }

    #[test]
    fn fresh_consumer_targets_seq_zero() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = new_consumer(&dir);
        assert_eq!(consumer.target_seq(), 0);
    }

    #[test]
    fn implicit_reorg_is_detected_on_parent_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer = new_consumer(&dir);
        consumer.state.last_block_hash = Some((5, [9u8; 32]));
        let envelope = OutboxEnvelope {
            seq: 6,
            version: 1,
            kind: EventKind::Diff,
            block_number: 6,
            block_hash: [1u8; 32],
            parent_hash: [2u8; 32],
            timestamp: 0,
            payload: vec![],
        };
        assert!(consumer.detect_implicit_reorg(&envelope));
        assert_eq!(consumer.reorg_count(), 1);
    }

    #[test]
    fn block_root_stride_escalates_under_heavy_lag() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer = new_consumer(&dir);
        assert_eq!(consumer.block_root_stride(), 64);
        consumer.state.outbox_lag = 1000 * 130;
        assert_eq!(consumer.block_root_stride(), 4096);
    }
}
