//! Core data model: outbox envelopes, decoded diffs, reorg markers, the
//! durable consumer checkpoint, and the selectors used by the query path.
//!
//! Shapes follow the wire format in spec §3/§6: accounts sorted by address,
//! storage sorted by `(address, slot)`, codes sorted by address, within a
//! payload that has already been length-delimited and decoded by the
//! caller (decoding itself lives in `outbox::decode_envelope`).

use serde::{Deserialize, Serialize};

pub type Address = [u8; 20];
pub type Hash32 = [u8; 32];

/// Highest seq is always retained; `Seq` intentionally has no signed variant
/// so that `processedSeq + 1` overflow is a deliberate, detectable panic
/// rather than silent wraparound.
pub type Seq = u64;
pub type BlockNumber = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Diff,
    Reorg,
}

/// The envelope as read off the outbox, before payload decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub seq: Seq,
    pub version: u16,
    pub kind: EventKind,
    pub block_number: BlockNumber,
    pub block_hash: Hash32,
    pub parent_hash: Hash32,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub address: Address,
    pub nonce: u64,
    /// Must fit in 128 bits; rejecting wider values is an applier-level
    /// invariant (spec §4.2), not something this type enforces structurally
    /// since the wire format can carry an arbitrary-precision integer.
    pub balance: Vec<u8>,
    pub code_hash: Hash32,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUpdate {
    pub address: Address,
    pub slot: Hash32,
    pub value: Hash32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUpdate {
    pub address: Address,
    pub code_hash: Hash32,
    pub code: Vec<u8>,
}

/// A decoded, not-yet-coalesced per-block delta. Lists may contain
/// duplicates produced by intra-block coalescing upstream (spec §3); the
/// Applier is responsible for calling `coalesce::coalesce_diff` before
/// writing anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuedDiff {
    pub accounts: Vec<AccountUpdate>,
    pub storage: Vec<StorageUpdate>,
    pub codes: Vec<CodeUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorgMarker {
    pub from_number: BlockNumber,
    pub from_hash: Hash32,
    pub to_number: BlockNumber,
    pub to_hash: Hash32,
    pub ancestor_number: BlockNumber,
    pub ancestor_hash: Hash32,
}

impl ReorgMarker {
    /// `ancestorNumber <= fromNumber` and `ancestorNumber <= toNumber` (spec §3).
    pub fn is_well_formed(&self) -> bool {
        self.ancestor_number <= self.from_number && self.ancestor_number <= self.to_number
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStatus {
    None,
    InFlight,
}

/// The single durable record described in spec §3. Exactly one instance
/// persists at `kv::CONSUMER_STATE_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerCheckpoint {
    pub applied_seq: Seq,
    pub applied_block: BlockNumber,
    pub applied_root: Hash32,
    pub pending_seq: Seq,
    pub pending_status: PendingStatus,
    pub pending_updated_at: u64,
}

impl ConsumerCheckpoint {
    pub fn fresh() -> Self {
        Self {
            applied_seq: 0,
            applied_block: 0,
            applied_root: EMPTY_ROOT,
            pending_seq: 0,
            pending_status: PendingStatus::None,
            pending_updated_at: 0,
        }
    }
}

/// Sentinel substituted for "no trie yet" on the very first commit (spec §4.2).
pub const EMPTY_ROOT: Hash32 = [0u8; 32];

/// A block selector as accepted by the query RPC (spec §4.6/§6).
#[derive(Debug, Clone, Copy)]
pub enum BlockSelector {
    Latest,
    Number(BlockNumber),
    Hash { hash: Hash32, require_canonical: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Tail,
    BackfillDirect,
}

/// `(blockHash, parentHash)` as stored by the canonical block index (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CanonicalBlock {
    pub hash: Hash32,
    pub parent_hash: Hash32,
}

/// In-trie pointer to a previously committed root, for fast revert (spec §3/§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSnapshot {
    pub index: u64,
    pub block_number: BlockNumber,
    pub block_root: Hash32,
    pub seq: Seq,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAnchorState {
    Building,
    Ready,
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAnchorManifest {
    pub anchor_id: u64,
    pub seq: Seq,
    pub block_number: BlockNumber,
    pub block_root: Hash32,
    pub created_at: u64,
    pub format_version: u16,
    pub state: RecoveryAnchorState,
}
