//! Sentinel error taxonomy (spec §7). The Runner pattern-matches on these
//! variants rather than parsing strings, which is the one place this crate
//! generalizes the teacher's `MyError`/`Box<dyn Error>` idiom into a typed
//! `thiserror` hierarchy — the Consumer's contract specifically requires
//! distinguishing fatal-vs-transient-vs-idle by kind (see SPEC_FULL §0.2).

use crate::types::{BlockNumber, Hash32, Seq};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("no event available")]
    NoEventAvailable,

    #[error("outbox gap: required seq {required_seq} below retained floor {retained_floor}")]
    OutboxGap { required_seq: Seq, retained_floor: Seq },

    #[error("validation halt at block {block}, address {}: expected balance {expected:x?}, got {actual:x?}", hex::encode(address))]
    ValidationHalt {
        block: BlockNumber,
        address: crate::types::Address,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    #[error("reorg depth {depth} exceeds max recoverable depth {max}")]
    ReorgManualRequired { depth: u64, max: u64 },

    #[error("reorg replay required: ancestor root missing for block {ancestor_block} and no replay client configured")]
    ReorgReplayRequired { ancestor_block: BlockNumber },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error(transparent)]
    Applier(#[from] ApplierError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl ConsumerError {
    /// Fatal errors propagate out of the consume loop and terminate the
    /// daemon (spec §4.5); everything else is transient and backed off.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumerError::ValidationHalt { .. }
                | ConsumerError::ReorgManualRequired { .. }
                | ConsumerError::ReorgReplayRequired { .. }
                | ConsumerError::InvariantViolation(_)
        )
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConsumerError::NoEventAvailable)
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, ConsumerError::OutboxGap { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    #[error("balance exceeds 128 bits for address {address:?}")]
    BalanceOverflow { address: [u8; 20] },

    #[error("trie update failed: {0}")]
    TrieUpdate(String),

    #[error("disk kv error: {0}")]
    DiskKv(#[from] rocksdb::Error),

    #[error("requested root not found in layered store: {0:x?}")]
    RootNotFound(Hash32),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("rpc call failed: {0}")]
    Rpc(String),

    #[error("rpc timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed envelope: {0}")]
    Decode(String),

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("trie db unopenable at root {0:x?}")]
    TrieDbUnopenable(Hash32),

    #[error("no usable anchor found for block {0}")]
    NoUsableAnchor(BlockNumber),

    #[error("recovery-strict set and no anchor available: startup failed")]
    StrictRecoveryFailed,

    #[error("anchor manifest corrupt: {0}")]
    CorruptManifest(String),

    #[error("io error during anchor materialization: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("state not yet available for block {0}")]
    NotYetAvailable(BlockNumber),

    #[error("state not available for block {0}")]
    NotAvailable(BlockNumber),

    #[error("unknown block hash")]
    UnknownHash,

    #[error("selector {0} is not a resolvable historical selector")]
    UnsupportedSelector(String),

    #[error("batch size {0} exceeds maximum allowed {1}")]
    BatchTooLarge(usize, usize),

    #[error("applier error: {0}")]
    Applier(#[from] ApplierError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("triedb-state-history ({history}) must be >= max-recoverable-reorg-depth ({depth}) + 64")]
    HistoryTooShort { history: u64, depth: u64 },

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}
