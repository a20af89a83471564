//! Narrow trait boundary onto the binary trie library and the layered node
//! store (spec §1 Non-goals, §9 design note): both are explicitly
//! out-of-scope black boxes here. `applier.rs` is written against these two
//! traits only, never against a concrete trie implementation, so swapping
//! the underlying path-layered scheme never touches the consumer/applier
//! engine.

use std::collections::HashMap;

use crate::error::ApplierError;
use crate::types::{Address, Hash32};

/// A node-set produced by mutating the working trie, handed to the layered
/// store at commit time. Opaque beyond its ability to be registered and
/// replayed; the engine never inspects its contents.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    pub nodes: HashMap<Hash32, Vec<u8>>,
}

impl NodeSet {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A Merkle proof: the set of trie nodes (by hash) needed to verify
/// inclusion/exclusion of a single key against a root.
pub type ProofNodes = HashMap<Hash32, Vec<u8>>;

/// Mutable working view over the trie, opened at a known root (spec §4.2).
pub trait MutableTrie {
    fn update_account(
        &mut self,
        address: &Address,
        nonce: u64,
        balance: &[u8],
        storage_root: Hash32,
        code_hash: Hash32,
        code_len: usize,
    ) -> Result<(), ApplierError>;

    fn delete_account(&mut self, address: &Address) -> Result<(), ApplierError>;

    fn update_storage(&mut self, address: &Address, slot: &Hash32, value: &Hash32) -> Result<(), ApplierError>;

    fn update_contract_code(&mut self, address: &Address, code_hash: &Hash32, code: &[u8]) -> Result<(), ApplierError>;

    /// Current root of the working view, without producing a node-set.
    fn hash(&self) -> Hash32;

    /// Drain the accumulated mutations into a node-set and return the new
    /// root. Does not itself register the node-set with the layered store.
    fn commit(&mut self) -> Result<(Hash32, NodeSet), ApplierError>;

    fn get_balance(&self, address: &Address) -> Result<Option<Vec<u8>>, ApplierError>;
    fn get_nonce(&self, address: &Address) -> Result<Option<u64>, ApplierError>;
    fn get_code_hash(&self, address: &Address) -> Result<Option<Hash32>, ApplierError>;
    fn get_storage(&self, address: &Address, slot: &Hash32) -> Result<Hash32, ApplierError>;

    fn prove(&self, key: &Hash32) -> Result<ProofNodes, ApplierError>;
}

/// Durable, layered node store underneath the working trie (spec §9): a
/// stack of immutable diff layers keyed by root, parented on a prior root.
pub trait LayeredNodeStore {
    /// Register `node_set` as a new layer with root `new_root`, parented on
    /// `parent_root`. Does not flatten any existing layer.
    fn update(
        &mut self,
        new_root: Hash32,
        parent_root: Hash32,
        block: u64,
        node_set: NodeSet,
    ) -> Result<(), ApplierError>;

    /// Open a read-only view of the trie at a previously registered root.
    fn open(&self, root: Hash32) -> Result<Box<dyn MutableTrie + '_>, ApplierError>;

    /// Explicit flatten-to-disk; historical roots above the flattened point
    /// become unreachable (spec §4.2 `Flush`).
    fn flush(&mut self) -> Result<(), ApplierError>;

    /// Journal the current root so the path-layered store can resume on
    /// restart, without flattening (spec §4.2 `Close`, §9 Open Question D2).
    fn journal(&mut self, root: Hash32) -> Result<(), ApplierError>;
}
