//! Default binary trie + layered node store. Spec §1/§9 treat both as
//! external black boxes reached only through `trie::MutableTrie` /
//! `trie::LayeredNodeStore`; this module is the one concrete
//! implementation the daemon ships with: a depth-256 sparse Merkle trie
//! keyed by hashed 32-byte keys (the "unified binary trie" the wire
//! format's `root`/`proofNodes` shapes describe), content-addressed so that
//! registering a diff layer never needs to touch or invalidate older
//! layers -- historical roots simply stay reachable as long as their nodes
//! are still in the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rocksdb::{Options, DB};
use sha2::{Digest, Sha256};

use crate::error::ApplierError;
use crate::trie::{LayeredNodeStore, MutableTrie, NodeSet, ProofNodes};
use crate::types::{Address, Hash32};

const DEPTH: usize = 256;

/// Opens the trie-node store: its own single-purpose RocksDB directory,
/// separate from `kv::open_db`'s metadata store, so a corrupt trie DB can
/// be rotated aside and rebuilt from a materialized anchor without ever
/// touching the checkpoint/anchor/code records recovery depends on.
pub fn open_trie_db(path: &std::path::Path) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    DB::open(&opts, path)
}

fn sha256_32(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn hash_internal(left: &Hash32, right: &Hash32) -> Hash32 {
    sha256_32(&[b"node", left, right])
}

fn hash_leaf(key: &Hash32, value: &[u8]) -> Hash32 {
    sha256_32(&[b"leaf", key, value])
}

pub fn key_for_address(address: &Address) -> Hash32 {
    sha256_32(&[b"account", address])
}

pub fn key_for_slot(address: &Address, slot: &Hash32) -> Hash32 {
    sha256_32(&[b"storage", address, slot])
}

fn bit_at(key: &Hash32, depth: usize) -> bool {
    let byte = key[depth / 8];
    let shift = 7 - (depth % 8);
    (byte >> shift) & 1 == 1
}

fn default_hashes() -> &'static [Hash32; DEPTH + 1] {
    use once_cell::sync::Lazy;
    static DEFAULTS: Lazy<[[u8; 32]; DEPTH + 1]> = Lazy::new(|| {
        let mut defaults = [[0u8; 32]; DEPTH + 1];
        for level in (0..DEPTH).rev() {
            defaults[level] = hash_internal(&defaults[level + 1], &defaults[level + 1]);
        }
        defaults
    });
    &DEFAULTS
}

pub fn empty_root() -> Hash32 {
    default_hashes()[0]
}

#[derive(Debug, Clone)]
pub(crate) enum TrieNode {
    Internal(Hash32, Hash32),
    Leaf(Hash32, Vec<u8>),
}

impl TrieNode {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            TrieNode::Internal(l, r) => {
                let mut buf = Vec::with_capacity(65);
                buf.push(0);
                buf.extend_from_slice(l);
                buf.extend_from_slice(r);
                buf
            }
            TrieNode::Leaf(k, v) => {
                let mut buf = Vec::with_capacity(33 + v.len());
                buf.push(1);
                buf.extend_from_slice(k);
                buf.extend_from_slice(v);
                buf
            }
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<TrieNode, ApplierError> {
        if bytes.is_empty() {
            return Err(ApplierError::Serialization("empty trie node".into()));
        }
        match bytes[0] {
            0 if bytes.len() == 65 => {
                let mut l = [0u8; 32];
                let mut r = [0u8; 32];
                l.copy_from_slice(&bytes[1..33]);
                r.copy_from_slice(&bytes[33..65]);
                Ok(TrieNode::Internal(l, r))
            }
            1 if bytes.len() >= 33 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(&bytes[1..33]);
                Ok(TrieNode::Leaf(k, bytes[33..].to_vec()))
            }
            _ => Err(ApplierError::Serialization("malformed trie node".into())),
        }
    }
}

/// Global content-addressed node store, backed by one RocksDB CF. Nodes are
/// never deleted in the steady path: commit-registered node-sets only add
/// entries, which is what "does not flatten layers" amounts to once
/// addressing is by content hash rather than by layer.
pub struct RocksLayeredStore {
    db: Arc<DB>,
    journaled_root: Mutex<Hash32>,
}

impl RocksLayeredStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db, journaled_root: Mutex::new(empty_root()) }
    }

    fn get_node(&self, hash: &Hash32) -> Result<Option<TrieNode>, ApplierError> {
        if *hash == empty_root() || self.is_default_at_any_depth(hash) {
            return Ok(None);
        }
        match self.db.get(hash).map_err(ApplierError::DiskKv)? {
            Some(bytes) => Ok(Some(TrieNode::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn is_default_at_any_depth(&self, hash: &Hash32) -> bool {
        default_hashes().contains(hash)
    }

    /// Whether `root` is resolvable against this store: either an implicit
    /// default-at-depth hash (always "present", no node written), or an
    /// actual node found on disk. Used by startup recovery to tell a real
    /// root from one the store has simply never seen (spec §4.4 in-trie
    /// anchor verification).
    pub(crate) fn has_root(&self, root: &Hash32) -> Result<bool, ApplierError> {
        if *root == empty_root() || self.is_default_at_any_depth(root) {
            return Ok(true);
        }
        Ok(self.db.get(root).map_err(ApplierError::DiskKv)?.is_some())
    }

    fn put_node(&self, hash: &Hash32, node: &TrieNode) -> Result<(), ApplierError> {
        self.db.put(hash, node.encode()).map_err(ApplierError::DiskKv)
    }
}

impl LayeredNodeStore for RocksLayeredStore {
    fn update(&mut self, new_root: Hash32, _parent_root: Hash32, _block: u64, node_set: NodeSet) -> Result<(), ApplierError> {
        for (hash, bytes) in node_set.nodes.iter() {
            self.db.put(hash, bytes).map_err(ApplierError::DiskKv)?;
        }
        let _ = new_root;
        Ok(())
    }

    fn open(&self, root: Hash32) -> Result<Box<dyn MutableTrie + '_>, ApplierError> {
        Ok(Box::new(WorkingTrie { store: self, root, pending: HashMap::new() }))
    }

    fn flush(&mut self) -> Result<(), ApplierError> {
        self.db.flush().map_err(ApplierError::DiskKv)
    }

    fn journal(&mut self, root: Hash32) -> Result<(), ApplierError> {
        *self.journaled_root.lock().unwrap() = root;
        Ok(())
    }
}

impl RocksLayeredStore {
    pub fn journaled_root(&self) -> Hash32 {
        *self.journaled_root.lock().unwrap()
    }
}

/// Working view over the sparse trie, opened at `root`. Mutations accumulate
/// in `pending` (not yet registered with the layered store) until `commit`.
///
/// `Applier` keeps `pending` alive across multiple applies between commits
/// by holding it itself and handing it in/out of a freshly-borrowed
/// `WorkingTrie` per call, rather than this struct outliving the borrow of
/// `store` it holds -- that would make `Applier` self-referential.
pub(crate) struct WorkingTrie<'a> {
    pub(crate) store: &'a RocksLayeredStore,
    pub(crate) root: Hash32,
    pub(crate) pending: HashMap<Hash32, TrieNode>,
}

impl<'a> WorkingTrie<'a> {
    pub(crate) fn new(store: &'a RocksLayeredStore, root: Hash32, pending: HashMap<Hash32, TrieNode>) -> Self {
        Self { store, root, pending }
    }

    fn lookup(&self, hash: &Hash32) -> Result<Option<TrieNode>, ApplierError> {
        if let Some(node) = self.pending.get(hash) {
            return Ok(Some(node.clone()));
        }
        self.store.get_node(hash)
    }

    /// Returns the leaf value bytes for `key` under `root`, or `None` if
    /// the key has never been written (or was cleared).
    fn read_leaf(&self, key: &Hash32) -> Result<Option<Vec<u8>>, ApplierError> {
        let defaults = default_hashes();
        let mut cur = self.root;
        let mut depth = 0usize;
        while depth < DEPTH {
            if cur == defaults[depth] {
                return Ok(None);
            }
            match self.lookup(&cur)? {
                Some(TrieNode::Internal(l, r)) => {
                    cur = if bit_at(key, depth) { r } else { l };
                    depth += 1;
                }
                Some(TrieNode::Leaf(leaf_key, value)) => {
                    return Ok(if &leaf_key == key { Some(value) } else { None });
                }
                None => return Ok(None),
            }
        }
        if cur == defaults[DEPTH] {
            return Ok(None);
        }
        match self.lookup(&cur)? {
            Some(TrieNode::Leaf(leaf_key, value)) if &leaf_key == key => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Sets (or clears, when `value` is `None`) the leaf at `key`, updating
    /// `self.root` and staging every touched internal/leaf node in
    /// `self.pending`.
    fn write_leaf(&mut self, key: &Hash32, value: Option<Vec<u8>>) -> Result<(), ApplierError> {
        let defaults = default_hashes();

        // Descend, recording the sibling hash at each depth.
        let mut siblings = Vec::with_capacity(DEPTH);
        let mut cur = self.root;
        for depth in 0..DEPTH {
            if cur == defaults[depth] {
                siblings.push(defaults[depth + 1]);
                cur = defaults[depth + 1];
                continue;
            }
            match self.lookup(&cur)? {
                Some(TrieNode::Internal(l, r)) => {
                    if bit_at(key, depth) {
                        siblings.push(l);
                        cur = r;
                    } else {
                        siblings.push(r);
                        cur = l;
                    }
                }
                // A leaf short-circuits the remaining depth; treat the rest
                // of the path as default since this trie always descends to
                // full depth for leaves it writes itself.
                _ => {
                    siblings.push(defaults[depth + 1]);
                    cur = defaults[depth + 1];
                }
            }
        }

        let mut new_cur = match value {
            Some(bytes) => {
                let leaf_hash = hash_leaf(key, &bytes);
                self.pending.insert(leaf_hash, TrieNode::Leaf(*key, bytes));
                leaf_hash
            }
            None => defaults[DEPTH],
        };

        for depth in (0..DEPTH).rev() {
            let sibling = siblings[depth];
            let (left, right) = if bit_at(key, depth) { (sibling, new_cur) } else { (new_cur, sibling) };
            new_cur = hash_internal(&left, &right);
            if new_cur != defaults[depth] {
                self.pending.insert(new_cur, TrieNode::Internal(left, right));
            }
        }

        self.root = new_cur;
        Ok(())
    }
}

impl<'a> MutableTrie for WorkingTrie<'a> {
    fn update_account(
        &mut self,
        address: &Address,
        nonce: u64,
        balance: &[u8],
        storage_root: Hash32,
        code_hash: Hash32,
        code_len: usize,
    ) -> Result<(), ApplierError> {
        let key = key_for_address(address);
        let mut value = Vec::with_capacity(8 + balance.len() + 32 + 32 + 8);
        value.extend_from_slice(&nonce.to_be_bytes());
        value.extend_from_slice(&(balance.len() as u16).to_be_bytes());
        value.extend_from_slice(balance);
        value.extend_from_slice(&storage_root);
        value.extend_from_slice(&code_hash);
        value.extend_from_slice(&(code_len as u64).to_be_bytes());
        self.write_leaf(&key, Some(value))
    }

    fn delete_account(&mut self, address: &Address) -> Result<(), ApplierError> {
        let key = key_for_address(address);
        self.write_leaf(&key, None)
    }

    fn update_storage(&mut self, address: &Address, slot: &Hash32, value: &Hash32) -> Result<(), ApplierError> {
        let key = key_for_slot(address, slot);
        if value == &[0u8; 32] {
            self.write_leaf(&key, None)
        } else {
            self.write_leaf(&key, Some(value.to_vec()))
        }
    }

    fn update_contract_code(&mut self, address: &Address, code_hash: &Hash32, _code: &[u8]) -> Result<(), ApplierError> {
        // Raw code bytes live in the disk KV (`kv::code_key`); the trie only
        // ever records the code hash as part of the account leaf, set by
        // `update_account`. This call exists so callers mutating code and
        // account state in one pass don't need a special case.
        let _ = (address, code_hash);
        Ok(())
    }

    fn hash(&self) -> Hash32 {
        self.root
    }

    fn commit(&mut self) -> Result<(Hash32, NodeSet), ApplierError> {
        let mut node_set = NodeSet::default();
        for (hash, node) in self.pending.drain() {
            node_set.nodes.insert(hash, node.encode());
        }
        Ok((self.root, node_set))
    }

    fn get_balance(&self, address: &Address) -> Result<Option<Vec<u8>>, ApplierError> {
        let key = key_for_address(address);
        match self.read_leaf(&key)? {
            Some(value) => {
                let nonce_len = 8;
                let balance_len_pos = nonce_len;
                if value.len() < balance_len_pos + 2 {
                    return Err(ApplierError::Serialization("truncated account leaf".into()));
                }
                let balance_len = u16::from_be_bytes([value[balance_len_pos], value[balance_len_pos + 1]]) as usize;
                let start = balance_len_pos + 2;
                Ok(Some(value[start..start + balance_len].to_vec()))
            }
            None => Ok(None),
        }
    }

    fn get_nonce(&self, address: &Address) -> Result<Option<u64>, ApplierError> {
        let key = key_for_address(address);
        match self.read_leaf(&key)? {
            Some(value) if value.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&value[0..8]);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            Some(_) => Err(ApplierError::Serialization("truncated account leaf".into())),
            None => Ok(None),
        }
    }

    fn get_code_hash(&self, address: &Address) -> Result<Option<Hash32>, ApplierError> {
        let key = key_for_address(address);
        match self.read_leaf(&key)? {
            Some(value) => {
                let balance_len_pos = 8;
                let balance_len = u16::from_be_bytes([value[balance_len_pos], value[balance_len_pos + 1]]) as usize;
                let code_hash_start = balance_len_pos + 2 + balance_len + 32;
                let mut out = [0u8; 32];
                out.copy_from_slice(&value[code_hash_start..code_hash_start + 32]);
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    fn get_storage(&self, address: &Address, slot: &Hash32) -> Result<Hash32, ApplierError> {
        let key = key_for_slot(address, slot);
        match self.read_leaf(&key)? {
            Some(value) if value.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&value);
                Ok(out)
            }
            _ => Ok([0u8; 32]),
        }
    }

    fn prove(&self, key: &Hash32) -> Result<ProofNodes, ApplierError> {
        let defaults = default_hashes();
        let mut proof = HashMap::new();
        let mut cur = self.root;
        let mut depth = 0usize;
        while depth < DEPTH {
            if cur == defaults[depth] {
                return Ok(proof);
            }
            match self.lookup(&cur)? {
                Some(TrieNode::Internal(l, r)) => {
                    proof.insert(cur, TrieNode::Internal(l, r).encode());
                    cur = if bit_at(key, depth) { r } else { l };
                    depth += 1;
                }
                Some(leaf @ TrieNode::Leaf(_, _)) => {
                    proof.insert(cur, leaf.encode());
                    return Ok(proof);
                }
                None => return Ok(proof),
            }
        }
        if cur != defaults[DEPTH] {
            if let Some(node) = self.lookup(&cur)? {
                proof.insert(cur, node.encode());
            }
        }
        Ok(proof)
    }
}

/// Verify a proof produced by `prove` against `root`/`key`. Mirrors the
/// descent in `prove` but only trusts bytes present in `proof_nodes`.
pub fn verify_proof(root: Hash32, key: &Hash32, proof_nodes: &ProofNodes) -> Result<(bool, bool, Vec<u8>), ApplierError> {
    let defaults = default_hashes();
    let mut cur = root;
    let mut depth = 0usize;
    while depth < DEPTH {
        if cur == defaults[depth] {
            return Ok((true, false, Vec::new()));
        }
        let bytes = match proof_nodes.get(&cur) {
            Some(bytes) => bytes,
            None => return Ok((false, false, Vec::new())),
        };
        match TrieNode::decode(bytes)? {
            TrieNode::Internal(l, r) => {
                cur = if bit_at(key, depth) { r } else { l };
                depth += 1;
            }
            TrieNode::Leaf(leaf_key, value) => {
                return Ok((true, &leaf_key == key, if &leaf_key == key { value } else { Vec::new() }));
            }
        }
    }
    if cur == defaults[DEPTH] {
        return Ok((true, false, Vec::new()));
    }
    match proof_nodes.get(&cur) {
        Some(bytes) => match TrieNode::decode(bytes)? {
            TrieNode::Leaf(leaf_key, value) => Ok((true, &leaf_key == key, if &leaf_key == key { value } else { Vec::new() })),
            TrieNode::Internal(_, _) => Ok((false, false, Vec::new())),
        },
        None => Ok((false, false, Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_read_balance_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_trie_db(dir.path()).unwrap();
        let store = RocksLayeredStore::new(std::sync::Arc::new(db));
        let mut trie = store.open(empty_root()).unwrap();

        let address = [1u8; 20];
        trie.update_account(&address, 7, &[42], [0u8; 32], [0u8; 32], 0).unwrap();
        assert_eq!(trie.get_nonce(&address).unwrap(), Some(7));
        assert_eq!(trie.get_balance(&address).unwrap(), Some(vec![42]));
    }

    #[test]
    fn deleting_an_account_clears_its_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_trie_db(dir.path()).unwrap();
        let store = RocksLayeredStore::new(std::sync::Arc::new(db));
        let mut trie = store.open(empty_root()).unwrap();

        let address = [2u8; 20];
        trie.update_account(&address, 1, &[1], [0u8; 32], [0u8; 32], 0).unwrap();
        assert!(trie.get_nonce(&address).unwrap().is_some());
        trie.delete_account(&address).unwrap();
        assert_eq!(trie.get_nonce(&address).unwrap(), None);
    }

    #[test]
    fn proof_round_trips_for_present_and_absent_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_trie_db(dir.path()).unwrap();
        let store = RocksLayeredStore::new(std::sync::Arc::new(db));
        let mut trie = store.open(empty_root()).unwrap();

        let address = [3u8; 20];
        trie.update_account(&address, 1, &[9], [0u8; 32], [0u8; 32], 0).unwrap();
        let root = trie.hash();
        let key = key_for_address(&address);

        let proof = trie.prove(&key).unwrap();
        let (valid, present, _value) = verify_proof(root, &key, &proof).unwrap();
        assert!(valid);
        assert!(present);

        let absent_key = key_for_address(&[99u8; 20]);
        let absent_proof = trie.prove(&absent_key).unwrap();
        let (valid, present, _) = verify_proof(root, &absent_key, &absent_proof).unwrap();
        assert!(valid);
        assert!(!present);
    }
}
