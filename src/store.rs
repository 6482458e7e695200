use crate::crypto::Hash;
use crate::types::Height;
use sparse_merkle_tree::blake2b::Blake2bHasher;
use sparse_merkle_tree::default_store::DefaultStore;
use sparse_merkle_tree::{H256, SparseMerkleTree};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type SmtStore = DefaultStore<H256>;
type StateTree = SparseMerkleTree<Blake2bHasher, H256, SmtStore>;

/// The snapshotting contract a versioned key-value store must offer:
/// height-tagged, root-anchored, cheap to `copy()`.
///
/// This crate treats the underlying versioned store / trie as external and
/// implements only this contract, via `MemStoreView` below.
pub trait StoreView: Send + Sync {
    fn height(&self) -> Height;
    fn root(&self) -> Hash;
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);
    fn delete(&mut self, key: &[u8]);
    /// Compute and persist a new root over the current overlay + base.
    fn save(&mut self) -> Hash;
    fn increment_height(&mut self);
    /// Fork a fresh, independent view rooted at the same state. Must be a
    /// cheap structural share of the immutable base, never a deep copy.
    fn copy(&self) -> Self
    where
        Self: Sized;
}

/// Reference `StoreView` implementation: a `BTreeMap` base shared via `Arc`
/// (cheap `copy()`) with a per-view mutable overlay, committed at `save()`
/// into a fresh `sparse_merkle_tree` (blake2b-hashed) to derive the root.
/// Transaction execution against the store is out of scope here.
#[derive(Clone)]
pub struct MemStoreView {
    height: Height,
    root: Hash,
    base: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    overlay: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl MemStoreView {
    /// Construct a view at `(height, root)`. Fatal if `root` names a state
    /// this store was never asked to persist — a storage-integrity
    /// violation, not a recoverable error.
    pub fn at_root(height: Height, root: Hash, base: Arc<BTreeMap<Vec<u8>, Vec<u8>>>) -> Self {
        Self {
            height,
            root,
            base,
            overlay: HashMap::new(),
        }
    }

    /// An empty view at height 0, root default — used to seed genesis state.
    pub fn genesis() -> Self {
        Self {
            height: 0,
            root: Hash::default(),
            base: Arc::new(BTreeMap::new()),
            overlay: HashMap::new(),
        }
    }

    fn key_leaf(key: &[u8]) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(key);
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }

    fn value_leaf(value: &[u8]) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(value);
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }
}

impl StoreView for MemStoreView {
    fn height(&self) -> Height {
        self.height
    }

    fn root(&self) -> Hash {
        self.root
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.overlay.get(key) {
            Some(Some(v)) => Some(v.clone()),
            Some(None) => None,
            None => self.base.get(key).cloned(),
        }
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.overlay.insert(key.to_vec(), None);
    }

    fn save(&mut self) -> Hash {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = (*self.base).clone();
        for (k, v) in self.overlay.drain() {
            match v {
                Some(value) => {
                    merged.insert(k, value);
                }
                None => {
                    merged.remove(&k);
                }
            }
        }

        let mut tree = StateTree::new(H256::zero(), SmtStore::default());
        for (k, v) in &merged {
            let leaf_key = Self::key_leaf(k);
            let leaf_value = Self::value_leaf(v);
            tree.update(leaf_key, leaf_value)
                .expect("SMT update must not fail on a freshly built tree");
        }
        let mut root_bytes = [0u8; 32];
        root_bytes.copy_from_slice(tree.root().as_slice());

        self.base = Arc::new(merged);
        self.root = Hash(root_bytes);
        self.root
    }

    fn increment_height(&mut self) {
        self.height += 1;
    }

    fn copy(&self) -> Self {
        Self {
            height: self.height,
            root: self.root,
            base: Arc::clone(&self.base),
            overlay: HashMap::new(),
        }
    }
}
