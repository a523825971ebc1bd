use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use blake3::Hasher;
use thiserror::Error;

/// Root hash of a tree with no leaves.
pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown root {}", hex::encode(.0))]
    UnknownRoot([u8; 32]),
}

/// Shared registry of committed tree versions, keyed by root hash.
///
/// Cloning is cheap; all clones observe the same committed set. Versions
/// are immutable once committed.
#[derive(Debug, Clone, Default)]
pub struct Store {
    committed: Arc<RwLock<HashMap<[u8; 32], Arc<BTreeMap<Vec<u8>, Vec<u8>>>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a working tree with no leaves.
    pub fn empty_tree(&self) -> MerkleTrie {
        MerkleTrie {
            store: self.clone(),
            map: BTreeMap::new(),
        }
    }

    /// Reopen a previously committed root as a fresh working tree.
    pub fn tree(&self, root: [u8; 32]) -> Result<MerkleTrie, StoreError> {
        if root == EMPTY_ROOT {
            return Ok(self.empty_tree());
        }

        let committed = self.committed.read().expect("store lock poisoned");
        let map = committed
            .get(&root)
            .ok_or(StoreError::UnknownRoot(root))?
            .as_ref()
            .clone();
        Ok(MerkleTrie {
            store: self.clone(),
            map,
        })
    }

    fn seal(&self, root: [u8; 32], map: &BTreeMap<Vec<u8>, Vec<u8>>) {
        if root == EMPTY_ROOT {
            return;
        }

        let mut committed = self.committed.write().expect("store lock poisoned");
        committed
            .entry(root)
            .or_insert_with(|| Arc::new(map.clone()));
    }
}

/// Merkle proof represented as sibling hashes with orientation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof(pub Vec<([u8; 32], bool)>); // (sibling, is_left)

/// An owned working tree over a [`Store`].
///
/// Leaves live in a sorted map so the root is a deterministic function of
/// the current (key, value) set. Reads always observe staged writes.
#[derive(Debug, Clone)]
pub struct MerkleTrie {
    store: Store,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MerkleTrie {
    /// Fetch a value by key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.map.get(key).map(|v| v.as_slice())
    }

    /// Stage a key/value pair.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) {
        self.map.insert(key.to_vec(), value.to_vec());
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.remove(key)
    }

    /// Ordered traversal of all leaves whose path starts with `prefix`.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.map
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The store backing this tree.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Compute the root hash of the current leaf set.
    pub fn root_hash(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = self.map.iter().map(|(k, v)| leaf_hash(k, v)).collect();

        if leaves.is_empty() {
            return EMPTY_ROOT;
        }

        while leaves.len() > 1 {
            leaves = next_level(&leaves);
        }
        leaves[0]
    }

    /// Seal the current leaves as a version in the store and return its
    /// root. The tree keeps working on top of the committed version.
    pub fn commit(&mut self) -> [u8; 32] {
        let root = self.root_hash();
        self.store.seal(root, &self.map);
        root
    }

    /// Generate a Merkle membership proof for a given key.
    pub fn prove(&self, key: &[u8]) -> Option<Proof> {
        let mut index = self.map.keys().position(|k| k.as_slice() == key)?;
        let mut leaves: Vec<[u8; 32]> = self.map.iter().map(|(k, v)| leaf_hash(k, v)).collect();

        let mut proof = Vec::new();
        while leaves.len() > 1 {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            let sibling = if sibling_index < leaves.len() {
                leaves[sibling_index]
            } else {
                leaves[index]
            };
            let is_left = index % 2 == 1;
            proof.push((sibling, is_left));
            leaves = next_level(&leaves);
            index /= 2;
        }
        Some(Proof(proof))
    }

    /// Verify a proof against a root hash.
    pub fn verify_proof(root: [u8; 32], key: &[u8], value: &[u8], proof: &Proof) -> bool {
        let mut hash = leaf_hash(key, value);
        for (sibling, is_left) in &proof.0 {
            let mut h = Hasher::new();
            if *is_left {
                h.update(sibling);
                h.update(&hash);
            } else {
                h.update(&hash);
                h.update(sibling);
            }
            hash = h.finalize().into();
        }
        hash == root
    }
}

fn leaf_hash(key: &[u8], value: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    // length prefix keeps the (key, value) boundary unambiguous
    hasher.update(&(key.len() as u64).to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize().into()
}

fn next_level(leaves: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
    for chunk in leaves.chunks(2) {
        let mut hasher = Hasher::new();
        hasher.update(&chunk[0]);
        if chunk.len() == 2 {
            hasher.update(&chunk[1]);
        } else {
            hasher.update(&chunk[0]);
        }
        next.push(hasher.finalize().into());
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_zero_root() {
        let store = Store::new();
        assert_eq!(store.empty_tree().root_hash(), EMPTY_ROOT);
    }

    #[test]
    fn root_is_deterministic_in_insertion_order() {
        let store = Store::new();
        let mut a = store.empty_tree();
        a.insert(b"x", b"1");
        a.insert(b"y", b"2");

        let mut b = store.empty_tree();
        b.insert(b"y", b"2");
        b.insert(b"x", b"1");

        assert_eq!(a.root_hash(), b.root_hash());

        b.insert(b"z", b"3");
        assert_ne!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn reads_observe_staged_writes() {
        let store = Store::new();
        let mut t = store.empty_tree();
        t.insert(b"k", b"v1");
        assert_eq!(t.get(b"k"), Some(&b"v1"[..]));
        t.insert(b"k", b"v2");
        assert_eq!(t.get(b"k"), Some(&b"v2"[..]));
        t.remove(b"k");
        assert_eq!(t.get(b"k"), None);
    }

    #[test]
    fn prefix_iteration_is_ordered_and_bounded() {
        let store = Store::new();
        let mut t = store.empty_tree();
        t.insert(&[2, 0, 1], b"b");
        t.insert(&[2, 0, 0], b"a");
        t.insert(&[3, 0, 0], b"other");
        t.insert(&[1, 9, 9], b"below");

        let got: Vec<_> = t
            .iter_prefix(&[2])
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(
            got,
            vec![
                (vec![2, 0, 0], b"a".to_vec()),
                (vec![2, 0, 1], b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn committed_roots_can_be_reopened() {
        let store = Store::new();
        let mut t = store.empty_tree();
        t.insert(b"a", b"1");
        let root1 = t.commit();

        t.insert(b"b", b"2");
        let root2 = t.commit();
        assert_ne!(root1, root2);

        let old = store.tree(root1).unwrap();
        assert_eq!(old.get(b"a"), Some(&b"1"[..]));
        assert_eq!(old.get(b"b"), None);
        assert_eq!(old.root_hash(), root1);

        let new = store.tree(root2).unwrap();
        assert_eq!(new.get(b"b"), Some(&b"2"[..]));
    }

    #[test]
    fn unknown_root_is_an_error() {
        let store = Store::new();
        assert!(matches!(
            store.tree([7u8; 32]),
            Err(StoreError::UnknownRoot(_))
        ));
    }

    #[test]
    fn proof_roundtrip() {
        let store = Store::new();
        let mut t = store.empty_tree();
        for i in 0u8..7 {
            t.insert(&[i], &[i * 2]);
        }
        let root = t.root_hash();
        for i in 0u8..7 {
            let proof = t.prove(&[i]).unwrap();
            assert!(MerkleTrie::verify_proof(root, &[i], &[i * 2], &proof));
            assert!(!MerkleTrie::verify_proof(root, &[i], &[99], &proof));
        }
        assert!(t.prove(b"missing").is_none());
    }
}
