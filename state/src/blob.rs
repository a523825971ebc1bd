use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trie::{MerkleTrie, Store};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    #[error("root mismatch: blob declares {declared}, entries hash to {actual}")]
    RootMismatch { declared: String, actual: String },
}

/// Serializable export of the tree reachable from a root.
///
/// Used to bootstrap a syncing peer: the receiver rebuilds the tree,
/// checks that re-hashing the entries reproduces the declared root, and
/// commits it into its own store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrieBlob {
    pub root: [u8; 32],
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TrieBlob {
    pub fn from_tree(tree: &MerkleTrie) -> Self {
        TrieBlob {
            root: tree.root_hash(),
            entries: tree
                .iter_prefix(&[])
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect(),
        }
    }

    /// Rebuild the tree in `store`, validating the declared root.
    pub fn into_tree(self, store: &Store) -> Result<MerkleTrie, BlobError> {
        let mut tree = store.empty_tree();
        for (k, v) in &self.entries {
            tree.insert(k, v);
        }

        let actual = tree.commit();
        if actual != self.root {
            return Err(BlobError::RootMismatch {
                declared: hex::encode(self.root),
                actual: hex::encode(actual),
            });
        }
        Ok(tree)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BlobError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_preserves_root_and_leaves() {
        let store = Store::new();
        let mut t = store.empty_tree();
        t.insert(b"alpha", b"1");
        t.insert(b"beta", b"2");
        let root = t.commit();

        let bytes = TrieBlob::from_tree(&t).encode().unwrap();

        let other = Store::new();
        let restored = TrieBlob::decode(&bytes)
            .unwrap()
            .into_tree(&other)
            .unwrap();
        assert_eq!(restored.root_hash(), root);
        assert_eq!(restored.get(b"alpha"), Some(&b"1"[..]));
        assert_eq!(restored.get(b"beta"), Some(&b"2"[..]));

        // the restored root is committed and can be reopened
        assert!(other.tree(root).is_ok());
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let store = Store::new();
        let mut t = store.empty_tree();
        t.insert(b"k", b"v");
        t.commit();

        let mut blob = TrieBlob::from_tree(&t);
        blob.entries[0].1 = b"forged".to_vec();
        assert!(matches!(
            blob.into_tree(&Store::new()),
            Err(BlobError::RootMismatch { .. })
        ));
    }
}
