//! Merkle-authenticated key-value store.
//!
//! A [`Store`] holds every committed tree version keyed by root hash; a
//! [`MerkleTrie`] is an owned working tree on top of it. Committing seals
//! the current leaves as a new version and returns its root, so any
//! previously committed root can be reopened later for fork traversal.
#![forbid(unsafe_code)]

pub mod blob;
pub mod trie;

pub use blob::{BlobError, TrieBlob};
pub use trie::{MerkleTrie, Proof, Store, StoreError, EMPTY_ROOT};
