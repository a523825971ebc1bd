//! Consensus core: block tree, notarization, random beacon and syncer.
//!
//! The chain orders signed block proposals into rounds; a rotating
//! threshold group notarizes one proposal per round, and rounds three deep
//! behind the tip become final. Application state is abstracted behind the
//! [`State`] / [`Transition`] traits so the ledger logic lives elsewhere.
#![forbid(unsafe_code)]

pub mod block;
pub mod chain;
pub mod pool;
pub mod random_beacon;
pub mod sys_state;
pub mod syncer;

use std::fmt;
use std::sync::Arc;

use bincode::Options;
use ed25519_dalek::{Signer, Verifier};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use block::{Block, BlockProposal, NtShare, RandBeaconSig};
pub use chain::{get_transition, Chain, ChainError, ChainSink, ChainStatus, Config, Updater};
pub use pool::{MemPool, TxnPool};
pub use random_beacon::{rank_to_weight, BeaconError, Rand, RandomBeacon};
pub use sys_state::{Group, SysState, SysTransition, SysTxn};
pub use syncer::{PeerAddr, RequestError, Requester, SyncError, Syncer};

type BincodeConfig = bincode::config::WithOtherEndian<
    bincode::config::WithOtherIntEncoding<bincode::DefaultOptions, bincode::config::FixintEncoding>,
    bincode::config::LittleEndian,
>;

/// Canonical bincode configuration shared by every hashed or signed
/// structure: fixed-width integers, little-endian. Peers must agree on
/// this byte-for-byte or no hash will ever match.
pub fn bincode_config() -> BincodeConfig {
    static CFG: Lazy<BincodeConfig> = Lazy::new(|| {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_little_endian()
    });
    *CFG
}

/// Encode a value with the canonical configuration.
pub fn canonical_encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode_config()
        .serialize(value)
        .expect("canonical encoding of an in-memory value cannot fail")
}

/// 32-byte content hash.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn of(data: &[u8]) -> Self {
        Hash(blake3::hash(data).into())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..4]))
    }
}

/// 20-byte account identifier derived from a public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Addr(pub [u8; 20]);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", hex::encode(&self.0[..4]))
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key length {0}, expected 32")]
    BadSecretLen(usize),
    #[error("malformed public key")]
    BadPublicKey,
}

/// Ed25519 public key.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PK(pub Vec<u8>);

impl PK {
    /// Account address: leading 20 bytes of the key's hash.
    pub fn addr(&self) -> Addr {
        let digest = blake3::hash(&self.0);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest.as_bytes()[..20]);
        Addr(addr)
    }

    /// Verify `sig` over `msg`. Malformed keys or signatures verify false.
    pub fn verify(&self, msg: &[u8], sig: &Sig) -> bool {
        let bytes: [u8; 32] = match self.0.as_slice().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&bytes) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(&sig.0) else {
            return false;
        };
        vk.verify(msg, &signature).is_ok()
    }
}

impl fmt::Debug for PK {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PK({})", hex::encode(&self.0))
    }
}

/// Ed25519 secret key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SK(pub Vec<u8>);

impl SK {
    pub fn generate() -> SK {
        let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        SK(key.to_bytes().to_vec())
    }

    fn signing_key(&self) -> Result<ed25519_dalek::SigningKey, KeyError> {
        let bytes: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::BadSecretLen(self.0.len()))?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    pub fn pk(&self) -> Result<PK, KeyError> {
        Ok(PK(self.signing_key()?.verifying_key().to_bytes().to_vec()))
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Sig, KeyError> {
        Ok(Sig(self.signing_key()?.sign(msg).to_bytes().to_vec()))
    }
}

impl fmt::Debug for SK {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SK(..)")
    }
}

/// Detached signature bytes. Empty when a structure is encoded for
/// signing or hashing without its signature.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sig(pub Vec<u8>);

impl Sig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode(&self.0))
    }
}

/// Application state at some block. Implementations are internally
/// synchronized; the chain shares them freely across forks.
pub trait State: Send + Sync {
    /// Root hash of the state.
    fn hash(&self) -> Hash;

    /// Open a transition for the given round on a snapshot of this state.
    fn transition(&self, round: u64) -> Box<dyn Transition>;
}

/// A short-lived overlay accumulating validated transactions against a
/// state snapshot. Either discarded or committed.
pub trait Transition: Send {
    /// Record one transaction. `valid` is whether the bytes are
    /// well-formed and correctly signed by a known, replay-protected
    /// owner; `success` is whether the transaction's intent applied. A
    /// valid transaction with a future nonce reports `(true, false)` and
    /// is not appended.
    fn record(&mut self, txn: &[u8]) -> (bool, bool);

    /// Ordered list of successfully recorded transaction bytes.
    fn txns(&self) -> Vec<Vec<u8>>;

    /// Root the transition would produce if committed now.
    fn state_hash(&self) -> Hash;

    /// Seal the transition into the underlying store; returns the new
    /// root and the state at that root.
    fn commit(self: Box<Self>) -> (Hash, Arc<dyn State>);
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Minimal application state for chain-level tests: applies every
    /// transaction and hashes the batch it has seen.
    pub struct NullState {
        seen: Vec<Vec<u8>>,
    }

    impl NullState {
        pub fn new() -> Arc<Self> {
            Arc::new(NullState { seen: Vec::new() })
        }
    }

    impl State for NullState {
        fn hash(&self) -> Hash {
            Hash::of(&canonical_encode(&self.seen))
        }

        fn transition(&self, _round: u64) -> Box<dyn Transition> {
            Box::new(NullTransition {
                seen: self.seen.clone(),
                recorded: Vec::new(),
            })
        }
    }

    pub struct NullTransition {
        seen: Vec<Vec<u8>>,
        recorded: Vec<Vec<u8>>,
    }

    impl Transition for NullTransition {
        fn record(&mut self, txn: &[u8]) -> (bool, bool) {
            self.seen.push(txn.to_vec());
            self.recorded.push(txn.to_vec());
            (true, true)
        }

        fn txns(&self) -> Vec<Vec<u8>> {
            self.recorded.clone()
        }

        fn state_hash(&self) -> Hash {
            Hash::of(&canonical_encode(&self.seen))
        }

        fn commit(self: Box<Self>) -> (Hash, Arc<dyn State>) {
            let next = Arc::new(NullState { seen: self.seen });
            (State::hash(&*next), next)
        }
    }

    pub struct NoopUpdater;

    impl Updater for NoopUpdater {
        fn update(&self, _state: Arc<dyn State>) {}
    }

    pub struct NoopSink;

    impl ChainSink for NoopSink {
        fn recv_bp_for_notary(&self, _bp: Arc<BlockProposal>) {}
        fn end_round(&self, _round: u64) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_encoding_is_fixed_width_little_endian() {
        assert_eq!(canonical_encode(&1u64), vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(canonical_encode(&0x0102u16), vec![2, 1]);
    }

    #[test]
    fn addr_is_stable_and_20_bytes() {
        let sk = SK::generate();
        let pk = sk.pk().unwrap();
        assert_eq!(pk.addr(), pk.addr());
        assert_eq!(pk.addr().0.len(), 20);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let sk = SK::generate();
        let pk = sk.pk().unwrap();
        let sig = sk.sign(b"payload").unwrap();
        assert!(pk.verify(b"payload", &sig));
        assert!(!pk.verify(b"other", &sig));
        assert!(!pk.verify(b"payload", &Sig(vec![0; 64])));
    }

    #[test]
    fn short_secret_key_is_rejected() {
        let sk = SK(vec![1, 2, 3]);
        assert!(matches!(sk.pk(), Err(KeyError::BadSecretLen(3))));
    }
}
