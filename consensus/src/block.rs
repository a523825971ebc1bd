use serde::{Deserialize, Serialize};

use crate::sys_state::SysTxn;
use crate::{canonical_encode, Addr, Hash, Sig};

/// A notarized block. Immutable once constructed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub round: u64,
    pub prev_block: Hash,
    pub block_proposal: Hash,
    pub state_root: Hash,
    pub sys_txns: Vec<SysTxn>,
    pub owner: Addr,
    /// Group threshold signature over `encode(false)`; absent only while
    /// the block is being assembled or hashed for signing.
    pub notarization_sig: Option<dkg::Signature>,
}

impl Block {
    pub fn encode(&self, with_sig: bool) -> Vec<u8> {
        if with_sig {
            canonical_encode(self)
        } else {
            let mut unsigned = self.clone();
            unsigned.notarization_sig = None;
            canonical_encode(&unsigned)
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode(true))
    }
}

/// A proposer's ordered transaction batch for one round.
///
/// `data` is the canonical encoding of the accepted batch
/// (`Vec<Vec<u8>>`); the state it produces is not stored but derived
/// deterministically by every replica.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockProposal {
    pub round: u64,
    pub prev_block: Hash,
    pub owner: Addr,
    pub sys_txns: Vec<SysTxn>,
    pub data: Vec<u8>,
    pub owner_sig: Sig,
}

impl BlockProposal {
    pub fn encode(&self, with_sig: bool) -> Vec<u8> {
        if with_sig {
            canonical_encode(self)
        } else {
            let mut unsigned = self.clone();
            unsigned.owner_sig = Sig::default();
            canonical_encode(&unsigned)
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode(true))
    }
}

/// One member's notarization share over the would-be block for a
/// proposal. Shares are pooled per proposal and discarded once the
/// threshold signature has been recovered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NtShare {
    pub round: u64,
    pub bp: Hash,
    pub owner: Addr,
    pub share: dkg::SignatureShare,
}

impl NtShare {
    pub fn hash(&self) -> Hash {
        Hash::of(&canonical_encode(self))
    }
}

/// A committed random beacon item: the group threshold signature that
/// extends the beacon chain by one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandBeaconSig {
    pub round: u64,
    pub last_sig_hash: Hash,
    pub sig: dkg::Signature,
}

impl RandBeaconSig {
    pub fn hash(&self) -> Hash {
        Hash::of(&canonical_encode(self))
    }

    /// The message a group signs to extend the beacon to `round`.
    pub fn signed_message(round: u64, last_sig_hash: Hash) -> Vec<u8> {
        canonical_encode(&(round, last_sig_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_covers_notarization_sig() {
        let mut b = Block {
            round: 3,
            ..Block::default()
        };
        let unsigned = b.hash();
        let (pk_set, shares) = dkg::run_dkg(1, 1);
        let mut collected = std::collections::BTreeMap::new();
        collected.insert(0, shares[0].sign(&b.encode(false)));
        b.notarization_sig = Some(pk_set.combine_signatures(&collected).unwrap());
        assert_ne!(unsigned, b.hash());
        assert_eq!(b.encode(false), Block { notarization_sig: None, ..b.clone() }.encode(true));
    }

    #[test]
    fn proposal_signing_excludes_signature() {
        let mut bp = BlockProposal {
            round: 1,
            data: vec![1, 2, 3],
            ..BlockProposal::default()
        };
        let unsigned = bp.encode(false);
        bp.owner_sig = Sig(vec![9; 64]);
        assert_eq!(unsigned, bp.encode(false));
        assert_ne!(bp.encode(true), bp.encode(false));
    }
}
