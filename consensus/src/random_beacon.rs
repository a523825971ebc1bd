use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::block::RandBeaconSig;
use crate::sys_state::Group;
use crate::{canonical_encode, Addr, Hash};

/// A verifiable random value. The value for round `r` selects the
/// notarization group for `r` and orders the proposers for `r`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rand(pub [u8; 32]);

impl Rand {
    pub fn of(data: &[u8]) -> Self {
        Rand(blake3::hash(data).into())
    }

    /// Derive a child value bound to `tag`.
    pub fn derive(&self, tag: &[u8]) -> Rand {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(tag);
        Rand(hasher.finalize().into())
    }

    /// Reduce to an index in `0..n`. `n` must be non-zero.
    pub fn modulo(&self, n: u64) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf) % n
    }

    /// Deterministic permutation of `0..n` (Fisher-Yates driven by
    /// successive derivations).
    pub fn permutation(&self, n: usize) -> Vec<usize> {
        let mut items: Vec<usize> = (0..n).collect();
        let mut r = self.derive(b"permutation");
        for i in (1..n).rev() {
            let j = r.modulo(i as u64 + 1) as usize;
            items.swap(i, j);
            r = r.derive(b"permutation");
        }
        items
    }
}

/// Proposal weight for a proposer rank; rank 0 is the preferred
/// proposer and outweighs the whole tail below it.
pub fn rank_to_weight(rank: usize) -> f64 {
    0.5f64.powi(rank as i32)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BeaconError {
    #[error("beacon has not reached round {round}, current round {current}")]
    RoundNotReached { round: u64, current: u64 },
    #[error("owner {0} is not a registered proposer")]
    UnknownProposer(Addr),
    #[error("no notarization groups are registered")]
    NoGroups,
}

/// Per-round verifiable randomness produced by the rotating threshold
/// groups. Rounds advance one at a time: each committed signature hashes
/// into the next round's random value.
pub struct RandomBeacon {
    groups: Vec<Group>,
    proposers: Vec<Addr>,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    // rands[r] is the random value for round r; round 0 holds the seed.
    rands: Vec<Rand>,
    last_sig_hash: Hash,
}

impl RandomBeacon {
    /// `proposers` must be the canonical (sorted) registered address
    /// list; every replica derives identical rankings from it.
    pub fn new(seed: Rand, groups: Vec<Group>, proposers: Vec<Addr>) -> Self {
        RandomBeacon {
            groups,
            proposers,
            inner: Mutex::new(Inner {
                rands: vec![seed],
                last_sig_hash: Hash::default(),
            }),
            cv: Condvar::new(),
        }
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Highest round with a committed beacon value.
    pub fn round(&self) -> u64 {
        let inner = self.inner.lock().expect("beacon lock poisoned");
        inner.rands.len() as u64 - 1
    }

    /// Hash of the most recently committed signature; the next beacon
    /// item must chain from it.
    pub fn last_sig_hash(&self) -> Hash {
        let inner = self.inner.lock().expect("beacon lock poisoned");
        inner.last_sig_hash
    }

    /// Validate and append one beacon item. Rounds must arrive
    /// contiguously; the syncer backfills gaps. Items at or below the
    /// current round are benign duplicates.
    pub fn add_rand_beacon_sig(&self, sig: &RandBeaconSig) -> bool {
        if self.groups.is_empty() {
            warn!("beacon item received but no groups are registered");
            return false;
        }

        let mut inner = self.inner.lock().expect("beacon lock poisoned");
        let current = inner.rands.len() as u64 - 1;
        if sig.round <= current {
            return true;
        }
        if sig.round != current + 1 {
            warn!(
                round = sig.round,
                current, "beacon item skips rounds, needs backfill"
            );
            return false;
        }
        if sig.last_sig_hash != inner.last_sig_hash {
            warn!(round = sig.round, "beacon item does not chain from the last signature");
            return false;
        }

        // the group selected by round r-1 randomness extends the beacon to r
        let group = inner.rands[current as usize].modulo(self.groups.len() as u64) as usize;
        let msg = RandBeaconSig::signed_message(sig.round, sig.last_sig_hash);
        if !self.groups[group].public_key().verify(&sig.sig, &msg) {
            warn!(round = sig.round, group, "beacon item signature failed verification");
            return false;
        }

        let next = Rand::of(&canonical_encode(&sig.sig));
        inner.rands.push(next);
        inner.last_sig_hash = sig.hash();
        self.cv.notify_all();
        true
    }

    /// Random value committed for `round`.
    pub fn rand(&self, round: u64) -> Result<Rand, BeaconError> {
        let inner = self.inner.lock().expect("beacon lock poisoned");
        let current = inner.rands.len() as u64 - 1;
        inner
            .rands
            .get(round as usize)
            .copied()
            .ok_or(BeaconError::RoundNotReached { round, current })
    }

    /// Index of the notarization group selected for `round`.
    pub fn committee(&self, round: u64) -> Result<usize, BeaconError> {
        if self.groups.is_empty() {
            return Err(BeaconError::NoGroups);
        }
        Ok(self.rand(round)?.modulo(self.groups.len() as u64) as usize)
    }

    /// Deterministic proposer rank for `round`; lower is preferred.
    pub fn rank(&self, owner: Addr, round: u64) -> Result<usize, BeaconError> {
        let idx = self
            .proposers
            .binary_search(&owner)
            .map_err(|_| BeaconError::UnknownProposer(owner))?;
        let perm = self.rand(round)?.permutation(self.proposers.len());
        let rank = perm
            .iter()
            .position(|p| *p == idx)
            .ok_or(BeaconError::UnknownProposer(owner))?;
        Ok(rank)
    }

    /// Block until the beacon reaches `round`.
    pub fn wait_until(&self, round: u64) {
        let mut inner = self.inner.lock().expect("beacon lock poisoned");
        while (inner.rands.len() as u64 - 1) < round {
            inner = self.cv.wait(inner).expect("beacon lock poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn fixed_group(n: u64, t: usize) -> (Group, Vec<dkg::SecretKeyShare>) {
        let (pk_set, shares) = dkg::run_dkg(n, t);
        let members = (0..n as u8).map(|i| Addr([i; 20])).collect();
        (Group { members, pk_set }, shares)
    }

    fn extend(beacon: &RandomBeacon, shares: &[dkg::SecretKeyShare], pk_set: &dkg::PublicKeySet) -> RandBeaconSig {
        let round = beacon.round() + 1;
        let last = beacon.last_sig_hash();
        let msg = RandBeaconSig::signed_message(round, last);
        let mut collected = BTreeMap::new();
        for share in shares.iter().take(pk_set.threshold()) {
            collected.insert(share.participant(), share.sign(&msg));
        }
        RandBeaconSig {
            round,
            last_sig_hash: last,
            sig: pk_set.combine_signatures(&collected).unwrap(),
        }
    }

    fn proposers() -> Vec<Addr> {
        let mut p = vec![Addr([9; 20]), Addr([3; 20]), Addr([6; 20])];
        p.sort();
        p
    }

    #[test]
    fn contiguous_items_advance_the_round() {
        let (group, shares) = fixed_group(3, 2);
        let pk_set = group.pk_set.clone();
        let beacon = RandomBeacon::new(Rand::of(b"seed"), vec![group], proposers());
        assert_eq!(beacon.round(), 0);

        let sig1 = extend(&beacon, &shares, &pk_set);
        assert!(beacon.add_rand_beacon_sig(&sig1));
        assert_eq!(beacon.round(), 1);

        // duplicates are benign, gaps are not
        assert!(beacon.add_rand_beacon_sig(&sig1));
        assert_eq!(beacon.round(), 1);
        let mut skipping = extend(&beacon, &shares, &pk_set);
        skipping.round = 5;
        assert!(!beacon.add_rand_beacon_sig(&skipping));

        let sig2 = extend(&beacon, &shares, &pk_set);
        assert!(beacon.add_rand_beacon_sig(&sig2));
        assert_eq!(beacon.round(), 2);
    }

    #[test]
    fn forged_item_is_rejected() {
        let (group, _) = fixed_group(3, 2);
        let beacon = RandomBeacon::new(Rand::of(b"seed"), vec![group], proposers());

        // a valid signature from a different group's key material
        let (rogue_pk_set, rogue_shares) = dkg::run_dkg(3, 2);
        let msg = RandBeaconSig::signed_message(1, beacon.last_sig_hash());
        let mut collected = BTreeMap::new();
        for share in rogue_shares.iter().take(2) {
            collected.insert(share.participant(), share.sign(&msg));
        }
        let forged = RandBeaconSig {
            round: 1,
            last_sig_hash: beacon.last_sig_hash(),
            sig: rogue_pk_set.combine_signatures(&collected).unwrap(),
        };
        assert!(!beacon.add_rand_beacon_sig(&forged));
        assert_eq!(beacon.round(), 0);
    }

    #[test]
    fn rank_is_deterministic_and_total() {
        let (group, shares) = fixed_group(3, 2);
        let pk_set = group.pk_set.clone();
        let props = proposers();
        let beacon = RandomBeacon::new(Rand::of(b"seed"), vec![group], props.clone());
        let sig = extend(&beacon, &shares, &pk_set);
        assert!(beacon.add_rand_beacon_sig(&sig));

        let mut ranks: Vec<usize> = props
            .iter()
            .map(|p| beacon.rank(*p, 1).unwrap())
            .collect();
        let replay: Vec<usize> = props
            .iter()
            .map(|p| beacon.rank(*p, 1).unwrap())
            .collect();
        assert_eq!(ranks, replay);
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2]);

        assert_eq!(
            beacon.rank(Addr([42; 20]), 1),
            Err(BeaconError::UnknownProposer(Addr([42; 20])))
        );
        assert!(matches!(
            beacon.rank(props[0], 9),
            Err(BeaconError::RoundNotReached { round: 9, .. })
        ));
    }

    #[test]
    fn wait_until_unblocks_on_progress() {
        let (group, shares) = fixed_group(3, 2);
        let pk_set = group.pk_set.clone();
        let beacon = Arc::new(RandomBeacon::new(Rand::of(b"seed"), vec![group], proposers()));

        let waiter = {
            let beacon = beacon.clone();
            std::thread::spawn(move || {
                beacon.wait_until(1);
                beacon.round()
            })
        };

        let sig = extend(&beacon, &shares, &pk_set);
        assert!(beacon.add_rand_beacon_sig(&sig));
        assert!(waiter.join().unwrap() >= 1);
    }

    #[test]
    fn weights_decrease_with_rank() {
        assert_eq!(rank_to_weight(0), 1.0);
        assert!(rank_to_weight(1) < rank_to_weight(0));
        assert!(rank_to_weight(5) > 0.0);
    }
}
