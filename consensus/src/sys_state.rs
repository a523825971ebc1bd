use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Addr, PK};

/// A fixed notarization group: its members and the threshold public key
/// material they were dealt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub members: Vec<Addr>,
    pub pk_set: dkg::PublicKeySet,
}

impl Group {
    pub fn public_key(&self) -> dkg::PublicKey {
        self.pk_set.public_key()
    }

    pub fn threshold(&self) -> usize {
        self.pk_set.threshold()
    }
}

/// Protocol-governance transactions. Only the genesis block carries
/// meaningful ones today; the variants for group rotation arrive with
/// open participation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SysTxn {
    RegisterPk { pk: PK },
    RegisterGroup { group: Group },
}

/// System state: the registry of participant keys and the fixed
/// notarization groups. Mutated only through [`SysTransition`].
#[derive(Clone, Debug, Default)]
pub struct SysState {
    addr_to_pk: BTreeMap<Addr, PK>,
    groups: Vec<Group>,
}

impl SysState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(&self) -> SysTransition {
        SysTransition {
            state: self.clone(),
        }
    }

    pub fn pk(&self, addr: &Addr) -> Option<&PK> {
        self.addr_to_pk.get(addr)
    }

    /// Registered participant addresses, in canonical (sorted) order.
    pub fn addrs(&self) -> Vec<Addr> {
        self.addr_to_pk.keys().copied().collect()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Called once the state is sealed behind a finalized block. Flags
    /// group members without a registered key; they can never contribute
    /// a verifiable share.
    pub fn finalized(&self) {
        for (i, group) in self.groups.iter().enumerate() {
            for member in &group.members {
                if !self.addr_to_pk.contains_key(member) {
                    warn!(group = i, member = %member, "group member has no registered public key");
                }
            }
        }
    }
}

/// Staged mutations against a copy of the system state.
pub struct SysTransition {
    state: SysState,
}

impl SysTransition {
    /// Record one system transaction; returns whether it was valid.
    pub fn record(&mut self, txn: &SysTxn) -> bool {
        match txn {
            SysTxn::RegisterPk { pk } => {
                if pk.0.is_empty() {
                    warn!("rejecting empty public key registration");
                    return false;
                }
                self.state.addr_to_pk.insert(pk.addr(), pk.clone());
                true
            }
            SysTxn::RegisterGroup { group } => {
                if group.members.is_empty() || group.threshold() > group.members.len() {
                    warn!(
                        members = group.members.len(),
                        threshold = group.threshold(),
                        "rejecting group with unreachable threshold"
                    );
                    return false;
                }
                self.state.groups.push(group.clone());
                true
            }
        }
    }

    pub fn apply(self) -> SysState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SK;

    #[test]
    fn genesis_registration_roundtrip() {
        let keys: Vec<_> = (0..3).map(|_| SK::generate().pk().unwrap()).collect();
        let (pk_set, _) = dkg::run_dkg(3, 2);

        let mut t = SysState::new().transition();
        for pk in &keys {
            assert!(t.record(&SysTxn::RegisterPk { pk: pk.clone() }));
        }
        assert!(t.record(&SysTxn::RegisterGroup {
            group: Group {
                members: keys.iter().map(|pk| pk.addr()).collect(),
                pk_set,
            }
        }));

        let state = t.apply();
        assert_eq!(state.addrs().len(), 3);
        assert_eq!(state.groups().len(), 1);
        for pk in &keys {
            assert_eq!(state.pk(&pk.addr()), Some(pk));
        }
    }

    #[test]
    fn unreachable_threshold_is_rejected() {
        let (pk_set, _) = dkg::run_dkg(2, 3);
        let mut t = SysState::new().transition();
        assert!(!t.record(&SysTxn::RegisterGroup {
            group: Group {
                members: vec![Addr([1; 20]), Addr([2; 20])],
                pk_set,
            }
        }));
    }
}
