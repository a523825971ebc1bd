use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::thread;

use bincode::Options;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockProposal, NtShare};
use crate::pool::TxnPool;
use crate::random_beacon::{Rand, RandomBeacon};
use crate::sys_state::SysState;
use crate::{bincode_config, canonical_encode, Hash, KeyError, Sig, State, Transition, SK};

/// Consensus configuration. The group threshold must match the value the
/// groups' key material was dealt with.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub group_threshold: usize,
}

/// Pushes the current leader state to observers (e.g. the RPC surface).
/// Invoked on a fresh thread whenever the leader changes; the last update
/// delivered reflects the latest leader at delivery time.
pub trait Updater: Send + Sync {
    fn update(&self, state: Arc<dyn State>);
}

/// Capabilities the chain calls out to on the networking node. Injected at
/// construction and always dispatched on a fresh thread so no external
/// code ever runs under the chain lock.
pub trait ChainSink: Send + Sync {
    /// A new proposal needs notarization by this node's groups.
    fn recv_bp_for_notary(&self, bp: Arc<BlockProposal>);

    /// The given round completed; time to produce the next beacon item.
    fn end_round(&self, round: u64);
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block proposal's parent not found: {hash}, round: {round}")]
    ParentNotFound { hash: Hash, round: u64 },
    #[error("invalid system transaction in genesis")]
    InvalidGenesis,
    #[error("invalid transactions: {0}")]
    InvalidTxnData(String),
    #[error("failed to apply transactions")]
    FailedToApply,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The chain consensus state, as seen by operator surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainStatus {
    pub round: u64,
    pub rand_beacon_depth: u64,
}

impl ChainStatus {
    pub fn in_sync(&self) -> bool {
        self.round >= self.rand_beacon_depth && self.round <= self.rand_beacon_depth + 1
    }
}

#[derive(Clone, Debug)]
struct BpNode {
    bp: Hash,
    weight: f64,
}

#[derive(Clone, Debug)]
struct BlockNode {
    block: Hash,
    bp: Hash,
    weight: f64,
    block_children: Vec<BlockNode>,
    bp_children: Vec<BpNode>,
}

struct ChainInner {
    // reorg never happens to a finalized block; its proposal and
    // sibling states are discarded.
    finalized: Vec<Hash>,
    last_finalized_state: Arc<dyn State>,
    last_finalized_sys_state: Arc<SysState>,
    fork: Vec<BlockNode>,
    bp_not_on_fork: Vec<BpNode>,
    unfinalized_state: HashMap<Hash, Arc<dyn State>>,
    unfinalized_sys_state: HashMap<Hash, Arc<SysState>>,
    hash_to_block: HashMap<Hash, Arc<Block>>,
    hash_to_bp: HashMap<Hash, Arc<BlockProposal>>,
    hash_to_nt_share: HashMap<Hash, Arc<NtShare>>,
    bp_to_nt_shares: HashMap<Hash, Vec<Arc<NtShare>>>,
    bp_need_notarize: HashMap<Hash, bool>,
}

/// The blockchain: finalized chain, fork tree of notarized blocks, and
/// the notarization share pools that turn proposals into blocks.
pub struct Chain {
    cfg: Config,
    pub random_beacon: Arc<RandomBeacon>,
    txn_pool: Arc<dyn TxnPool>,
    updater: Arc<dyn Updater>,
    sink: Arc<dyn ChainSink>,
    inner: RwLock<ChainInner>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").finish_non_exhaustive()
    }
}

impl Chain {
    pub fn new(
        genesis: Block,
        genesis_state: Arc<dyn State>,
        seed: Rand,
        cfg: Config,
        txn_pool: Arc<dyn TxnPool>,
        updater: Arc<dyn Updater>,
        sink: Arc<dyn ChainSink>,
    ) -> Result<Arc<Chain>, ChainError> {
        let mut t = SysState::new().transition();
        for txn in &genesis.sys_txns {
            if !t.record(txn) {
                return Err(ChainError::InvalidGenesis);
            }
        }

        updater.update(genesis_state.clone());
        let sys_state = Arc::new(t.apply());
        sys_state.finalized();

        let gh = genesis.hash();
        let random_beacon = Arc::new(RandomBeacon::new(
            seed,
            sys_state.groups().to_vec(),
            sys_state.addrs(),
        ));

        let mut hash_to_block = HashMap::new();
        hash_to_block.insert(gh, Arc::new(genesis));

        Ok(Arc::new(Chain {
            cfg,
            random_beacon,
            txn_pool,
            updater,
            sink,
            inner: RwLock::new(ChainInner {
                finalized: vec![gh],
                last_finalized_state: genesis_state,
                last_finalized_sys_state: sys_state,
                fork: Vec::new(),
                bp_not_on_fork: Vec::new(),
                unfinalized_state: HashMap::new(),
                unfinalized_sys_state: HashMap::new(),
                hash_to_block,
                hash_to_bp: HashMap::new(),
                hash_to_nt_share: HashMap::new(),
                bp_to_nt_shares: HashMap::new(),
                bp_need_notarize: HashMap::new(),
            }),
        }))
    }

    pub fn genesis(&self) -> Hash {
        self.read().finalized[0]
    }

    pub fn chain_status(&self) -> ChainStatus {
        ChainStatus {
            round: self.round(),
            rand_beacon_depth: self.random_beacon.round(),
        }
    }

    /// The round currently being voted on.
    pub fn round(&self) -> u64 {
        self.read().round()
    }

    pub fn finalized_round(&self) -> u64 {
        self.read().finalized.len() as u64 - 1
    }

    /// Block of the given hash.
    pub fn block(&self, h: Hash) -> Option<Arc<Block>> {
        self.read().hash_to_block.get(&h).cloned()
    }

    /// Block proposal of the given hash.
    pub fn block_proposal(&self, h: Hash) -> Option<Arc<BlockProposal>> {
        self.read().hash_to_bp.get(&h).cloned()
    }

    /// Notarization share of the given hash.
    pub fn nt_share(&self, h: Hash) -> Option<Arc<NtShare>> {
        self.read().hash_to_nt_share.get(&h).cloned()
    }

    /// Whether the proposal of the given hash still needs notarization.
    /// A proposal that has not arrived yet does.
    pub fn need_notarize(&self, h: Hash) -> bool {
        self.read().bp_need_notarize.get(&h).copied().unwrap_or(true)
    }

    pub fn finalized_chain(&self) -> Vec<Arc<Block>> {
        let inner = self.read();
        inner
            .finalized
            .iter()
            .filter_map(|h| inner.hash_to_block.get(h).cloned())
            .collect()
    }

    pub fn last_finalized_sys_state(&self) -> Arc<SysState> {
        self.read().last_finalized_sys_state.clone()
    }

    pub fn block_to_state(&self, h: Hash) -> Option<Arc<dyn State>> {
        self.read().block_to_state(&h)
    }

    /// The notarized tip of the heaviest branch, with its state. Falls
    /// back to the finalized tip while the fork tree is empty.
    pub fn leader(&self) -> (Arc<Block>, Arc<dyn State>, Arc<SysState>) {
        self.read().leader()
    }

    /// Drain the pool into a transition on the leader state and wrap the
    /// accepted batch in a signed proposal for the next round. Does not
    /// add the proposal to the chain.
    pub fn propose_block(&self, sk: &SK) -> Result<BlockProposal, ChainError> {
        let txns = self.txn_pool.txns();
        let (block, state, _) = self.leader();
        let round = block.round + 1;

        let mut trans = state.transition(round);
        for txn in txns {
            let (valid, _) = trans.record(&txn);
            if !valid {
                self.txn_pool.remove(Hash::of(&txn));
            }
        }

        let data = canonical_encode(&trans.txns());
        let pk = sk.pk()?;
        let mut bp = BlockProposal {
            round,
            prev_block: block.hash(),
            owner: pk.addr(),
            sys_txns: Vec::new(),
            data,
            owner_sig: Sig::default(),
        };
        bp.owner_sig = sk.sign(&bp.encode(false))?;
        Ok(bp)
    }

    /// Link a proposal under its parent in the fork tree (or the
    /// off-fork list) and hand it to the notary. `Ok(false)` means the
    /// proposal was already known.
    pub fn add_bp(&self, bp: BlockProposal, weight: f64) -> Result<bool, ChainError> {
        let h = bp.hash();
        debug!(hash = %h, weight, "add block proposal to chain");

        let mut guard = self.write();
        let inner = &mut *guard;

        if inner.hash_to_bp.contains_key(&h) {
            return Ok(false);
        }

        let path = find_block_path(&inner.fork, bp.prev_block);
        if path.is_none() && *inner.tip() != bp.prev_block {
            return Err(ChainError::ParentNotFound {
                hash: bp.prev_block,
                round: bp.round,
            });
        }

        let bp = Arc::new(bp);
        inner.hash_to_bp.insert(h, bp.clone());
        let node = BpNode { bp: h, weight };
        match path {
            Some(path) => node_at_mut(&mut inner.fork, &path).bp_children.push(node),
            None => inner.bp_not_on_fork.push(node),
        }
        inner.bp_need_notarize.insert(h, true);
        drop(guard);

        let sink = self.sink.clone();
        thread::spawn(move || sink.recv_bp_for_notary(bp));
        Ok(true)
    }

    /// Store one notarization share. Once the shares for a proposal reach
    /// the group threshold, the threshold signature is recovered and the
    /// notarized block is returned for insertion via [`Chain::add_block`].
    ///
    /// Returns `(block, added, success)`: `added` is whether this share
    /// was new, `success` whether it was acceptable (duplicates are
    /// benign).
    pub fn add_nt_share(&self, share: NtShare, group_id: usize) -> (Option<Block>, bool, bool) {
        debug!(hash = %share.hash(), group = group_id, "add notarization share to chain");

        let mut guard = self.write();
        let inner = &mut *guard;

        let bp = match inner.hash_to_bp.get(&share.bp) {
            Some(bp) => bp.clone(),
            None => {
                warn!("add nt share but block proposal not found");
                return (None, false, false);
            }
        };

        if !inner.bp_need_notarize.get(&share.bp).copied().unwrap_or(false) {
            return (None, false, true);
        }

        if inner
            .bp_to_nt_shares
            .get(&share.bp)
            .map(|shares| shares.iter().any(|s| s.owner == share.owner))
            .unwrap_or(false)
        {
            warn!("notarization share from the owner already received");
            return (None, false, true);
        }

        let group = match self.random_beacon.groups().get(group_id) {
            Some(g) => g.clone(),
            None => {
                warn!(group = group_id, "notarization share names an unknown group");
                return (None, false, false);
            }
        };

        let share = Arc::new(share);
        let reached = {
            let pool = inner.bp_to_nt_shares.entry(share.bp).or_default();
            pool.push(share.clone());
            pool.len() >= self.cfg.group_threshold
        };

        if reached {
            let collected: BTreeMap<u64, dkg::SignatureShare> = inner
                .bp_to_nt_shares
                .get(&share.bp)
                .map(|pool| {
                    pool.iter()
                        .map(|s| (s.share.participant(), s.share.clone()))
                        .collect()
                })
                .unwrap_or_default();

            let state = match inner.block_to_state(&bp.prev_block) {
                Some(s) => s,
                // a notarized parent always has a recorded state
                None => panic!("state for parent block {} is missing", bp.prev_block),
            };
            let trans = match get_transition(&state, &bp.data, bp.round) {
                Ok(t) => t,
                Err(err) => panic!("notarized proposal does not apply: {err}"),
            };

            let mut block = Block {
                owner: bp.owner,
                round: bp.round,
                block_proposal: bp.hash(),
                prev_block: bp.prev_block,
                sys_txns: bp.sys_txns.clone(),
                state_root: trans.state_hash(),
                notarization_sig: None,
            };

            let sig = match group.pk_set.combine_signatures(&collected) {
                Ok(sig) => sig,
                Err(err) => panic!("failed to recover notarization signature: {err}"),
            };
            if !group.public_key().verify(&sig, &block.encode(false)) {
                // either a bug or a successful attack on the threshold scheme
                panic!("recovered notarization signature failed against the group key");
            }
            block.notarization_sig = Some(sig);

            inner.bp_need_notarize.remove(&share.bp);
            if let Some(shares) = inner.bp_to_nt_shares.remove(&share.bp) {
                for s in shares {
                    inner.hash_to_nt_share.remove(&s.hash());
                }
            }
            return (Some(block), true, true);
        }

        inner.hash_to_nt_share.insert(share.hash(), share);
        (None, true, true)
    }

    /// Insert a notarized block under its parent, record its post-state,
    /// evict its transactions from the pool and advance finality.
    /// `Ok(false)` means the block was already known.
    pub fn add_block(
        &self,
        block: Block,
        bp: &BlockProposal,
        state: Arc<dyn State>,
        weight: f64,
    ) -> Result<bool, ChainError> {
        let h = block.hash();
        debug!(hash = %h, weight, "add block to chain");

        let mut guard = self.write();
        let inner = &mut *guard;
        let begin_round = inner.round();

        if inner.hash_to_block.contains_key(&h) {
            return Ok(false);
        }

        let prev_on_tip = bp.prev_block == *inner.tip();
        let path = if prev_on_tip {
            None
        } else {
            match find_block_path(&inner.fork, bp.prev_block) {
                Some(p) => Some(p),
                None => {
                    return Err(ChainError::ParentNotFound {
                        hash: bp.prev_block,
                        round: block.round,
                    })
                }
            }
        };

        let prev_sys_state = if prev_on_tip {
            inner.last_finalized_sys_state.clone()
        } else {
            match inner.unfinalized_sys_state.get(&bp.prev_block) {
                Some(s) => s.clone(),
                None => panic!("system state for parent block {} is missing", bp.prev_block),
            }
        };

        inner.unfinalized_state.insert(h, state);
        // system transactions stay inert until open participation lands
        inner.unfinalized_sys_state.insert(h, prev_sys_state);

        let node = BlockNode {
            block: h,
            bp: block.block_proposal,
            weight,
            block_children: Vec::new(),
            bp_children: Vec::new(),
        };

        match path {
            None => {
                inner.fork.push(node);
                match inner
                    .bp_not_on_fork
                    .iter()
                    .position(|e| e.bp == block.block_proposal)
                {
                    Some(idx) => {
                        inner.bp_not_on_fork.remove(idx);
                    }
                    None => {
                        info!(bp = %block.block_proposal, block = %h, "block's proposal not found on chain");
                    }
                }
            }
            Some(path) => {
                let parent = node_at_mut(&mut inner.fork, &path);
                parent.block_children.push(node);
                if let Some(idx) = parent
                    .bp_children
                    .iter()
                    .position(|e| e.bp == block.block_proposal)
                {
                    parent.bp_children.remove(idx);
                }
            }
        }

        let block = Arc::new(block);
        inner.hash_to_block.insert(h, block.clone());
        inner.bp_need_notarize.remove(&block.block_proposal);
        inner.bp_to_nt_shares.remove(&block.block_proposal);

        let round = inner.round();
        // when round n is started, round n - 3 can be finalized. See
        // corollary 9.19 in https://arxiv.org/abs/1805.04548
        if round > 3 {
            inner.finalize(round - 3);
        }

        if !bp.data.is_empty() {
            let txns: Vec<Vec<u8>> = bincode_config()
                .deserialize(&bp.data)
                .map_err(|err| ChainError::InvalidTxnData(err.to_string()))?;
            for txn in &txns {
                self.txn_pool.remove(Hash::of(txn));
            }
        }

        let (_, leader_state, _) = inner.leader();
        drop(guard);

        let updater = self.updater.clone();
        thread::spawn(move || updater.update(leader_state));

        if begin_round == block.round && begin_round + 1 == round {
            let sink = self.sink.clone();
            thread::spawn(move || sink.end_round(begin_round));
        }
        Ok(true)
    }

    /// Graphviz dot rendering of the finalized chain and the fork tree,
    /// for operator inspection. `max_finalized` > 0 collapses the middle
    /// of the finalized list.
    pub fn graphviz(&self, max_finalized: usize) -> String {
        let inner = self.read();

        const BEGIN: &str = "digraph chain {\nrankdir=LR;\nsize=\"12,8\"";
        const END: &str = "}\n";

        let mut finalized = String::from("node [shape = rect, style=filled, color = chartreuse2];");
        let mut notarized = String::from("node [shape = rect, style=filled, color = aquamarine];");
        let mut un_notarized =
            String::from("node [shape = octagon, style=filled, color = aliceblue];");

        let mut start = String::new();
        let mut graph = String::new();

        let mut dot_idx = 0usize;
        let mut finalized_slice = inner.finalized.clone();
        let omitted = finalized_slice.len().saturating_sub(max_finalized);
        if max_finalized > 0 && finalized_slice.len() > max_finalized {
            dot_idx = max_finalized / 2;
            let tail_start = finalized_slice.len() - (max_finalized - dot_idx);
            let tail = finalized_slice.split_off(tail_start);
            finalized_slice.truncate(dot_idx);
            finalized_slice.extend(tail);
        }

        for (i, f) in finalized_slice.iter().enumerate() {
            let name = format!("block_{}", hex::encode(&f.0[..2]));
            start = name.clone();
            finalized.push(' ');
            finalized.push_str(&name);

            if i > 0 {
                graph.push_str(" -> ");
                graph.push_str(&name);
            } else {
                graph = name.clone();
            }

            if dot_idx > 0 && i == dot_idx - 1 {
                let omit = format!("num_blocks_omitted_to_save_space_{omitted}");
                graph.push_str(" -> ");
                graph.push_str(&omit);
                finalized.push(' ');
                finalized.push_str(&omit);
            }
        }

        graph.push('\n');

        update_un_nt(&inner.bp_not_on_fork, &start, &mut graph, &mut un_notarized);
        update_nt(
            &inner.fork,
            &start,
            &mut graph,
            &mut notarized,
            &mut un_notarized,
        );
        [BEGIN, &finalized, &notarized, &un_notarized, &graph, END].join("\n")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ChainInner> {
        self.inner.read().expect("chain lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ChainInner> {
        self.inner.write().expect("chain lock poisoned")
    }
}

impl ChainInner {
    fn tip(&self) -> &Hash {
        self.finalized.last().expect("finalized chain never empty")
    }

    fn round(&self) -> u64 {
        self.finalized.len() as u64 + max_height(&self.fork)
    }

    fn block_to_state(&self, h: &Hash) -> Option<Arc<dyn State>> {
        if h == self.tip() {
            return Some(self.last_finalized_state.clone());
        }
        self.unfinalized_state.get(h).cloned()
    }

    fn leader(&self) -> (Arc<Block>, Arc<dyn State>, Arc<SysState>) {
        match self.heaviest_fork() {
            None => (
                self.hash_to_block[self.tip()].clone(),
                self.last_finalized_state.clone(),
                self.last_finalized_sys_state.clone(),
            ),
            Some(n) => (
                self.hash_to_block[&n.block].clone(),
                self.unfinalized_state[&n.block].clone(),
                self.unfinalized_sys_state[&n.block].clone(),
            ),
        }
    }

    /// Leaf of the heaviest branch: maximum cumulative weight, ties going
    /// to the deeper branch, then the lower block hash.
    fn heaviest_fork(&self) -> Option<&BlockNode> {
        let mut best: Option<(&BlockNode, f64, u64)> = None;
        for root in &self.fork {
            let cand = best_leaf(root);
            best = Some(match best {
                None => cand,
                Some(cur) => {
                    if heavier(&cand, &cur) {
                        cand
                    } else {
                        cur
                    }
                }
            });
        }
        best.map(|(leaf, _, _)| leaf)
    }

    // must be called with the write lock held
    fn finalize(&mut self, round: u64) {
        let depth = round;
        let count = self.finalized.len() as u64;
        if depth < count {
            return;
        }
        let depth = depth - count;

        // off-fork proposals are discarded; peers still serve them to
        // anyone catching up
        self.bp_not_on_fork.clear();

        if depth == 0 {
            if self.fork.len() > 1 {
                // more than one notarized block in the finalized round;
                // wait for the next call to see which fork survives
                return;
            }

            let f = self.fork.remove(0);
            self.finalized.push(f.block);
            self.last_finalized_state = self
                .unfinalized_state
                .remove(&f.block)
                .expect("finalized block has no recorded state");
            self.last_finalized_sys_state = self
                .unfinalized_sys_state
                .remove(&f.block)
                .expect("finalized block has no recorded system state");
            self.fork = f.block_children;
            self.bp_not_on_fork = f.bp_children;
            return;
        }

        panic!("catch-up finalization deeper than one round is not under normal operation, not implemented");
    }
}

/// Replays a proposal's transaction batch on a snapshot of `state`,
/// producing the transition every replica must agree on.
pub fn get_transition(
    state: &Arc<dyn State>,
    txn_data: &[u8],
    round: u64,
) -> Result<Box<dyn Transition>, ChainError> {
    let mut trans = state.transition(round);
    if txn_data.is_empty() {
        return Ok(trans);
    }

    let txns: Vec<Vec<u8>> = bincode_config()
        .deserialize(txn_data)
        .map_err(|err| ChainError::InvalidTxnData(err.to_string()))?;
    for txn in &txns {
        let (valid, success) = trans.record(txn);
        if !valid || !success {
            return Err(ChainError::FailedToApply);
        }
    }
    Ok(trans)
}

fn max_height(ns: &[BlockNode]) -> u64 {
    ns.iter()
        .map(|n| max_height(&n.block_children) + 1)
        .max()
        .unwrap_or(0)
}

fn best_leaf(node: &BlockNode) -> (&BlockNode, f64, u64) {
    // weights are positive, so any descendant outweighs the node itself
    let mut best = (node, node.weight, 1);
    for child in &node.block_children {
        let (leaf, weight, depth) = best_leaf(child);
        let cand = (leaf, weight + node.weight, depth + 1);
        if heavier(&cand, &best) {
            best = cand;
        }
    }
    best
}

fn heavier(a: &(&BlockNode, f64, u64), b: &(&BlockNode, f64, u64)) -> bool {
    if a.1 != b.1 {
        return a.1 > b.1;
    }
    if a.2 != b.2 {
        return a.2 > b.2;
    }
    a.0.block < b.0.block
}

fn find_block_path(nodes: &[BlockNode], hash: Hash) -> Option<Vec<usize>> {
    for (i, n) in nodes.iter().enumerate() {
        if n.block == hash {
            return Some(vec![i]);
        }
        if let Some(mut rest) = find_block_path(&n.block_children, hash) {
            let mut path = Vec::with_capacity(rest.len() + 1);
            path.push(i);
            path.append(&mut rest);
            return Some(path);
        }
    }
    None
}

fn node_at_mut<'a>(nodes: &'a mut [BlockNode], path: &[usize]) -> &'a mut BlockNode {
    let mut node = &mut nodes[path[0]];
    for idx in &path[1..] {
        node = &mut node.block_children[*idx];
    }
    node
}

fn update_un_nt(ns: &[BpNode], start: &str, graph: &mut String, un_notarized: &mut String) {
    for u in ns {
        let name = format!("proposal_{}", hex::encode(&u.bp.0[..2]));
        un_notarized.push(' ');
        un_notarized.push_str(&name);
        graph.push_str(start);
        graph.push_str(" -> ");
        graph.push_str(&name);
        graph.push('\n');
    }
}

fn update_nt(
    ns: &[BlockNode],
    start: &str,
    graph: &mut String,
    notarized: &mut String,
    un_notarized: &mut String,
) {
    for u in ns {
        let name = format!("block_{}", hex::encode(&u.block.0[..2]));
        notarized.push(' ');
        notarized.push_str(&name);
        graph.push_str(start);
        graph.push_str(" -> ");
        graph.push_str(&name);
        graph.push('\n');

        if !u.block_children.is_empty() {
            update_nt(&u.block_children, &name, graph, notarized, un_notarized);
        }
        if !u.bp_children.is_empty() {
            update_un_nt(&u.bp_children, &name, graph, un_notarized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{NoopSink, NoopUpdater, NullState};
    use crate::MemPool;

    fn new_chain(genesis: Block, threshold: usize) -> Arc<Chain> {
        Chain::new(
            genesis,
            NullState::new(),
            Rand::default(),
            Config {
                group_threshold: threshold,
            },
            Arc::new(MemPool::new()),
            Arc::new(NoopUpdater),
            Arc::new(NoopSink),
        )
        .unwrap()
    }

    fn h(b: u8) -> Hash {
        let mut a = [0u8; 32];
        a[0] = b;
        Hash(a)
    }

    fn proposal(prev: Hash, round: u64) -> BlockProposal {
        BlockProposal {
            round,
            prev_block: prev,
            ..BlockProposal::default()
        }
    }

    fn notarized(bp: &BlockProposal) -> Block {
        Block {
            round: bp.round,
            prev_block: bp.prev_block,
            block_proposal: bp.hash(),
            ..Block::default()
        }
    }

    #[test]
    fn graphviz_renders_the_fork_tree() {
        let chain = new_chain(Block::default(), 0);
        let genesis = chain.genesis();
        {
            let leaf = |b: u8| BlockNode {
                block: h(b),
                bp: Hash::default(),
                weight: 0.0,
                block_children: Vec::new(),
                bp_children: Vec::new(),
            };

            let mut inner = chain.write();
            inner.finalized.extend([h(1), h(2), h(3), h(4)]);
            inner.bp_not_on_fork.push(BpNode { bp: h(5), weight: 0.0 });
            inner.bp_not_on_fork.push(BpNode { bp: h(6), weight: 0.0 });

            let mut fork0 = leaf(7);
            let mut fork02 = leaf(9);
            fork02.bp_children = vec![
                BpNode { bp: h(10), weight: 0.0 },
                BpNode { bp: h(11), weight: 0.0 },
            ];
            fork0.block_children = vec![leaf(8), fork02];

            let mut fork1 = leaf(12);
            fork1.block_children = vec![leaf(13)];

            inner.fork.push(fork0);
            inner.fork.push(fork1);
        }

        let gen = format!("block_{}", hex::encode(&genesis.0[..2]));
        let expected = format!(
            "digraph chain {{\nrankdir=LR;\nsize=\"12,8\"\n\
node [shape = rect, style=filled, color = chartreuse2]; {gen} block_0100 block_0200 block_0300 block_0400\n\
node [shape = rect, style=filled, color = aquamarine]; block_0700 block_0800 block_0900 block_0c00 block_0d00\n\
node [shape = octagon, style=filled, color = aliceblue]; proposal_0500 proposal_0600 proposal_0a00 proposal_0b00\n\
{gen} -> block_0100 -> block_0200 -> block_0300 -> block_0400\n\
block_0400 -> proposal_0500\n\
block_0400 -> proposal_0600\n\
block_0400 -> block_0700\n\
block_0700 -> block_0800\n\
block_0700 -> block_0900\n\
block_0900 -> proposal_0a00\n\
block_0900 -> proposal_0b00\n\
block_0400 -> block_0c00\n\
block_0c00 -> block_0d00\n\n}}\n"
        );
        assert_eq!(chain.graphviz(0), expected);
    }

    #[test]
    fn graphviz_collapses_long_finalized_chains() {
        let chain = new_chain(Block::default(), 0);
        {
            let mut inner = chain.write();
            for i in 1..=9 {
                inner.finalized.push(h(i));
            }
        }
        let dot = chain.graphviz(4);
        assert!(dot.contains("num_blocks_omitted_to_save_space_6"));
    }

    #[test]
    fn adds_are_idempotent() {
        let chain = new_chain(Block::default(), 0);
        let genesis = chain.genesis();

        let bp = proposal(genesis, 1);
        assert!(chain.add_bp(bp.clone(), 1.0).unwrap());
        assert!(!chain.add_bp(bp.clone(), 1.0).unwrap());

        let block = notarized(&bp);
        assert!(chain
            .add_block(block.clone(), &bp, NullState::new(), 1.0)
            .unwrap());
        assert!(!chain
            .add_block(block.clone(), &bp, NullState::new(), 1.0)
            .unwrap());

        assert_eq!(chain.round(), 2);
        assert_eq!(chain.finalized_round(), 0);
        assert_eq!(chain.leader().0.hash(), block.hash());
    }

    #[test]
    fn orphan_proposals_are_rejected() {
        let chain = new_chain(Block::default(), 0);
        let bp = proposal(h(42), 1);
        assert!(matches!(
            chain.add_bp(bp, 1.0),
            Err(ChainError::ParentNotFound { .. })
        ));
    }

    #[test]
    fn leader_follows_cumulative_weight() {
        let chain = new_chain(Block::default(), 0);
        let genesis = chain.genesis();

        let bp_a = proposal(genesis, 1);
        let block_a = notarized(&bp_a);
        chain.add_bp(bp_a.clone(), 1.0).unwrap();
        chain
            .add_block(block_a.clone(), &bp_a, NullState::new(), 1.0)
            .unwrap();

        let mut bp_b = proposal(genesis, 1);
        bp_b.owner = crate::Addr([7; 20]);
        let block_b = notarized(&bp_b);
        chain.add_bp(bp_b.clone(), 0.5).unwrap();
        chain
            .add_block(block_b.clone(), &bp_b, NullState::new(), 0.5)
            .unwrap();

        // heavier single block wins
        assert_eq!(chain.leader().0.hash(), block_a.hash());

        // equal cumulative weight, deeper branch wins
        let bp_c = proposal(block_b.hash(), 2);
        let block_c = notarized(&bp_c);
        chain.add_bp(bp_c.clone(), 0.5).unwrap();
        chain
            .add_block(block_c.clone(), &bp_c, NullState::new(), 0.5)
            .unwrap();
        assert_eq!(chain.leader().0.hash(), block_c.hash());
    }

    #[test]
    fn finality_trails_three_rounds() {
        let chain = new_chain(Block::default(), 0);
        let mut prev = chain.genesis();
        let mut finalized_rounds = Vec::new();

        for round in 1..=5 {
            let bp = proposal(prev, round);
            let block = notarized(&bp);
            chain.add_bp(bp.clone(), 1.0).unwrap();
            chain
                .add_block(block.clone(), &bp, NullState::new(), 1.0)
                .unwrap();
            prev = block.hash();
            finalized_rounds.push(chain.finalized_round());
        }

        // monotone, lagging three rounds behind the voted round
        assert_eq!(finalized_rounds, vec![0, 0, 1, 2, 3]);
        assert_eq!(chain.round(), 6);
        assert!(chain.leader().0.round >= chain.finalized_round());
        assert_eq!(chain.finalized_chain().len(), 4);
    }

    #[test]
    fn finality_waits_on_tied_forks() {
        let chain = new_chain(Block::default(), 0);
        let genesis = chain.genesis();

        for owner in [1u8, 2] {
            let mut bp = proposal(genesis, 1);
            bp.owner = crate::Addr([owner; 20]);
            let block = notarized(&bp);
            chain.add_bp(bp.clone(), 1.0).unwrap();
            chain
                .add_block(block, &bp, NullState::new(), 1.0)
                .unwrap();
        }

        // extend one branch to round 3: finalize(1) sees two roots and waits
        let mut prev = chain.leader().0.hash();
        for round in 2..=3 {
            let bp = proposal(prev, round);
            let block = notarized(&bp);
            chain.add_bp(bp.clone(), 1.0).unwrap();
            chain
                .add_block(block.clone(), &bp, NullState::new(), 1.0)
                .unwrap();
            prev = block.hash();
        }
        assert_eq!(chain.round(), 4);
        assert_eq!(chain.finalized_round(), 0);
    }

    #[test]
    fn chain_status_tracks_beacon_depth() {
        let chain = new_chain(Block::default(), 0);
        let status = chain.chain_status();
        assert_eq!(status.round, 1);
        assert_eq!(status.rand_beacon_depth, 0);
        assert!(status.in_sync());
        assert!(!ChainStatus { round: 9, rand_beacon_depth: 2 }.in_sync());
    }
}
