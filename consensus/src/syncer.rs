use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::block::{Block, BlockProposal, RandBeaconSig};
use crate::chain::{get_transition, Chain, ChainError};
use crate::random_beacon::{rank_to_weight, BeaconError};
use crate::{Hash, State};

/// How long a single peer request may take before the syncer gives up
/// and the caller retries with a different peer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Opaque unicast address of a peer; meaningful only to the requester.
pub type PeerAddr = String;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("peer unavailable: {0}")]
    Unavailable(String),
}

/// The network-facing fetch interface the syncer drives. Implementations
/// honor the timeout and may be called from multiple threads.
pub trait Requester: Send + Sync {
    fn request_block(
        &self,
        peer: &PeerAddr,
        hash: Hash,
        timeout: Duration,
    ) -> Result<Block, RequestError>;

    fn request_block_proposal(
        &self,
        peer: &PeerAddr,
        hash: Hash,
        timeout: Duration,
    ) -> Result<BlockProposal, RequestError>;

    fn request_rand_beacon_sig(
        &self,
        peer: &PeerAddr,
        round: u64,
        timeout: Duration,
    ) -> Result<RandBeaconSig, RequestError>;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("can not connect to chain")]
    CannotConnectToChain,
    #[error("invalid state root")]
    InvalidStateRoot,
    #[error("prev block round is not block proposal round - 1")]
    PrevRoundMismatch,
    #[error("block proposal owner not found")]
    OwnerNotFound,
    #[error("invalid block proposal signature")]
    InvalidSignature,
    #[error("peer returned a different item than requested")]
    UnexpectedResponse,
    #[error("failed to add rand beacon sig, round: {0}")]
    BeaconSigRejected(u64),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Beacon(#[from] BeaconError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Downloads blocks, block proposals and beacon items, validates them
/// and connects them to the chain.
///
/// The synchronization steps:
/// 1. got a new block hash
/// 2. get the block corresponding to the hash
/// 3. get all prev blocks until connected to the chain; stop if the
///    finalized tip is reached without a link
/// 4. recompute each block's transition and insert if the roots agree
pub struct Syncer {
    chain: Arc<Chain>,
    requester: Arc<dyn Requester>,
    sync_rand_beacon_mu: Mutex<()>,
}

impl Syncer {
    pub fn new(chain: Arc<Chain>, requester: Arc<dyn Requester>) -> Self {
        Syncer {
            chain,
            requester,
            sync_rand_beacon_mu: Mutex::new(()),
        }
    }

    pub fn sync_block(
        &self,
        peer: &PeerAddr,
        hash: Hash,
        round: u64,
    ) -> Result<Arc<Block>, SyncError> {
        self.sync_block_and_connect(peer, hash, round)
            .map(|(block, _)| block)
    }

    fn sync_block_and_connect(
        &self,
        peer: &PeerAddr,
        hash: Hash,
        round: u64,
    ) -> Result<(Arc<Block>, Arc<dyn State>), SyncError> {
        if let Some(block) = self.chain.block(hash) {
            // already connected to the chain
            let state = self
                .chain
                .block_to_state(hash)
                .ok_or(SyncError::CannotConnectToChain)?;
            return Ok((block, state));
        }

        if round <= self.chain.finalized_round() {
            return Err(SyncError::CannotConnectToChain);
        }

        let block = self.requester.request_block(peer, hash, REQUEST_TIMEOUT)?;
        if block.hash() != hash {
            return Err(SyncError::UnexpectedResponse);
        }

        // fetch the proposal while recursing on the parent
        let (state_result, bp_result) = thread::scope(|s| {
            let bp_handle = s.spawn(|| {
                self.requester
                    .request_block_proposal(peer, block.block_proposal, REQUEST_TIMEOUT)
            });

            let state_result = if round == 1 {
                if block.prev_block != self.chain.genesis() {
                    Err(SyncError::CannotConnectToChain)
                } else {
                    self.chain
                        .block_to_state(block.prev_block)
                        .ok_or(SyncError::CannotConnectToChain)
                }
            } else {
                self.sync_block_and_connect(peer, block.prev_block, round - 1)
                    .map(|(_, state)| state)
            };

            let bp_result = match bp_handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (state_result, bp_result)
        });

        let state = state_result?;
        let bp = bp_result?;
        if bp.hash() != block.block_proposal {
            return Err(SyncError::UnexpectedResponse);
        }

        let trans = get_transition(&state, &bp.data, bp.round)?;
        if trans.state_hash() != block.state_root {
            return Err(SyncError::InvalidStateRoot);
        }

        if let Err(err) = self.chain.add_bp(bp.clone(), 0.0) {
            error!(%err, "syncer: add block proposal error");
        }

        let (_, state) = trans.commit();
        if let Err(err) = self.chain.add_block(block.clone(), &bp, state.clone(), 0.0) {
            error!(%err, "syncer: add block error");
        }

        Ok((Arc::new(block), state))
    }

    pub fn sync_block_proposal(
        &self,
        peer: &PeerAddr,
        hash: Hash,
    ) -> Result<Arc<BlockProposal>, SyncError> {
        if let Some(bp) = self.chain.block_proposal(hash) {
            return Ok(bp);
        }

        let bp = self
            .requester
            .request_block_proposal(peer, hash, REQUEST_TIMEOUT)?;
        if bp.hash() != hash {
            return Err(SyncError::UnexpectedResponse);
        }

        let prev = if bp.round == 1 {
            if bp.prev_block != self.chain.genesis() {
                return Err(SyncError::CannotConnectToChain);
            }
            self.chain
                .block(self.chain.genesis())
                .ok_or(SyncError::CannotConnectToChain)?
        } else {
            self.sync_block(peer, bp.prev_block, bp.round - 1)?
        };

        self.chain.random_beacon.wait_until(bp.round);

        if prev.round != bp.round - 1 {
            return Err(SyncError::PrevRoundMismatch);
        }

        let rank = self.chain.random_beacon.rank(bp.owner, bp.round)?;

        let sys_state = self.chain.last_finalized_sys_state();
        let pk = sys_state.pk(&bp.owner).ok_or(SyncError::OwnerNotFound)?;
        if !pk.verify(&bp.encode(false), &bp.owner_sig) {
            return Err(SyncError::InvalidSignature);
        }

        if bp.round == self.chain.round() {
            self.chain.add_bp(bp.clone(), rank_to_weight(rank))?;
        }

        Ok(self
            .chain
            .block_proposal(hash)
            .unwrap_or_else(|| Arc::new(bp)))
    }

    /// Backfill beacon items from `round` down to the local beacon's
    /// round, then apply them forward in order. Single-flight: concurrent
    /// backfills would fight over the contiguity requirement.
    pub fn sync_rand_beacon_sig(&self, peer: &PeerAddr, round: u64) -> Result<bool, SyncError> {
        info!(round, "syncing rand beacon sig");
        let beacon = &self.chain.random_beacon;
        if beacon.round() > round {
            return Ok(false);
        }

        let _flight = self
            .sync_rand_beacon_mu
            .lock()
            .expect("beacon sync lock poisoned");

        let mut sigs = Vec::new();
        let mut fetch_round = round;
        while beacon.round() < fetch_round {
            let sig = self
                .requester
                .request_rand_beacon_sig(peer, fetch_round, REQUEST_TIMEOUT)?;
            if sig.round == 0 {
                // the genesis value is seeded, never signed
                return Err(SyncError::UnexpectedResponse);
            }
            fetch_round = sig.round - 1;
            sigs.push(sig);
        }

        for sig in sigs.iter().rev() {
            if !beacon.add_rand_beacon_sig(sig) {
                return Err(SyncError::BeaconSigRejected(sig.round));
            }
        }

        Ok(true)
    }
}
