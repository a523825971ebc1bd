use bincode::Options;
use consensus::{bincode_config, canonical_encode, Addr, KeyError, Sig, PK, SK};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::account::Account;
use crate::market::{MarketSymbol, OrderID};
use crate::state::State;
use crate::token::{TokenID, TokenInfo};

/// How far ahead of a slot's counter a nonce may run and still be kept
/// around as valid-but-not-ready.
pub const NONCE_LOOKAHEAD: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnType {
    PlaceOrder,
    CancelOrder,
    IssueToken,
    SendToken,
    FreezeToken,
    BurnToken,
}

impl TxnType {
    pub fn tag(self) -> u8 {
        match self {
            TxnType::PlaceOrder => 0,
            TxnType::CancelOrder => 1,
            TxnType::IssueToken => 2,
            TxnType::SendToken => 3,
            TxnType::FreezeToken => 4,
            TxnType::BurnToken => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<TxnType> {
        match tag {
            0 => Some(TxnType::PlaceOrder),
            1 => Some(TxnType::CancelOrder),
            2 => Some(TxnType::IssueToken),
            3 => Some(TxnType::SendToken),
            4 => Some(TxnType::FreezeToken),
            5 => Some(TxnType::BurnToken),
            _ => None,
        }
    }
}

/// The transaction wire envelope. The signature covers the encoding with
/// `sig` zeroed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Txn {
    pub t: u8,
    pub data: Vec<u8>,
    pub nonce_idx: u8,
    pub nonce_value: u64,
    pub owner: Addr,
    pub sig: Sig,
}

impl Txn {
    pub fn kind(&self) -> Option<TxnType> {
        TxnType::from_tag(self.t)
    }

    pub fn encode(&self, with_sig: bool) -> Vec<u8> {
        if with_sig {
            canonical_encode(self)
        } else {
            let mut unsigned = self.clone();
            unsigned.sig = Sig::default();
            canonical_encode(&unsigned)
        }
    }

    pub fn hash(&self) -> consensus::Hash {
        consensus::Hash::of(&self.encode(true))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderTxn {
    pub sell_side: bool,
    /// Quantity in base units; the step size is the base token's
    /// decimals.
    pub quant: u64,
    /// Price tick size is 10^-8.
    pub price: u64,
    /// The order expires when this round's events run.
    pub expire_round: u64,
    pub market: MarketSymbol,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelOrderTxn {
    pub market: MarketSymbol,
    pub id: OrderID,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssueTokenTxn {
    pub info: TokenInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendTokenTxn {
    pub token_id: TokenID,
    pub to: PK,
    pub quant: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FreezeTokenTxn {
    pub token_id: TokenID,
    /// Round at which the frozen quantity unlocks back to available.
    pub available_round: u64,
    pub quant: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BurnTokenTxn {
    pub token_id: TokenID,
    pub quant: u64,
}

fn make_txn(
    sk: &SK,
    owner: Addr,
    kind: TxnType,
    data: Vec<u8>,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    let mut txn = Txn {
        t: kind.tag(),
        data,
        nonce_idx,
        nonce_value,
        owner,
        sig: Sig::default(),
    };
    txn.sig = sk.sign(&txn.encode(false))?;
    Ok(txn.encode(true))
}

pub fn make_place_order_txn(
    sk: &SK,
    owner: Addr,
    txn: PlaceOrderTxn,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    make_txn(
        sk,
        owner,
        TxnType::PlaceOrder,
        canonical_encode(&txn),
        nonce_idx,
        nonce_value,
    )
}

pub fn make_cancel_order_txn(
    sk: &SK,
    owner: Addr,
    txn: CancelOrderTxn,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    make_txn(
        sk,
        owner,
        TxnType::CancelOrder,
        canonical_encode(&txn),
        nonce_idx,
        nonce_value,
    )
}

pub fn make_issue_token_txn(
    sk: &SK,
    owner: Addr,
    info: TokenInfo,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    make_txn(
        sk,
        owner,
        TxnType::IssueToken,
        canonical_encode(&IssueTokenTxn { info }),
        nonce_idx,
        nonce_value,
    )
}

pub fn make_send_token_txn(
    sk: &SK,
    owner: Addr,
    txn: SendTokenTxn,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    make_txn(
        sk,
        owner,
        TxnType::SendToken,
        canonical_encode(&txn),
        nonce_idx,
        nonce_value,
    )
}

pub fn make_freeze_token_txn(
    sk: &SK,
    owner: Addr,
    txn: FreezeTokenTxn,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    make_txn(
        sk,
        owner,
        TxnType::FreezeToken,
        canonical_encode(&txn),
        nonce_idx,
        nonce_value,
    )
}

pub fn make_burn_token_txn(
    sk: &SK,
    owner: Addr,
    txn: BurnTokenTxn,
    nonce_idx: u8,
    nonce_value: u64,
) -> Result<Vec<u8>, KeyError> {
    make_txn(
        sk,
        owner,
        TxnType::BurnToken,
        canonical_encode(&txn),
        nonce_idx,
        nonce_value,
    )
}

pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Box<bincode::ErrorKind>> {
    bincode_config().deserialize(bytes)
}

pub(crate) enum Validated {
    Invalid,
    NotReady,
    Ready { txn: Txn, owner: Account },
}

/// Decode the envelope and check owner existence, signature and the
/// nonce slot rule. A future nonce within the look-ahead is valid but
/// not ready; a past nonce is invalid.
pub(crate) fn validate_sig_and_nonce(state: &State, raw: &[u8]) -> Validated {
    let txn: Txn = match decode_payload(raw) {
        Ok(txn) => txn,
        Err(err) => {
            warn!(%err, "txn decode failed");
            return Validated::Invalid;
        }
    };

    let owner = match state.account(&txn.owner) {
        Some(acc) => acc,
        None => {
            warn!("txn owner not found");
            return Validated::Invalid;
        }
    };

    if !owner.pk.verify(&txn.encode(false), &txn.sig) {
        warn!("invalid txn signature");
        return Validated::Invalid;
    }

    let current = owner.nonce(txn.nonce_idx);
    if txn.nonce_value < current {
        warn!(
            slot = txn.nonce_idx,
            nonce = txn.nonce_value,
            current, "txn nonce already consumed"
        );
        return Validated::Invalid;
    }
    if txn.nonce_value > current {
        if txn.nonce_value - current > NONCE_LOOKAHEAD {
            warn!(
                slot = txn.nonce_idx,
                nonce = txn.nonce_value,
                current, "txn nonce beyond the look-ahead window"
            );
            return Validated::Invalid;
        }
        return Validated::NotReady;
    }

    Validated::Ready { txn, owner }
}
