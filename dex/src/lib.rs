//! The DEX ledger: a Merkle-authenticated state of tokens, accounts and
//! order books, plus the transition engine that applies ordered
//! transaction batches deterministically. Plugs into the consensus core
//! through the `consensus::State` / `consensus::Transition` traits.
#![forbid(unsafe_code)]

pub mod account;
pub mod market;
pub mod state;
pub mod token;
pub mod transition;
pub mod txn;

pub use crate::account::{Account, Balance};
pub use crate::market::{MarketDecodeError, MarketSymbol, Order, OrderBook, OrderID, PendingOrder};
pub use crate::state::{FreezeToken, GenesisConfig, OrderExpiration, State};
pub use crate::token::{Token, TokenID, TokenInfo};
pub use crate::transition::{Transition, ORDER_PRICE_DECIMALS, PRICE_SCALE};
pub use crate::txn::{
    make_burn_token_txn, make_cancel_order_txn, make_freeze_token_txn, make_issue_token_txn,
    make_place_order_txn, make_send_token_txn, BurnTokenTxn, CancelOrderTxn, FreezeTokenTxn,
    IssueTokenTxn, PlaceOrderTxn, SendTokenTxn, Txn, TxnType, NONCE_LOOKAHEAD,
};
