use std::collections::BTreeSet;

use consensus::Hash;
use std::sync::Arc;
use tracing::{error, warn};

use crate::account::Account;
use crate::market::{MarketSymbol, Order};
use crate::state::{FreezeToken, OrderExpiration, State};
use crate::token::{Token, TokenID};
use crate::txn::{
    decode_payload, validate_sig_and_nonce, BurnTokenTxn, CancelOrderTxn, FreezeTokenTxn,
    IssueTokenTxn, PlaceOrderTxn, SendTokenTxn, TxnType, Validated,
};

pub const ORDER_PRICE_DECIMALS: u32 = 8;
/// Fixed-point scale of order prices: a price of `PRICE_SCALE` is 1.0
/// quote per base.
pub const PRICE_SCALE: u64 = 10u64.pow(ORDER_PRICE_DECIMALS);

/// Staged mutations against a snapshot of the ledger at a given round.
/// Accumulates the ordered batch of applied transactions; either
/// discarded or committed.
pub struct Transition {
    state: State,
    round: u64,
    txns: Vec<Vec<u8>>,
}

impl Transition {
    pub(crate) fn new(state: State, round: u64) -> Transition {
        let t = Transition {
            state,
            round,
            txns: Vec::new(),
        };
        t.apply_round_events();
        t
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Read access to the staged state, e.g. for wallet queries against
    /// a proposal under construction.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Record one transaction.
    ///
    /// `valid` is whether the envelope decodes, the owner exists, the
    /// signature verifies and the nonce is not stale; `success` is
    /// whether the intent applied. A valid transaction with a future
    /// nonce returns `(true, false)` and may be retried once the slot
    /// catches up.
    pub fn record(&mut self, raw: &[u8]) -> (bool, bool) {
        let (txn, mut owner) = match validate_sig_and_nonce(&self.state, raw) {
            Validated::Invalid => return (false, false),
            Validated::NotReady => return (true, false),
            Validated::Ready { txn, owner } => (txn, owner),
        };

        let applied = match txn.kind() {
            Some(TxnType::PlaceOrder) => match decode_payload::<PlaceOrderTxn>(&txn.data) {
                Ok(payload) => self.place_order(&mut owner, payload),
                Err(err) => {
                    warn!(%err, "place order txn decode failed");
                    false
                }
            },
            Some(TxnType::CancelOrder) => match decode_payload::<CancelOrderTxn>(&txn.data) {
                Ok(payload) => self.cancel_order(&mut owner, payload),
                Err(err) => {
                    warn!(%err, "cancel order txn decode failed");
                    false
                }
            },
            Some(TxnType::IssueToken) => match decode_payload::<IssueTokenTxn>(&txn.data) {
                Ok(payload) => self.issue_token(&mut owner, payload),
                Err(err) => {
                    warn!(%err, "issue token txn decode failed");
                    false
                }
            },
            Some(TxnType::SendToken) => match decode_payload::<SendTokenTxn>(&txn.data) {
                Ok(payload) => self.send_token(&mut owner, payload),
                Err(err) => {
                    warn!(%err, "send token txn decode failed");
                    false
                }
            },
            Some(TxnType::FreezeToken) => match decode_payload::<FreezeTokenTxn>(&txn.data) {
                Ok(payload) => self.freeze_token(&mut owner, payload),
                Err(err) => {
                    warn!(%err, "freeze token txn decode failed");
                    false
                }
            },
            Some(TxnType::BurnToken) => match decode_payload::<BurnTokenTxn>(&txn.data) {
                Ok(payload) => self.burn_token(&mut owner, payload),
                Err(err) => {
                    warn!(%err, "burn token txn decode failed");
                    false
                }
            },
            None => {
                warn!(tag = txn.t, "unknown txn type");
                return (false, false);
            }
        };

        if !applied {
            return (true, false);
        }

        owner.advance_nonce(txn.nonce_idx, txn.nonce_value);
        self.state.update_account(owner);
        self.txns.push(raw.to_vec());
        (true, true)
    }

    /// Ordered list of successfully recorded transaction bytes; this is
    /// what goes into the block proposal.
    pub fn txns(&self) -> Vec<Vec<u8>> {
        self.txns.clone()
    }

    /// Root the transition would produce if committed now.
    pub fn state_hash(&self) -> Hash {
        self.state.hash()
    }

    /// Seal the transition into the underlying store; returns the new
    /// root and the state at that root.
    pub fn commit(self) -> (Hash, State) {
        let root = self.state.commit();
        (root, self.state)
    }

    fn place_order(&mut self, owner: &mut Account, txn: PlaceOrderTxn) -> bool {
        if self.state.token(txn.market.base).is_none() {
            error!(token = txn.market.base, "trying to place order on nonexistent token");
            return false;
        }
        if self.state.token(txn.market.quote).is_none() {
            error!(token = txn.market.quote, "trying to place order on nonexistent token");
            return false;
        }
        if txn.expire_round <= self.round {
            warn!(
                expire = txn.expire_round,
                round = self.round,
                "order would expire before it rests"
            );
            return false;
        }

        let order = Order {
            id: 0,
            sell_side: txn.sell_side,
            quant: txn.quant,
            price: txn.price,
            expire_round: txn.expire_round,
        };
        let Some((sell, sell_quant)) = sell_side_reservation(&txn.market, &order) else {
            warn!("order sell quantity overflows");
            return false;
        };

        let addr = owner.addr();
        let Some(balance) = owner.balances.get_mut(&sell) else {
            warn!(token = sell, "does not have balance for the given token");
            return false;
        };
        if balance.available <= sell_quant {
            warn!(token = sell, quant = sell_quant, "insufficient quant to sell");
            return false;
        }
        let Some(pending) = balance.pending.checked_add(sell_quant) else {
            warn!(token = sell, "pending balance would overflow");
            return false;
        };
        balance.available -= sell_quant;
        balance.pending = pending;

        let mut book = self.state.load_order_book(&txn.market).unwrap_or_default();
        let id = book.add(addr, txn.sell_side, txn.quant, txn.price, txn.expire_round);
        self.state.save_order_book(&txn.market, &book);
        self.state.add_order_expirations(
            txn.expire_round,
            vec![OrderExpiration {
                id,
                owner: addr,
                market: txn.market,
            }],
        );

        if !owner.order_markets.contains(&txn.market) {
            owner.order_markets.push(txn.market);
        }
        true
    }

    fn send_token(&mut self, owner: &mut Account, txn: SendTokenTxn) -> bool {
        if txn.quant == 0 {
            return false;
        }

        let owner_addr = owner.addr();
        let to_addr = txn.to.addr();
        let Some(balance) = owner.balances.get_mut(&txn.token_id) else {
            warn!(token = txn.token_id, "trying to send token that the owner does not have");
            return false;
        };
        if balance.available < txn.quant {
            warn!(
                token = txn.token_id,
                quant = txn.quant,
                available = balance.available,
                "insufficient available token balance"
            );
            return false;
        }

        if to_addr == owner_addr {
            // transfer to self leaves the balance untouched
            return true;
        }

        // the recipient account is created lazily
        let mut recipient = self
            .state
            .account(&to_addr)
            .unwrap_or_else(|| Account::new(txn.to.clone()));
        let entry = recipient.balances.entry(txn.token_id).or_default();
        let Some(received) = entry.available.checked_add(txn.quant) else {
            warn!(token = txn.token_id, "recipient balance would overflow");
            return false;
        };
        entry.available = received;
        balance.available -= txn.quant;

        self.state.update_account(recipient);
        true
    }

    fn cancel_order(&mut self, owner: &mut Account, txn: CancelOrderTxn) -> bool {
        let Some(mut book) = self.state.load_order_book(&txn.market) else {
            warn!("cancel order on a market with no orders");
            return false;
        };
        let Some(pending_order) = book.get(txn.id) else {
            warn!(id = txn.id, "cancel order not found");
            return false;
        };
        if pending_order.owner != owner.addr() {
            warn!(id = txn.id, "cancel order owner mismatch");
            return false;
        }
        let order = pending_order.order.clone();

        if !release_reservation(owner, &txn.market, &order) {
            return false;
        }

        book.remove(txn.id);
        self.state.save_order_book(&txn.market, &book);
        self.state
            .remove_order_expirations(order.expire_round, &BTreeSet::from([txn.id]));
        if !book.has_orders_of(&owner.addr()) {
            owner.order_markets.retain(|m| *m != txn.market);
        }
        true
    }

    fn issue_token(&mut self, owner: &mut Account, txn: IssueTokenTxn) -> bool {
        if txn.info.symbol.is_empty() {
            warn!("refusing to issue a token without a symbol");
            return false;
        }

        // registry ids are dense; the next id is the current count
        let id = self.state.tokens().len() as TokenID;
        let entry = owner.balances.entry(id).or_default();
        let Some(credited) = entry.available.checked_add(txn.info.total_units) else {
            warn!("issuer balance would overflow");
            return false;
        };
        entry.available = credited;

        self.state.update_token(&Token {
            id,
            info: txn.info,
        });
        true
    }

    fn freeze_token(&mut self, owner: &mut Account, txn: FreezeTokenTxn) -> bool {
        if txn.quant == 0 {
            return false;
        }
        if txn.available_round <= self.round {
            warn!(
                available_round = txn.available_round,
                round = self.round,
                "freeze would unlock in the past"
            );
            return false;
        }
        if self.state.token(txn.token_id).is_none() {
            warn!(token = txn.token_id, "freezing a nonexistent token");
            return false;
        }

        let addr = owner.addr();
        let Some(balance) = owner.balances.get_mut(&txn.token_id) else {
            warn!(token = txn.token_id, "freezing a token the owner does not have");
            return false;
        };
        if balance.available < txn.quant {
            warn!(token = txn.token_id, "insufficient available balance to freeze");
            return false;
        }
        let Some(pending) = balance.pending.checked_add(txn.quant) else {
            warn!(token = txn.token_id, "pending balance would overflow");
            return false;
        };
        balance.available -= txn.quant;
        balance.pending = pending;

        self.state.freeze_token(
            txn.available_round,
            FreezeToken {
                addr,
                token_id: txn.token_id,
                quant: txn.quant,
            },
        );
        true
    }

    fn burn_token(&mut self, owner: &mut Account, txn: BurnTokenTxn) -> bool {
        if txn.quant == 0 {
            return false;
        }
        let Some(mut token) = self.state.token(txn.token_id) else {
            warn!(token = txn.token_id, "burning a nonexistent token");
            return false;
        };
        let Some(balance) = owner.balances.get_mut(&txn.token_id) else {
            warn!(token = txn.token_id, "burning a token the owner does not have");
            return false;
        };
        if balance.available < txn.quant {
            warn!(token = txn.token_id, "insufficient available balance to burn");
            return false;
        }
        let Some(remaining) = token.info.total_units.checked_sub(txn.quant) else {
            warn!(token = txn.token_id, "burn exceeds the total supply");
            return false;
        };

        balance.available -= txn.quant;
        token.info.total_units = remaining;
        self.state.update_token(&token);
        true
    }

    /// Apply the round's scheduled events before any transaction: frozen
    /// balances unlock and expired orders leave their books. Every
    /// replica building a transition for this round derives the same
    /// root, batch or no batch.
    fn apply_round_events(&self) {
        let unlocks = self.state.get_freeze_tokens(self.round);
        if !unlocks.is_empty() {
            for unlock in &unlocks {
                let Some(mut account) = self.state.account(&unlock.addr) else {
                    error!(addr = %unlock.addr, "scheduled unlock for a missing account");
                    continue;
                };
                let Some(balance) = account.balances.get_mut(&unlock.token_id) else {
                    error!(addr = %unlock.addr, "scheduled unlock for a missing balance");
                    continue;
                };
                if balance.pending < unlock.quant {
                    error!(addr = %unlock.addr, "scheduled unlock exceeds the pending balance");
                    continue;
                }
                balance.pending -= unlock.quant;
                balance.available += unlock.quant;
                self.state.update_account(account);
            }
            self.state.clear_freeze_tokens(self.round);
        }

        let expirations = self.state.get_order_expirations(self.round);
        if !expirations.is_empty() {
            for exp in &expirations {
                let Some(mut book) = self.state.load_order_book(&exp.market) else {
                    error!(id = exp.id, "expiration references a market with no orders");
                    continue;
                };
                let Some(pending_order) = book.remove(exp.id) else {
                    error!(id = exp.id, "expiration references a dead order");
                    continue;
                };
                self.state.save_order_book(&exp.market, &book);

                let Some(mut account) = self.state.account(&exp.owner) else {
                    error!(addr = %exp.owner, "expired order for a missing account");
                    continue;
                };
                release_reservation(&mut account, &exp.market, &pending_order.order);
                if !book.has_orders_of(&exp.owner) {
                    account.order_markets.retain(|m| *m != exp.market);
                }
                self.state.update_account(account);
            }
            self.state.clear_order_expirations(self.round);
        }
    }
}

impl consensus::Transition for Transition {
    fn record(&mut self, txn: &[u8]) -> (bool, bool) {
        Transition::record(self, txn)
    }

    fn txns(&self) -> Vec<Vec<u8>> {
        Transition::txns(self)
    }

    fn state_hash(&self) -> Hash {
        Transition::state_hash(self)
    }

    fn commit(self: Box<Self>) -> (Hash, Arc<dyn consensus::State>) {
        let (root, state) = Transition::commit(*self);
        (root, Arc::new(state))
    }
}

/// The token and quantity an order reserves on its owner's balance:
/// the full base quantity when selling, `floor(quant * price / 10^8)`
/// quote units when buying.
fn sell_side_reservation(market: &MarketSymbol, order: &Order) -> Option<(TokenID, u64)> {
    if order.sell_side {
        return Some((market.base, order.quant));
    }
    let quote = (order.quant as u128) * (order.price as u128) / (PRICE_SCALE as u128);
    u64::try_from(quote).ok().map(|q| (market.quote, q))
}

/// Move an order's reservation from pending back to available.
fn release_reservation(account: &mut Account, market: &MarketSymbol, order: &Order) -> bool {
    let Some((sell, sell_quant)) = sell_side_reservation(market, order) else {
        error!(id = order.id, "order reservation overflows on release");
        return false;
    };
    let Some(balance) = account.balances.get_mut(&sell) else {
        error!(id = order.id, "order reservation has no backing balance");
        return false;
    };
    if balance.pending < sell_quant {
        error!(id = order.id, "order reservation exceeds the pending balance");
        return false;
    }
    balance.pending -= sell_quant;
    balance.available += sell_quant;
    true
}
