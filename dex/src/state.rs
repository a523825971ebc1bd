use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use bincode::Options;
use consensus::{bincode_config, canonical_encode, Addr, Hash, PK};
use serde::{Deserialize, Serialize};
use ::state::{BlobError, MerkleTrie, Store, TrieBlob};
use tracing::error;

use crate::account::{Account, Balance};
use crate::market::{MarketSymbol, OrderBook, OrderID};
use crate::token::{native_token_info, Token, TokenID, TokenInfo};
use crate::transition::Transition;

const ACCOUNT_PREFIX: u8 = 0x00;
const MARKET_PREFIX: u8 = 0x01;
const TOKEN_PREFIX: u8 = 0x02;
const ORDER_EXPIRATION_PREFIX: u8 = 0x03;
const FREEZE_AT_ROUND_PREFIX: u8 = 0x04;

fn account_path(addr: &Addr) -> Vec<u8> {
    let mut path = Vec::with_capacity(21);
    path.push(ACCOUNT_PREFIX);
    path.extend_from_slice(&addr.0);
    path
}

fn market_path(market: &MarketSymbol) -> Vec<u8> {
    let mut path = Vec::with_capacity(129);
    path.push(MARKET_PREFIX);
    path.extend_from_slice(&market.encode());
    path
}

fn round_path(prefix: u8, value: u64) -> Vec<u8> {
    // little-endian id zero-padded to 64 bytes, as every round/token
    // path in the trie
    let mut path = vec![0u8; 65];
    path[0] = prefix;
    path[1..9].copy_from_slice(&value.to_le_bytes());
    path
}

fn token_path(id: TokenID) -> Vec<u8> {
    round_path(TOKEN_PREFIX, id)
}

fn expiration_path(round: u64) -> Vec<u8> {
    round_path(ORDER_EXPIRATION_PREFIX, round)
}

fn freeze_at_round_path(round: u64) -> Vec<u8> {
    round_path(FREEZE_AT_ROUND_PREFIX, round)
}

/// An order due to expire, kept in the per-round expiration index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderExpiration {
    pub id: OrderID,
    pub owner: Addr,
    pub market: MarketSymbol,
}

/// A scheduled unlock: `quant` moves from pending back to available
/// when the listed round's events run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FreezeToken {
    pub addr: Addr,
    pub token_id: TokenID,
    pub quant: u64,
}

/// Genesis parameters: the native token, any extra tokens, and the
/// recipients the supply is split across. Token supplies must divide
/// evenly by the recipient count.
#[derive(Clone, Debug)]
pub struct GenesisConfig {
    pub native_token: TokenInfo,
    pub additional_tokens: Vec<TokenInfo>,
    pub recipients: Vec<PK>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            native_token: native_token_info(),
            additional_tokens: Vec::new(),
            recipients: Vec::new(),
        }
    }
}

struct StateInner {
    tree: MerkleTrie,
    account_cache: HashMap<Addr, Account>,
    account_dirty: HashSet<Addr>,
}

/// The DEX ledger state: a typed view over the authenticated trie with a
/// write-back account cache. All access is serialized by one mutex;
/// transitions run on their own snapshot and only meet the parent state
/// at commit.
pub struct State {
    store: Store,
    inner: Mutex<StateInner>,
}

impl State {
    pub fn new(store: Store) -> State {
        let tree = store.empty_tree();
        State::from_tree(store, tree)
    }

    fn from_tree(store: Store, tree: MerkleTrie) -> State {
        State {
            store,
            inner: Mutex::new(StateInner {
                tree,
                account_cache: HashMap::new(),
                account_dirty: HashSet::new(),
            }),
        }
    }

    /// Build the genesis ledger: register every token and split each
    /// supply evenly across the recipients.
    pub fn genesis(cfg: &GenesisConfig) -> State {
        let state = State::new(Store::new());

        let mut tokens = Vec::with_capacity(cfg.additional_tokens.len() + 1);
        tokens.push(Token {
            id: 0,
            info: cfg.native_token.clone(),
        });
        for (i, info) in cfg.additional_tokens.iter().enumerate() {
            tokens.push(Token {
                id: i as TokenID + 1,
                info: info.clone(),
            });
        }

        for token in &tokens {
            state.update_token(token);
        }

        for pk in &cfg.recipients {
            let mut account = Account::new(pk.clone());
            for token in &tokens {
                let share = token.info.total_units / cfg.recipients.len() as u64;
                account.balances.insert(
                    token.id,
                    Balance {
                        available: share,
                        pending: 0,
                    },
                );
            }
            state.update_account(account);
        }

        state
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// The account of the given address, preferring the write-back cache
    /// so a transition observes its own updates.
    pub fn account(&self, addr: &Addr) -> Option<Account> {
        let mut inner = self.lock();
        if let Some(cached) = inner.account_cache.get(addr) {
            return Some(cached.clone());
        }

        let bytes = inner.tree.get(&account_path(addr))?.to_vec();
        let account: Account = match bincode_config().deserialize(&bytes) {
            Ok(acc) => acc,
            Err(err) => {
                error!(%err, %addr, "decode account error");
                return None;
            }
        };
        inner.account_cache.insert(*addr, account.clone());
        Some(account)
    }

    /// Stage an account update. The serialized form is written through
    /// on the next cache commit.
    pub fn update_account(&self, account: Account) {
        let addr = account.addr();
        let mut inner = self.lock();
        inner.account_cache.insert(addr, account);
        inner.account_dirty.insert(addr);
    }

    /// Write every dirty cached account through to the trie.
    pub fn commit_cache(&self) {
        let mut inner = self.lock();
        flush_accounts(&mut inner);
    }

    /// Tokens are rarely mutated; updates are written through directly.
    pub fn update_token(&self, token: &Token) {
        let mut inner = self.lock();
        let bytes = canonical_encode(token);
        inner.tree.insert(&token_path(token.id), &bytes);
    }

    pub fn token(&self, id: TokenID) -> Option<Token> {
        let inner = self.lock();
        let bytes = inner.tree.get(&token_path(id))?;
        Some(
            bincode_config()
                .deserialize(bytes)
                .expect("corrupt token in state trie"),
        )
    }

    /// All issued tokens. Iteration follows the trie's path order, which
    /// is not numeric id order (the path encodes ids little-endian).
    pub fn tokens(&self) -> Vec<Token> {
        let inner = self.lock();
        inner
            .tree
            .iter_prefix(&[TOKEN_PREFIX])
            .map(|(_, bytes)| {
                bincode_config()
                    .deserialize(bytes)
                    .expect("corrupt token in state trie")
            })
            .collect()
    }

    pub fn load_order_book(&self, market: &MarketSymbol) -> Option<OrderBook> {
        let inner = self.lock();
        let bytes = inner.tree.get(&market_path(market))?;
        Some(
            bincode_config()
                .deserialize(bytes)
                .expect("corrupt order book in state trie"),
        )
    }

    pub fn save_order_book(&self, market: &MarketSymbol, book: &OrderBook) {
        let mut inner = self.lock();
        let bytes = canonical_encode(book);
        inner.tree.insert(&market_path(market), &bytes);
    }

    pub fn get_order_expirations(&self, round: u64) -> Vec<OrderExpiration> {
        let inner = self.lock();
        read_list(&inner.tree, &expiration_path(round))
    }

    pub fn add_order_expirations(&self, round: u64, entries: Vec<OrderExpiration>) {
        let mut inner = self.lock();
        let path = expiration_path(round);
        let mut all: Vec<OrderExpiration> = read_list(&inner.tree, &path);
        all.extend(entries);
        let bytes = canonical_encode(&all);
        inner.tree.insert(&path, &bytes);
    }

    pub fn remove_order_expirations(&self, round: u64, ids: &BTreeSet<OrderID>) {
        let mut inner = self.lock();
        let path = expiration_path(round);
        let mut all: Vec<OrderExpiration> = read_list(&inner.tree, &path);
        all.retain(|exp| !ids.contains(&exp.id));
        if all.is_empty() {
            inner.tree.remove(&path);
        } else {
            let bytes = canonical_encode(&all);
            inner.tree.insert(&path, &bytes);
        }
    }

    pub(crate) fn clear_order_expirations(&self, round: u64) {
        let mut inner = self.lock();
        inner.tree.remove(&expiration_path(round));
    }

    pub fn get_freeze_tokens(&self, round: u64) -> Vec<FreezeToken> {
        let inner = self.lock();
        read_list(&inner.tree, &freeze_at_round_path(round))
    }

    pub fn freeze_token(&self, round: u64, entry: FreezeToken) {
        let mut inner = self.lock();
        let path = freeze_at_round_path(round);
        let mut all: Vec<FreezeToken> = read_list(&inner.tree, &path);
        all.push(entry);
        let bytes = canonical_encode(&all);
        inner.tree.insert(&path, &bytes);
    }

    pub(crate) fn clear_freeze_tokens(&self, round: u64) {
        let mut inner = self.lock();
        inner.tree.remove(&freeze_at_round_path(round));
    }

    /// Root hash of the state; commits the account cache first.
    pub fn hash(&self) -> Hash {
        let mut inner = self.lock();
        flush_accounts(&mut inner);
        Hash(inner.tree.root_hash())
    }

    /// Seal the current state as a version in the store.
    pub(crate) fn commit(&self) -> Hash {
        let mut inner = self.lock();
        flush_accounts(&mut inner);
        Hash(inner.tree.commit())
    }

    /// Export the tree reachable from the current root, for bootstrap.
    pub fn serialize(&self) -> TrieBlob {
        let mut inner = self.lock();
        flush_accounts(&mut inner);
        inner.tree.commit();
        TrieBlob::from_tree(&inner.tree)
    }

    /// Replace this state with the tree carried by `blob`.
    pub fn deserialize(&self, blob: TrieBlob) -> Result<(), BlobError> {
        let tree = blob.into_tree(&self.store)?;
        let mut inner = self.lock();
        inner.tree = tree;
        inner.account_cache.clear();
        inner.account_dirty.clear();
        Ok(())
    }

    /// Commit the cache, seal the tree, and open a transition for the
    /// given round on a fresh working tree rooted there.
    pub fn transition(&self, round: u64) -> Transition {
        let root = {
            let mut inner = self.lock();
            flush_accounts(&mut inner);
            inner.tree.commit()
        };

        let tree = self
            .store
            .tree(root)
            .expect("root committed a moment ago must resolve");
        Transition::new(State::from_tree(self.store.clone(), tree), round)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().expect("state lock poisoned")
    }
}

impl consensus::State for State {
    fn hash(&self) -> Hash {
        State::hash(self)
    }

    fn transition(&self, round: u64) -> Box<dyn consensus::Transition> {
        Box::new(State::transition(self, round))
    }
}

fn flush_accounts(inner: &mut StateInner) {
    let dirty: Vec<Addr> = inner.account_dirty.drain().collect();
    for addr in dirty {
        let account = inner
            .account_cache
            .get(&addr)
            .expect("dirty account missing from cache");
        let bytes = canonical_encode(account);
        inner.tree.insert(&account_path(&addr), &bytes);
    }
}

fn read_list<T: serde::de::DeserializeOwned>(tree: &MerkleTrie, path: &[u8]) -> Vec<T> {
    match tree.get(path) {
        None => Vec::new(),
        Some(bytes) => bincode_config()
            .deserialize(bytes)
            .expect("corrupt per-round list in state trie"),
    }
}
