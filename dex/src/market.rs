use consensus::Addr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::TokenID;

/// Identifier unique within one market's order book.
pub type OrderID = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarketDecodeError {
    #[error("bytes len not correct, expected 128, received {0}")]
    BadLength(usize),
}

/// The symbol of a trading pair.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MarketSymbol {
    /// The unit of the order's quantity.
    pub base: TokenID,
    /// The unit of the order's price.
    pub quote: TokenID,
}

impl MarketSymbol {
    /// Bytes representation used as the market's path segment in the
    /// state trie: each token id little-endian, zero-padded to 64 bytes,
    /// quote first. The padding is load-bearing: changing it changes
    /// every market path and therefore the state root.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 128];
        buf[..8].copy_from_slice(&self.quote.to_le_bytes());
        buf[64..72].copy_from_slice(&self.base.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MarketDecodeError> {
        if bytes.len() != 128 {
            return Err(MarketDecodeError::BadLength(bytes.len()));
        }

        let mut quote = [0u8; 8];
        quote.copy_from_slice(&bytes[..8]);
        let mut base = [0u8; 8];
        base.copy_from_slice(&bytes[64..72]);
        Ok(MarketSymbol {
            base: u64::from_le_bytes(base),
            quote: u64::from_le_bytes(quote),
        })
    }
}

/// A resting limit order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderID,
    pub sell_side: bool,
    /// Quantity in base-token units.
    pub quant: u64,
    /// Price in `10^-8` quote per base.
    pub price: u64,
    /// The order leaves the book when this round's events run.
    pub expire_round: u64,
}

/// An order together with the account that placed it. The owner's
/// `pending` balance carries the matching reservation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub owner: Addr,
    pub order: Order,
}

/// One market's resting orders, serialized as a whole into the state
/// trie. Read-modify-write is the caller's responsibility.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    next_order_id: OrderID,
    orders: Vec<PendingOrder>,
}

impl OrderBook {
    pub fn add(
        &mut self,
        owner: Addr,
        sell_side: bool,
        quant: u64,
        price: u64,
        expire_round: u64,
    ) -> OrderID {
        let id = self.next_order_id;
        self.next_order_id += 1;
        self.orders.push(PendingOrder {
            owner,
            order: Order {
                id,
                sell_side,
                quant,
                price,
                expire_round,
            },
        });
        id
    }

    pub fn get(&self, id: OrderID) -> Option<&PendingOrder> {
        self.orders.iter().find(|p| p.order.id == id)
    }

    pub fn remove(&mut self, id: OrderID) -> Option<PendingOrder> {
        let idx = self.orders.iter().position(|p| p.order.id == id)?;
        Some(self.orders.remove(idx))
    }

    pub fn orders(&self) -> &[PendingOrder] {
        &self.orders
    }

    pub fn orders_of<'a>(&'a self, owner: &'a Addr) -> impl Iterator<Item = &'a PendingOrder> + 'a {
        self.orders.iter().filter(move |p| p.owner == *owner)
    }

    pub fn has_orders_of(&self, owner: &Addr) -> bool {
        self.orders.iter().any(|p| p.owner == *owner)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_encoding_roundtrips() {
        let m = MarketSymbol { base: 7, quote: 1 };
        let bytes = m.encode();
        assert_eq!(bytes.len(), 128);
        assert_eq!(MarketSymbol::decode(&bytes), Ok(m));
    }

    #[test]
    fn symbol_encoding_layout_is_fixed() {
        let m = MarketSymbol {
            base: 0x0102030405060708,
            quote: 0x1112131415161718,
        };
        let bytes = m.encode();
        assert_eq!(&bytes[..8], &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]);
        assert!(bytes[8..64].iter().all(|b| *b == 0));
        assert_eq!(&bytes[64..72], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert!(bytes[72..].iter().all(|b| *b == 0));
    }

    #[test]
    fn wrong_length_is_a_length_error() {
        assert_eq!(
            MarketSymbol::decode(&[0u8; 64]),
            Err(MarketDecodeError::BadLength(64))
        );
    }

    #[test]
    fn book_ids_are_unique_and_stable() {
        let mut book = OrderBook::default();
        let owner = Addr([1; 20]);
        let other = Addr([2; 20]);
        let a = book.add(owner, true, 10, 5, 100);
        let b = book.add(other, false, 20, 6, 100);
        assert_ne!(a, b);

        assert_eq!(book.get(a).unwrap().owner, owner);
        assert!(book.has_orders_of(&owner));
        assert_eq!(book.orders_of(&other).count(), 1);

        let removed = book.remove(a).unwrap();
        assert_eq!(removed.order.id, a);
        assert!(!book.has_orders_of(&owner));
        assert_eq!(book.len(), 1);

        // removed ids are not reused
        let c = book.add(owner, true, 1, 1, 100);
        assert!(c > b);
    }
}
