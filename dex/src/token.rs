use serde::{Deserialize, Serialize};

/// Index into the token registry. Dense: the n-th issued token has id n.
pub type TokenID = u64;

/// Immutable description of a token, fixed at issuance (except the total
/// supply, which burning shrinks).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    /// Quantity step size: one unit is `10^-decimals` of the token.
    pub decimals: u8,
    pub total_units: u64,
}

/// A registered token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenID,
    pub info: TokenInfo,
}

/// The chain's native token, registered with id 0 at genesis.
pub fn native_token_info() -> TokenInfo {
    TokenInfo {
        symbol: "BNB".to_string(),
        decimals: 8,
        total_units: 200_000_000 * 100_000_000,
    }
}
