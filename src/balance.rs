use std::collections::HashMap;

use futures_util::future::BoxFuture;

use crate::error::GatewayError;

/// Solana-style base58 alphabet (no 0, O, I, l).
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Source of token balances, keyed by wallet address.
///
/// The real implementation talks to a chain RPC node; the gateway only
/// depends on this narrow contract. Implementations own their own transport
/// timeouts, but callers still bound the whole lookup (see
/// [`crate::access::AccessGate`]).
pub trait BalanceLookup: Send + Sync {
    /// Token balance for `address`, already scaled by the mint's decimals.
    fn balance_of<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<f64, GatewayError>>;
}

/// Balances read from the config file. Unknown addresses hold nothing.
#[derive(Debug, Default, Clone)]
pub struct StaticBalances {
    balances: HashMap<String, f64>,
}

impl StaticBalances {
    pub fn new(balances: HashMap<String, f64>) -> Self {
        Self { balances }
    }
}

impl BalanceLookup for StaticBalances {
    fn balance_of<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<f64, GatewayError>> {
        Box::pin(async move { Ok(self.balances.get(address).copied().unwrap_or(0.0)) })
    }
}

/// Reject strings that cannot be a 32-byte base58 public key.
pub fn validate_address(address: &str) -> Result<(), GatewayError> {
    let len = address.len();
    if !(32..=44).contains(&len) {
        return Err(GatewayError::Verification(format!(
            "invalid wallet address length: {len}"
        )));
    }
    if let Some(bad) = address.chars().find(|c| !BASE58_ALPHABET.contains(*c)) {
        return Err(GatewayError::Verification(format!(
            "invalid character in wallet address: {bad:?}"
        )));
    }
    Ok(())
}
