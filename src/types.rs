//! Blockchain and token types shared across the daemon.

use crate::error::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Ledgers the daemon can drive HTLCs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Blockchain {
    /// UTXO chain, script-based HTLCs.
    Bitcoin,
    /// Account chain, contract-based HTLCs (native coin and ERC-20 tokens).
    Ethereum,
}

impl std::fmt::Display for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blockchain::Bitcoin => write!(f, "bitcoin"),
            Blockchain::Ethereum => write!(f, "ethereum"),
        }
    }
}

/// Supported token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenKind {
    Btc,
    Eth,
    Wbtc,
}

impl TokenKind {
    /// Canonical upper-case token name.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Btc => "BTC",
            TokenKind::Eth => "ETH",
            TokenKind::Wbtc => "WBTC",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A token is a kind bound to the chain it settles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub chain: Blockchain,
}

impl Token {
    pub const BTC: Token = Token {
        kind: TokenKind::Btc,
        chain: Blockchain::Bitcoin,
    };
    pub const ETH: Token = Token {
        kind: TokenKind::Eth,
        chain: Blockchain::Ethereum,
    };
    pub const WBTC: Token = Token {
        kind: TokenKind::Wbtc,
        chain: Blockchain::Ethereum,
    };

    /// Normalize a user-supplied token name.
    pub fn from_name(name: &str) -> Result<Token> {
        match name.trim().to_uppercase().as_str() {
            "BTC" => Ok(Token::BTC),
            "ETH" => Ok(Token::ETH),
            "WBTC" => Ok(Token::WBTC),
            other => Err(Error::UnsupportedToken(other.to_string())),
        }
    }

    /// Canonical upper-case token name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Number of decimal places in the token's smallest unit.
    pub fn decimals(&self) -> u8 {
        match self.kind {
            TokenKind::Btc => 8,
            TokenKind::Eth => 18,
            TokenKind::Wbtc => 8,
        }
    }

    /// Fees charged for one on-chain operation moving `amount` of this
    /// token, keyed by the fee token. ERC-20 moves pay gas in ETH.
    /// Fee estimation policy is an input to the daemon; these are the
    /// conservative defaults used when the caller supplies none.
    pub fn transaction_cost(&self, _amount: &Decimal) -> Cost {
        let mut cost = Cost::new();
        match self.kind {
            TokenKind::Btc => {
                cost.insert("BTC".to_string(), Decimal::new(10_000, 0));
            }
            TokenKind::Eth => {
                cost.insert("ETH".to_string(), Decimal::new(1_200_000_000_000_000, 0));
            }
            TokenKind::Wbtc => {
                cost.insert("ETH".to_string(), Decimal::new(3_600_000_000_000_000, 0));
            }
        }
        cost
    }

    /// Validate an address string for this token's blockchain.
    pub fn verify_address(&self, address: &str) -> Result<()> {
        match self.chain {
            Blockchain::Bitcoin => {
                address
                    .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
                    .map_err(|e| {
                        Error::InvalidAddress(format!(
                            "{} is not a bitcoin address: {}",
                            address, e
                        ))
                    })?;
                Ok(())
            }
            Blockchain::Ethereum => {
                let hex_part = address
                    .strip_prefix("0x")
                    .ok_or_else(|| Error::InvalidAddress(format!("{} is missing 0x", address)))?;
                let bytes = hex::decode(hex_part).map_err(|e| {
                    Error::InvalidAddress(format!("{} is not hex encoded: {}", address, e))
                })?;
                if bytes.len() != 20 {
                    return Err(Error::InvalidAddress(format!(
                        "{} is not 20 bytes",
                        address
                    )));
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Multi-token fee ledger: fee-token name to amount in that token's
/// smallest unit. A WBTC swap pays gas in ETH, so a single swap side can
/// accrue fees in more than one token.
pub type Cost = BTreeMap<String, Decimal>;

/// Merge `extra` into `cost`, adding amounts for shared fee tokens.
pub fn merge_costs(cost: &mut Cost, extra: &Cost) {
    for (token, amount) in extra {
        *cost.entry(token.clone()).or_insert(Decimal::ZERO) += amount;
    }
}

/// Parse a user-supplied amount: a non-negative decimal integer string in
/// the token's smallest unit.
pub fn parse_amount(amount: &str) -> Result<Decimal> {
    let value = Decimal::from_str(amount)
        .map_err(|e| Error::InvalidAmount(format!("{}: {}", amount, e)))?;
    if value.is_sign_negative() {
        return Err(Error::InvalidAmount(format!("{} is negative", amount)));
    }
    if value.normalize().scale() != 0 {
        return Err(Error::InvalidAmount(format!("{} is not an integer", amount)));
    }
    Ok(value.normalize())
}
