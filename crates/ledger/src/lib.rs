//! # Verdant Ledger Crate
//!
//! Client for the ecological-credit ledger and its indexer.
//!
//! ## Modules
//! - `types`: Read models (sell orders, classes, denoms, retirements) and
//!   the buy-direct message shape
//! - `wallet`: Mnemonic-derived signing wallet
//! - `client`: [`LedgerClient`] trait + HTTP implementation
//! - `poll`: Exponential-backoff retirement polling
//! - `mock`: In-memory ledger for tests
//!
//! ## Error Taxonomy
//!
//! Network failures and HTTP 5xx surface as retryable
//! [`LedgerError::Unavailable`]; 4xx responses are fatal
//! [`LedgerError::Request`]. A retirement that has not yet been indexed is
//! `Ok(None)`, not an error: the indexer is expected to lag the chain.

pub mod client;
pub mod mock;
pub mod poll;
pub mod types;
pub mod wallet;

pub use client::{HttpLedgerClient, LedgerClient, LedgerError};
pub use mock::MockLedgerClient;
pub use types::{
    AllowedDenom, BroadcastResult, BuyOrder, Coin, CreditClass, MsgBuyDirect, Project,
    RetirementRecord, SellOrder,
};
pub use wallet::{Wallet, WalletError};
