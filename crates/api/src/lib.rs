//! # Verdant API Crate
//!
//! The outward-facing service: an auth-protected `/api/v1` surface over
//! the core services, the gateway webhook receiver, the prepaid balance
//! store and process boot.
//!
//! ## Modules
//! - `envelope`: `{error: {code, message, details?}}` responses
//! - `rate_limit`: Per-key sliding-window limiter
//! - `balance`: SQLite-backed prepaid users/transactions ledger
//! - `webhook`: Checkout-completed ingestion (signature-verified)
//! - `dashboard`: Read-only projections + HTML escaping for templates
//! - `usage`: Post-response usage recording for billing
//! - `routes` / `state`: Router wiring and dependency injection

pub mod balance;
pub mod dashboard;
pub mod envelope;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod usage;
pub mod webhook;

pub use state::AppState;
