//! Payment provider abstraction.
//!
//! The retirement pipeline talks to one trait regardless of whether money
//! moves on-chain or through the card gateway. Business rejections are
//! expressed as [`AuthorizationStatus::Failed`]; [`PaymentError`] is
//! reserved for transport and protocol failures.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Outcome tag of an authorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Authorized,
    Failed,
}

/// A hold (fiat) or balance proof (native) for a pending purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Provider-scoped id, later passed to capture/refund.
    pub id: String,
    pub status: AuthorizationStatus,
    /// Human-readable explanation when `status == Failed`.
    pub message: Option<String>,
}

impl Authorization {
    pub fn failed(message: impl Into<String>) -> Self {
        Authorization {
            id: String::new(),
            status: AuthorizationStatus::Failed,
            message: Some(message.into()),
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.status == AuthorizationStatus::Authorized
    }
}

/// Settlement record returned by `capture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub authorization_id: String,
    /// On-chain amount the capture settled, in micro-units.
    pub amount_micro: u128,
    pub denom: String,
    /// Gateway-side reference (intent id, charge id) when one exists.
    pub gateway_reference: Option<String>,
}

/// Transport/protocol failures from a provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    /// Gateway or chain unreachable; retryable.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    /// The gateway rejected the operation; not retryable.
    #[error("payment rejected: {0}")]
    Rejected(String),
    /// Capture/refund referenced an authorization the provider does not
    /// know.
    #[error("unknown authorization id: {0}")]
    UnknownAuthorization(String),
}

/// One interface, two implementations (native-token and fiat).
///
/// ## Contract
///
/// - `authorize` never partially reserves: on `Failed` there is nothing
///   to release.
/// - `capture` is called at most once per authorization, only after the
///   purchase transaction was accepted on-chain.
/// - `refund` releases an uncaptured hold; it must be idempotent against
///   "already released".
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Reserve (or prove) `amount_micro` of `denom`. `metadata` is echoed
    /// to the gateway so later steps can reconstruct context without
    /// another round trip.
    async fn authorize(
        &self,
        amount_micro: u128,
        denom: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Authorization, PaymentError>;

    async fn capture(&self, authorization_id: &str) -> Result<PaymentReceipt, PaymentError>;

    async fn refund(&self, authorization_id: &str) -> Result<(), PaymentError>;

    /// Denom this provider prefers to settle in, used to bias order
    /// selection (fiat wants a USDC-equivalent).
    fn preferred_denom(&self) -> Option<String> {
        None
    }
}
