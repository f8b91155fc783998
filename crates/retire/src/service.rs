//! # Retirement Service
//!
//! Orchestrates one on-chain retirement:
//!
//! ```text
//! wallet? → select orders → prepaid check? → authorize
//!        → broadcast → capture → prepaid debit → poll indexer
//! ```
//!
//! ## Failure Posture
//!
//! **No error escapes [`RetirementService::execute`].** Every failure is
//! translated into [`RetirementOutcome::MarketplaceFallback`] carrying a
//! human-readable message, after releasing any uncaptured hold:
//!
//! - authorization holds are always released before returning on a
//!   failure path;
//! - capture happens only after the chain accepted the tx (`code == 0`);
//! - refund failures after a successful broadcast are logged and
//!   swallowed, the retirement is already on-chain;
//! - a capture failure after broadcast retains the hold for manual
//!   reconciliation (logged), and the call still reports success;
//! - an indexer that has not caught up is not a failure: the result just
//!   omits `certificate_id`, look it up by tx hash later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use verdant_common::attribution::{append_identity_to_reason, IdentityAttribution};
use verdant_common::money::{cents_from_usdc_micro, format_quantity_micro};
use verdant_ledger::{BuyOrder, LedgerClient, MsgBuyDirect};
use verdant_payments::PaymentProvider;

use crate::selector::{CreditType, OrderSelector, QuantitySelection};

// ════════════════════════════════════════════════════════════════════════════════
// PREPAID BALANCE SEAM
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("insufficient balance: have {available_cents}¢, need {required_cents}¢")]
    Insufficient {
        available_cents: u64,
        required_cents: u64,
    },
    #[error("balance store failure: {0}")]
    Store(String),
}

/// Optional prepaid USD balance collaborator. Balances are USD cents;
/// the debit is transactional and refuses overdrafts.
#[async_trait]
pub trait PrepaidBalance: Send + Sync {
    async fn balance_cents(&self, user_id: &str) -> Result<u64, BalanceError>;

    /// Debit `amount_cents`, recording `tx_hash` for audit. Returns the
    /// remaining balance.
    async fn debit(
        &self,
        user_id: &str,
        amount_cents: u64,
        tx_hash: &str,
        description: &str,
    ) -> Result<u64, BalanceError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// REQUEST / OUTCOME
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct RetirementRequest {
    pub credit_type: Option<CreditType>,
    /// Credits to retire, micro-units.
    pub quantity_micro: u128,
    pub beneficiary_name: Option<String>,
    pub jurisdiction: String,
    pub reason: String,
    pub identity: IdentityAttribution,
    /// When set (and a prepaid store is wired), the purchase is checked
    /// against and debited from this user's balance.
    pub prepaid_user_id: Option<String>,
}

/// Tagged result: retired on-chain, or go to the marketplace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetirementOutcome {
    Success {
        tx_hash: String,
        /// 6-decimal string.
        credits_retired: String,
        cost_micro: u128,
        cost_denom: String,
        block_height: u64,
        /// Indexer node id; absent when the indexer had not caught up
        /// before the poll deadline.
        certificate_id: Option<String>,
        remaining_balance_cents: Option<u64>,
    },
    MarketplaceFallback {
        marketplace_url: String,
        message: String,
    },
}

impl RetirementOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RetirementOutcome::Success { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub marketplace_url: String,
    /// Hard deadline for post-broadcast indexer polling.
    pub poll_timeout: Duration,
}

// ════════════════════════════════════════════════════════════════════════════════
// SERVICE
// ════════════════════════════════════════════════════════════════════════════════

pub struct RetirementService {
    ledger: Arc<dyn LedgerClient>,
    provider: Arc<dyn PaymentProvider>,
    selector: OrderSelector,
    prepaid: Option<Arc<dyn PrepaidBalance>>,
    config: ServiceConfig,
}

impl RetirementService {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        provider: Arc<dyn PaymentProvider>,
        selector: OrderSelector,
        prepaid: Option<Arc<dyn PrepaidBalance>>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            selector,
            prepaid,
            config,
        }
    }

    fn fallback(&self, message: impl Into<String>) -> RetirementOutcome {
        let message = message.into();
        warn!(%message, "retirement falls back to marketplace");
        RetirementOutcome::MarketplaceFallback {
            marketplace_url: self.config.marketplace_url.clone(),
            message,
        }
    }

    /// Execute one retirement. Infallible by contract: every failure is a
    /// marketplace fallback.
    pub async fn execute(&self, request: &RetirementRequest) -> RetirementOutcome {
        // 1. No wallet, no broadcast.
        let buyer = match self.ledger.wallet_address() {
            Some(address) => address,
            None => {
                return self.fallback(
                    "no signing wallet is configured; you can retire credits directly on the marketplace",
                )
            }
        };

        // 2–3. Select the cheapest orders, biased to the provider's denom.
        let preferred = self.provider.preferred_denom();
        let selection = match self
            .selector
            .select_best_orders(
                request.credit_type,
                request.quantity_micro,
                preferred.as_deref(),
            )
            .await
        {
            Ok(selection) => selection,
            Err(err) => return self.fallback(format!("could not load sell orders: {}", err)),
        };
        if selection.orders.is_empty() || selection.insufficient_supply {
            return self.fallback(format!(
                "not enough {} credits are listed right now to cover {} credits; try the marketplace",
                request
                    .credit_type
                    .map(|t| t.as_str())
                    .unwrap_or("eligible"),
                format_quantity_micro(request.quantity_micro),
            ));
        }

        // 4. Prepaid balance gate (USD-equivalent costs only; the prepaid
        // ledger is denominated in cents).
        let required_cents = match cents_from_usdc_micro(selection.total_cost_micro) {
            Ok(cents) => cents,
            Err(err) => return self.fallback(format!("cost out of range: {}", err)),
        };
        if let (Some(prepaid), Some(user_id)) = (&self.prepaid, &request.prepaid_user_id) {
            match prepaid.balance_cents(user_id).await {
                Ok(balance) if balance >= required_cents => {}
                Ok(balance) => {
                    return self.fallback(format!(
                        "prepaid balance {}¢ does not cover the {}¢ cost; top up or use the marketplace",
                        balance, required_cents
                    ))
                }
                Err(err) => return self.fallback(format!("balance check failed: {}", err)),
            }
        }

        // 5. Authorize the payment.
        let metadata: HashMap<String, String> = [
            ("purpose".to_string(), "credit_retirement".to_string()),
            (
                "quantity".to_string(),
                format_quantity_micro(selection.total_quantity_micro),
            ),
        ]
        .into_iter()
        .collect();
        let authorization = match self
            .provider
            .authorize(
                selection.total_cost_micro,
                &selection.payment_denom,
                &metadata,
            )
            .await
        {
            Ok(authorization) => authorization,
            Err(err) => return self.fallback(format!("payment authorization failed: {}", err)),
        };
        if !authorization.is_authorized() {
            return self.fallback(format!(
                "payment was not authorized: {}",
                authorization
                    .message
                    .as_deref()
                    .unwrap_or("no reason given")
            ));
        }

        // 6. Compose the message set: one buy order per sell order, the
        // identity tag appended to the reason.
        let identity = effective_identity(&request.identity, request.beneficiary_name.as_deref());
        let reason = append_identity_to_reason(&request.reason, &identity);
        let message = build_buy_direct(&buyer, &selection, &request.jurisdiction, &reason);

        // 7. Broadcast; every failure releases the hold.
        let broadcast = match self.ledger.sign_and_broadcast(&[message]).await {
            Ok(broadcast) => broadcast,
            Err(err) => {
                self.release_hold(&authorization.id).await;
                return self.fallback(format!("broadcast failed: {}", err));
            }
        };
        if broadcast.code != 0 {
            self.release_hold(&authorization.id).await;
            return self.fallback(format!(
                "the ledger rejected the purchase (code {}): {}",
                broadcast.code, broadcast.raw_log
            ));
        }

        // 8. Capture only after on-chain acceptance. A capture failure
        // here cannot undo the retirement; keep the hold for manual
        // reconciliation and continue.
        if let Err(err) = self.provider.capture(&authorization.id).await {
            error!(
                authorization = %authorization.id,
                tx_hash = %broadcast.tx_hash,
                %err,
                "capture failed after successful broadcast; hold retained for manual reconciliation"
            );
        }

        let remaining_balance_cents = match (&self.prepaid, &request.prepaid_user_id) {
            (Some(prepaid), Some(user_id)) => {
                match prepaid
                    .debit(
                        user_id,
                        required_cents,
                        &broadcast.tx_hash,
                        "credit retirement",
                    )
                    .await
                {
                    Ok(remaining) => Some(remaining),
                    Err(err) => {
                        warn!(%err, user_id = %user_id, "prepaid debit failed after retirement");
                        None
                    }
                }
            }
            _ => None,
        };

        // 9. Poll the indexer; a timeout only omits the certificate id.
        let certificate_id = match self
            .ledger
            .wait_for_retirement(&broadcast.tx_hash, self.config.poll_timeout)
            .await
        {
            Ok(Some(record)) => Some(record.node_id),
            Ok(None) => None,
            Err(err) => {
                warn!(%err, tx_hash = %broadcast.tx_hash, "retirement lookup failed; certificate can be fetched later");
                None
            }
        };

        info!(
            tx_hash = %broadcast.tx_hash,
            quantity = %format_quantity_micro(selection.total_quantity_micro),
            cost = selection.total_cost_micro,
            denom = %selection.payment_denom,
            "retirement executed"
        );
        RetirementOutcome::Success {
            tx_hash: broadcast.tx_hash,
            credits_retired: format_quantity_micro(selection.total_quantity_micro),
            cost_micro: selection.total_cost_micro,
            cost_denom: selection.payment_denom,
            block_height: broadcast.height,
            certificate_id,
            remaining_balance_cents,
        }
    }

    /// Release an uncaptured hold, swallowing (but logging) any failure;
    /// on these paths either nothing was reserved or the gateway will be
    /// reconciled manually.
    async fn release_hold(&self, authorization_id: &str) {
        if let Err(err) = self.provider.refund(authorization_id).await {
            error!(authorization = authorization_id, %err, "failed to release payment hold");
        }
    }
}

fn effective_identity(
    identity: &IdentityAttribution,
    beneficiary_name: Option<&str>,
) -> IdentityAttribution {
    match (identity, beneficiary_name) {
        (IdentityAttribution::None, Some(name)) if !name.trim().is_empty() => {
            IdentityAttribution::Manual {
                name: name.trim().to_string(),
            }
        }
        _ => identity.clone(),
    }
}

fn build_buy_direct(
    buyer: &str,
    selection: &QuantitySelection,
    jurisdiction: &str,
    reason: &str,
) -> MsgBuyDirect {
    MsgBuyDirect {
        buyer: buyer.to_string(),
        orders: selection
            .orders
            .iter()
            .map(|selected| {
                BuyOrder::for_sell_order(
                    &selected.order,
                    selected.quantity_micro,
                    jurisdiction,
                    reason,
                )
            })
            .collect(),
    }
}
