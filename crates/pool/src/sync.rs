//! # Subscription Sync
//!
//! Walks paid gateway invoices into the contribution ledger.
//!
//! Two modes share one walk:
//! - **single customer**: resolved from an explicit customer id or an
//!   email lookup;
//! - **all customers**: an unfiltered, paginated walk bounded by
//!   `max_pages` (clamped to 1..=50) and reported `truncated` when the
//!   bound stopped it early.
//!
//! Each paid USD invoice becomes a contribution keyed
//! `stripe_invoice:{id}`, so re-running a sync is a no-op for everything
//! already ingested.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use verdant_payments::{GatewayError, Invoice, InvoiceGateway};

use crate::contribution::{ContributionInput, ContributionSource, PoolError};
use crate::store::PoolStore;

pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const MAX_PAGES_CEILING: u32 = 50;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Page bound for one run; clamped to 1..=50 at execution.
    pub max_pages: u32,
    pub page_size: u32,
    /// Gateway price id → tier id.
    pub tier_by_price: HashMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            page_size: 100,
            tier_by_price: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub all_customers: bool,
    /// Optional `YYYY-MM` filter; invoices outside it count as skipped.
    pub month: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: u32,
    pub duplicates: u32,
    pub skipped: u32,
    pub pages: u32,
    /// The walk stopped at `max_pages` with more data remaining.
    pub truncated: bool,
}

pub fn is_valid_month(month: &str) -> bool {
    let bytes = month.as_bytes();
    bytes.len() == 7
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

pub struct SubscriptionSync {
    gateway: Arc<dyn InvoiceGateway>,
    pool: Arc<dyn PoolStore>,
    config: SyncConfig,
}

impl SubscriptionSync {
    pub fn new(
        gateway: Arc<dyn InvoiceGateway>,
        pool: Arc<dyn PoolStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            gateway,
            pool,
            config,
        }
    }

    pub async fn run(&self, request: &SyncRequest) -> Result<SyncSummary, PoolError> {
        if let Some(month) = &request.month {
            if !is_valid_month(month) {
                return Err(PoolError::InvalidInput(format!(
                    "month must match YYYY-MM, got {:?}",
                    month
                )));
            }
        }

        let customer = self.resolve_customer(request).await?;
        let max_pages = self.config.max_pages.clamp(1, MAX_PAGES_CEILING);

        let mut summary = SyncSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .gateway
                .list_invoices(customer.as_deref(), cursor.as_deref(), self.config.page_size)
                .await
                .map_err(map_gateway)?;
            summary.pages += 1;

            for invoice in &page.invoices {
                self.ingest(invoice, request, &mut summary)?;
            }

            cursor = page.invoices.last().map(|i| i.id.clone());
            if !page.has_more || cursor.is_none() {
                break;
            }
            if summary.pages >= max_pages {
                summary.truncated = true;
                warn!(pages = summary.pages, "invoice walk stopped at page bound");
                break;
            }
        }

        info!(
            synced = summary.synced,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            truncated = summary.truncated,
            "subscription sync finished"
        );
        Ok(summary)
    }

    async fn resolve_customer(&self, request: &SyncRequest) -> Result<Option<String>, PoolError> {
        if request.all_customers {
            return Ok(None);
        }
        if let Some(customer_id) = request
            .customer_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return Ok(Some(customer_id.to_string()));
        }
        if let Some(email) = request
            .email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let customer = self
                .gateway
                .find_customer_by_email(email)
                .await
                .map_err(map_gateway)?
                .ok_or_else(|| PoolError::NotFound(format!("no customer for email {}", email)))?;
            return Ok(Some(customer.id));
        }
        Err(PoolError::InvalidInput(
            "customer_id, email or all_customers is required".to_string(),
        ))
    }

    fn ingest(
        &self,
        invoice: &Invoice,
        request: &SyncRequest,
        summary: &mut SyncSummary,
    ) -> Result<(), PoolError> {
        // Non-paid / non-USD rows are excluded upstream; this
        // re-check keeps a misbehaving gateway from polluting the pool.
        if !invoice.is_paid_usd() {
            return Ok(());
        }
        let paid_at = match invoice.paid_at {
            Some(paid_at) => paid_at,
            None => return Ok(()),
        };

        if let Some(filter) = &request.month {
            if paid_at.format("%Y-%m").to_string() != *filter {
                summary.skipped += 1;
                return Ok(());
            }
        }

        let tier_id = invoice
            .price_id
            .as_ref()
            .and_then(|price| self.config.tier_by_price.get(price))
            .cloned();

        let outcome = self.pool.record_contribution(ContributionInput {
            customer_id: invoice.customer.clone(),
            email: request.email.clone(),
            amount_usd_cents: invoice.amount_paid,
            contributed_at: paid_at.to_rfc3339(),
            source: Some(ContributionSource::Subscription),
            external_event_id: Some(format!("stripe_invoice:{}", invoice.id)),
            tier_id,
            ..Default::default()
        })?;

        if outcome.duplicate {
            summary.duplicates += 1;
        } else {
            summary.synced += 1;
        }
        Ok(())
    }
}

fn map_gateway(err: GatewayError) -> PoolError {
    PoolError::Gateway(err.to_string())
}
