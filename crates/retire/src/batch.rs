//! # Monthly Batch Driver
//!
//! Turns a month of pooled contributions into one budget-bounded on-chain
//! retirement and splits the result exactly among contributors.
//!
//! ```text
//! pool month total ──fee bps──▶ budget ──▶ budget selection
//!        │                                       │
//!        │          dry run / preflight: persist the plan, stop
//!        ▼                                       ▼
//!  contributor weights            authorize → broadcast → capture → poll
//!        │                                       │
//!        └──────────── largest-remainder attribution ◀──────────────┘
//! ```
//!
//! ## Gating
//!
//! A live run must be preceded by a successful dry run for the same
//! `(month, credit_type)` no older than the configured window, unless
//! `force` is set. Violations persist a `blocked` execution. The
//! execution store additionally rejects a second concurrent execution for
//! the same key, so one month can never broadcast twice at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use verdant_common::money::{
    apply_fee_bps, format_quantity_micro, usdc_micro_from_cents,
};
use verdant_ledger::{BuyOrder, LedgerClient, MsgBuyDirect};
use verdant_payments::PaymentProvider;
use verdant_pool::sync::is_valid_month;
use verdant_pool::{ContributorTotal, PoolStore, SubscriptionSync, SyncRequest, SyncSummary};

use crate::allocate::{allocate_proportional, share_ppm};
use crate::execution::{
    BatchExecution, BatchStatus, ContributorAttribution, ExecutionError, ExecutionMode,
    ExecutionStore, ReconciliationRun, RunStatus, SyncScope,
};
use crate::selector::{BudgetSelection, CreditType, OrderSelector};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Operations fee retained from the pool, basis points on cents.
    pub fee_bps: u32,
    pub preferred_denom: Option<String>,
    /// Maximum age of the gating dry run.
    pub preflight_max_age_hours: u32,
    pub jurisdiction: String,
    pub poll_timeout: Duration,
}

/// One driver invocation.
#[derive(Debug, Clone)]
pub struct ReconciliationRequest {
    pub month: String,
    pub credit_type: Option<CreditType>,
    pub sync_scope: SyncScope,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub execution_mode: ExecutionMode,
    pub preflight_only: bool,
    pub force: bool,
    pub reason: String,
}

pub struct BatchService {
    pool: Arc<dyn PoolStore>,
    store: Arc<dyn ExecutionStore>,
    ledger: Arc<dyn LedgerClient>,
    provider: Arc<dyn PaymentProvider>,
    selector: OrderSelector,
    sync: Option<Arc<SubscriptionSync>>,
    config: DriverConfig,
}

impl BatchService {
    pub fn new(
        pool: Arc<dyn PoolStore>,
        store: Arc<dyn ExecutionStore>,
        ledger: Arc<dyn LedgerClient>,
        provider: Arc<dyn PaymentProvider>,
        selector: OrderSelector,
        sync: Option<Arc<SubscriptionSync>>,
        config: DriverConfig,
    ) -> Self {
        Self {
            pool,
            store,
            ledger,
            provider,
            selector,
            sync,
            config,
        }
    }

    /// Execute (or plan) one batch for `month`. The returned record is
    /// always persisted; `status` carries the verdict.
    pub async fn run_batch(
        &self,
        month: &str,
        credit_type: Option<CreditType>,
        execution_mode: ExecutionMode,
        preflight_only: bool,
        force: bool,
        reason: &str,
    ) -> Result<BatchExecution, ExecutionError> {
        if !is_valid_month(month) {
            return Err(ExecutionError::Store(format!(
                "month must match YYYY-MM, got {:?}",
                month
            )));
        }
        let credit_type_str = credit_type.map(|t| t.as_str());
        let dry_run = execution_mode == ExecutionMode::DryRun || preflight_only;

        let contributions = self
            .pool
            .contributions()
            .map_err(|e| ExecutionError::Store(e.to_string()))?;
        let contributors = verdant_pool::summary::month_contributors(&contributions, month);
        let month_total_cents: u64 = contributors.iter().map(|c| c.total_usd_cents).sum();
        let budget_cents = apply_fee_bps(month_total_cents, self.config.fee_bps);

        let mut execution = match self.store.begin_execution(
            month,
            credit_type_str,
            dry_run,
            budget_cents,
        ) {
            Ok(execution) => execution,
            Err(ExecutionError::AlreadyRunning { .. }) => {
                // reject rather than queue: a queued run could broadcast
                // against a pool that changed under it
                let blocked = blocked_execution(
                    month,
                    credit_type_str,
                    dry_run,
                    budget_cents,
                    "another execution for this month is already in progress",
                );
                self.store.finish_execution(blocked.clone())?;
                return Ok(blocked);
            }
            Err(err) => return Err(err),
        };

        // Preflight gate for live runs.
        if !dry_run && !force {
            match self.store.latest_successful_dry_run(month, credit_type_str)? {
                Some(dry) => {
                    let age = Utc::now() - dry.executed_at;
                    let max_age = chrono::Duration::hours(i64::from(
                        self.config.preflight_max_age_hours,
                    ));
                    if age > max_age {
                        return self.finish_blocked(
                            execution,
                            format!(
                                "the last successful dry run is {}h old (limit {}h); re-run the dry run or pass force",
                                age.num_hours(),
                                self.config.preflight_max_age_hours
                            ),
                        );
                    }
                }
                None => {
                    return self.finish_blocked(
                        execution,
                        "a live run requires a successful dry run for this month first",
                    );
                }
            }
        }

        if budget_cents == 0 {
            return self.finish_failed(execution, "no pool contributions for this month");
        }

        let budget_micro = usdc_micro_from_cents(budget_cents);
        let selection = match self
            .selector
            .select_orders_for_budget(
                credit_type,
                budget_micro,
                self.config.preferred_denom.as_deref(),
            )
            .await
        {
            Ok(selection) => selection,
            Err(err) => {
                return self.finish_failed(execution, format!("order selection failed: {}", err))
            }
        };
        if selection.orders.is_empty() {
            return self.finish_failed(execution, "no eligible orders for budget");
        }

        let attributions = build_attributions(
            &contributors,
            budget_cents,
            selection.total_cost_micro,
            selection.total_quantity_micro,
            &selection.payment_denom,
        );

        execution.reason = reason.to_string();
        execution.spent_denom = selection.payment_denom.clone();

        if dry_run {
            execution.status = BatchStatus::Success;
            execution.spent_micro = selection.total_cost_micro;
            execution.retired_quantity = format_quantity_micro(selection.total_quantity_micro);
            execution.attributions = attributions;
            execution.executed_at = Utc::now();
            self.store.finish_execution(execution.clone())?;
            info!(month, budget_cents, "dry-run batch planned");
            return Ok(execution);
        }

        match self.purchase(&selection, reason).await {
            Ok(purchase) => {
                execution.status = BatchStatus::Success;
                execution.spent_micro = selection.total_cost_micro;
                execution.retired_quantity =
                    format_quantity_micro(selection.total_quantity_micro);
                execution.attributions = attributions;
                execution.tx_hash = Some(purchase.tx_hash.clone());
                execution.block_height = Some(purchase.block_height);
                execution.retirement_id = purchase.retirement_id;
                execution.executed_at = Utc::now();
                self.store.finish_execution(execution.clone())?;
                info!(month, tx_hash = %purchase.tx_hash, "batch retirement executed");
                Ok(execution)
            }
            Err(message) => self.finish_failed(execution, message),
        }
    }

    /// The §-shared purchase sequence against a budget-constrained order
    /// set: authorize → broadcast → capture → poll, holds released on any
    /// pre-capture failure.
    async fn purchase(
        &self,
        selection: &BudgetSelection,
        reason: &str,
    ) -> Result<PurchaseResult, String> {
        let buyer = self
            .ledger
            .wallet_address()
            .ok_or_else(|| "no signing wallet configured".to_string())?;

        let metadata: HashMap<String, String> = [(
            "purpose".to_string(),
            "monthly_batch_retirement".to_string(),
        )]
        .into_iter()
        .collect();
        let authorization = self
            .provider
            .authorize(
                selection.total_cost_micro,
                &selection.payment_denom,
                &metadata,
            )
            .await
            .map_err(|e| format!("payment authorization failed: {}", e))?;
        if !authorization.is_authorized() {
            return Err(format!(
                "payment was not authorized: {}",
                authorization
                    .message
                    .as_deref()
                    .unwrap_or("no reason given")
            ));
        }

        let message = MsgBuyDirect {
            buyer,
            orders: selection
                .orders
                .iter()
                .map(|selected| {
                    BuyOrder::for_sell_order(
                        &selected.order,
                        selected.quantity_micro,
                        &self.config.jurisdiction,
                        reason,
                    )
                })
                .collect(),
        };

        let broadcast = match self.ledger.sign_and_broadcast(&[message]).await {
            Ok(broadcast) => broadcast,
            Err(err) => {
                self.release_hold(&authorization.id).await;
                return Err(format!("broadcast failed: {}", err));
            }
        };
        if broadcast.code != 0 {
            self.release_hold(&authorization.id).await;
            return Err(format!(
                "the ledger rejected the purchase (code {}): {}",
                broadcast.code, broadcast.raw_log
            ));
        }

        if let Err(err) = self.provider.capture(&authorization.id).await {
            warn!(
                authorization = %authorization.id,
                tx_hash = %broadcast.tx_hash,
                %err,
                "capture failed after successful broadcast; hold retained for manual reconciliation"
            );
        }

        let retirement_id = match self
            .ledger
            .wait_for_retirement(&broadcast.tx_hash, self.config.poll_timeout)
            .await
        {
            Ok(Some(record)) => Some(record.node_id),
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "retirement lookup failed; record can be fetched later by tx hash");
                None
            }
        };

        Ok(PurchaseResult {
            tx_hash: broadcast.tx_hash,
            block_height: broadcast.height,
            retirement_id,
        })
    }

    async fn release_hold(&self, authorization_id: &str) {
        if let Err(err) = self.provider.refund(authorization_id).await {
            warn!(authorization = authorization_id, %err, "failed to release payment hold");
        }
    }

    fn finish_failed(
        &self,
        mut execution: BatchExecution,
        message: impl Into<String>,
    ) -> Result<BatchExecution, ExecutionError> {
        execution.status = BatchStatus::Failed;
        execution.reason = message.into();
        execution.executed_at = Utc::now();
        warn!(month = %execution.month, reason = %execution.reason, "batch failed");
        self.store.finish_execution(execution.clone())?;
        Ok(execution)
    }

    fn finish_blocked(
        &self,
        mut execution: BatchExecution,
        message: impl Into<String>,
    ) -> Result<BatchExecution, ExecutionError> {
        execution.status = BatchStatus::Blocked;
        execution.reason = message.into();
        execution.executed_at = Utc::now();
        warn!(month = %execution.month, reason = %execution.reason, "batch blocked");
        self.store.finish_execution(execution.clone())?;
        Ok(execution)
    }

    /// Full driver invocation: optional invoice sync, then the batch,
    /// all wrapped in one persisted [`ReconciliationRun`].
    pub async fn run_reconciliation(
        &self,
        request: &ReconciliationRequest,
    ) -> Result<ReconciliationRun, ExecutionError> {
        let mut run = ReconciliationRun {
            id: Uuid::new_v4().to_string(),
            month: request.month.clone(),
            credit_type: request.credit_type.map(|t| t.as_str().to_string()),
            sync_scope: request.sync_scope,
            execution_mode: request.execution_mode,
            preflight_only: request.preflight_only,
            force: request.force,
            status: RunStatus::InProgress,
            batch_status: String::new(),
            started_at: Utc::now(),
            finished_at: None,
            sync: None,
            message: None,
        };
        self.store.record_run(run.clone())?;

        match self.run_sync(request).await {
            Ok(summary) => run.sync = summary,
            Err(message) => {
                run.status = RunStatus::Failed;
                run.batch_status = "sync_failed".to_string();
                run.message = Some(message);
                run.finished_at = Some(Utc::now());
                self.store.record_run(run.clone())?;
                return Ok(run);
            }
        }

        let execution = self
            .run_batch(
                &request.month,
                request.credit_type,
                request.execution_mode,
                request.preflight_only,
                request.force,
                &request.reason,
            )
            .await?;

        match execution.status {
            BatchStatus::Success => {
                run.status = RunStatus::Completed;
                run.batch_status = if execution.dry_run {
                    "dry_run".to_string()
                } else {
                    "executed".to_string()
                };
            }
            BatchStatus::Blocked => {
                run.status = RunStatus::Blocked;
                run.batch_status = "blocked_preflight".to_string();
                run.message = Some(execution.reason.clone());
            }
            BatchStatus::Failed | BatchStatus::InProgress => {
                run.status = RunStatus::Failed;
                run.batch_status = "failed".to_string();
                run.message = Some(execution.reason.clone());
            }
        }
        run.finished_at = Some(Utc::now());
        self.store.record_run(run.clone())?;
        Ok(run)
    }

    async fn run_sync(
        &self,
        request: &ReconciliationRequest,
    ) -> Result<Option<SyncSummary>, String> {
        let sync = match (&self.sync, request.sync_scope) {
            (_, SyncScope::None) => return Ok(None),
            (Some(sync), _) => sync,
            (None, _) => return Err("invoice sync is not configured".to_string()),
        };
        let sync_request = SyncRequest {
            customer_id: request.customer_id.clone(),
            email: request.email.clone(),
            all_customers: request.sync_scope == SyncScope::AllCustomers,
            month: Some(request.month.clone()),
        };
        sync.run(&sync_request)
            .await
            .map(Some)
            .map_err(|e| e.to_string())
    }
}

struct PurchaseResult {
    tx_hash: String,
    block_height: u64,
    retirement_id: Option<String>,
}

fn blocked_execution(
    month: &str,
    credit_type: Option<&str>,
    dry_run: bool,
    budget_usd_cents: u64,
    reason: &str,
) -> BatchExecution {
    BatchExecution {
        id: Uuid::new_v4().to_string(),
        month: month.to_string(),
        credit_type: credit_type.map(str::to_string),
        dry_run,
        status: BatchStatus::Blocked,
        reason: reason.to_string(),
        budget_usd_cents,
        spent_micro: 0,
        spent_denom: String::new(),
        retired_quantity: "0.000000".to_string(),
        attributions: Vec::new(),
        tx_hash: None,
        block_height: None,
        retirement_id: None,
        executed_at: Utc::now(),
    }
}

/// Split the three authoritative totals across contributor weights.
fn build_attributions(
    contributors: &[ContributorTotal],
    budget_cents: u64,
    cost_micro: u128,
    quantity_micro: u128,
    payment_denom: &str,
) -> Vec<ContributorAttribution> {
    let weights: Vec<u128> = contributors
        .iter()
        .map(|c| u128::from(c.total_usd_cents))
        .collect();
    let sum_weights: u128 = weights.iter().sum();

    let budget_alloc = allocate_proportional(u128::from(budget_cents), &weights);
    let cost_alloc = allocate_proportional(cost_micro, &weights);
    let quantity_alloc = allocate_proportional(quantity_micro, &weights);

    contributors
        .iter()
        .enumerate()
        .map(|(i, contributor)| ContributorAttribution {
            user_id: contributor.user_id.clone(),
            share_ppm: share_ppm(weights[i], sum_weights),
            contribution_usd_cents: contributor.total_usd_cents,
            attributed_budget_usd_cents: budget_alloc[i] as u64,
            attributed_cost_micro: cost_alloc[i],
            attributed_quantity: format_quantity_micro(quantity_alloc[i]),
            payment_denom: payment_denom.to_string(),
        })
        .collect()
}
