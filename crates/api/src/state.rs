//! Shared application state: every collaborator constructed once at boot
//! and injected by `Arc`, per-store and per-client. Tests build the same
//! shape from in-memory fakes.

use std::sync::Arc;

use verdant_auth::AuthService;
use verdant_common::Config;
use verdant_ledger::LedgerClient;
use verdant_pool::PoolStore;
use verdant_retire::{BatchService, ExecutionStore, RetirementService};

use crate::balance::SqliteBalanceStore;
use crate::dashboard::DashboardProjection;
use crate::rate_limit::SlidingWindowLimiter;
use crate::usage::UsageRecorder;
use crate::webhook::WebhookProcessor;

pub struct AppState {
    pub config: Config,
    pub ledger: Arc<dyn LedgerClient>,
    pub pool: Arc<dyn PoolStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub retirement: Arc<RetirementService>,
    pub batch: Arc<BatchService>,
    pub auth: Arc<AuthService>,
    pub balance: Arc<SqliteBalanceStore>,
    pub dashboard: Arc<DashboardProjection>,
    pub webhooks: Arc<WebhookProcessor>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub usage: Arc<UsageRecorder>,
}

/// Authenticated caller, attached to the request by the auth middleware.
#[derive(Debug, Clone)]
pub struct ApiCaller {
    pub user_id: String,
    pub api_key: String,
}
