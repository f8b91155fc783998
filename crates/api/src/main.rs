//! Process boot: load env config, construct every collaborator once,
//! wire the router and serve.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use verdant_auth::{AuthService, JsonAuthStore};
use verdant_common::config::PaymentMode;
use verdant_common::Config;
use verdant_ledger::{HttpLedgerClient, LedgerClient};
use verdant_payments::{
    NativeTokenProvider, PaymentProvider, StripeClient, StripeProvider,
};
use verdant_pool::{JsonPoolStore, PoolStore, SubscriptionSync, SyncConfig};
use verdant_retire::service::PrepaidBalance;
use verdant_retire::{
    BatchService, DriverConfig, ExecutionStore, JsonExecutionStore, OrderSelector,
    RetirementService, ServiceConfig,
};

use verdant_api::balance::SqliteBalanceStore;
use verdant_api::dashboard::DashboardProjection;
use verdant_api::rate_limit::{RateLimitConfig, SlidingWindowLimiter};
use verdant_api::routes;
use verdant_api::state::AppState;
use verdant_api::usage::UsageRecorder;
use verdant_api::webhook::WebhookProcessor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let state = build_state(config).context("wiring services")?;

    let bind_addr = state.config.api.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!(%bind_addr, "verdant api listening");

    axum::serve(listener, routes::router(state))
        .await
        .context("serving")?;
    Ok(())
}

fn build_state(config: Config) -> Result<Arc<AppState>> {
    let ledger: Arc<dyn LedgerClient> = Arc::new(
        HttpLedgerClient::new(&config.ledger).map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );
    let pool: Arc<dyn PoolStore> = Arc::new(JsonPoolStore::new(&config.state.pool_state));
    let executions: Arc<dyn ExecutionStore> =
        Arc::new(JsonExecutionStore::new(&config.state.batch_state));
    let balance = Arc::new(
        SqliteBalanceStore::open(&config.state.balance_db)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );

    let provider: Arc<dyn PaymentProvider> = match config.payment_mode {
        PaymentMode::Crypto => Arc::new(NativeTokenProvider::new(ledger.clone())),
        PaymentMode::Stripe => {
            let client = StripeClient::new(&config.gateway)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let customer = config
                .gateway
                .customer_id
                .clone()
                .context("VERDANT_GATEWAY_CUSTOMER_ID is required in stripe mode")?;
            let payment_method = config
                .gateway
                .payment_method
                .clone()
                .context("VERDANT_GATEWAY_PAYMENT_METHOD is required in stripe mode")?;
            Arc::new(StripeProvider::new(
                client,
                customer,
                payment_method,
                config.gateway.usdc_denoms.clone(),
            ))
        }
    };

    let retirement = Arc::new(RetirementService::new(
        ledger.clone(),
        provider.clone(),
        OrderSelector::new(ledger.clone(), config.ledger.native_denom.clone()),
        Some(balance.clone() as Arc<dyn PrepaidBalance>),
        ServiceConfig {
            marketplace_url: config.ledger.marketplace_url.clone(),
            poll_timeout: config.ledger.retirement_poll_timeout,
        },
    ));

    // invoice sync is available whenever the gateway is configured
    let sync = if config.gateway.secret_key.is_some() {
        let client = StripeClient::new(&config.gateway)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Some(Arc::new(SubscriptionSync::new(
            Arc::new(client),
            pool.clone(),
            SyncConfig::default(),
        )))
    } else {
        None
    };

    let batch = Arc::new(BatchService::new(
        pool.clone(),
        executions.clone(),
        ledger.clone(),
        provider,
        OrderSelector::new(ledger.clone(), config.ledger.native_denom.clone()),
        sync,
        DriverConfig {
            fee_bps: config.batch.fee_bps,
            preferred_denom: config.batch.preferred_denom.clone(),
            preflight_max_age_hours: config.batch.preflight_max_age_hours,
            jurisdiction: config.batch.jurisdiction.clone(),
            poll_timeout: config.ledger.retirement_poll_timeout,
        },
    ));

    let auth = Arc::new(AuthService::new(
        Arc::new(JsonAuthStore::new(&config.state.auth_state)),
        config.auth.clone(),
    ));

    let dashboard = Arc::new(DashboardProjection::new(pool.clone(), executions.clone()));
    let webhooks = Arc::new(WebhookProcessor::new(
        balance.clone(),
        pool.clone(),
        config.gateway.webhook_secret.clone(),
    ));
    let limiter = Arc::new(SlidingWindowLimiter::new(RateLimitConfig::per_minute(
        config.api.rate_limit_per_minute,
    )));

    Ok(Arc::new(AppState {
        config,
        ledger,
        pool,
        executions,
        retirement,
        batch,
        auth,
        balance,
        dashboard,
        webhooks,
        limiter,
        usage: Arc::new(UsageRecorder::new()),
    }))
}
