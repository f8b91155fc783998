//! # HTTP Routes
//!
//! | Route | Auth | Purpose |
//! |-------|------|---------|
//! | `GET /openapi.json` | public | API document |
//! | `POST /webhooks/gateway` | signature | checkout ingestion |
//! | `POST /api/v1/retirements` | bearer | execute one retirement |
//! | `GET /api/v1/retirements/{id}` | bearer | certificate lookup |
//! | `POST /api/v1/contributions` | bearer | record a contribution |
//! | `GET /api/v1/pool/{month}` | bearer | monthly summary |
//! | `GET /api/v1/users/{id}/summary` | bearer | user dashboard |
//! | `POST /api/v1/reconciliations` | bearer | run the monthly driver |
//! | `GET /api/v1/reconciliations` | bearer | list runs |
//! | `GET /api/v1/batches` | bearer | list batch executions |
//! | `GET /api/v1/dashboard/{month}` | bearer | month projection |
//! | `POST /api/v1/auth/…` | bearer | session flows |
//!
//! Every `/api/v1` request passes the bearer-key middleware: key lookup,
//! sliding-window rate limit, and post-response usage recording.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use verdant_auth::{
    AuthSession, StartEmailAuth, StartOAuthAuth, VerifyEmailAuth, VerifyOAuthAuth,
};
use verdant_common::attribution::{capture_identity, IdentityInput};
use verdant_common::money::parse_quantity_micro;
use verdant_common::ErrorKind;
use verdant_ledger::{LedgerClient, LedgerError};
use verdant_pool::contribution::ContributionInput;
use verdant_pool::sync::is_valid_month;
use verdant_pool::{ContributionSource, PoolStore};
use verdant_retire::{
    CreditType, ExecutionMode, ExecutionStore, ReconciliationRequest, RetirementOutcome,
    RetirementRequest, SyncScope,
};

use crate::dashboard::DashboardProjection;
use crate::envelope::ApiError;
use crate::state::{ApiCaller, AppState};

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/retirements", post(create_retirement))
        .route("/retirements/:id", get(get_retirement))
        .route("/contributions", post(create_contribution))
        .route("/pool/:month", get(get_pool_month))
        .route("/users/:user_id/summary", get(get_user_summary))
        .route("/reconciliations", post(create_reconciliation).get(list_reconciliations))
        .route("/batches", get(list_batches))
        .route("/dashboard/:month", get(get_dashboard))
        .route("/auth/email/start", post(start_email_auth))
        .route("/auth/email/verify", post(verify_email_auth))
        .route("/auth/oauth/start", post(start_oauth_auth))
        .route("/auth/oauth/verify", post(verify_oauth_auth))
        .route("/auth/recovery/start", post(start_recovery))
        .route("/auth/recovery/redeem", post(redeem_recovery))
        .route("/auth/link", post(link_session))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/openapi.json", get(openapi_document))
        .route("/webhooks/gateway", post(receive_webhook))
        .nest("/api/v1", protected)
        .with_state(state)
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ════════════════════════════════════════════════════════════════════════════════
// MIDDLEWARE
// ════════════════════════════════════════════════════════════════════════════════

async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("missing Authorization: Bearer <api key>"))?;

    let user = state
        .balance
        .user_by_api_key(&api_key)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::unauthorized("unknown API key"))?;

    match state.limiter.check(&api_key, now_ms()) {
        crate::rate_limit::RateDecision::Allowed => {}
        crate::rate_limit::RateDecision::Limited { retry_after_ms } => {
            return Err(ApiError::rate_limited(retry_after_ms.div_ceil(1_000)));
        }
    }

    request.extensions_mut().insert(ApiCaller {
        user_id: user.id,
        api_key: api_key.clone(),
    });

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    // usage is billed after the response exists, whatever its status
    state
        .usage
        .record(&api_key, &method, &path, response.status().as_u16());
    Ok(response)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn map_ledger(err: LedgerError) -> ApiError {
    match &err {
        LedgerError::Unavailable(_) => {
            ApiError::new(ErrorKind::ServiceUnavailable, err.to_string())
        }
        _ => ApiError::internal(err.to_string()),
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// RETIREMENTS
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Deserialize)]
struct IdentityDto {
    name: Option<String>,
    email: Option<String>,
    provider: Option<String>,
    subject: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetireBody {
    credit_type: Option<String>,
    /// Decimal credits, up to six fractional digits.
    quantity: String,
    beneficiary_name: Option<String>,
    jurisdiction: Option<String>,
    reason: Option<String>,
    identity: Option<IdentityDto>,
}

async fn create_retirement(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiCaller>,
    Json(body): Json<RetireBody>,
) -> Result<Json<Value>, ApiError> {
    let quantity_micro = parse_quantity_micro(&body.quantity)
        .map_err(|e| ApiError::invalid(e.to_string()))?;
    let credit_type = parse_credit_type(body.credit_type.as_deref())?;
    let identity_dto = body.identity.unwrap_or_default();
    let identity = capture_identity(&IdentityInput {
        name: identity_dto.name,
        email: identity_dto.email,
        provider: identity_dto.provider,
        subject: identity_dto.subject,
    })
    .map_err(|e| ApiError::invalid(e.to_string()))?;

    let request = RetirementRequest {
        credit_type,
        quantity_micro,
        beneficiary_name: body.beneficiary_name,
        jurisdiction: body
            .jurisdiction
            .unwrap_or_else(|| state.config.batch.jurisdiction.clone()),
        reason: body
            .reason
            .unwrap_or_else(|| "Ecological credit retirement".to_string()),
        identity,
        prepaid_user_id: Some(caller.user_id),
    };

    // execute never errors; failures arrive as a marketplace link
    let outcome = state.retirement.execute(&request).await;
    Ok(Json(match outcome {
        RetirementOutcome::Success {
            tx_hash,
            credits_retired,
            cost_micro,
            cost_denom,
            block_height,
            certificate_id,
            remaining_balance_cents,
        } => json!({
            "status": "retired",
            "tx_hash": tx_hash,
            "credits_retired": credits_retired,
            "cost_micro": cost_micro.to_string(),
            "cost_denom": cost_denom,
            "block_height": block_height,
            "certificate_id": certificate_id,
            "remaining_balance_cents": remaining_balance_cents,
        }),
        RetirementOutcome::MarketplaceFallback {
            marketplace_url,
            message,
        } => json!({
            "status": "marketplace_link",
            "marketplace_url": marketplace_url,
            "message": message,
        }),
    }))
}

async fn get_retirement(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .ledger
        .retirement_by_id(&id)
        .await
        .map_err(map_ledger)?
        .ok_or_else(|| ApiError::not_found(format!("no retirement found for {:?}", id)))?;
    let certificate = DashboardProjection::certificate_view(&record);
    Ok(Json(json!({
        "retirement": record,
        "certificate": certificate,
    })))
}

fn parse_credit_type(raw: Option<&str>) -> Result<Option<CreditType>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => CreditType::parse(raw)
            .map(Some)
            .ok_or_else(|| ApiError::invalid(format!("unknown credit type {:?}", raw))),
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// POOL
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ContributionBody {
    user_id: Option<String>,
    customer_id: Option<String>,
    email: Option<String>,
    amount_usd_cents: u64,
    contributed_at: String,
    source: Option<ContributionSource>,
    external_event_id: Option<String>,
    tier_id: Option<String>,
    #[serde(default)]
    metadata: std::collections::BTreeMap<String, String>,
}

async fn create_contribution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContributionBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.pool.record_contribution(ContributionInput {
        user_id: body.user_id,
        customer_id: body.customer_id,
        email: body.email,
        amount_usd_cents: body.amount_usd_cents,
        contributed_at: body.contributed_at,
        source: body.source,
        external_event_id: body.external_event_id,
        tier_id: body.tier_id,
        metadata: body.metadata,
    })?;
    Ok(Json(json!({
        "contribution": outcome.record,
        "duplicate": outcome.duplicate,
        "month_summary": outcome.month_summary,
        "user_summary": outcome.user_summary,
    })))
}

async fn get_pool_month(
    State(state): State<Arc<AppState>>,
    Path(month): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_month(&month)?;
    let contributions = state.pool.contributions()?;
    Ok(Json(json!({
        "summary": verdant_pool::summary::monthly_summary(&contributions, &month),
    })))
}

async fn get_user_summary(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state.dashboard.user_view(&user_id)?;
    Ok(Json(json!({ "summary": view.summary })))
}

fn require_month(month: &str) -> Result<(), ApiError> {
    if is_valid_month(month) {
        Ok(())
    } else {
        Err(ApiError::invalid(format!(
            "month must match YYYY-MM, got {:?}",
            month
        )))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// BATCH / RECONCILIATION
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ReconciliationBody {
    month: String,
    credit_type: Option<String>,
    #[serde(default = "default_sync_scope")]
    sync_scope: SyncScope,
    customer_id: Option<String>,
    email: Option<String>,
    execution_mode: ExecutionMode,
    #[serde(default)]
    preflight_only: bool,
    #[serde(default)]
    force: bool,
    reason: Option<String>,
}

fn default_sync_scope() -> SyncScope {
    SyncScope::None
}

async fn create_reconciliation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReconciliationBody>,
) -> Result<Json<Value>, ApiError> {
    require_month(&body.month)?;
    let run = state
        .batch
        .run_reconciliation(&ReconciliationRequest {
            month: body.month,
            credit_type: parse_credit_type(body.credit_type.as_deref())?,
            sync_scope: body.sync_scope,
            customer_id: body.customer_id,
            email: body.email,
            execution_mode: body.execution_mode,
            preflight_only: body.preflight_only,
            force: body.force,
            reason: body
                .reason
                .unwrap_or_else(|| "Monthly pooled retirement".to_string()),
        })
        .await?;
    Ok(Json(json!({ "run": run })))
}

#[derive(Debug, Deserialize)]
struct MonthFilter {
    month: Option<String>,
}

async fn list_reconciliations(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MonthFilter>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.executions.list_runs(filter.month.as_deref())?;
    Ok(Json(json!({ "runs": runs })))
}

async fn list_batches(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MonthFilter>,
) -> Result<Json<Value>, ApiError> {
    let executions = state.executions.list_executions(filter.month.as_deref())?;
    Ok(Json(json!({ "executions": executions })))
}

async fn get_dashboard(
    State(state): State<Arc<AppState>>,
    Path(month): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_month(&month)?;
    let view = state.dashboard.month_view(&month)?;
    Ok(Json(serde_json::to_value(view).map_err(|e| ApiError::internal(e.to_string()))?))
}

// ════════════════════════════════════════════════════════════════════════════════
// AUTH
// ════════════════════════════════════════════════════════════════════════════════

/// Session fields safe to return; code hashes and state tokens stay
/// server-side (the oauth state token is returned once, from start).
#[derive(Debug, Serialize)]
struct SessionView {
    id: String,
    method: verdant_auth::AuthMethod,
    status: verdant_auth::SessionStatus,
    created_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
    verified_at: Option<chrono::DateTime<Utc>>,
    beneficiary_name: Option<String>,
    beneficiary_email: Option<String>,
    auth_provider: Option<String>,
    verification_attempts: u32,
    max_verification_attempts: u32,
}

impl From<AuthSession> for SessionView {
    fn from(session: AuthSession) -> Self {
        SessionView {
            id: session.id,
            method: session.method,
            status: session.status,
            created_at: session.created_at,
            expires_at: session.expires_at,
            verified_at: session.verified_at,
            beneficiary_name: session.beneficiary_name,
            beneficiary_email: session.beneficiary_email,
            auth_provider: session.auth_provider,
            verification_attempts: session.verification_attempts,
            max_verification_attempts: session.max_verification_attempts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartEmailBody {
    email: String,
    name: Option<String>,
}

async fn start_email_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartEmailBody>,
) -> Result<Json<Value>, ApiError> {
    let (session, code) = state.auth.start_email_auth(&StartEmailAuth {
        email: body.email,
        name: body.name,
    })?;
    // the code travels out-of-band (mailer collaborator), never in the
    // HTTP response
    debug!(session = %session.id, code_len = code.len(), "email code dispatched");
    Ok(Json(json!({ "session": SessionView::from(session) })))
}

#[derive(Debug, Deserialize)]
struct VerifyEmailBody {
    session_id: String,
    code: String,
}

async fn verify_email_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyEmailBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.auth.verify_email_auth(&VerifyEmailAuth {
        session_id: body.session_id,
        code: body.code,
    })?;
    Ok(Json(json!({ "session": SessionView::from(session) })))
}

#[derive(Debug, Deserialize)]
struct StartOAuthBody {
    provider: String,
    email: Option<String>,
    name: Option<String>,
}

async fn start_oauth_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartOAuthBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.auth.start_oauth_auth(&StartOAuthAuth {
        provider: body.provider,
        email: body.email,
        name: body.name,
    })?;
    let state_token = session.oauth_state_token.clone();
    Ok(Json(json!({
        "session": SessionView::from(session),
        "oauth_state_token": state_token,
    })))
}

#[derive(Debug, Deserialize)]
struct VerifyOAuthBody {
    session_id: String,
    oauth_state_token: String,
    provider: String,
    subject: String,
    email: Option<String>,
}

async fn verify_oauth_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyOAuthBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.auth.verify_oauth_auth(&VerifyOAuthAuth {
        session_id: body.session_id,
        oauth_state_token: body.oauth_state_token,
        provider: body.provider,
        subject: body.subject,
        email: body.email,
    })?;
    Ok(Json(json!({ "session": SessionView::from(session) })))
}

#[derive(Debug, Deserialize)]
struct StartRecoveryBody {
    email: String,
}

async fn start_recovery(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRecoveryBody>,
) -> Result<Json<Value>, ApiError> {
    let (record, token) = state.auth.start_recovery(&body.email)?;
    // like email codes, the token itself is delivered out-of-band
    debug!(token_id = %record.id, token_len = token.len(), "recovery token dispatched");
    Ok(Json(json!({
        "token_id": record.id,
        "expires_at": record.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
struct RedeemRecoveryBody {
    token: String,
}

async fn redeem_recovery(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RedeemRecoveryBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.auth.recover_with_token(&body.token)?;
    Ok(Json(json!({ "session": SessionView::from(session) })))
}

#[derive(Debug, Deserialize)]
struct LinkBody {
    session_id: String,
    /// Defaults to the calling user.
    user_id: Option<String>,
}

async fn link_session(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiCaller>,
    Json(body): Json<LinkBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = body.user_id.unwrap_or(caller.user_id);
    state.auth.link_session_to_user(&body.session_id, &user_id)?;
    Ok(Json(json!({ "linked": true, "user_id": user_id })))
}

// ════════════════════════════════════════════════════════════════════════════════
// PUBLIC ROUTES
// ════════════════════════════════════════════════════════════════════════════════

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok());
    match state.webhooks.process(&body, signature)? {
        Some(outcome) => Ok(Json(json!({
            "received": true,
            "event_id": outcome.event_id,
            "duplicate": outcome.duplicate,
        }))),
        None => Ok(Json(json!({ "received": true, "ignored": true }))),
    }
}

async fn openapi_document() -> Json<Value> {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Verdant Retirement Orchestrator API",
            "version": "1.0.0",
            "description": "Pooled purchase and retirement of ecological credits with verifiable on-chain certificates."
        },
        "security": [{ "bearerAuth": [] }],
        "components": {
            "securitySchemes": {
                "bearerAuth": { "type": "http", "scheme": "bearer" }
            }
        },
        "paths": {
            "/api/v1/retirements": { "post": { "summary": "Execute a retirement; failures return a marketplace link" } },
            "/api/v1/retirements/{id}": { "get": { "summary": "Look up a retirement certificate by id or tx hash" } },
            "/api/v1/contributions": { "post": { "summary": "Record an idempotent pool contribution" } },
            "/api/v1/pool/{month}": { "get": { "summary": "Monthly pool summary" } },
            "/api/v1/users/{user_id}/summary": { "get": { "summary": "Lifetime contributor summary" } },
            "/api/v1/reconciliations": {
                "post": { "summary": "Run the monthly driver (sync + batch)" },
                "get": { "summary": "List reconciliation runs" }
            },
            "/api/v1/batches": { "get": { "summary": "List batch executions" } },
            "/api/v1/dashboard/{month}": { "get": { "summary": "Month dashboard projection" } },
            "/api/v1/auth/email/start": { "post": { "summary": "Start email verification" } },
            "/api/v1/auth/email/verify": { "post": { "summary": "Verify an email code" } },
            "/api/v1/auth/oauth/start": { "post": { "summary": "Start an oauth flow" } },
            "/api/v1/auth/oauth/verify": { "post": { "summary": "Complete an oauth flow" } },
            "/api/v1/auth/recovery/start": { "post": { "summary": "Mint a recovery token" } },
            "/api/v1/auth/recovery/redeem": { "post": { "summary": "Redeem a recovery token" } },
            "/api/v1/auth/link": { "post": { "summary": "Bind a verified session to a user" } },
            "/webhooks/gateway": { "post": { "summary": "Gateway webhook receiver (signature-verified)" } }
        }
    }))
}
