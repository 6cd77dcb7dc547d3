//! Admin API for account management
//!
//! Runs on a separate listener port (default 9090), never routed alongside
//! `/v1/messages` (spec.md §3: operator intervention is out-of-band from
//! client traffic).
//!
//! Endpoints:
//! - GET    /admin/accounts                    — list accounts, redacted
//! - POST   /admin/accounts/init-oauth          — start PKCE flow, return auth URL
//! - POST   /admin/accounts/complete-oauth      — exchange code, add to pool
//! - POST   /admin/accounts/manual              — add an account from operator-supplied tokens
//! - POST   /admin/accounts/{email}/clear-invalid — clear the isInvalid flag
//! - DELETE /admin/accounts/{email}             — remove from pool + record store
//! - GET    /admin/pool                         — pool status summary

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use cloud_code_auth::{AccountRecord, AccountSource, QuotaState};
use cloud_code_pool::Pool;

/// In-memory PKCE state for an in-progress OAuth flow.
///
/// Created by init-oauth and consumed by complete-oauth. Expires after
/// PKCE_EXPIRY_SECS to prevent stale verifiers from accumulating.
struct PkceState {
    verifier: String,
    created_at: Instant,
}

/// Maximum age of a PKCE state entry before it expires.
const PKCE_EXPIRY_SECS: u64 = 600; // 10 minutes

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
    http_client: reqwest::Client,
    pkce_states: Arc<Mutex<HashMap<String, PkceState>>>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>, http_client: reqwest::Client) -> Self {
        Self {
            pool,
            http_client,
            pkce_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Build the admin axum router with all account management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/init-oauth", post(init_oauth))
        .route("/admin/accounts/complete-oauth", post(complete_oauth))
        .route("/admin/accounts/manual", post(add_manual_account))
        .route("/admin/accounts/{email}/clear-invalid", post(clear_invalid))
        .route("/admin/accounts/{email}", delete(delete_account))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn account_status(account: &cloud_code_pool::Account) -> &'static str {
    if account.is_invalid {
        "invalid"
    } else if !account.enabled {
        "disabled"
    } else if account.model_rate_limits.values().any(|l| l.reset_time_ms > now_millis()) {
        "cooling_down"
    } else {
        "available"
    }
}

/// Redacted view of an account: never includes `access_token`/`refresh_token`.
fn redact(account: &cloud_code_pool::Account) -> serde_json::Value {
    serde_json::json!({
        "email": account.email,
        "source": account.source,
        "enabled": account.enabled,
        "status": account_status(account),
        "is_invalid": account.is_invalid,
        "invalid_reason": account.invalid_reason,
        "consecutive_failures": account.health.consecutive_failures,
        "last_used_ms": account.health.last_used_ms,
        "subscription_tier": account.subscription.as_ref().map(|s| s.tier.clone()),
    })
}

/// GET /admin/accounts — list every pool account, redacted.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = state.pool.get_all_accounts().await;
    let accounts: Vec<_> = accounts.iter().map(redact).collect();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "accounts": accounts }).to_string(),
    )
}

/// POST /admin/accounts/init-oauth — generate PKCE pair and return authorization URL.
async fn init_oauth(State(state): State<AdminState>) -> impl IntoResponse {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let flow_id = format!("cloud-code-{timestamp}");

    let verifier = cloud_code_auth::generate_verifier();
    let challenge = cloud_code_auth::compute_challenge(&verifier);
    let authorization_url = cloud_code_auth::build_authorization_url(&flow_id, &challenge);

    let pkce_state = PkceState {
        verifier,
        created_at: Instant::now(),
    };

    let mut states = state.pkce_states.lock().await;
    states.retain(|_, s| s.created_at.elapsed().as_secs() < PKCE_EXPIRY_SECS);
    states.insert(flow_id.clone(), pkce_state);

    info!(flow_id, "PKCE flow initiated");

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "authorization_url": authorization_url,
            "flow_id": flow_id,
            "instructions": "Open the URL in a browser, authorize, then POST the code and the account's email to complete-oauth"
        })
        .to_string(),
    )
}

/// Request body for complete-oauth endpoint.
#[derive(Deserialize)]
struct CompleteOAuthRequest {
    flow_id: String,
    email: String,
    code: String,
}

fn error_body(message: String) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// POST /admin/accounts/complete-oauth — exchange authorization code for tokens.
async fn complete_oauth(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CompleteOAuthRequest>,
) -> impl IntoResponse {
    let pkce_state = {
        let mut states = state.pkce_states.lock().await;
        states.remove(&body.flow_id)
    };

    let pkce_state = match pkce_state {
        Some(s) => s,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                error_body(
                    "no pending OAuth flow for this flow_id (expired or not initiated)".into(),
                ),
            );
        }
    };

    if pkce_state.created_at.elapsed() > Duration::from_secs(PKCE_EXPIRY_SECS) {
        return (
            StatusCode::BAD_REQUEST,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            error_body("PKCE state expired (>10 minutes), please re-initiate with init-oauth".into()),
        );
    }

    // The authorization code may carry a '#state' suffix from the callback URL.
    let authorization_code = body.code.split('#').next().unwrap_or(&body.code);

    let token_response = match cloud_code_auth::exchange_code(
        &state.http_client,
        authorization_code,
        &pkce_state.verifier,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(email = body.email, error = %e, "token exchange failed");
            return (
                StatusCode::BAD_GATEWAY,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                error_body(format!("token exchange failed: {e}")),
            );
        }
    };

    let now = now_millis();
    let expires = now + token_response.expires_in * 1000;
    let record = AccountRecord {
        email: body.email.clone(),
        source: AccountSource::Oauth,
        enabled: true,
        refresh_token: token_response.refresh_token.unwrap_or_default(),
        access_token: token_response.access_token,
        expires,
        project_id: None,
        added_at: now,
        is_invalid: false,
        invalid_reason: None,
        last_used: None,
        subscription: None,
        quota: QuotaState::default(),
    };

    if let Err(e) = state.pool.add_account(record).await {
        warn!(email = body.email, error = %e, "failed to add account");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            error_body(format!("failed to add account: {e}")),
        );
    }

    info!(email = body.email, "OAuth flow completed, account added to pool");

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "email": body.email, "status": "added" }).to_string(),
    )
}

/// Request body for the manual-account endpoint: operator-supplied tokens,
/// bypassing the PKCE flow (spec.md §3's `AccountSource::Manual`).
#[derive(Deserialize)]
struct ManualAccountRequest {
    email: String,
    refresh_token: String,
    access_token: String,
    expires_in_secs: u64,
}

/// POST /admin/accounts/manual — add an account from operator-supplied tokens.
async fn add_manual_account(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<ManualAccountRequest>,
) -> impl IntoResponse {
    let now = now_millis();
    let record = AccountRecord {
        email: body.email.clone(),
        source: AccountSource::Manual,
        enabled: true,
        refresh_token: body.refresh_token,
        access_token: body.access_token,
        expires: now + body.expires_in_secs * 1000,
        project_id: None,
        added_at: now,
        is_invalid: false,
        invalid_reason: None,
        last_used: None,
        subscription: None,
        quota: QuotaState::default(),
    };

    if let Err(e) = state.pool.add_account(record).await {
        warn!(email = body.email, error = %e, "failed to add manual account");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            error_body(format!("failed to add account: {e}")),
        );
    }

    info!(email = body.email, "manual account added to pool");

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "email": body.email, "status": "added" }).to_string(),
    )
}

/// POST /admin/accounts/{email}/clear-invalid — operator-only recovery path
/// for an account `markInvalid` took out of rotation (spec.md §3).
async fn clear_invalid(State(state): State<AdminState>, Path(email): Path<String>) -> impl IntoResponse {
    match state.pool.clear_invalid(&email).await {
        Ok(()) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "email": email, "status": "cleared" }).to_string(),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            error_body(e.to_string()),
        ),
    }
}

/// DELETE /admin/accounts/{email} — remove account from pool and record store.
async fn delete_account(State(state): State<AdminState>, Path(email): Path<String>) -> impl IntoResponse {
    if let Err(e) = state.pool.remove_account(&email).await {
        warn!(email, error = %e, "account removal failed");
    }

    info!(email, "account removed");

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "email": email, "status": "removed" }).to_string(),
    )
}

/// GET /admin/pool — pool status summary (same shape as `Pool::health`).
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}
