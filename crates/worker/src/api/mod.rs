//! Worker RPC surface, called only by the Master.
//!
//! - `GET  /accounts`            — snapshot of every managed identity
//! - `POST /send`                — send one message on behalf of an identity
//! - `POST /accounts/connect`    — connect or pair an identity
//! - `POST /accounts/disconnect` — close an identity's sessions
//! - `POST /accounts/cleanup`    — purge idle never-paired identities
//! - `GET  /health`              — liveness

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;

use dr_protocol::{
    AccountsResponse, ConnectRequest, DisconnectRequest, SendError, SendErrorKind, SendRequest,
};

use crate::state::WorkerState;

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/accounts", get(accounts))
        .route("/send", post(send))
        .route("/accounts/connect", post(connect))
        .route("/accounts/disconnect", post(disconnect))
        .route("/accounts/cleanup", post(cleanup))
        .route("/health", get(health))
        .with_state(state)
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn status_for_kind(kind: SendErrorKind) -> StatusCode {
    match kind {
        SendErrorKind::NotLoggedIn | SendErrorKind::NotConnected => StatusCode::CONFLICT,
        SendErrorKind::RateLimited | SendErrorKind::TempBlocked => StatusCode::TOO_MANY_REQUESTS,
        SendErrorKind::PermanentlyBlocked => StatusCode::FORBIDDEN,
        SendErrorKind::TransportError => StatusCode::BAD_GATEWAY,
        SendErrorKind::InvalidRecipient => StatusCode::BAD_REQUEST,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn accounts(State(state): State<WorkerState>) -> impl IntoResponse {
    let accounts = state.runtime.accounts_snapshot(Utc::now()).await;
    Json(AccountsResponse { accounts })
}

async fn send(
    State(state): State<WorkerState>,
    Json(req): Json<SendRequest>,
) -> Response {
    match state
        .runtime
        .send(&req.from_phone, &req.to_phone, &req.message)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err((kind, error)) => (
            status_for_kind(kind),
            Json(SendError { error, kind }),
        )
            .into_response(),
    }
}

async fn connect(
    State(state): State<WorkerState>,
    Json(req): Json<ConnectRequest>,
) -> Response {
    match state.runtime.connect(&req.phone).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => api_error(StatusCode::BAD_GATEWAY, format!("connect failed: {e}")),
    }
}

async fn disconnect(
    State(state): State<WorkerState>,
    Json(req): Json<DisconnectRequest>,
) -> Response {
    match state.runtime.disconnect(&req.phone).await {
        Ok(()) => Json(serde_json::json!({ "disconnected": true })).into_response(),
        Err(e) => api_error(StatusCode::NOT_FOUND, e.to_string()),
    }
}

async fn cleanup(State(state): State<WorkerState>) -> impl IntoResponse {
    let purged = state.runtime.cleanup_idle().await;
    Json(serde_json::json!({ "purged": purged }))
}

async fn health(State(state): State<WorkerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "identities": state.runtime.phones().len(),
    }))
}
