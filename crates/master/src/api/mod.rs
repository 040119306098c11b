//! Public ingress API.
//!
//! - `POST /api/send`                  — admit a batch (auth required)
//! - `GET  /api/campaigns/:id/status`  — campaign progress (auth required)
//! - `GET  /health`                    — liveness (public)

pub mod auth;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use dr_domain::Priority;

use crate::distributor::{self, BatchContact};
use crate::senders;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/api/send", post(send_batch))
        .route("/api/campaigns/:id/status", get(campaign_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    public.merge(protected).with_state(state)
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SendBatchRequest {
    pub contacts: Vec<BatchContact>,
    pub message: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

async fn send_batch(
    State(state): State<AppState>,
    Json(req): Json<SendBatchRequest>,
) -> Response {
    if req.contacts.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "contacts must not be empty");
    }
    if req.message.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "message must not be empty");
    }

    let now = Utc::now();
    // 503 only when the fleet has no usable sender at all (senders merely
    // cooling down still count); shortage within one country just defers
    // those recipients.
    let any_capacity = state
        .pool
        .snapshot(now)
        .await
        .iter()
        .any(|v| v.status.connected && v.status.logged_in && !senders::is_blocked(&v.status, now));
    if !any_capacity {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no sending capacity available",
        );
    }

    let outcome = distributor::distribute(
        &state,
        &req.contacts,
        &req.message,
        req.priority.unwrap_or_default(),
        now,
    )
    .await;

    Json(serde_json::json!({
        "campaign_id": outcome.campaign.id,
        "queued": outcome.queued,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/campaigns/:id/status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn campaign_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(campaign) = state.campaigns.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, format!("unknown campaign {id}"));
    };
    let (pending, processing, sent, failed) = state.queue.campaign_counts(&id);
    let failed_recipients = state.queue.failed_recipients(&id);

    Json(serde_json::json!({
        "id": campaign.id,
        "total": campaign.total,
        "sent": sent,
        "failed": failed,
        "pending": pending + processing,
        "status": campaign.status,
        "failed_recipients": failed_recipients,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "workers": state.pool.worker_count(),
    }))
}
