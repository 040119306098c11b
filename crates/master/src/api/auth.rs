//! Ingress authentication.
//!
//! The API key is read from `API_KEY` **once at startup** and cached as a
//! SHA-256 digest in `AppState`. Callers present it as `X-API-Key` or
//! `Authorization: Bearer <key>`. No key configured = dev mode: the server
//! warns once and allows unauthenticated access.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Axum middleware enforcing the ingress API key. 401 when no key is
/// presented, 403 when the presented key is wrong.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.api_key_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let headers = req.headers();
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    let Some(provided) = provided else {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "missing API key" })),
        )
            .into_response();
    };

    // Hash the provided key to a fixed-length digest, then compare in
    // constant time.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return (
            axum::http::StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": "invalid API key" })),
        )
            .into_response();
    }

    next.run(req).await
}

/// Digest an API key for storage in `AppState`.
pub fn hash_key(key: &str) -> Vec<u8> {
    Sha256::digest(key.as_bytes()).to_vec()
}
