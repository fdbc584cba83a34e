/// Authentication utilities for secure API key validation
use crate::AppState;
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use subtle::ConstantTimeEq;
use tracing::debug;

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on API key validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

impl Hash for ConstantTimeString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Type alias for a HashSet of (best effort) constant-time strings, used to API keys
pub type KeySet = HashSet<ConstantTimeString>;

/// Validates a bearer token against a set of valid keys using constant-time comparison
pub fn validate_bearer_token(keys: &KeySet, token: &str) -> bool {
    keys.contains(&ConstantTimeString::from(token))
}

/// The client's key: `Authorization: Bearer`, or `x-api-key` as Anthropic SDKs send it.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
}

fn check(keys: &KeySet, headers: &HeaderMap) -> bool {
    keys.is_empty() || presented_key(headers).is_some_and(|key| validate_bearer_token(keys, key))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "type": "authentication_error",
                "message": "missing or invalid API key"
            }
        })),
    )
        .into_response()
}

/// Guards the completion routes with the configured global keys.
pub async fn require_client_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if check(&state.auth.global_keys, req.headers()) {
        next.run(req).await
    } else {
        debug!("Rejected request with missing or invalid key");
        unauthorized()
    }
}

/// Guards the management routes with the admin keys, or the global keys when none are set.
pub async fn require_admin_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let keys = if state.auth.admin_keys.is_empty() {
        &state.auth.global_keys
    } else {
        &state.auth.admin_keys
    };
    if check(keys, req.headers()) {
        next.run(req).await
    } else {
        debug!("Rejected management request with missing or invalid key");
        unauthorized()
    }
}
