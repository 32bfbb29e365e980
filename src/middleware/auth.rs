use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

/// Id of the API key that authenticated the request, injected into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct KeyIdentity {
    pub key_id: i64,
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Caller credential as each client SDK sends it: OpenAI uses Bearer,
/// Anthropic `x-api-key`, Gemini `x-goog-api-key`.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    extract_bearer(headers).or_else(|| {
        ["x-api-key", "x-goog-api-key"]
            .iter()
            .find_map(|name| headers.get(*name)?.to_str().ok())
    })
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": { "message": message } })),
    )
        .into_response()
}

/// Middleware that validates the Admin Key from env config.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let token = match extract_bearer(req.headers()) {
        Some(t) => t,
        None => return unauthorized("Missing Authorization header"),
    };

    if token != state.config.admin_key {
        return unauthorized("Invalid admin key");
    }

    next.run(req).await
}

/// Middleware that validates a caller API key against the in-memory key set.
pub async fn api_key_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let key_id = match extract_api_key(req.headers()) {
        Some(token) => state.keys.validate(token.trim()),
        None => return unauthorized("Missing API key"),
    };

    match key_id {
        Some(key_id) => {
            req.extensions_mut().insert(KeyIdentity { key_id });
            next.run(req).await
        }
        None => unauthorized("Invalid API key"),
    }
}
