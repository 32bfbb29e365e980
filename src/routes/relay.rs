use axum::{
    body::Bytes,
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::AppError;
use crate::relay::Overrides;
use crate::state::AppState;
use crate::transformer::InboundType;

async fn relay(state: &AppState, kind: InboundType, body: &[u8], overrides: Overrides) -> Result<Response, AppError> {
    state.relay.clone().handle(kind, body, overrides).await
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    relay(&state, InboundType::OpenaiChat, &body, Overrides::default()).await
}

/// POST /v1/responses
async fn responses(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    relay(&state, InboundType::OpenaiResponse, &body, Overrides::default()).await
}

/// POST /v1/messages
async fn messages(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    relay(&state, InboundType::Anthropic, &body, Overrides::default()).await
}

/// POST /v1beta/models/{model}:generateContent
/// POST /v1beta/models/{model}:streamGenerateContent
async fn generate_content(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let (model, action) = target
        .rsplit_once(':')
        .ok_or_else(|| AppError::not_found(format!("route models/{target}")))?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return Err(AppError::not_found(format!("action {action}"))),
    };
    let overrides = Overrides {
        model: Some(model.to_string()),
        stream: Some(stream),
    };
    relay(&state, InboundType::Gemini, &body, overrides).await
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelEntry>,
}

/// GET /v1/models: every group name is a routable model
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let data = state
        .groups
        .model_names()
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            owned_by: "llm-relay",
        })
        .collect();
    Json(ModelList { object: "list", data })
}

/// Build the relay router (to be nested under /v1)
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/responses", post(responses))
        .route("/messages", post(messages))
        .route("/models", get(list_models))
}

/// Gemini-style routes (to be nested under /v1beta)
pub fn gemini_router() -> Router<Arc<AppState>> {
    Router::new().route("/models/{target}", post(generate_content))
}
