use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::client;
use crate::error::AppError;
use crate::models::api_key::{ApiKeyCreated, ApiKeyInfo};
use crate::models::channel::{AutoGroupType, Channel, ChannelInfo, ChannelType, ChannelUpdate, NewChannel};
use crate::models::group::{Group, GroupUpdate, NewGroup};
use crate::models::llm_price::{LlmInfo, LlmPrice};
use crate::state::AppState;
use crate::tasks::BackgroundTask;

// ── API key endpoints ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
}

/// POST /admin/keys: create a new API key
async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<ApiKeyCreated>), AppError> {
    let result = state.keys.create(&body.name).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /admin/keys: list all keys (without plaintext)
async fn list_keys(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ApiKeyInfo>>, AppError> {
    Ok(Json(state.keys.list().await?))
}

/// DELETE /admin/keys/{id}
async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.keys.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Channel endpoints ─────────────────────────────────────────────────

/// Queue auto-grouping and price backfill for a channel's models.
fn submit_channel_tasks(state: &AppState, channel: &Channel) {
    state.tasks.submit(BackgroundTask::AutoGroup {
        channel_id: channel.id,
    });
    let names = channel.model_names();
    if !names.is_empty() {
        state.tasks.submit(BackgroundTask::PriceBackfill { names });
    }
}

/// POST /admin/channels
async fn create_channel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewChannel>,
) -> Result<impl IntoResponse, AppError> {
    let channel = state.channels.create(body).await?;
    submit_channel_tasks(&state, &channel);
    let delay = state.channels.delay(channel.id);
    Ok((StatusCode::CREATED, Json(ChannelInfo::new(channel, delay))))
}

/// GET /admin/channels
async fn list_channels(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelInfo>> {
    Json(state.channels.list_info())
}

/// GET /admin/channels/{id}
async fn get_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ChannelInfo>, AppError> {
    let channel = state.channels.get(id)?;
    Ok(Json(ChannelInfo::new(channel, state.channels.delay(id))))
}

/// PUT /admin/channels/{id}
async fn update_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ChannelUpdate>,
) -> Result<Json<ChannelInfo>, AppError> {
    let touches_models = body.touches_models();
    let channel = state.channels.update(id, body).await?;
    if touches_models {
        submit_channel_tasks(&state, &channel);
    }
    Ok(Json(ChannelInfo::new(channel, state.channels.delay(id))))
}

/// DELETE /admin/channels/{id}
async fn delete_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.channels.delete(id).await?;
    // storage dropped the channel's group items
    state.groups.refresh().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct FetchModelsRequest {
    pub channel_type: ChannelType,
    pub base_url: Option<String>,
    pub key: String,
    pub proxy: Option<String>,
}

/// POST /admin/channels/fetch-models: list what a provider offers before
/// the channel is saved
async fn fetch_models(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FetchModelsRequest>,
) -> Result<Json<Vec<String>>, AppError> {
    if body.key.trim().is_empty() {
        return Err(AppError::BadRequest("key is required".into()));
    }
    let probe = Channel {
        id: 0,
        name: "fetch-models".into(),
        channel_type: body.channel_type,
        enabled: true,
        base_url: body
            .base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| body.channel_type.default_base_url().to_string()),
        key: body.key,
        model: String::new(),
        custom_model: String::new(),
        proxy: body.proxy,
        auto_group: AutoGroupType::None,
    };
    let names = client::fetch_model_names(state.upstream.as_ref(), &probe).await?;
    Ok(Json(names))
}

// ── Group endpoints ───────────────────────────────────────────────────

/// POST /admin/groups
async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewGroup>,
) -> Result<(StatusCode, Json<Group>), AppError> {
    let group = state.groups.create(body).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// GET /admin/groups
async fn list_groups(State(state): State<Arc<AppState>>) -> Json<Vec<Group>> {
    Json(state.groups.list())
}

/// GET /admin/groups/{id}
async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Group>, AppError> {
    Ok(Json(state.groups.get(id)?))
}

/// PUT /admin/groups/{id}: incremental update
async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<GroupUpdate>,
) -> Result<Json<Group>, AppError> {
    Ok(Json(state.groups.update(id, body).await?))
}

/// DELETE /admin/groups/{id}
async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.groups.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DeleteItemsRequest {
    pub ids: Vec<i64>,
}

/// POST /admin/groups/items/delete: batch delete group items
async fn delete_group_items(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteItemsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.groups.delete_items(&body.ids).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// ── Price endpoints ───────────────────────────────────────────────────

/// GET /admin/prices
async fn list_prices(State(state): State<Arc<AppState>>) -> Json<Vec<LlmInfo>> {
    Json(state.prices.list())
}

/// GET /admin/prices/{*name}: model names may contain slashes
async fn get_price(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<LlmPrice>, AppError> {
    Ok(Json(state.prices.get(&name)?))
}

fn validate_price(info: &LlmInfo) -> Result<(), AppError> {
    if info.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    let p = info.price;
    if [p.input, p.output, p.cache_read, p.cache_write]
        .iter()
        .any(|v| !v.is_finite() || *v < 0.0)
    {
        return Err(AppError::BadRequest("prices must be non-negative".into()));
    }
    Ok(())
}

/// POST /admin/prices
async fn create_price(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LlmInfo>,
) -> Result<(StatusCode, Json<LlmInfo>), AppError> {
    validate_price(&body)?;
    state.prices.create(body.clone()).await?;
    Ok((StatusCode::CREATED, Json(body)))
}

/// PUT /admin/prices
async fn update_price(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LlmInfo>,
) -> Result<Json<LlmInfo>, AppError> {
    validate_price(&body)?;
    state.prices.update(body.clone()).await?;
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct DeletePricesRequest {
    pub names: Vec<String>,
}

/// POST /admin/prices/delete: batch delete
async fn delete_prices(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeletePricesRequest>,
) -> Result<StatusCode, AppError> {
    state.prices.batch_delete(&body.names).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Router ────────────────────────────────────────────────────────────

/// Build the admin router (to be nested under /admin)
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // API keys
        .route("/keys", post(create_key).get(list_keys))
        .route("/keys/{id}", delete(delete_key))
        // Channels
        .route("/channels", post(create_channel).get(list_channels))
        .route("/channels/fetch-models", post(fetch_models))
        .route(
            "/channels/{id}",
            get(get_channel).put(update_channel).delete(delete_channel),
        )
        // Groups
        .route("/groups", post(create_group).get(list_groups))
        .route("/groups/items/delete", post(delete_group_items))
        .route(
            "/groups/{id}",
            get(get_group).put(update_group).delete(delete_group),
        )
        // Prices
        .route("/prices", get(list_prices).post(create_price).put(update_price))
        .route("/prices/delete", post(delete_prices))
        .route("/prices/{*name}", get(get_price))
        // Logs
        .merge(super::logs::router())
}
