use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::relay_log::RelayLog;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListLogsQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    /// Unix seconds, inclusive.
    pub start: Option<i64>,
    pub end: Option<i64>,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

/// GET /admin/logs: newest first
async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListLogsQuery>,
) -> Result<Json<Vec<RelayLog>>, AppError> {
    let logs = match (q.start, q.end) {
        (None, None) => state.logs.list(q.page, q.page_size).await?,
        (start, end) => {
            state
                .logs
                .list_by_time(start.unwrap_or(0), end.unwrap_or(i64::MAX), q.page, q.page_size)
                .await?
        }
    };
    Ok(Json(logs))
}

#[derive(Debug, Serialize)]
struct Cleared {
    deleted: u64,
}

/// DELETE /admin/logs: drop every stored entry
async fn clear_logs(State(state): State<Arc<AppState>>) -> Result<Json<Cleared>, AppError> {
    let deleted = state.logs.clear().await?;
    tracing::info!("Cleared {} relay logs", deleted);
    Ok(Json(Cleared { deleted }))
}

#[derive(Debug, Serialize)]
struct LogStatus {
    buffered: usize,
    subscribers: usize,
}

/// GET /admin/logs/status
async fn log_status(State(state): State<Arc<AppState>>) -> Json<LogStatus> {
    Json(LogStatus {
        buffered: state.logs.buffered(),
        subscribers: state.logs.subscriber_count(),
    })
}

#[derive(Debug, Serialize)]
struct StreamToken {
    token: String,
}

/// POST /admin/logs/stream-token: one-shot token for the live tail
async fn create_stream_token(State(state): State<Arc<AppState>>) -> Json<StreamToken> {
    Json(StreamToken {
        token: state.logs.create_stream_token(),
    })
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: String,
}

/// GET /admin/logs/stream?token=...: live tail as Server-Sent Events.
/// Browsers' EventSource cannot send headers, hence the query token.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if !state.logs.verify_stream_token(&q.token) {
        return Err(AppError::Unauthorized);
    }
    state.logs.revoke_stream_token(&q.token);

    let events = state.logs.subscribe().map(|entry| {
        let event = Event::default()
            .event("relay_log")
            .json_data(&entry)
            .unwrap_or_else(|e| Event::default().comment(e.to_string()));
        Ok(event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Admin log routes (to be nested under /admin, behind admin auth)
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs", get(list_logs).delete(clear_logs))
        .route("/logs/status", get(log_status))
        .route("/logs/stream-token", post(create_stream_token))
}

/// Token-authenticated live tail (to be nested under /admin, outside admin auth)
pub fn stream_router() -> Router<Arc<AppState>> {
    Router::new().route("/logs/stream", get(stream_logs))
}
