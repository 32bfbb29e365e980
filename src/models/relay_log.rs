use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One record per relay attempt. Never mutated after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, FromRow)]
pub struct RelayLog {
    /// Time-ordered id, assigned when the entry enters the pipeline.
    pub id: i64,
    /// Unix seconds.
    pub time: i64,
    pub request_model: String,
    pub actual_model: String,
    pub channel_id: Option<i64>,
    pub channel_name: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost: f64,
    pub is_stream: bool,
    /// Milliseconds until the first streamed chunk.
    pub first_token_ms: Option<i64>,
    pub use_time_ms: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// Storage-side query: newest first by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayLogQuery {
    /// Inclusive unix-second range on `time`.
    pub range: Option<(i64, i64)>,
    pub offset: i64,
    pub limit: i64,
}
