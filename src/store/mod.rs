//! Durable storage used by the caches and the relay-log pipeline.
//!
//! Every call may fail with a persistence error; callers keep their
//! in-memory state unchanged when that happens.

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::channel::{Channel, NewChannel};
use crate::models::group::{Group, GroupItem, NewGroupItem};
use crate::models::llm_price::LlmInfo;
use crate::models::relay_log::{RelayLog, RelayLogQuery};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub const SETTING_RELAY_LOG_KEEP_PERIOD: &str = "relay_log_keep_period";

#[async_trait]
pub trait Store: Send + Sync {
    // ── Channels ──
    async fn list_channels(&self) -> Result<Vec<Channel>, AppError>;
    async fn create_channel(&self, channel: &NewChannel, base_url: &str) -> Result<Channel, AppError>;
    async fn update_channel(&self, channel: &Channel) -> Result<(), AppError>;
    /// Also removes the channel's group items. Returns false if absent.
    async fn delete_channel(&self, id: i64) -> Result<bool, AppError>;

    // ── Groups ──
    /// All groups with their items, items ordered by priority then id.
    async fn list_groups(&self) -> Result<Vec<Group>, AppError>;
    async fn create_group(&self, name: &str, match_regex: Option<&str>) -> Result<Group, AppError>;
    async fn update_group(&self, id: i64, name: &str, match_regex: Option<&str>) -> Result<(), AppError>;
    /// Cascades to the group's items. Returns false if absent.
    async fn delete_group(&self, id: i64) -> Result<bool, AppError>;
    async fn create_group_item(&self, item: &NewGroupItem) -> Result<GroupItem, AppError>;
    async fn update_group_item(&self, id: i64, priority: i32, weight: Option<i32>) -> Result<(), AppError>;
    async fn delete_group_items(&self, ids: &[i64]) -> Result<u64, AppError>;

    // ── Prices ──
    async fn list_prices(&self) -> Result<Vec<LlmInfo>, AppError>;
    async fn insert_prices(&self, infos: &[LlmInfo]) -> Result<(), AppError>;
    async fn save_price(&self, info: &LlmInfo) -> Result<(), AppError>;
    async fn delete_prices(&self, names: &[String]) -> Result<(), AppError>;

    // ── Relay logs ──
    async fn insert_relay_logs(&self, logs: &[RelayLog]) -> Result<(), AppError>;
    /// Newest first by id.
    async fn list_relay_logs(&self, query: RelayLogQuery) -> Result<Vec<RelayLog>, AppError>;
    /// Deletes entries with `time < cutoff`. Returns the number removed.
    async fn delete_relay_logs_before(&self, cutoff: i64) -> Result<u64, AppError>;
    async fn clear_relay_logs(&self) -> Result<u64, AppError>;

    // ── Settings ──
    async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError>;

    // ── API keys ──
    async fn list_api_keys(&self) -> Result<Vec<ApiKey>, AppError>;
    async fn create_api_key(&self, name: &str, key_hash: &str, key_prefix: &str) -> Result<ApiKey, AppError>;
    async fn delete_api_key(&self, id: i64) -> Result<Option<ApiKey>, AppError>;
}
