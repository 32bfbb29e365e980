use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A named routing bucket. Requests for a model equal to the group name are
/// served by the group's items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: i64,
    pub name: String,
    /// Pattern used by regex auto-grouping. Empty means exact-name matching.
    pub match_regex: Option<String>,
    pub items: Vec<GroupItem>,
}

/// Link between a group, a channel and one upstream model name.
/// `(group_id, channel_id, model_name)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct GroupItem {
    pub id: i64,
    pub group_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    /// Lower is tried first.
    pub priority: i32,
    /// Relative selection probability within one priority.
    pub weight: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGroupItem {
    #[serde(default)]
    pub group_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    #[serde(default = "default_one")]
    pub priority: i32,
    #[serde(default = "default_one")]
    pub weight: i32,
}

fn default_one() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub match_regex: Option<String>,
    #[serde(default)]
    pub items: Vec<NewGroupItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupItemChange {
    pub id: i64,
    pub priority: i32,
    pub weight: Option<i32>,
}

/// Incremental group update; only changed data is sent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    /// `Some("")` clears the pattern.
    pub match_regex: Option<String>,
    #[serde(default)]
    pub items_to_add: Vec<NewGroupItem>,
    #[serde(default)]
    pub items_to_update: Vec<GroupItemChange>,
    #[serde(default)]
    pub items_to_delete: Vec<i64>,
}
