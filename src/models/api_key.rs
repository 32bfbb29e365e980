use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// Response when listing keys: never exposes hash or full key
#[derive(Debug, Serialize)]
pub struct ApiKeyInfo {
    pub id: i64,
    pub name: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKey> for ApiKeyInfo {
    fn from(k: ApiKey) -> Self {
        Self {
            id: k.id,
            name: k.name,
            key_prefix: k.key_prefix,
            created_at: k.created_at,
        }
    }
}

/// Response when creating a key: includes the plaintext key (shown only once)
#[derive(Debug, Serialize)]
pub struct ApiKeyCreated {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}
