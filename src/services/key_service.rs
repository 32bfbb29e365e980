use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::AppError;
use crate::models::api_key::{ApiKeyCreated, ApiKeyInfo};
use crate::store::Store;

/// Generate a new key in the format `sk-{uuid v4}`
pub fn generate_key() -> String {
    format!("sk-{}", Uuid::new_v4())
}

/// SHA-256 hash of a plaintext key
pub fn hash_key(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

/// Display prefix of a key, e.g. "sk-550e8400..." -> "sk-550e8400...".
fn key_prefix(plain: &str) -> String {
    match plain.char_indices().nth(11) {
        Some((cut, _)) => format!("{}...", &plain[..cut]),
        None => plain.to_string(),
    }
}

/// Caller credentials. Only hashes are stored; the active set is cached in
/// memory so validation never touches storage.
pub struct KeyService {
    store: Arc<dyn Store>,
    /// key hash -> key id
    active: Cache<String, i64>,
}

impl KeyService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            active: Cache::new(16),
        }
    }

    /// Load all key hashes (call on startup).
    pub async fn warm_up(&self) -> Result<(), AppError> {
        let keys = self.store.list_api_keys().await?;
        tracing::info!("Loaded {} API keys", keys.len());
        self.active
            .replace_all(keys.into_iter().map(|k| (k.key_hash, k.id)));
        Ok(())
    }

    /// Create a key. The plaintext is returned here and never again.
    pub async fn create(&self, name: &str) -> Result<ApiKeyCreated, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("name is required".into()));
        }
        let plain = generate_key();
        let hash = hash_key(&plain);
        let prefix = key_prefix(&plain);

        let key = self.store.create_api_key(name, &hash, &prefix).await?;
        self.active.set(hash, key.id);

        Ok(ApiKeyCreated {
            id: key.id,
            name: key.name,
            key: plain,
            key_prefix: key.key_prefix,
            created_at: key.created_at,
        })
    }

    /// Id of the key matching a plaintext credential.
    pub fn validate(&self, plain: &str) -> Option<i64> {
        self.active.get(&hash_key(plain))
    }

    pub async fn list(&self) -> Result<Vec<ApiKeyInfo>, AppError> {
        let mut keys = self.store.list_api_keys().await?;
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys.into_iter().map(ApiKeyInfo::from).collect())
    }

    pub async fn delete(&self, id: i64) -> Result<(), AppError> {
        let removed = self
            .store
            .delete_api_key(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("API key {id}")))?;
        self.active.delete([&removed.key_hash]);
        Ok(())
    }
}
