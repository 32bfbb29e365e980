use std::sync::Arc;

use crate::cache::Cache;
use crate::error::AppError;
use crate::models::llm_price::{LlmInfo, LlmPrice};
use crate::store::Store;
use crate::transformer::model::Usage;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// Per-model prices kept resident in memory.
///
/// Every mutation writes storage first and only then touches the cache, so a
/// failed write leaves the cache as it was and storage stays authoritative.
pub struct PriceCache {
    store: Arc<dyn Store>,
    prices: Cache<String, LlmPrice>,
    /// Held across check-then-write so concurrent mutations cannot both
    /// pass the same existence check.
    writes: tokio::sync::Mutex<()>,
}

impl PriceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            prices: Cache::new(256),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Reload everything from storage.
    pub async fn refresh(&self) -> Result<(), AppError> {
        let rows = self.store.list_prices().await?;
        tracing::info!("Loaded {} model prices", rows.len());
        self.prices
            .replace_all(rows.into_iter().map(|info| (info.name, info.price)));
        Ok(())
    }

    /// All known prices, sorted by model name.
    pub fn list(&self) -> Vec<LlmInfo> {
        let mut all: Vec<LlmInfo> = self
            .prices
            .get_all()
            .into_iter()
            .map(|(name, price)| LlmInfo { name, price })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get(&self, name: &str) -> Result<LlmPrice, AppError> {
        self.prices
            .get(&name.to_string())
            .ok_or_else(|| AppError::not_found(format!("price for {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prices.contains(&name.to_string())
    }

    pub async fn create(&self, info: LlmInfo) -> Result<(), AppError> {
        let _writes = self.writes.lock().await;
        if self.contains(&info.name) {
            return Err(AppError::AlreadyExists(format!("price for {}", info.name)));
        }
        self.store.insert_prices(std::slice::from_ref(&info)).await?;
        self.prices.set(info.name, info.price);
        Ok(())
    }

    pub async fn update(&self, info: LlmInfo) -> Result<(), AppError> {
        let _writes = self.writes.lock().await;
        if !self.contains(&info.name) {
            return Err(AppError::not_found(format!("price for {}", info.name)));
        }
        self.store.save_price(&info).await?;
        self.prices.set(info.name, info.price);
        Ok(())
    }

    pub async fn batch_delete(&self, names: &[String]) -> Result<(), AppError> {
        if names.is_empty() {
            return Ok(());
        }
        let _writes = self.writes.lock().await;
        self.store.delete_prices(names).await?;
        self.prices.delete(names);
        Ok(())
    }

    /// Zero-priced entries for every name not yet known, in one storage call.
    /// Returns how many were created.
    pub async fn batch_create(&self, names: &[String]) -> Result<usize, AppError> {
        let _writes = self.writes.lock().await;
        let mut fresh: Vec<LlmInfo> = Vec::new();
        for name in names.iter().map(|n| n.trim()) {
            if name.is_empty() || self.contains(name) || fresh.iter().any(|f| f.name == name) {
                continue;
            }
            fresh.push(LlmInfo::zero(name));
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        self.store.insert_prices(&fresh).await?;
        let created = fresh.len();
        for info in fresh {
            self.prices.set(info.name, info.price);
        }
        Ok(created)
    }

    /// Cost of one relay. Unknown models cost nothing.
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        let Some(price) = self.prices.get(&model.to_string()) else {
            return 0.0;
        };
        let uncached = (usage.prompt_tokens - usage.cached_tokens - usage.cache_write_tokens).max(0);
        (uncached as f64 * price.input
            + usage.cached_tokens as f64 * price.cache_read
            + usage.cache_write_tokens as f64 * price.cache_write
            + usage.completion_tokens as f64 * price.output)
            / TOKENS_PER_UNIT
    }
}
