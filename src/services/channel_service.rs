use std::sync::Arc;

use crate::cache::Cache;
use crate::error::AppError;
use crate::models::channel::{Channel, ChannelInfo, ChannelUpdate, NewChannel};
use crate::store::Store;

/// Channels, kept warm in memory. Also holds the last measured base-URL
/// latency per channel.
pub struct ChannelService {
    store: Arc<dyn Store>,
    channels: Cache<i64, Channel>,
    delays: Cache<i64, u64>,
}

impl ChannelService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            channels: Cache::new(64),
            delays: Cache::new(64),
        }
    }

    /// Reload all channels from storage.
    pub async fn refresh(&self) -> Result<(), AppError> {
        let channels = self.store.list_channels().await?;
        tracing::info!("Loaded {} channels", channels.len());
        self.channels
            .replace_all(channels.into_iter().map(|c| (c.id, c)));
        Ok(())
    }

    /// All channels ordered by id.
    pub fn list(&self) -> Vec<Channel> {
        let mut all: Vec<Channel> = self.channels.get_all().into_values().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn list_info(&self) -> Vec<ChannelInfo> {
        self.list()
            .into_iter()
            .map(|c| {
                let delay = self.delays.get(&c.id);
                ChannelInfo::new(c, delay)
            })
            .collect()
    }

    pub fn get(&self, id: i64) -> Result<Channel, AppError> {
        self.channels
            .get(&id)
            .ok_or_else(|| AppError::not_found(format!("channel {id}")))
    }

    /// Create a channel. The base URL defaults from the channel type.
    pub async fn create(&self, new: NewChannel) -> Result<Channel, AppError> {
        if new.name.trim().is_empty() {
            return Err(AppError::BadRequest("name is required".into()));
        }
        if new.key.trim().is_empty() {
            return Err(AppError::BadRequest("key is required".into()));
        }
        let base_url = new
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| new.channel_type.default_base_url().to_string());

        let channel = self.store.create_channel(&new, &base_url).await?;
        self.channels.set(channel.id, channel.clone());
        tracing::info!("Created channel {} ({})", channel.name, channel.id);
        Ok(channel)
    }

    pub async fn update(&self, id: i64, update: ChannelUpdate) -> Result<Channel, AppError> {
        let mut channel = self.get(id)?;
        update.apply(&mut channel);
        if channel.name.trim().is_empty() {
            return Err(AppError::BadRequest("name is required".into()));
        }
        self.store.update_channel(&channel).await?;
        self.channels.set(id, channel.clone());
        Ok(channel)
    }

    /// Delete a channel; storage removes its group items with it.
    pub async fn delete(&self, id: i64) -> Result<(), AppError> {
        if !self.store.delete_channel(id).await? {
            return Err(AppError::not_found(format!("channel {id}")));
        }
        self.channels.delete([&id]);
        self.delays.delete([&id]);
        Ok(())
    }

    pub fn record_delay(&self, id: i64, delay_ms: u64) {
        self.delays.set(id, delay_ms);
    }

    pub fn delay(&self, id: i64) -> Option<u64> {
        self.delays.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{AutoGroupType, ChannelType};
    use crate::store::memory::MemoryStore;
    use pretty_assertions::assert_eq;

    fn new_channel(name: &str, channel_type: ChannelType, model: &str) -> NewChannel {
        NewChannel {
            name: name.into(),
            channel_type,
            enabled: true,
            base_url: None,
            key: "sk-abcdefghijkl".into(),
            model: model.into(),
            custom_model: String::new(),
            proxy: None,
            auto_group: AutoGroupType::None,
        }
    }

    #[tokio::test]
    async fn create_defaults_base_url_and_caches() {
        let store = Arc::new(MemoryStore::new());
        let service = ChannelService::new(store.clone());
        let channel = service
            .create(new_channel("anthropic", ChannelType::Anthropic, "claude"))
            .await
            .unwrap();
        assert_eq!(channel.base_url, "https://api.anthropic.com/v1");
        assert_eq!(service.get(channel.id).unwrap(), channel);

        let info = service.list_info();
        assert_eq!(info[0].key_preview, "sk-a...ijkl");
        assert_eq!(info[0].delay_ms, None);
        service.record_delay(channel.id, 42);
        assert_eq!(service.list_info()[0].delay_ms, Some(42));
    }

    #[tokio::test]
    async fn update_applies_partial_fields() {
        let store = Arc::new(MemoryStore::new());
        let service = ChannelService::new(store.clone());
        let mut new = new_channel("c", ChannelType::OpenaiChat, "gpt-4o");
        new.proxy = Some("http://proxy:8080".into());
        let channel = service.create(new).await.unwrap();

        let updated = service
            .update(
                channel.id,
                ChannelUpdate {
                    enabled: Some(false),
                    custom_model: Some("gpt-4.1".into()),
                    proxy: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.proxy, None);
        assert_eq!(updated.model_names(), vec!["gpt-4o", "gpt-4.1"]);
        assert_eq!(store.list_channels().await.unwrap()[0], updated);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let service = ChannelService::new(Arc::new(MemoryStore::new()));
        assert!(matches!(service.delete(7).await, Err(AppError::NotFound(_))));
        assert!(matches!(
            service.create(new_channel(" ", ChannelType::Gemini, "")).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
