use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::Upstream;
use crate::config::Config;
use crate::error::AppError;
use crate::relay::Relay;
use crate::services::channel_service::ChannelService;
use crate::services::group_service::GroupService;
use crate::services::key_service::KeyService;
use crate::services::price_service::PriceCache;
use crate::services::relay_log::RelayLogService;
use crate::store::{Store, SETTING_RELAY_LOG_KEEP_PERIOD};
use crate::tasks::{BackgroundTask, TaskQueue, TaskRunner};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub channels: Arc<ChannelService>,
    pub groups: Arc<GroupService>,
    pub prices: Arc<PriceCache>,
    pub keys: KeyService,
    pub logs: Arc<RelayLogService>,
    pub tasks: TaskQueue,
    pub upstream: Arc<dyn Upstream>,
    pub relay: Arc<Relay>,
}

impl AppState {
    /// Build every service over one store. The receiver feeds the task worker.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        upstream: Arc<dyn Upstream>,
    ) -> (Self, mpsc::Receiver<BackgroundTask>) {
        let channels = Arc::new(ChannelService::new(store.clone()));
        let groups = Arc::new(GroupService::new(store.clone()));
        let prices = Arc::new(PriceCache::new(store.clone()));
        let logs = Arc::new(RelayLogService::new(store.clone(), config.stream_token_ttl));
        let (tasks, rx) = TaskQueue::new(config.task_queue_capacity);

        let relay = Arc::new(Relay {
            channels: channels.clone(),
            groups: groups.clone(),
            prices: prices.clone(),
            logs: logs.clone(),
            tasks: tasks.clone(),
            upstream: upstream.clone(),
        });

        let state = Self {
            keys: KeyService::new(store.clone()),
            config,
            store,
            channels,
            groups,
            prices,
            logs,
            tasks,
            upstream,
            relay,
        };
        (state, rx)
    }

    pub fn task_runner(&self) -> TaskRunner {
        TaskRunner {
            channels: self.channels.clone(),
            groups: self.groups.clone(),
            prices: self.prices.clone(),
        }
    }

    /// Load every cache from storage and seed missing settings.
    pub async fn warm_up(&self) -> Result<(), AppError> {
        self.channels.refresh().await?;
        self.groups.refresh().await?;
        self.prices.refresh().await?;
        self.keys.warm_up().await?;

        if self.store.get_setting(SETTING_RELAY_LOG_KEEP_PERIOD).await?.is_none() {
            self.store
                .set_setting(
                    SETTING_RELAY_LOG_KEEP_PERIOD,
                    &self.config.log_retention_days.to_string(),
                )
                .await?;
        }
        Ok(())
    }
}
