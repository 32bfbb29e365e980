//! Background work: a bounded queue for fire-and-forget jobs submitted by
//! request handlers, and the periodic loops started from `main`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::Upstream;
use crate::error::AppError;
use crate::services::channel_service::ChannelService;
use crate::services::group_service::GroupService;
use crate::services::price_service::PriceCache;
use crate::services::relay_log::RelayLogService;

/// Timeout of one base-URL probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundTask {
    /// Classify a channel's models into matching groups.
    AutoGroup { channel_id: i64 },
    /// Create zero-priced entries for model names without a price.
    PriceBackfill { names: Vec<String> },
}

/// Producer side of the work queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<BackgroundTask>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BackgroundTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. A full or closed queue drops the task.
    pub fn submit(&self, task: BackgroundTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!("Task queue full, dropping {:?}", task);
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                tracing::error!("Task queue closed, dropping {:?}", task);
                false
            }
        }
    }
}

pub struct TaskRunner {
    pub channels: Arc<ChannelService>,
    pub groups: Arc<GroupService>,
    pub prices: Arc<PriceCache>,
}

impl TaskRunner {
    pub async fn execute(&self, task: &BackgroundTask) -> Result<(), AppError> {
        match task {
            BackgroundTask::AutoGroup { channel_id } => {
                let channel = self.channels.get(*channel_id)?;
                self.groups.auto_group(&channel).await?;
            }
            BackgroundTask::PriceBackfill { names } => {
                let created = self.prices.batch_create(names).await?;
                if created > 0 {
                    tracing::info!("Added {} zero-priced models", created);
                }
            }
        }
        Ok(())
    }

    /// Single consumer; runs until every `TaskQueue` is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<BackgroundTask>) {
        while let Some(task) = rx.recv().await {
            if let Err(e) = self.execute(&task).await {
                tracing::error!("Background task {:?} failed: {}", task, e);
            }
        }
        tracing::info!("Task queue closed, worker exiting");
    }
}

/// Flush relay logs and apply retention every `interval`.
pub fn spawn_flush_loop(logs: Arc<RelayLogService>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = logs.flush_task().await {
                tracing::error!("Relay log flush task error: {}", e);
            }
        }
    })
}

/// Measure every channel's base-URL latency.
pub async fn probe_channels(channels: &ChannelService, upstream: &dyn Upstream) {
    for channel in channels.list() {
        match upstream.probe(&channel, PROBE_TIMEOUT).await {
            Ok(elapsed) => channels.record_delay(channel.id, elapsed.as_millis() as u64),
            Err(e) => tracing::warn!("Probe of channel {} failed: {}", channel.name, e),
        }
    }
}

pub fn spawn_probe_loop(
    channels: Arc<ChannelService>,
    upstream: Arc<dyn Upstream>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            probe_channels(&channels, upstream.as_ref()).await;
        }
    })
}
