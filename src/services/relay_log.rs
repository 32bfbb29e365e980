//! Relay-log pipeline: a bounded write buffer in front of storage, live
//! fan-out to tail subscribers, periodic flush with retention cleanup, and
//! short-lived stream tokens for the tail endpoint.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::relay_log::{RelayLog, RelayLogQuery};
use crate::snowflake::Snowflake;
use crate::store::{Store, SETTING_RELAY_LOG_KEEP_PERIOD};

/// Buffered entries that trigger a synchronous flush.
pub const BUFFER_CAPACITY: usize = 20;
/// Per-subscriber queue depth. Entries beyond it are dropped for that subscriber.
pub const SUBSCRIBER_DEPTH: usize = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Default)]
struct Buffer {
    /// Entries not yet handed to storage, oldest first.
    pending: Vec<RelayLog>,
    /// Entries of the flush in progress, restored to the front on failure.
    flushing: Vec<RelayLog>,
}

pub struct RelayLogService {
    store: Arc<dyn Store>,
    ids: Snowflake,
    buffer: Mutex<Buffer>,
    /// Serialises flushes; never held together with `buffer`.
    flush_lock: tokio::sync::Mutex<()>,
    /// Readers share it; a flush takes it exclusively so a batch is never
    /// visible in both the buffer and storage.
    view: tokio::sync::RwLock<()>,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<RelayLog>>>,
    next_subscriber: AtomicU64,
    tokens: Mutex<HashMap<String, Instant>>,
    token_ttl: Duration,
}

impl RelayLogService {
    pub fn new(store: Arc<dyn Store>, token_ttl: Duration) -> Self {
        Self {
            store,
            ids: Snowflake::with_random_node(),
            buffer: Mutex::new(Buffer::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            view: tokio::sync::RwLock::new(()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            tokens: Mutex::new(HashMap::new()),
            token_ttl,
        }
    }

    // ── Write path ──

    /// Append an entry, fan it out to subscribers and flush when the buffer
    /// is full. Storage failures are logged; the entries stay buffered.
    pub async fn add(&self, mut entry: RelayLog) {
        entry.id = self.ids.next_id();
        if entry.time == 0 {
            entry.time = Utc::now().timestamp();
        }

        let full = {
            let mut buf = self.buffer.lock();
            buf.pending.push(entry.clone());
            buf.pending.len() >= BUFFER_CAPACITY
        };

        self.broadcast(&entry);

        if full {
            if let Err(e) = self.flush().await {
                tracing::error!("Relay log flush failed: {}", e);
            }
        }
    }

    fn broadcast(&self, entry: &RelayLog) {
        let mut closed = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, tx) in subs.iter() {
                match tx.try_send(entry.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subs = self.subscribers.write();
            for id in closed {
                subs.remove(&id);
            }
        }
    }

    /// Move everything pending to storage. On failure the batch goes back to
    /// the front of the buffer.
    pub async fn flush(&self) -> Result<usize, AppError> {
        let _guard = self.flush_lock.lock().await;
        let _view = self.view.write().await;

        let batch = {
            let mut buf = self.buffer.lock();
            if buf.pending.is_empty() {
                return Ok(0);
            }
            let batch = std::mem::take(&mut buf.pending);
            buf.flushing = batch.clone();
            batch
        };

        let result = self.store.insert_relay_logs(&batch).await;

        let mut buf = self.buffer.lock();
        let flushing = std::mem::take(&mut buf.flushing);
        match result {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let newer = std::mem::replace(&mut buf.pending, flushing);
                buf.pending.extend(newer);
                Err(e)
            }
        }
    }

    /// Periodic job: flush, then delete stored entries older than the
    /// configured keep period. A keep period of 0 or less keeps everything.
    pub async fn flush_task(&self) -> Result<u64, AppError> {
        self.flush().await?;

        let keep_days = self
            .store
            .get_setting(SETTING_RELAY_LOG_KEEP_PERIOD)
            .await?
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if keep_days <= 0 {
            return Ok(0);
        }

        let cutoff = Utc::now().timestamp() - keep_days * SECONDS_PER_DAY;
        let removed = self.store.delete_relay_logs_before(cutoff).await?;
        if removed > 0 {
            tracing::info!("Removed {} relay logs older than {} days", removed, keep_days);
        }
        Ok(removed)
    }

    // ── Read path ──

    /// Buffered entries, newest first.
    fn recent(&self) -> Vec<RelayLog> {
        let buf = self.buffer.lock();
        buf.flushing
            .iter()
            .chain(buf.pending.iter())
            .rev()
            .cloned()
            .collect()
    }

    pub fn buffered(&self) -> usize {
        let buf = self.buffer.lock();
        buf.pending.len() + buf.flushing.len()
    }

    pub async fn list(&self, page: i64, page_size: i64) -> Result<Vec<RelayLog>, AppError> {
        self.query(None, page, page_size).await
    }

    /// Entries with `start <= time <= end` (unix seconds).
    pub async fn list_by_time(
        &self,
        start: i64,
        end: i64,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<RelayLog>, AppError> {
        self.query(Some((start, end)), page, page_size).await
    }

    /// Newest-first page over buffer and storage as if they were one source:
    /// buffered rows come first, storage supplies the rest of the page.
    async fn query(
        &self,
        range: Option<(i64, i64)>,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<RelayLog>, AppError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(page_size);

        let _view = self.view.read().await;
        let mut recent = self.recent();
        if let Some((start, end)) = range {
            recent.retain(|l| l.time >= start && l.time <= end);
        }
        let buffered = recent.len() as i64;

        let mut rows: Vec<RelayLog> = recent
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(page_size as usize)
            .collect();

        let missing = page_size - rows.len() as i64;
        if missing > 0 {
            let stored = self
                .store
                .list_relay_logs(RelayLogQuery {
                    range,
                    offset: offset.saturating_sub(buffered).max(0),
                    limit: missing,
                })
                .await?;
            rows.extend(stored);
        }
        Ok(rows)
    }

    /// Delete every stored entry. The buffer is left alone.
    pub async fn clear(&self) -> Result<u64, AppError> {
        self.store.clear_relay_logs().await
    }

    // ── Live tail ──

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.subscribers.write().insert(id, tx);
        Subscription {
            id,
            rx,
            owner: Arc::downgrade(self),
        }
    }

    /// Deregister a subscriber; its receiver sees the end of the queue.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // ── Stream tokens ──

    /// A fresh 64-hex-char token valid for the configured TTL.
    pub fn create_stream_token(&self) -> String {
        let token = hex::encode(rand::random::<[u8; 32]>());
        let now = Instant::now();
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, expires| *expires > now);
        tokens.insert(token.clone(), now + self.token_ttl);
        token
    }

    pub fn verify_stream_token(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .get(token)
            .is_some_and(|expires| *expires > Instant::now())
    }

    pub fn revoke_stream_token(&self, token: &str) {
        self.tokens.lock().remove(token);
    }
}

/// Receiving end of a live-tail subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<RelayLog>,
    owner: Weak<RelayLogService>,
}

#[cfg(test)]
impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<RelayLog> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RelayLog> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = RelayLog;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use pretty_assertions::assert_eq;

    fn entry(model: &str) -> RelayLog {
        RelayLog {
            request_model: model.into(),
            success: true,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RelayLogService>) {
        let store = Arc::new(MemoryStore::new());
        let logs = Arc::new(RelayLogService::new(store.clone(), Duration::from_secs(60)));
        (store, logs)
    }

    #[tokio::test]
    async fn full_buffer_flushes_once() {
        let (store, logs) = setup();
        for i in 0..25 {
            logs.add(entry(&format!("m{i}"))).await;
        }
        assert_eq!(store.flush_count(), 1);
        assert_eq!(store.relay_logs().len(), 20);
        assert_eq!(logs.buffered(), 5);

        let newest = logs.list(1, 1).await.unwrap();
        assert_eq!(newest[0].request_model, "m24");
    }

    #[tokio::test]
    async fn pages_are_newest_first_across_buffer_and_storage() {
        let (_, logs) = setup();
        for i in 0..15 {
            logs.add(entry(&format!("m{i}"))).await;
        }

        let first = logs.list(1, 10).await.unwrap();
        let second = logs.list(2, 10).await.unwrap();
        let names = |rows: &[RelayLog]| rows.iter().map(|r| r.request_model.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), (5..15).rev().map(|i| format!("m{i}")).collect::<Vec<_>>());
        assert_eq!(names(&second), (0..5).rev().map(|i| format!("m{i}")).collect::<Vec<_>>());
        assert!(first.windows(2).all(|w| w[0].id > w[1].id));

        // after a flush the same pages come from storage
        logs.flush().await.unwrap();
        logs.add(entry("m15")).await;
        let spanning = logs.list(1, 3).await.unwrap();
        assert_eq!(names(&spanning), vec!["m15", "m14", "m13"]);
        let deep = logs.list(2, 10).await.unwrap();
        assert_eq!(names(&deep), (0..6).rev().map(|i| format!("m{i}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn page_past_the_end_is_empty() {
        let (_, logs) = setup();
        for i in 0..3 {
            logs.add(entry(&format!("m{i}"))).await;
        }
        assert!(logs.list(i64::MAX, 10).await.unwrap().is_empty());
        assert!(logs.list_by_time(0, i64::MAX, i64::MAX, MAX_PAGE_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_during_a_flush_see_each_entry_once() {
        let (store, logs) = setup();
        for i in 0..5 {
            logs.add(entry(&format!("m{i}"))).await;
        }
        let gate = store.hold_relay_log_inserts();

        let flushing = tokio::spawn({
            let logs = logs.clone();
            async move { logs.flush().await }
        });
        // rows are in storage, the flush has not returned yet
        gate.entered.notified().await;
        assert_eq!(store.relay_logs().len(), 5);

        let reading = tokio::spawn({
            let logs = logs.clone();
            async move { logs.list(1, 10).await }
        });
        tokio::task::yield_now().await;
        gate.release.notify_one();

        assert_eq!(flushing.await.unwrap().unwrap(), 5);
        let rows = reading.await.unwrap().unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.request_model.as_str()).collect();
        assert_eq!(names, vec!["m4", "m3", "m2", "m1", "m0"]);
    }

    #[tokio::test]
    async fn list_by_time_filters_buffer_and_storage() {
        let (_, logs) = setup();
        for (model, time) in [("old", 100), ("mid", 200), ("new", 300)] {
            logs.add(RelayLog { time, ..entry(model) }).await;
        }
        logs.flush().await.unwrap();
        logs.add(RelayLog { time: 250, ..entry("late") }).await;

        let rows = logs.list_by_time(150, 260, 1, 10).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.request_model.as_str()).collect();
        assert_eq!(names, vec!["late", "mid"]);
    }

    #[tokio::test]
    async fn saturated_subscriber_drops_only_its_own_entries() {
        let (store, logs) = setup();
        let mut slow = logs.subscribe();
        let mut fast = logs.subscribe();

        let mut fast_seen = 0;
        for i in 0..15 {
            logs.add(entry(&format!("m{i}"))).await;
            while fast.try_recv().is_some() {
                fast_seen += 1;
            }
        }

        let mut slow_seen = Vec::new();
        while let Some(e) = slow.try_recv() {
            slow_seen.push(e.request_model);
        }
        assert_eq!(slow_seen.len(), SUBSCRIBER_DEPTH);
        assert_eq!(slow_seen[0], "m0");
        assert_eq!(fast_seen, 15);
        assert_eq!(logs.buffered() + store.relay_logs().len(), 15);
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let (_, logs) = setup();
        let sub = logs.subscribe();
        assert_eq!(logs.subscriber_count(), 1);
        drop(sub);
        assert_eq!(logs.subscriber_count(), 0);

        let mut sub = logs.subscribe();
        logs.unsubscribe(sub.id());
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn failed_flush_keeps_entries_in_order() {
        let (store, logs) = setup();
        store.fail_writes(true);
        for i in 0..BUFFER_CAPACITY {
            logs.add(entry(&format!("m{i}"))).await;
        }
        assert_eq!(logs.buffered(), BUFFER_CAPACITY);
        assert!(logs.flush().await.is_err());

        store.fail_writes(false);
        logs.add(entry("last")).await;
        assert_eq!(logs.buffered(), 0);
        let stored = store.relay_logs();
        assert_eq!(stored.len(), BUFFER_CAPACITY + 1);
        assert!(stored.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn retention_respects_keep_period() {
        let (store, logs) = setup();
        let now = Utc::now().timestamp();
        let day = SECONDS_PER_DAY;
        store
            .insert_relay_logs(&[
                RelayLog { id: 1, time: now - 30 * day, ..entry("ancient") },
                RelayLog { id: 2, time: now - 8 * day, ..entry("old") },
                RelayLog { id: 3, time: now - 6 * day, ..entry("recent") },
            ])
            .await
            .unwrap();

        store.set_setting(SETTING_RELAY_LOG_KEEP_PERIOD, "0").await.unwrap();
        assert_eq!(logs.flush_task().await.unwrap(), 0);
        assert_eq!(store.relay_logs().len(), 3);

        store.set_setting(SETTING_RELAY_LOG_KEEP_PERIOD, "7").await.unwrap();
        assert_eq!(logs.flush_task().await.unwrap(), 2);
        let left: Vec<String> = store.relay_logs().into_iter().map(|l| l.request_model).collect();
        assert_eq!(left, vec!["recent"]);
    }

    #[tokio::test]
    async fn clear_removes_stored_entries_only() {
        let (store, logs) = setup();
        logs.add(entry("a")).await;
        logs.flush().await.unwrap();
        logs.add(entry("b")).await;
        assert_eq!(logs.clear().await.unwrap(), 1);
        assert!(store.relay_logs().is_empty());
        assert_eq!(logs.buffered(), 1);
    }

    #[test]
    fn stream_tokens_verify_and_revoke() {
        let logs = RelayLogService::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let token = logs.create_stream_token();
        assert_eq!(token.len(), 64);
        assert!(logs.verify_stream_token(&token));
        assert!(!logs.verify_stream_token("nope"));
        logs.revoke_stream_token(&token);
        assert!(!logs.verify_stream_token(&token));

        let expired = RelayLogService::new(Arc::new(MemoryStore::new()), Duration::ZERO);
        let token = expired.create_stream_token();
        assert!(!expired.verify_stream_token(&token));
    }
}
