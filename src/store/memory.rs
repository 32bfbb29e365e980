//! In-memory `Store` for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Store;
use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::channel::{Channel, NewChannel};
use crate::models::group::{Group, GroupItem, NewGroupItem};
use crate::models::llm_price::LlmInfo;
use crate::models::relay_log::{RelayLog, RelayLogQuery};

#[derive(Default)]
struct Tables {
    next_id: i64,
    channels: Vec<Channel>,
    groups: Vec<(i64, String, Option<String>)>,
    items: Vec<GroupItem>,
    prices: HashMap<String, LlmInfo>,
    relay_logs: Vec<RelayLog>,
    settings: HashMap<String, String>,
    api_keys: Vec<ApiKey>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Pauses one insert call until released.
#[derive(Default)]
pub struct InsertGate {
    /// Signalled once the call reaches the pause point.
    pub entered: Notify,
    /// The insert returns after this is signalled.
    pub release: Notify,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    relay_log_gate: Mutex<Option<Arc<InsertGate>>>,
    price_gate: Mutex<Option<Arc<InsertGate>>>,
    /// Number of successful `insert_relay_logs` calls.
    pub relay_log_flushes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a persistence error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold the next relay-log insert after its rows are stored.
    pub fn hold_relay_log_inserts(&self) -> Arc<InsertGate> {
        let gate = Arc::new(InsertGate::default());
        *self.relay_log_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold the next price insert before anything is written.
    pub fn hold_price_inserts(&self) -> Arc<InsertGate> {
        let gate = Arc::new(InsertGate::default());
        *self.price_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn relay_logs(&self) -> Vec<RelayLog> {
        self.tables.lock().relay_logs.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.relay_log_flushes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Persistence("simulated write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        Ok(self.tables.lock().channels.clone())
    }

    async fn create_channel(&self, c: &NewChannel, base_url: &str) -> Result<Channel, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let channel = Channel {
            id: t.id(),
            name: c.name.clone(),
            channel_type: c.channel_type,
            enabled: c.enabled,
            base_url: base_url.to_string(),
            key: c.key.clone(),
            model: c.model.clone(),
            custom_model: c.custom_model.clone(),
            proxy: c.proxy.clone(),
            auto_group: c.auto_group,
        };
        t.channels.push(channel.clone());
        Ok(channel)
    }

    async fn update_channel(&self, c: &Channel) -> Result<(), AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        if let Some(existing) = t.channels.iter_mut().find(|e| e.id == c.id) {
            *existing = c.clone();
        }
        Ok(())
    }

    async fn delete_channel(&self, id: i64) -> Result<bool, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let before = t.channels.len();
        t.channels.retain(|c| c.id != id);
        t.items.retain(|i| i.channel_id != id);
        Ok(t.channels.len() != before)
    }

    async fn list_groups(&self) -> Result<Vec<Group>, AppError> {
        let t = self.tables.lock();
        Ok(t.groups
            .iter()
            .map(|(id, name, re)| {
                let mut items: Vec<GroupItem> =
                    t.items.iter().filter(|i| i.group_id == *id).cloned().collect();
                items.sort_by_key(|i| (i.priority, i.id));
                Group {
                    id: *id,
                    name: name.clone(),
                    match_regex: re.clone(),
                    items,
                }
            })
            .collect())
    }

    async fn create_group(&self, name: &str, match_regex: Option<&str>) -> Result<Group, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        if t.groups.iter().any(|(_, n, _)| n == name) {
            return Err(AppError::Persistence(format!("duplicate group name {name}")));
        }
        let id = t.id();
        t.groups.push((id, name.to_string(), match_regex.map(str::to_string)));
        Ok(Group {
            id,
            name: name.to_string(),
            match_regex: match_regex.map(str::to_string),
            items: Vec::new(),
        })
    }

    async fn update_group(&self, id: i64, name: &str, match_regex: Option<&str>) -> Result<(), AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        if let Some(g) = t.groups.iter_mut().find(|(gid, _, _)| *gid == id) {
            g.1 = name.to_string();
            g.2 = match_regex.map(str::to_string);
        }
        Ok(())
    }

    async fn delete_group(&self, id: i64) -> Result<bool, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let before = t.groups.len();
        t.groups.retain(|(gid, _, _)| *gid != id);
        t.items.retain(|i| i.group_id != id);
        Ok(t.groups.len() != before)
    }

    async fn create_group_item(&self, item: &NewGroupItem) -> Result<GroupItem, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let duplicate = t.items.iter().any(|i| {
            i.group_id == item.group_id
                && i.channel_id == item.channel_id
                && i.model_name == item.model_name
        });
        if duplicate {
            return Err(AppError::Persistence("duplicate group item".into()));
        }
        let row = GroupItem {
            id: t.id(),
            group_id: item.group_id,
            channel_id: item.channel_id,
            model_name: item.model_name.clone(),
            priority: item.priority,
            weight: item.weight,
        };
        t.items.push(row.clone());
        Ok(row)
    }

    async fn update_group_item(&self, id: i64, priority: i32, weight: Option<i32>) -> Result<(), AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        if let Some(item) = t.items.iter_mut().find(|i| i.id == id) {
            item.priority = priority;
            if let Some(w) = weight {
                item.weight = w;
            }
        }
        Ok(())
    }

    async fn delete_group_items(&self, ids: &[i64]) -> Result<u64, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let before = t.items.len();
        t.items.retain(|i| !ids.contains(&i.id));
        Ok((before - t.items.len()) as u64)
    }

    async fn list_prices(&self) -> Result<Vec<LlmInfo>, AppError> {
        Ok(self.tables.lock().prices.values().cloned().collect())
    }

    async fn insert_prices(&self, infos: &[LlmInfo]) -> Result<(), AppError> {
        let gate = self.price_gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.check_write()?;
        let mut t = self.tables.lock();
        if infos.iter().any(|i| t.prices.contains_key(&i.name)) {
            return Err(AppError::Persistence("duplicate price row".into()));
        }
        for info in infos {
            t.prices.insert(info.name.clone(), info.clone());
        }
        Ok(())
    }

    async fn save_price(&self, info: &LlmInfo) -> Result<(), AppError> {
        self.check_write()?;
        self.tables.lock().prices.insert(info.name.clone(), info.clone());
        Ok(())
    }

    async fn delete_prices(&self, names: &[String]) -> Result<(), AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        for name in names {
            t.prices.remove(name);
        }
        Ok(())
    }

    async fn insert_relay_logs(&self, logs: &[RelayLog]) -> Result<(), AppError> {
        self.check_write()?;
        self.tables.lock().relay_logs.extend_from_slice(logs);
        self.relay_log_flushes.fetch_add(1, Ordering::SeqCst);

        let gate = self.relay_log_gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(())
    }

    async fn list_relay_logs(&self, query: RelayLogQuery) -> Result<Vec<RelayLog>, AppError> {
        let t = self.tables.lock();
        let mut logs: Vec<RelayLog> = t
            .relay_logs
            .iter()
            .filter(|l| match query.range {
                Some((start, end)) => l.time >= start && l.time <= end,
                None => true,
            })
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(logs
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn delete_relay_logs_before(&self, cutoff: i64) -> Result<u64, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let before = t.relay_logs.len();
        t.relay_logs.retain(|l| l.time >= cutoff);
        Ok((before - t.relay_logs.len()) as u64)
    }

    async fn clear_relay_logs(&self) -> Result<u64, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let n = t.relay_logs.len() as u64;
        t.relay_logs.clear();
        Ok(n)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.tables.lock().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.check_write()?;
        self.tables
            .lock()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKey>, AppError> {
        Ok(self.tables.lock().api_keys.clone())
    }

    async fn create_api_key(&self, name: &str, key_hash: &str, key_prefix: &str) -> Result<ApiKey, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let key = ApiKey {
            id: t.id(),
            name: name.to_string(),
            key_hash: key_hash.to_string(),
            key_prefix: key_prefix.to_string(),
            created_at: Utc::now(),
        };
        t.api_keys.push(key.clone());
        Ok(key)
    }

    async fn delete_api_key(&self, id: i64) -> Result<Option<ApiKey>, AppError> {
        self.check_write()?;
        let mut t = self.tables.lock();
        let pos = t.api_keys.iter().position(|k| k.id == id);
        Ok(pos.map(|p| t.api_keys.remove(p)))
    }
}
