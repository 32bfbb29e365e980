use std::sync::Arc;

use fancy_regex::Regex;

use crate::cache::Cache;
use crate::error::AppError;
use crate::models::channel::{AutoGroupType, Channel};
use crate::models::group::{Group, GroupItem, GroupUpdate, NewGroup, NewGroupItem};
use crate::store::Store;

/// Groups and their items, refreshed from storage after every mutation.
pub struct GroupService {
    store: Arc<dyn Store>,
    groups: Cache<i64, Group>,
}

fn normalize_pattern(pattern: Option<String>) -> Option<String> {
    pattern.map(|p| p.trim().to_string()).filter(|p| !p.is_empty())
}

fn validate_pattern(pattern: Option<&str>) -> Result<(), AppError> {
    if let Some(p) = pattern {
        Regex::new(p).map_err(|e| AppError::BadRequest(format!("invalid match_regex: {e}")))?;
    }
    Ok(())
}

/// How one group decides membership during auto-grouping.
enum Matcher {
    Exact(String),
    Fuzzy(String),
    Pattern(Regex),
}

impl Matcher {
    /// `None` when the group cannot take part in this pass.
    fn for_group(group: &Group, mode: AutoGroupType) -> Option<Self> {
        let name = group.name.to_lowercase();
        match mode {
            AutoGroupType::None => None,
            AutoGroupType::Exact => Some(Matcher::Exact(name)),
            AutoGroupType::Fuzzy => Some(Matcher::Fuzzy(name)),
            AutoGroupType::Regex => match group.match_regex.as_deref().filter(|p| !p.is_empty()) {
                None => Some(Matcher::Exact(name)),
                Some(pattern) => match Regex::new(pattern) {
                    Ok(re) => Some(Matcher::Pattern(re)),
                    Err(e) => {
                        tracing::warn!("Group {} has an unusable pattern {:?}: {}", group.name, pattern, e);
                        None
                    }
                },
            },
        }
    }

    /// Errors only when a backtracking pattern gives up on the input.
    fn matches(&self, model: &str) -> Result<bool, fancy_regex::Error> {
        match self {
            Matcher::Exact(name) => Ok(model.to_lowercase() == *name),
            Matcher::Fuzzy(name) => Ok(model.to_lowercase().contains(name.as_str())),
            Matcher::Pattern(re) => re.is_match(model),
        }
    }
}

impl GroupService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            groups: Cache::new(64),
        }
    }

    pub async fn refresh(&self) -> Result<(), AppError> {
        let groups = self.store.list_groups().await?;
        self.groups.replace_all(groups.into_iter().map(|g| (g.id, g)));
        Ok(())
    }

    /// All groups ordered by id.
    pub fn list(&self) -> Vec<Group> {
        let mut all: Vec<Group> = self.groups.get_all().into_values().collect();
        all.sort_by_key(|g| g.id);
        all
    }

    pub fn get(&self, id: i64) -> Result<Group, AppError> {
        self.groups
            .get(&id)
            .ok_or_else(|| AppError::not_found(format!("group {id}")))
    }

    /// Case-insensitive lookup by name.
    pub fn find_by_name(&self, name: &str) -> Option<Group> {
        let name = name.to_lowercase();
        self.list().into_iter().find(|g| g.name.to_lowercase() == name)
    }

    /// Routing candidates for a requested model: the items of the group with
    /// that name, or else every item whose upstream model equals it.
    pub fn items_for_model(&self, model: &str) -> Vec<GroupItem> {
        if let Some(group) = self.find_by_name(model) {
            return group.items;
        }
        self.list()
            .into_iter()
            .flat_map(|g| g.items)
            .filter(|i| i.model_name == model)
            .collect()
    }

    pub async fn create(&self, new: NewGroup) -> Result<Group, AppError> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::BadRequest("name is required".into()));
        }
        if self.find_by_name(&name).is_some() {
            return Err(AppError::AlreadyExists(format!("group {name}")));
        }
        let pattern = normalize_pattern(new.match_regex);
        validate_pattern(pattern.as_deref())?;

        let group = self.store.create_group(&name, pattern.as_deref()).await?;
        for item in new.items {
            self.store
                .create_group_item(&NewGroupItem {
                    group_id: group.id,
                    ..item
                })
                .await?;
        }
        self.refresh().await?;
        self.get(group.id)
    }

    /// Apply an incremental update: rename / re-pattern, then delete, change
    /// and add items.
    pub async fn update(&self, id: i64, update: GroupUpdate) -> Result<Group, AppError> {
        let existing = self.get(id)?;

        if update.name.is_some() || update.match_regex.is_some() {
            let name = update
                .name
                .map(|n| n.trim().to_string())
                .unwrap_or_else(|| existing.name.clone());
            if name.is_empty() {
                return Err(AppError::BadRequest("name is required".into()));
            }
            if let Some(other) = self.find_by_name(&name) {
                if other.id != id {
                    return Err(AppError::AlreadyExists(format!("group {name}")));
                }
            }
            let pattern = match update.match_regex {
                Some(p) => normalize_pattern(Some(p)),
                None => existing.match_regex.clone(),
            };
            validate_pattern(pattern.as_deref())?;
            self.store.update_group(id, &name, pattern.as_deref()).await?;
        }

        let owned = |item_id: &i64| existing.items.iter().any(|i| i.id == *item_id);
        let to_delete: Vec<i64> = update.items_to_delete.into_iter().filter(|i| owned(i)).collect();
        if !to_delete.is_empty() {
            self.store.delete_group_items(&to_delete).await?;
        }
        for change in update.items_to_update.iter().filter(|c| owned(&c.id)) {
            self.store
                .update_group_item(change.id, change.priority, change.weight)
                .await?;
        }
        for item in update.items_to_add {
            self.store
                .create_group_item(&NewGroupItem { group_id: id, ..item })
                .await?;
        }

        self.refresh().await?;
        self.get(id)
    }

    pub async fn delete(&self, id: i64) -> Result<(), AppError> {
        if !self.store.delete_group(id).await? {
            return Err(AppError::not_found(format!("group {id}")));
        }
        self.groups.delete([&id]);
        Ok(())
    }

    pub async fn delete_items(&self, ids: &[i64]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete_group_items(ids).await?;
        self.refresh().await?;
        Ok(removed)
    }

    /// Add the channel's declared models to every group they match under
    /// the channel's auto-group mode. Existing memberships are left alone,
    /// so running it twice is a no-op. Returns the number of items created.
    pub async fn auto_group(&self, channel: &Channel) -> Result<usize, AppError> {
        if channel.auto_group == AutoGroupType::None {
            return Ok(0);
        }
        let models = channel.model_names();
        if models.is_empty() {
            return Ok(0);
        }

        let mut created = 0;
        for group in self.list() {
            let Some(matcher) = Matcher::for_group(&group, channel.auto_group) else {
                continue;
            };
            let mut count = group.items.len() as i32;
            for model in &models {
                match matcher.matches(model) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!("Auto-group: pattern of group {} failed on {}: {}", group.name, model, e);
                        break;
                    }
                }
                let exists = group
                    .items
                    .iter()
                    .any(|i| i.channel_id == channel.id && i.model_name == *model);
                if exists {
                    continue;
                }
                let item = NewGroupItem {
                    group_id: group.id,
                    channel_id: channel.id,
                    model_name: model.clone(),
                    priority: count + 1,
                    weight: 1,
                };
                match self.store.create_group_item(&item).await {
                    Ok(_) => {
                        count += 1;
                        created += 1;
                    }
                    Err(e) => {
                        tracing::error!("Auto-group: failed to add {} to group {}: {}", model, group.name, e);
                    }
                }
            }
        }

        if created > 0 {
            tracing::info!("Auto-group: channel {} joined {} group item(s)", channel.name, created);
            self.refresh().await?;
        }
        Ok(created)
    }

    /// Routable model names, one per group.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.list().into_iter().map(|g| g.name).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{test_channel, ChannelType};
    use crate::models::group::GroupItemChange;
    use crate::store::memory::MemoryStore;
    use pretty_assertions::assert_eq;

    fn group(name: &str, pattern: Option<&str>) -> NewGroup {
        NewGroup {
            name: name.into(),
            match_regex: pattern.map(str::to_string),
            items: Vec::new(),
        }
    }

    fn channel(id: i64, models: &str, mode: AutoGroupType) -> Channel {
        let mut c = test_channel(id, ChannelType::OpenaiChat);
        c.model = models.into();
        c.auto_group = mode;
        c
    }

    fn service() -> GroupService {
        GroupService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn fuzzy_auto_group_is_idempotent() {
        let groups = service();
        let gpt = groups.create(group("gpt", None)).await.unwrap();
        let c = channel(1, "my-gpt-4-custom", AutoGroupType::Fuzzy);

        assert_eq!(groups.auto_group(&c).await.unwrap(), 1);
        assert_eq!(groups.auto_group(&c).await.unwrap(), 0);

        let items = groups.get(gpt.id).unwrap().items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].model_name, "my-gpt-4-custom");
        assert_eq!((items[0].priority, items[0].weight), (1, 1));
    }

    #[tokio::test]
    async fn exact_mode_ignores_case_and_numbers_priorities() {
        let groups = service();
        let g = groups.create(group("GPT-4o", None)).await.unwrap();
        groups.auto_group(&channel(1, "gpt-4o,gpt-4o-mini", AutoGroupType::Exact)).await.unwrap();
        groups.auto_group(&channel(2, "gpt-4o", AutoGroupType::Exact)).await.unwrap();

        let items = groups.get(g.id).unwrap().items;
        let summary: Vec<(i64, i32)> = items.iter().map(|i| (i.channel_id, i.priority)).collect();
        assert_eq!(summary, vec![(1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn regex_mode_uses_pattern_or_falls_back_to_exact() {
        let groups = service();
        let claude = groups.create(group("claude", Some("^claude-(3|4)"))).await.unwrap();
        let exact = groups.create(group("gemini-pro", None)).await.unwrap();
        let c = channel(1, "claude-4-sonnet,claude-2,gemini-pro", AutoGroupType::Regex);

        assert_eq!(groups.auto_group(&c).await.unwrap(), 2);
        let claude_models: Vec<String> = groups
            .get(claude.id)
            .unwrap()
            .items
            .into_iter()
            .map(|i| i.model_name)
            .collect();
        assert_eq!(claude_models, vec!["claude-4-sonnet"]);
        assert_eq!(groups.get(exact.id).unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn patterns_support_lookaround() {
        let groups = service();
        let g = groups.create(group("gpt-4", Some("^gpt-4(?!o)"))).await.unwrap();
        let c = channel(1, "gpt-4-turbo,gpt-4o,gpt-4o-mini,gpt-4", AutoGroupType::Regex);

        assert_eq!(groups.auto_group(&c).await.unwrap(), 2);
        let models: Vec<String> = groups
            .get(g.id)
            .unwrap()
            .items
            .into_iter()
            .map(|i| i.model_name)
            .collect();
        assert_eq!(models, vec!["gpt-4-turbo", "gpt-4"]);
    }

    #[tokio::test]
    async fn unusable_pattern_skips_only_that_group() {
        let store = Arc::new(MemoryStore::new());
        let groups = GroupService::new(store.clone());
        store.create_group("broken", Some("(x")).await.unwrap();
        let ok = groups.create(group("ok", Some("y$"))).await.unwrap();
        groups.refresh().await.unwrap();

        assert_eq!(groups.auto_group(&channel(1, "xy", AutoGroupType::Regex)).await.unwrap(), 1);
        assert_eq!(groups.get(ok.id).unwrap().items.len(), 1);
        assert!(matches!(
            groups.create(group("bad", Some("(x"))).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn none_mode_does_nothing() {
        let groups = service();
        groups.create(group("gpt", None)).await.unwrap();
        assert_eq!(groups.auto_group(&channel(1, "gpt", AutoGroupType::None)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incremental_update() {
        let groups = service();
        let g = groups
            .create(NewGroup {
                name: "chat".into(),
                match_regex: None,
                items: vec![
                    NewGroupItem { group_id: 0, channel_id: 1, model_name: "a".into(), priority: 1, weight: 1 },
                    NewGroupItem { group_id: 0, channel_id: 2, model_name: "b".into(), priority: 2, weight: 1 },
                ],
            })
            .await
            .unwrap();
        let (first, second) = (g.items[0].id, g.items[1].id);

        let updated = groups
            .update(
                g.id,
                GroupUpdate {
                    name: Some("chat-v2".into()),
                    match_regex: None,
                    items_to_add: vec![NewGroupItem {
                        group_id: 0,
                        channel_id: 3,
                        model_name: "c".into(),
                        priority: 3,
                        weight: 5,
                    }],
                    items_to_update: vec![GroupItemChange { id: second, priority: 1, weight: Some(4) }],
                    items_to_delete: vec![first],
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "chat-v2");
        let items: Vec<(String, i32, i32)> = updated
            .items
            .iter()
            .map(|i| (i.model_name.clone(), i.priority, i.weight))
            .collect();
        assert_eq!(items, vec![("b".to_string(), 1, 4), ("c".to_string(), 3, 5)]);
        assert!(groups.find_by_name("CHAT-V2").is_some());
    }

    #[tokio::test]
    async fn candidates_fall_back_to_model_name() {
        let groups = service();
        groups
            .create(NewGroup {
                name: "smart".into(),
                match_regex: None,
                items: vec![NewGroupItem { group_id: 0, channel_id: 1, model_name: "gpt-4o".into(), priority: 1, weight: 1 }],
            })
            .await
            .unwrap();

        assert_eq!(groups.items_for_model("SMART").len(), 1);
        assert_eq!(groups.items_for_model("gpt-4o")[0].channel_id, 1);
        assert!(groups.items_for_model("other").is_empty());
        assert!(matches!(
            groups.create(group("Smart", None)).await,
            Err(AppError::AlreadyExists(_))
        ));
    }
}
