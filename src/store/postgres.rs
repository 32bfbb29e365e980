use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::Store;
use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::channel::{AutoGroupType, Channel, ChannelType, NewChannel};
use crate::models::group::{Group, GroupItem, NewGroupItem};
use crate::models::llm_price::{LlmInfo, LlmPrice};
use crate::models::relay_log::{RelayLog, RelayLogQuery};

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

// ── Internal row types ────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct ChannelRow {
    id: i64,
    name: String,
    channel_type: String,
    enabled: bool,
    base_url: String,
    key: String,
    model: String,
    custom_model: String,
    proxy: Option<String>,
    auto_group: String,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = AppError;

    fn try_from(r: ChannelRow) -> Result<Self, Self::Error> {
        let channel_type = ChannelType::from_str(&r.channel_type).ok_or_else(|| {
            AppError::Persistence(format!("channel {} has unknown type {}", r.id, r.channel_type))
        })?;
        Ok(Channel {
            id: r.id,
            name: r.name,
            channel_type,
            enabled: r.enabled,
            base_url: r.base_url,
            key: r.key,
            model: r.model,
            custom_model: r.custom_model,
            proxy: r.proxy,
            auto_group: AutoGroupType::from_str(&r.auto_group).unwrap_or_default(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    id: i64,
    name: String,
    match_regex: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    name: String,
    input: f64,
    output: f64,
    cache_read: f64,
    cache_write: f64,
}

impl From<PriceRow> for LlmInfo {
    fn from(r: PriceRow) -> Self {
        LlmInfo {
            name: r.name,
            price: LlmPrice {
                input: r.input,
                output: r.output,
                cache_read: r.cache_read,
                cache_write: r.cache_write,
            },
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        let rows = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels ORDER BY id")
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    async fn create_channel(&self, c: &NewChannel, base_url: &str) -> Result<Channel, AppError> {
        let row = sqlx::query_as::<_, ChannelRow>(
            r#"
            INSERT INTO channels (name, channel_type, enabled, base_url, key, model, custom_model, proxy, auto_group)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&c.name)
        .bind(c.channel_type.as_str())
        .bind(c.enabled)
        .bind(base_url)
        .bind(&c.key)
        .bind(&c.model)
        .bind(&c.custom_model)
        .bind(&c.proxy)
        .bind(c.auto_group.as_str())
        .fetch_one(&self.db)
        .await?;
        Channel::try_from(row)
    }

    async fn update_channel(&self, c: &Channel) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE channels
            SET name = $1, channel_type = $2, enabled = $3, base_url = $4, key = $5,
                model = $6, custom_model = $7, proxy = $8, auto_group = $9
            WHERE id = $10
            "#,
        )
        .bind(&c.name)
        .bind(c.channel_type.as_str())
        .bind(c.enabled)
        .bind(&c.base_url)
        .bind(&c.key)
        .bind(&c.model)
        .bind(&c.custom_model)
        .bind(&c.proxy)
        .bind(c.auto_group.as_str())
        .bind(c.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_channel(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM channels WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_groups(&self) -> Result<Vec<Group>, AppError> {
        let groups = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups ORDER BY id")
            .fetch_all(&self.db)
            .await?;
        let items = sqlx::query_as::<_, GroupItem>(
            "SELECT * FROM group_items ORDER BY group_id, priority, id",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(groups
            .into_iter()
            .map(|g| Group {
                items: items.iter().filter(|i| i.group_id == g.id).cloned().collect(),
                id: g.id,
                name: g.name,
                match_regex: g.match_regex,
            })
            .collect())
    }

    async fn create_group(&self, name: &str, match_regex: Option<&str>) -> Result<Group, AppError> {
        let row = sqlx::query_as::<_, GroupRow>(
            "INSERT INTO groups (name, match_regex) VALUES ($1, $2) RETURNING *",
        )
        .bind(name)
        .bind(match_regex)
        .fetch_one(&self.db)
        .await?;
        Ok(Group {
            id: row.id,
            name: row.name,
            match_regex: row.match_regex,
            items: Vec::new(),
        })
    }

    async fn update_group(&self, id: i64, name: &str, match_regex: Option<&str>) -> Result<(), AppError> {
        sqlx::query("UPDATE groups SET name = $1, match_regex = $2 WHERE id = $3")
            .bind(name)
            .bind(match_regex)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_group(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_group_item(&self, item: &NewGroupItem) -> Result<GroupItem, AppError> {
        let row = sqlx::query_as::<_, GroupItem>(
            r#"
            INSERT INTO group_items (group_id, channel_id, model_name, priority, weight)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(item.group_id)
        .bind(item.channel_id)
        .bind(&item.model_name)
        .bind(item.priority)
        .bind(item.weight)
        .fetch_one(&self.db)
        .await?;
        Ok(row)
    }

    async fn update_group_item(&self, id: i64, priority: i32, weight: Option<i32>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE group_items SET priority = $1, weight = COALESCE($2, weight) WHERE id = $3",
        )
        .bind(priority)
        .bind(weight)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_group_items(&self, ids: &[i64]) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM group_items WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_prices(&self) -> Result<Vec<LlmInfo>, AppError> {
        let rows = sqlx::query_as::<_, PriceRow>("SELECT * FROM llm_prices")
            .fetch_all(&self.db)
            .await?;
        Ok(rows.into_iter().map(LlmInfo::from).collect())
    }

    async fn insert_prices(&self, infos: &[LlmInfo]) -> Result<(), AppError> {
        if infos.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO llm_prices (name, input, output, cache_read, cache_write) ");
        qb.push_values(infos, |mut b, info| {
            b.push_bind(&info.name)
                .push_bind(info.price.input)
                .push_bind(info.price.output)
                .push_bind(info.price.cache_read)
                .push_bind(info.price.cache_write);
        });
        qb.build().execute(&self.db).await?;
        Ok(())
    }

    async fn save_price(&self, info: &LlmInfo) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO llm_prices (name, input, output, cache_read, cache_write)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
            SET input = EXCLUDED.input, output = EXCLUDED.output,
                cache_read = EXCLUDED.cache_read, cache_write = EXCLUDED.cache_write
            "#,
        )
        .bind(&info.name)
        .bind(info.price.input)
        .bind(info.price.output)
        .bind(info.price.cache_read)
        .bind(info.price.cache_write)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_prices(&self, names: &[String]) -> Result<(), AppError> {
        sqlx::query("DELETE FROM llm_prices WHERE name = ANY($1)")
            .bind(names)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_relay_logs(&self, logs: &[RelayLog]) -> Result<(), AppError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"INSERT INTO relay_logs (
                id, time, request_model, actual_model, channel_id, channel_name,
                input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                cost, is_stream, first_token_ms, use_time_ms, success, error
            ) "#,
        );
        qb.push_values(logs, |mut b, l| {
            b.push_bind(l.id)
                .push_bind(l.time)
                .push_bind(&l.request_model)
                .push_bind(&l.actual_model)
                .push_bind(l.channel_id)
                .push_bind(&l.channel_name)
                .push_bind(l.input_tokens)
                .push_bind(l.output_tokens)
                .push_bind(l.cache_read_tokens)
                .push_bind(l.cache_write_tokens)
                .push_bind(l.cost)
                .push_bind(l.is_stream)
                .push_bind(l.first_token_ms)
                .push_bind(l.use_time_ms)
                .push_bind(l.success)
                .push_bind(&l.error);
        });
        qb.build().execute(&self.db).await?;
        Ok(())
    }

    async fn list_relay_logs(&self, query: RelayLogQuery) -> Result<Vec<RelayLog>, AppError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM relay_logs ");
        if let Some((start, end)) = query.range {
            qb.push("WHERE time >= ")
                .push_bind(start)
                .push(" AND time <= ")
                .push_bind(end)
                .push(" ");
        }
        qb.push("ORDER BY id DESC LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let logs = qb
            .build_query_as::<RelayLog>()
            .fetch_all(&self.db)
            .await?;
        Ok(logs)
    }

    async fn delete_relay_logs_before(&self, cutoff: i64) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM relay_logs WHERE time < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_relay_logs(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM relay_logs")
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKey>, AppError> {
        let keys = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys ORDER BY created_at DESC")
            .fetch_all(&self.db)
            .await?;
        Ok(keys)
    }

    async fn create_api_key(&self, name: &str, key_hash: &str, key_prefix: &str) -> Result<ApiKey, AppError> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (name, key_hash, key_prefix, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(key_hash)
        .bind(key_prefix)
        .fetch_one(&self.db)
        .await?;
        Ok(key)
    }

    async fn delete_api_key(&self, id: i64) -> Result<Option<ApiKey>, AppError> {
        let key = sqlx::query_as::<_, ApiKey>("DELETE FROM api_keys WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(key)
    }
}
