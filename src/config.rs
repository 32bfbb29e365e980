use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub admin_key: String,
    pub listen_addr: String,
    /// Comma-separated list of allowed CORS origins, or "*" for any.
    pub cors_origin: String,
    /// Seeds the persisted relay-log keep period when none is stored yet.
    /// 0 = keep forever.
    pub log_retention_days: i64,
    pub relay_log_flush_interval: Duration,
    /// Zero disables the channel latency probe.
    pub channel_probe_interval: Duration,
    pub upstream_timeout: Duration,
    pub task_queue_capacity: usize,
    pub stream_token_ttl: Duration,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(parse_env(key, default))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?,
            admin_key: env::var("ADMIN_KEY")
                .map_err(|_| anyhow::anyhow!("ADMIN_KEY is required"))?,
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".into()),
            cors_origin: env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "*".into()),
            log_retention_days: parse_env("LOG_RETENTION_DAYS", 7),
            relay_log_flush_interval: secs_env("RELAY_LOG_FLUSH_INTERVAL_SECS", 60),
            channel_probe_interval: secs_env("CHANNEL_PROBE_INTERVAL_SECS", 1800),
            upstream_timeout: secs_env("UPSTREAM_TIMEOUT_SECS", 300),
            task_queue_capacity: parse_env("TASK_QUEUE_CAPACITY", 64),
            stream_token_ttl: secs_env("STREAM_TOKEN_TTL_SECS", 300),
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            database_url: String::new(),
            admin_key: "admin-secret".into(),
            listen_addr: "127.0.0.1:0".into(),
            cors_origin: "*".into(),
            log_retention_days: 7,
            relay_log_flush_interval: Duration::from_secs(60),
            channel_probe_interval: Duration::ZERO,
            upstream_timeout: Duration::from_secs(5),
            task_queue_capacity: 8,
            stream_token_ttl: Duration::from_secs(60),
        }
    }
}
