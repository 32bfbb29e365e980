mod cache;
mod client;
mod config;
mod error;
mod middleware;
mod models;
mod relay;
mod routes;
mod services;
mod snowflake;
mod state;
mod store;
mod tasks;
mod transformer;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use client::HttpUpstream;
use config::Config;
use state::AppState;
use store::postgres::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = Config::from_env()?;
    tracing::info!("Starting LLM relay on {}", config.listen_addr);

    // Create Postgres connection pool
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PgStore::new(db));
    let upstream = Arc::new(HttpUpstream::new(config.upstream_timeout));
    let (state, task_rx) = AppState::new(config.clone(), store, upstream);

    // Load caches before accepting traffic
    state.warm_up().await?;
    tracing::info!(
        "Loaded {} channels, {} groups",
        state.channels.list().len(),
        state.groups.list().len()
    );

    let state = Arc::new(state);

    // Background workers
    tokio::spawn(state.task_runner().run(task_rx));
    tasks::spawn_flush_loop(state.logs.clone(), config.relay_log_flush_interval);
    if !config.channel_probe_interval.is_zero() {
        tasks::spawn_probe_loop(
            state.channels.clone(),
            state.upstream.clone(),
            config.channel_probe_interval,
        );
    }

    let app = routes::app(state.clone());

    // Start server
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Persist whatever is still buffered
    match state.logs.flush().await {
        Ok(n) if n > 0 => tracing::info!("Flushed {} buffered relay logs", n),
        Ok(_) => {}
        Err(e) => tracing::error!("Final relay log flush failed: {}", e),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
