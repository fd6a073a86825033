pub mod api;
pub mod budget;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod observability;
pub mod offline;
pub mod scheduler;
pub mod secrets;
pub mod sources;

pub use crate::cache::{CacheScope, RequestKey, ResponseCache};
pub use crate::circuit_breaker::{CircuitBreakerService, CircuitState};
pub use crate::config::FetchLayerConfig;
pub use crate::error::{FetchError, Result};
pub use crate::fetcher::{FetchMode, ResilientFetcher};
pub use crate::scheduler::Priority;
pub use crate::sources::{Payload, SourceFetcher};

use crate::api::AppState;
use crate::budget::SourceBudgets;
use crate::config::{StoreBackend, StoreConfig};
use crate::metrics::MetricsService;
use crate::offline::{DurableStore, FileStore, MemoryStore, OfflineQueue, RedisStore};
use crate::secrets::SecretsManager;
use crate::sources::HttpSourceFetcher;
use std::sync::Arc;
use tracing::info;

/// Open the durable store backing the offline queue
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn DurableStore>> {
    let store: Arc<dyn DurableStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::new(&config.path)),
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                FetchError::Config("Redis store requires store.redis_url".to_string())
            })?;
            Arc::new(RedisStore::connect(url, config.prefix.clone()).await?)
        }
    };

    info!(backend = store.name(), "Opened durable store");
    Ok(store)
}

/// Build the per-process fetch context described by `config`
pub async fn build_fetcher(config: &FetchLayerConfig) -> Result<ResilientFetcher> {
    let mut builder = ResilientFetcher::builder()
        .fetch_config(config.fetch.clone())
        .breaker_config(config.breaker.clone())
        .cache_config(config.cache.clone())
        .scheduler_config(config.scheduler.clone())
        .budgets(SourceBudgets::from_quotas(&config.source_quotas()));

    if config.offline.enabled {
        let store = open_store(&config.store).await?;
        let queue = OfflineQueue::open(store, config.offline.clone()).await?;
        builder = builder.offline_queue(Arc::new(queue));
    }

    Ok(builder.build())
}

/// Serve the HTTP surface until Ctrl-C
pub async fn serve(config: FetchLayerConfig, metrics: Option<MetricsService>) -> Result<()> {
    config.validate()?;

    let fetcher = build_fetcher(&config).await?;
    let sources = HttpSourceFetcher::new(
        &config.sources,
        &SecretsManager::default(),
        config.fetch.attempt_timeout(),
    )?;
    info!(sources = ?sources.source_ids(), "Loaded HTTP sources");

    let pruner = fetcher.spawn_cache_pruner();

    let mut state = AppState::new(fetcher, Arc::new(sources));
    if let Some(metrics) = metrics {
        state = state.with_metrics(metrics);
    }
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FetchError::Internal(format!("Failed to bind {}: {}", addr, e)))?;

    info!(addr = %addr, preset = ?config.preset, "Fetch layer ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| FetchError::Internal(format!("Server error: {}", e)))?;

    pruner.abort();
    info!("Fetch layer stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
