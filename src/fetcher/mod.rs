//! The fetch orchestrator.
//!
//! [`ResilientFetcher`] is the one context object a process builds at startup
//! and hands to every consumer. It owns the breaker map, response cache,
//! metrics collector, scheduler, source budgets and (optionally) the offline
//! queue; clones share all of them.

use crate::budget::SourceBudgets;
use crate::cache::{CacheConfig, CacheScope, CacheStats, ResponseCache};
use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerService, CircuitSnapshot, CircuitState,
};
use crate::error::{FetchError, Result};
use crate::metrics::{MetricsCollector, MetricsSnapshot, SourceStats};
use crate::offline::{OfflineQueue, ReplayReport};
use crate::scheduler::{Priority, RequestScheduler, SchedulerConfig, SchedulerStats};
use crate::sources::{Payload, RequestDescriptor, SourceFetcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a cache miss reaches the sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Walk the sources directly in the caller's task
    #[default]
    Aggregate,
    /// Run the walk through the priority scheduler, with retries and offline hand-off
    Scheduled,
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub mode: FetchMode,
    /// Hard limit on a single source attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Sources used when a request names none, in fallback order
    #[serde(default)]
    pub default_sources: Vec<String>,
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mode: FetchMode::default(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            default_sources: Vec::new(),
        }
    }
}

impl FetchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Builder for [`ResilientFetcher`]
#[derive(Debug, Default)]
pub struct ResilientFetcherBuilder {
    fetch: FetchConfig,
    breaker: CircuitBreakerConfig,
    cache: CacheConfig,
    scheduler: SchedulerConfig,
    budgets: SourceBudgets,
    metrics: MetricsCollector,
    offline: Option<Arc<OfflineQueue>>,
}

impl ResilientFetcherBuilder {
    pub fn fetch_config(mut self, config: FetchConfig) -> Self {
        self.fetch = config;
        self
    }

    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn budgets(mut self, budgets: SourceBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn offline_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.offline = Some(queue);
        self
    }

    pub fn build(self) -> ResilientFetcher {
        info!(
            mode = ?self.fetch.mode,
            failure_threshold = self.breaker.failure_threshold,
            cache_capacity = self.cache.max_capacity,
            max_concurrent = self.scheduler.max_concurrent,
            offline = self.offline.is_some(),
            "Building resilient fetcher"
        );

        ResilientFetcher {
            inner: Arc::new(Inner {
                breakers: CircuitBreakerService::new(self.breaker),
                cache: ResponseCache::new(self.cache),
                scheduler: RequestScheduler::new(self.scheduler),
                metrics: self.metrics,
                budgets: self.budgets,
                offline: self.offline,
                config: self.fetch,
            }),
        }
    }
}

struct Inner {
    config: FetchConfig,
    breakers: CircuitBreakerService,
    cache: ResponseCache<Payload>,
    metrics: MetricsCollector,
    scheduler: RequestScheduler<Payload>,
    budgets: SourceBudgets,
    offline: Option<Arc<OfflineQueue>>,
}

/// Cache-first, multi-source fetch with per-source circuit breakers
#[derive(Clone)]
pub struct ResilientFetcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResilientFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientFetcher")
            .field("config", &self.inner.config)
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

impl ResilientFetcher {
    pub fn builder() -> ResilientFetcherBuilder {
        ResilientFetcherBuilder::default()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Fetch `key`, trying `sources` in order until one succeeds.
    ///
    /// A cache hit returns immediately without touching breakers or the
    /// scheduler. An empty `sources` falls back to the configured defaults.
    pub async fn fetch(
        &self,
        key: &str,
        priority: Priority,
        sources: &[String],
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Payload> {
        if let Some(value) = self.inner.cache.get(key) {
            debug!(key = %key, "Cache hit");
            self.inner.metrics.record_cache_outcome(true);
            return Ok(value);
        }

        let sources = if sources.is_empty() {
            self.inner.config.default_sources.clone()
        } else {
            sources.to_vec()
        };

        match self.inner.config.mode {
            FetchMode::Aggregate => {
                self.inner.metrics.record_cache_outcome(false);
                self.walk_sources(key, &sources, fetcher.as_ref()).await
            }
            FetchMode::Scheduled => self.fetch_scheduled(key, priority, sources, fetcher).await,
        }
    }

    async fn fetch_scheduled(
        &self,
        key: &str,
        priority: Priority,
        sources: Vec<String>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Payload> {
        let this = self.clone();
        let owned_key = key.to_string();
        let walk_sources = sources.clone();

        let mut first_attempt = true;

        let handle = self.inner.scheduler.enqueue(
            move || {
                let record_lookup = std::mem::replace(&mut first_attempt, false);
                let this = this.clone();
                let key = owned_key.clone();
                let sources = walk_sources.clone();
                let fetcher = fetcher.clone();
                async move {
                    // An earlier item for the same key may have filled the cache
                    let cached = this.inner.cache.get(&key);
                    if record_lookup {
                        this.inner.metrics.record_cache_outcome(cached.is_some());
                    }
                    if let Some(value) = cached {
                        return Ok(value);
                    }
                    this.walk_sources(&key, &sources, fetcher.as_ref()).await
                }
            },
            priority,
            Some(key.to_string()),
        );

        match handle.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_connectivity() => self.defer_offline(key, priority, &sources, e).await,
            Err(e) => Err(e),
        }
    }

    async fn defer_offline(
        &self,
        key: &str,
        priority: Priority,
        sources: &[String],
        error: FetchError,
    ) -> Result<Payload> {
        let Some(queue) = self.inner.offline.as_ref().filter(|q| q.config().enabled) else {
            return Err(error);
        };

        let descriptor = RequestDescriptor::new(key, priority, sources);
        match queue.enqueue(&descriptor).await {
            Ok(id) => {
                info!(key = %key, id = %id, error = %error, "Deferred request to offline queue");
                Err(FetchError::QueuedOffline { id })
            }
            Err(storage_error) => {
                warn!(key = %key, error = %storage_error, "Failed to persist offline request");
                Err(error)
            }
        }
    }

    /// Try each source in order. Open circuits and exhausted budgets are skipped.
    async fn walk_sources(
        &self,
        key: &str,
        sources: &[String],
        fetcher: &dyn SourceFetcher,
    ) -> Result<Payload> {
        let timeout = self.inner.config.attempt_timeout();
        let mut attempted = Vec::new();
        let mut connectivity_only = true;
        let mut circuit_skipped = false;

        for source in sources {
            if !self.inner.breakers.permits_attempt(source).await {
                debug!(key = %key, source = %source, "Skipping source with open circuit");
                self.inner.metrics.record_skip(source, "circuit_open");
                circuit_skipped = true;
                continue;
            }
            if !self.inner.budgets.try_acquire(source) {
                debug!(key = %key, source = %source, "Skipping source with exhausted budget");
                self.inner.metrics.record_skip(source, "budget_exhausted");
                continue;
            }

            let start = Instant::now();
            let result = self
                .inner
                .breakers
                .execute(source, || attempt(fetcher, source, key, timeout))
                .await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    self.inner.metrics.record_request(source, true, latency_ms);
                    self.inner.cache.insert(key, value.clone());
                    debug!(
                        key = %key,
                        source = %source,
                        latency_ms,
                        bytes = value.size_hint(),
                        "Fetched from source"
                    );
                    return Ok(value);
                }
                Err(FetchError::CircuitOpen { .. }) => {
                    // Opened by a concurrent caller since the check above
                    self.inner.metrics.record_skip(source, "circuit_open");
                    circuit_skipped = true;
                }
                Err(e) => {
                    attempted.push(source.clone());
                    connectivity_only &= e.is_connectivity();
                    self.inner.metrics.record_request(source, false, latency_ms);
                    warn!(
                        key = %key,
                        source = %source,
                        latency_ms,
                        error = %e,
                        "Source failed, falling back"
                    );
                }
            }
        }

        // Open circuits with nothing attempted means the outage is still running
        let connectivity_only = if attempted.is_empty() {
            circuit_skipped
        } else {
            connectivity_only
        };

        warn!(key = %key, attempted = ?attempted, "All sources unavailable");
        Err(FetchError::AllSourcesUnavailable {
            key: key.to_string(),
            connectivity_only,
            attempted,
        })
    }

    /// Replay requests persisted while offline. A no-op without an offline queue.
    ///
    /// Circuits opened by the outage move to half-open first, so every replay
    /// reaches its sources instead of being rejected inside the open timeout.
    pub async fn on_connectivity_restored(
        &self,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<ReplayReport> {
        let Some(queue) = self.inner.offline.clone() else {
            return Ok(ReplayReport::default());
        };

        let half_opened = self.inner.breakers.half_open_all().await;
        info!(half_opened = ?half_opened, "Connectivity restored, replaying offline requests");
        queue
            .process_queue(|descriptor: RequestDescriptor| {
                let this = self.clone();
                let fetcher = fetcher.clone();
                async move {
                    if this.inner.cache.get(&descriptor.key).is_some() {
                        return Ok(());
                    }
                    this.walk_sources(&descriptor.key, &descriptor.sources, fetcher.as_ref())
                        .await
                        .map(|_| ())
                }
            })
            .await
    }

    pub async fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.inner.breakers.state(endpoint).await
    }

    pub async fn circuit_snapshot(&self, endpoint: &str) -> CircuitSnapshot {
        self.inner.breakers.snapshot(endpoint).await
    }

    pub async fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.inner.breakers.all_snapshots().await
    }

    pub async fn force_open(&self, endpoint: &str) {
        self.inner.breakers.force_open(endpoint).await;
    }

    pub async fn force_close(&self, endpoint: &str) {
        self.inner.breakers.force_close(endpoint).await;
    }

    pub async fn reset(&self, endpoint: &str) {
        self.inner.breakers.reset(endpoint).await;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn source_stats(&self, endpoint: &str) -> Option<SourceStats> {
        self.inner.metrics.source_stats(endpoint)
    }

    /// Drop cached entries; returns how many were removed
    pub fn clear_cache(&self, scope: &CacheScope) -> Result<usize> {
        let removed = self.inner.cache.clear_scope(scope)?;
        info!(scope = ?scope, removed, "Cleared cache");
        Ok(removed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Cancel a scheduled fetch for `key` that has not started yet
    pub fn cancel(&self, key: &str) -> bool {
        self.inner.scheduler.cancel(key)
    }

    pub fn offline_queue(&self) -> Option<&Arc<OfflineQueue>> {
        self.inner.offline.as_ref()
    }

    /// Start the periodic expired-entry sweep
    pub fn spawn_cache_pruner(&self) -> JoinHandle<()> {
        self.inner.cache.spawn_pruner()
    }
}

/// One source attempt under a hard timeout; dropping the future aborts its I/O
async fn attempt(
    fetcher: &dyn SourceFetcher,
    source: &str,
    key: &str,
    timeout: Duration,
) -> Result<Payload> {
    match tokio::time::timeout(timeout, fetcher.fetch_one(source, key)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            provider: source.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
