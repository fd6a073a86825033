mod collector;

pub use collector::{LatencySummary, MetricsCollector, MetricsSnapshot, SourceStats};

use crate::error::{FetchError, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Prometheus exporter for the fetch layer's `metrics` facade output
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService").finish_non_exhaustive()
    }
}

impl MetricsService {
    /// Install the Prometheus recorder. Only one recorder may exist per process.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            FetchError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "fetch_requests_total",
            "Total number of upstream fetch attempts by source and outcome"
        );
        describe_histogram!(
            "fetch_request_duration_seconds",
            "Upstream fetch attempt latencies in seconds"
        );
        describe_counter!(
            "fetch_cache_lookups_total",
            "Total number of cache lookups by result"
        );
        describe_counter!(
            "fetch_sources_skipped_total",
            "Sources skipped during fallback by reason"
        );
        describe_gauge!(
            "fetch_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );
        describe_counter!(
            "fetch_circuit_breaker_transitions_total",
            "Total number of circuit breaker state transitions"
        );
        describe_gauge!(
            "fetch_scheduler_queue_depth",
            "Number of scheduled requests waiting for a slot"
        );
        describe_gauge!(
            "fetch_offline_queue_depth",
            "Number of requests persisted for replay"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record one upstream attempt
pub fn record_source_request(source: &str, success: bool, latency_ms: u64) {
    let labels = [
        ("source", source.to_string()),
        ("outcome", if success { "success" } else { "failure" }.to_string()),
    ];
    counter!("fetch_requests_total", &labels).increment(1);
    histogram!("fetch_request_duration_seconds", &labels).record(latency_ms as f64 / 1000.0);
}

/// Record a cache lookup result
pub fn record_cache_lookup(hit: bool) {
    let labels = [("result", if hit { "hit" } else { "miss" }.to_string())];
    counter!("fetch_cache_lookups_total", &labels).increment(1);
}

/// Record a source skipped without an attempt
pub fn record_source_skipped(source: &str, reason: &str) {
    let labels = [
        ("source", source.to_string()),
        ("reason", reason.to_string()),
    ];
    counter!("fetch_sources_skipped_total", &labels).increment(1);
}

/// Record circuit breaker state
/// State: 0 = Closed, 1 = Open, 2 = HalfOpen
pub fn record_circuit_breaker_state(endpoint: &str, state: u8) {
    let labels = [("endpoint", endpoint.to_string())];
    gauge!("fetch_circuit_breaker_state", &labels).set(state as f64);
}

/// Record circuit breaker transition
pub fn record_circuit_breaker_transition(endpoint: &str, from_state: &str, to_state: &str) {
    let labels = [
        ("endpoint", endpoint.to_string()),
        ("from", from_state.to_string()),
        ("to", to_state.to_string()),
    ];
    counter!("fetch_circuit_breaker_transitions_total", &labels).increment(1);
}

pub fn record_scheduler_depth(depth: usize) {
    gauge!("fetch_scheduler_queue_depth").set(depth as f64);
}

pub fn record_offline_depth(depth: usize) {
    gauge!("fetch_offline_queue_depth").set(depth as f64);
}
