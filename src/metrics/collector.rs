//! In-process outcome counters backing `getMetrics` / `getSourceStats`.
//!
//! Every recorded outcome is also forwarded to the `metrics` facade so a
//! Prometheus recorder, when installed, sees the same numbers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Default size of the rolling latency window
pub const DEFAULT_LATENCY_WINDOW: usize = 1_000;

/// Aggregate view returned by [`MetricsCollector::snapshot`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Successful / total, 0.0 when nothing has been recorded
    pub success_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub latency: LatencySummary,
    pub sources: BTreeMap<String, SourceStats>,
}

/// Latency statistics over the rolling sample window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub average_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
}

/// Per-source breakdown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Times the source was passed over without an attempt (open circuit, exhausted budget)
    pub skipped: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SourceCounters {
    requests: u64,
    successes: u64,
    failures: u64,
    skipped: u64,
    total_latency_ms: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl SourceCounters {
    fn stats(&self) -> SourceStats {
        SourceStats {
            requests: self.requests,
            successes: self.successes,
            failures: self.failures,
            skipped: self.skipped,
            success_rate: ratio(self.successes, self.requests),
            average_latency_ms: if self.requests == 0 {
                0.0
            } else {
                self.total_latency_ms as f64 / self.requests as f64
            },
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    latencies: VecDeque<u64>,
    sources: HashMap<String, SourceCounters>,
}

/// Passive metrics collector shared by every fetch path
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    counters: Arc<Mutex<Counters>>,
    window: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl MetricsCollector {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            counters: Arc::new(Mutex::new(Counters {
                latencies: VecDeque::with_capacity(window.min(DEFAULT_LATENCY_WINDOW)),
                ..Default::default()
            })),
            window,
        }
    }

    /// Record the outcome of one upstream attempt
    pub fn record_request(&self, endpoint: &str, success: bool, latency_ms: u64) {
        {
            let mut counters = self.counters.lock();
            counters.total_requests += 1;
            if success {
                counters.successful_requests += 1;
            } else {
                counters.failed_requests += 1;
            }

            if counters.latencies.len() >= self.window {
                counters.latencies.pop_front();
            }
            counters.latencies.push_back(latency_ms);

            let source = counters.sources.entry(endpoint.to_string()).or_default();
            source.requests += 1;
            source.total_latency_ms = source.total_latency_ms.saturating_add(latency_ms);
            if success {
                source.successes += 1;
                source.last_success_at = Some(Utc::now());
            } else {
                source.failures += 1;
                source.last_failure_at = Some(Utc::now());
            }
        }

        super::record_source_request(endpoint, success, latency_ms);
    }

    pub fn record_cache_outcome(&self, hit: bool) {
        {
            let mut counters = self.counters.lock();
            if hit {
                counters.cache_hits += 1;
            } else {
                counters.cache_misses += 1;
            }
        }
        super::record_cache_lookup(hit);
    }

    /// Record a source passed over without an attempt
    pub fn record_skip(&self, endpoint: &str, reason: &str) {
        self.counters
            .lock()
            .sources
            .entry(endpoint.to_string())
            .or_default()
            .skipped += 1;
        super::record_source_skipped(endpoint, reason);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock();

        MetricsSnapshot {
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            success_rate: ratio(counters.successful_requests, counters.total_requests),
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            cache_hit_rate: ratio(
                counters.cache_hits,
                counters.cache_hits + counters.cache_misses,
            ),
            latency: summarize(&counters.latencies),
            sources: counters
                .sources
                .iter()
                .map(|(name, source)| (name.clone(), source.stats()))
                .collect(),
        }
    }

    pub fn source_stats(&self, endpoint: &str) -> Option<SourceStats> {
        self.counters.lock().sources.get(endpoint).map(SourceCounters::stats)
    }

    /// Zero every counter and drop the latency window
    pub fn reset(&self) {
        let mut counters = self.counters.lock();
        *counters = Counters::default();
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn summarize(samples: &VecDeque<u64>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let n = sorted.len();

    let average_ms = sorted.iter().sum::<u64>() as f64 / n as f64;
    let median_ms = if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    };
    // Nearest-rank percentile
    let rank = ((n as f64) * 0.95).ceil() as usize;
    let p95_ms = sorted[rank.saturating_sub(1).min(n - 1)] as f64;

    LatencySummary {
        samples: n,
        average_ms,
        median_ms,
        p95_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let collector = MetricsCollector::default();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.cache_hit_rate, 0.0);
        assert_eq!(snapshot.latency, LatencySummary::default());
        assert!(snapshot.sources.is_empty());
    }

    #[test]
    fn test_totals_and_rates() {
        let collector = MetricsCollector::default();
        collector.record_request("yahoo", true, 100);
        collector.record_request("yahoo", false, 300);
        collector.record_request("finnhub", true, 200);
        collector.record_cache_outcome(true);
        collector.record_cache_outcome(false);
        collector.record_cache_outcome(false);
        collector.record_cache_outcome(false);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 3);
        assert_eq!(snapshot.cache_hit_rate, 0.25);
        assert_eq!(snapshot.latency.average_ms, 200.0);
        assert_eq!(snapshot.latency.median_ms, 200.0);
        assert_eq!(snapshot.sources.len(), 2);
    }

    #[test]
    fn test_source_stats() {
        let collector = MetricsCollector::default();
        collector.record_request("yahoo", true, 40);
        collector.record_request("yahoo", false, 60);
        collector.record_skip("yahoo", "circuit_open");

        let stats = collector.source_stats("yahoo").unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.average_latency_ms, 50.0);
        assert!(stats.last_success_at.is_some());
        assert!(stats.last_failure_at.is_some());

        assert!(collector.source_stats("unknown").is_none());
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new(10);
        for latency in 1..=25 {
            collector.record_request("yahoo", true, latency);
        }

        let latency = collector.snapshot().latency;
        assert_eq!(latency.samples, 10);
        // Window holds 16..=25
        assert_eq!(latency.average_ms, 20.5);
        assert_eq!(latency.median_ms, 20.5);
        assert_eq!(latency.p95_ms, 25.0);
        // Totals are not windowed
        assert_eq!(collector.snapshot().total_requests, 25);
    }

    #[test]
    fn test_p95_nearest_rank() {
        let collector = MetricsCollector::default();
        for latency in 1..=100 {
            collector.record_request("yahoo", true, latency);
        }
        let latency = collector.snapshot().latency;
        assert_eq!(latency.p95_ms, 95.0);
        assert_eq!(latency.median_ms, 50.5);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::default();
        collector.record_request("yahoo", true, 10);
        collector.record_cache_outcome(true);
        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.cache_hits, 0);
        assert_eq!(snapshot.latency.samples, 0);
        assert!(snapshot.sources.is_empty());
    }
}
