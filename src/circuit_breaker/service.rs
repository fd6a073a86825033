use super::breaker::CircuitBreaker;
use super::types::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitSnapshot, CircuitState};
use crate::error::Result;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Circuit breaker service managing one breaker per endpoint
#[derive(Debug, Clone)]
pub struct CircuitBreakerService {
    /// Circuit breakers per endpoint
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    /// Configuration applied to every breaker
    config: CircuitBreakerConfig,
}

impl CircuitBreakerService {
    /// Create a new circuit breaker service
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create a circuit breaker for an endpoint
    pub fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(endpoint) {
            return existing.clone();
        }
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                debug!(endpoint = endpoint, "Creating new circuit breaker");
                Arc::new(CircuitBreaker::new(endpoint.to_string(), self.config.clone()))
            })
            .clone()
    }

    /// Get the state of an endpoint, initializing unseen endpoints as closed
    pub async fn state(&self, endpoint: &str) -> CircuitState {
        self.breaker(endpoint).state().await
    }

    /// Run `operation` through the endpoint's breaker
    pub async fn execute<F, Fut, T>(&self, endpoint: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(endpoint).execute(operation).await
    }

    /// Whether a call to the endpoint would currently be admitted
    pub async fn permits_attempt(&self, endpoint: &str) -> bool {
        self.breaker(endpoint).permits_attempt().await
    }

    /// Record a successful request for an endpoint
    pub async fn record_success(&self, endpoint: &str) {
        self.breaker(endpoint).record_success().await;
    }

    /// Record a failed request for an endpoint
    pub async fn record_failure(&self, endpoint: &str) {
        self.breaker(endpoint).record_failure().await;
    }

    /// Record a timeout for an endpoint
    pub async fn record_timeout(&self, endpoint: &str) {
        self.breaker(endpoint).record_timeout().await;
    }

    pub async fn force_open(&self, endpoint: &str) {
        self.breaker(endpoint).force_open().await;
    }

    pub async fn force_close(&self, endpoint: &str) {
        self.breaker(endpoint).force_close().await;
    }

    /// Let every open, unpinned circuit admit a call to its endpoint right away.
    /// Returns the endpoints that moved to half-open.
    pub async fn half_open_all(&self) -> Vec<String> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();

        let mut moved = Vec::new();
        for breaker in breakers {
            if breaker.half_open_now().await {
                moved.push(breaker.endpoint().to_string());
            }
        }
        moved.sort();
        moved
    }

    pub async fn reset(&self, endpoint: &str) {
        self.breaker(endpoint).reset().await;
    }

    pub async fn snapshot(&self, endpoint: &str) -> CircuitSnapshot {
        self.breaker(endpoint).snapshot().await
    }

    /// Get metrics for an endpoint, if it has been seen
    pub async fn metrics(&self, endpoint: &str) -> Option<CircuitBreakerMetrics> {
        let breaker = self.breakers.get(endpoint).map(|b| b.clone());
        match breaker {
            Some(breaker) => Some(breaker.metrics().await),
            None => None,
        }
    }

    /// Get all endpoint names with circuit breakers
    pub fn endpoints(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshots of every known endpoint, sorted by name
    pub async fn all_snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            results.push(breaker.snapshot().await);
        }
        results.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_manages_multiple_endpoints() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let service = CircuitBreakerService::new(config);

        service.record_success("yahoo").await;
        service.record_failure("finnhub").await;
        service.record_failure("finnhub").await;

        assert_eq!(service.state("yahoo").await, CircuitState::Closed);
        assert_eq!(service.state("finnhub").await, CircuitState::Open);

        let endpoints = service.endpoints();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.contains(&"yahoo".to_string()));
        assert!(endpoints.contains(&"finnhub".to_string()));
    }

    #[tokio::test]
    async fn test_state_lazily_initializes_endpoint() {
        let service = CircuitBreakerService::new(CircuitBreakerConfig::default());

        assert!(service.metrics("polygon").await.is_none());
        assert_eq!(service.state("polygon").await, CircuitState::Closed);
        assert!(service.metrics("polygon").await.is_some());
        assert_eq!(service.endpoints(), vec!["polygon".to_string()]);
    }

    #[tokio::test]
    async fn test_all_snapshots_sorted() {
        let service = CircuitBreakerService::new(CircuitBreakerConfig::default());
        service.record_failure("zacks").await;
        service.record_success("alpha").await;

        let snapshots = service.all_snapshots().await;
        let names: Vec<&str> = snapshots.iter().map(|s| s.endpoint.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zacks"]);
        assert_eq!(snapshots[1].failure_count, 1);
        assert!(snapshots[1].last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_admin_overrides() {
        let service = CircuitBreakerService::new(CircuitBreakerConfig::default());

        service.force_open("fmp").await;
        assert_eq!(service.state("fmp").await, CircuitState::Open);
        assert!(service.snapshot("fmp").await.forced_open);
        assert!(!service.permits_attempt("fmp").await);

        service.reset("fmp").await;
        assert_eq!(service.state("fmp").await, CircuitState::Closed);
        assert!(service.permits_attempt("fmp").await);
    }

    #[tokio::test]
    async fn test_half_open_all_leaves_pinned_open() {
        let service = CircuitBreakerService::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout_ms: 60_000,
        });
        service.record_failure("yahoo").await;
        service.record_failure("finnhub").await;
        service.record_success("polygon").await;
        service.force_open("fmp").await;

        let moved = service.half_open_all().await;

        assert_eq!(moved, vec!["finnhub".to_string(), "yahoo".to_string()]);
        assert_eq!(service.state("yahoo").await, CircuitState::HalfOpen);
        assert_eq!(service.state("polygon").await, CircuitState::Closed);
        assert_eq!(service.state("fmp").await, CircuitState::Open);
        assert!(!service.permits_attempt("fmp").await);
    }
}
