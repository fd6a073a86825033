use super::types::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitSnapshot, CircuitState};
use crate::error::{FetchError, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker for a single upstream endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state
    state: Arc<RwLock<State>>,
    /// Endpoint identifier
    endpoint: String,
}

#[derive(Debug)]
struct State {
    circuit_state: CircuitState,
    /// Consecutive failures while closed; total failures since the last transition otherwise
    failure_count: u32,
    /// Successes since the last transition
    success_count: u32,
    /// Time when the circuit was opened
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    /// Pinned open by an administrator; the open timeout does not apply
    forced_open: bool,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(endpoint: String, config: CircuitBreakerConfig) -> Self {
        info!(
            endpoint = %endpoint,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            open_timeout_ms = config.open_timeout_ms,
            "Creating circuit breaker"
        );

        Self {
            config,
            state: Arc::new(RwLock::new(State {
                circuit_state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_failure_at: None,
                forced_open: false,
                metrics: CircuitBreakerMetrics::default(),
            })),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run `operation` if the circuit allows it and record its outcome.
    ///
    /// Returns `CircuitOpen` without invoking `operation` when rejected; otherwise the
    /// operation's own error is returned after being recorded.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire().await?;

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                if matches!(e, FetchError::Timeout { .. }) {
                    self.record_timeout().await;
                } else {
                    self.record_failure().await;
                }
                Err(e)
            }
        }
    }

    /// Admit one call, moving an expired open circuit to half-open
    pub async fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.write().await;

        match state.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                state.metrics.total_requests += 1;
                Ok(())
            }
            CircuitState::Open => {
                let remaining = self.remaining_open(&state);
                if remaining == 0 {
                    self.transition_to_half_open(&mut state);
                    state.metrics.total_requests += 1;
                    Ok(())
                } else {
                    state.metrics.rejected_requests += 1;
                    debug!(
                        endpoint = %self.endpoint,
                        retry_after_ms = remaining,
                        forced = state.forced_open,
                        "Circuit breaker open, rejecting request"
                    );
                    Err(FetchError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after_ms: remaining,
                    })
                }
            }
        }
    }

    /// Whether a call made now would be admitted. Does not change state.
    pub async fn permits_attempt(&self) -> bool {
        let state = self.state.read().await;
        state.circuit_state != CircuitState::Open || self.remaining_open(&state) == 0
    }

    /// Record a successful request
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        state.metrics.successful_requests += 1;
        state.success_count = state.success_count.saturating_add(1);

        match state.circuit_state {
            CircuitState::Closed => {
                // Failures only count while consecutive
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                debug!(
                    endpoint = %self.endpoint,
                    success_count = state.success_count,
                    threshold = self.config.success_threshold,
                    "Half-open trial request succeeded"
                );

                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {
                warn!(endpoint = %self.endpoint, "Recording success in open state");
            }
        }
    }

    /// Record a failed request
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.metrics.failed_requests += 1;
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Utc::now());

        match state.circuit_state {
            CircuitState::Closed => {
                debug!(
                    endpoint = %self.endpoint,
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Request failed in closed state"
                );

                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    endpoint = %self.endpoint,
                    success_count = state.success_count,
                    "Half-open trial request failed, reopening circuit"
                );
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {
                debug!(endpoint = %self.endpoint, "Recording failure in open state");
            }
        }
    }

    /// Record a timeout
    pub async fn record_timeout(&self) {
        let mut state = self.state.write().await;
        state.metrics.timeout_count += 1;
        drop(state);
        self.record_failure().await;
    }

    /// Pin the circuit open until `force_close` or `reset`
    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        info!(endpoint = %self.endpoint, "Circuit breaker forced open");
        if state.circuit_state != CircuitState::Open {
            self.transition_to_open(&mut state);
        }
        state.forced_open = true;
    }

    /// Close the circuit regardless of its current state
    pub async fn force_close(&self) {
        let mut state = self.state.write().await;
        info!(endpoint = %self.endpoint, "Circuit breaker forced closed");
        state.forced_open = false;
        if state.circuit_state != CircuitState::Closed {
            self.transition_to_closed(&mut state);
        } else {
            state.failure_count = 0;
            state.success_count = 0;
        }
    }

    /// Move an open circuit straight to half-open so the next call reaches the
    /// endpoint. Circuits pinned by `force_open` stay open.
    pub async fn half_open_now(&self) -> bool {
        let mut state = self.state.write().await;
        if state.circuit_state != CircuitState::Open || state.forced_open {
            return false;
        }
        self.transition_to_half_open(&mut state);
        true
    }

    /// Return to the initial closed state, clearing counters and metrics
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!(endpoint = %self.endpoint, "Circuit breaker reset");
        let previous = state.circuit_state;
        *state = State {
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure_at: None,
            forced_open: false,
            metrics: CircuitBreakerMetrics::default(),
        };
        if previous != CircuitState::Closed {
            self.publish_transition(previous, CircuitState::Closed);
        }
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.circuit_state
    }

    /// Get metrics
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        self.state.read().await.metrics.clone()
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.read().await;
        CircuitSnapshot {
            endpoint: self.endpoint.clone(),
            state: state.circuit_state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_at,
            forced_open: state.forced_open,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_timeout_ms: self.config.open_timeout_ms,
        }
    }

    /// Milliseconds until an open circuit admits a trial request, 0 if it would now
    fn remaining_open(&self, state: &State) -> u64 {
        if state.forced_open {
            return self.config.open_timeout_ms.max(1);
        }
        match state.opened_at {
            Some(opened_at) => {
                let remaining = self.config.open_timeout().saturating_sub(opened_at.elapsed());
                if remaining.is_zero() {
                    0
                } else {
                    (remaining.as_millis() as u64).max(1)
                }
            }
            None => {
                warn!(endpoint = %self.endpoint, "Circuit open but no opened_at timestamp");
                0
            }
        }
    }

    fn transition_to_open(&self, state: &mut State) {
        info!(
            endpoint = %self.endpoint,
            failure_count = state.failure_count,
            "Circuit breaker opening"
        );

        let previous = state.circuit_state;
        state.circuit_state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
        state.metrics.circuit_opened_count += 1;
        self.publish_transition(previous, CircuitState::Open);
    }

    fn transition_to_half_open(&self, state: &mut State) {
        info!(
            endpoint = %self.endpoint,
            open_timeout = ?self.config.open_timeout(),
            "Circuit breaker transitioning to half-open"
        );

        let previous = state.circuit_state;
        state.circuit_state = CircuitState::HalfOpen;
        state.failure_count = 0;
        state.success_count = 0;
        state.metrics.circuit_half_opened_count += 1;
        self.publish_transition(previous, CircuitState::HalfOpen);
    }

    fn transition_to_closed(&self, state: &mut State) {
        info!(
            endpoint = %self.endpoint,
            success_count = state.success_count,
            "Circuit breaker closing"
        );

        let previous = state.circuit_state;
        state.circuit_state = CircuitState::Closed;
        state.opened_at = None;
        state.failure_count = 0;
        state.success_count = 0;
        state.metrics.circuit_closed_count += 1;
        self.publish_transition(previous, CircuitState::Closed);
    }

    fn publish_transition(&self, from: CircuitState, to: CircuitState) {
        metrics::record_circuit_breaker_state(&self.endpoint, to.as_gauge());
        metrics::record_circuit_breaker_transition(&self.endpoint, &from.to_string(), &to.to_string());
    }
}
