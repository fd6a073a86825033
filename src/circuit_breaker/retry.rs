use super::types::RetryConfig;
use crate::error::FetchError;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

/// Retry executor with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Execute a fetch operation, retrying errors that are retryable
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        self.execute_with_predicate(f, FetchError::is_retryable).await
    }

    /// Execute with retries, but only if error matches predicate
    pub async fn execute_with_predicate<F, Fut, T, E, P>(
        &self,
        mut f: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Request succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(attempt, error = %e, "Error not retryable");
                        return Err(e);
                    }

                    if attempt > self.config.max_retries {
                        if self.config.max_retries > 0 {
                            warn!(
                                attempt,
                                max_retries = self.config.max_retries,
                                error = %e,
                                "Request failed after max retries"
                            );
                        }
                        return Err(e);
                    }

                    match backoff.next_backoff() {
                        Some(wait) => {
                            debug!(
                                attempt,
                                wait_ms = wait.as_millis() as u64,
                                error = %e,
                                "Request failed, retrying after backoff"
                            );
                            tokio::time::sleep(wait).await;
                        }
                        None => {
                            warn!(attempt, error = %e, "Backoff exhausted");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_multiplier(self.config.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // Attempts are bounded by max_retries
            .build()
    }
}
