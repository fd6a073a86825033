//! Per-source request budgets.
//!
//! Upstream providers publish call quotas (for example "60 requests per
//! minute on the free tier"). A source with an exhausted budget is passed over
//! the same way an open circuit is, without counting as a failure.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket budgets keyed by source id
#[derive(Clone, Default)]
pub struct SourceBudgets {
    limiters: Arc<DashMap<String, Arc<DirectLimiter>>>,
}

impl std::fmt::Debug for SourceBudgets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBudgets")
            .field("sources", &self.limiters.len())
            .finish()
    }
}

impl SourceBudgets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build budgets from `source -> requests per minute`; zero means unlimited
    pub fn from_quotas(quotas: &HashMap<String, u32>) -> Self {
        let budgets = Self::new();
        for (source, per_minute) in quotas {
            budgets.set_quota(source, *per_minute);
        }
        budgets
    }

    /// Install or replace the budget for `source`
    pub fn set_quota(&self, source: &str, requests_per_minute: u32) {
        match NonZeroU32::new(requests_per_minute) {
            Some(rate) => {
                debug!(source, requests_per_minute, "Installing source budget");
                self.limiters.insert(
                    source.to_string(),
                    Arc::new(RateLimiter::direct(Quota::per_minute(rate))),
                );
            }
            None => {
                self.limiters.remove(source);
            }
        }
    }

    /// Take one request from the budget; sources without a budget always pass
    pub fn try_acquire(&self, source: &str) -> bool {
        let Some(limiter) = self.limiters.get(source).map(|entry| entry.value().clone()) else {
            return true;
        };

        match limiter.check() {
            Ok(_) => true,
            Err(_) => {
                warn!(source, "Source budget exhausted");
                false
            }
        }
    }

    pub fn is_limited(&self, source: &str) -> bool {
        self.limiters.contains_key(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbudgeted_source_always_passes() {
        let budgets = SourceBudgets::new();
        for _ in 0..1_000 {
            assert!(budgets.try_acquire("yahoo"));
        }
        assert!(!budgets.is_limited("yahoo"));
    }

    #[test]
    fn test_budget_is_enforced_per_source() {
        let budgets = SourceBudgets::from_quotas(&HashMap::from([
            ("alphavantage".to_string(), 5),
            ("finnhub".to_string(), 60),
        ]));

        for i in 0..5 {
            assert!(budgets.try_acquire("alphavantage"), "request {} should pass", i);
        }
        assert!(!budgets.try_acquire("alphavantage"));

        // Other sources keep their own budget
        assert!(budgets.try_acquire("finnhub"));
    }

    #[test]
    fn test_zero_quota_removes_budget() {
        let budgets = SourceBudgets::new();
        budgets.set_quota("alphavantage", 1);
        assert!(budgets.try_acquire("alphavantage"));
        assert!(!budgets.try_acquire("alphavantage"));

        budgets.set_quota("alphavantage", 0);
        assert!(budgets.try_acquire("alphavantage"));
    }
}
