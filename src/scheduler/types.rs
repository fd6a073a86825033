use crate::circuit_breaker::RetryConfig;
use serde::{Deserialize, Serialize};

/// Request urgency. Lower variants are served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of operations executing at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retry policy applied to each scheduled operation
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retry: RetryConfig::default(),
        }
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub completed: u64,
    pub failed: u64,
    /// Enqueue calls folded into an already-queued item
    pub coalesced: u64,
    pub cancelled: u64,
}
