pub mod breaker;
pub mod retry;
pub mod service;
pub mod types;

pub use breaker::CircuitBreaker;
pub use retry::RetryExecutor;
pub use service::CircuitBreakerService;
pub use types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitSnapshot, CircuitState, RetryConfig,
};
