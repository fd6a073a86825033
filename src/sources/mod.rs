//! Upstream data sources.
//!
//! The fetch layer never inspects provider responses. A [`SourceFetcher`]
//! turns `(source, key)` into a [`Payload`] and is the only place provider
//! specifics live.

mod http;

pub use http::{HttpSourceFetcher, SourceDefinition};

use crate::error::Result;
use crate::scheduler::Priority;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// A normalized upstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Approximate size in bytes, for logging
    pub fn size_hint(&self) -> usize {
        match self {
            Payload::Json(value) => value.to_string().len(),
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Performs one attempt against one source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_one(&self, source: &str, key: &str) -> Result<Payload>;
}

/// Adapts an async closure into a [`SourceFetcher`]
pub struct FnFetcher<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> SourceFetcher for FnFetcher<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload>> + Send,
{
    async fn fetch_one(&self, source: &str, key: &str) -> Result<Payload> {
        (self.f)(source.to_string(), key.to_string()).await
    }
}

pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn SourceFetcher>
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(FnFetcher { f })
}

/// Everything needed to re-issue a fetch later (offline replay)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub key: String,
    #[serde(default)]
    pub priority: Priority,
    pub sources: Vec<String>,
}

impl RequestDescriptor {
    pub fn new(key: impl Into<String>, priority: Priority, sources: &[String]) -> Self {
        Self {
            key: key.into(),
            priority,
            sources: sources.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_is_tagged() {
        let payload = Payload::Json(json!({"symbol": "AAPL", "price": 187.25}));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"kind": "json", "data": {"symbol": "AAPL", "price": 187.25}})
        );

        let text: Payload = serde_json::from_value(json!({"kind": "text", "data": "ok"})).unwrap();
        assert_eq!(text, Payload::Text("ok".into()));
    }

    #[test]
    fn test_descriptor_default_priority() {
        let descriptor: RequestDescriptor =
            serde_json::from_value(json!({"key": "quote:AAPL", "sources": ["yahoo"]})).unwrap();
        assert_eq!(descriptor.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_fetcher_fn() {
        let fetcher = fetcher_fn(|source, key| async move {
            Ok(Payload::Text(format!("{}:{}", source, key)))
        });
        assert_eq!(
            fetcher.fetch_one("yahoo", "AAPL").await.unwrap(),
            Payload::Text("yahoo:AAPL".into())
        );
    }
}
