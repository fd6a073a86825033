use super::{Payload, SourceFetcher};
use crate::error::{FetchError, Result};
use crate::secrets::{expose, resolve_secret_ref, SecretString, SecretsManager};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Placeholder replaced by the (url-encoded) request key
pub const KEY_PLACEHOLDER: &str = "{key}";

/// An upstream provider reachable over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Source id used in fetch calls, circuit names and metrics
    pub id: String,
    /// URL template, e.g. `https://api.example.com/quote/{key}`
    pub url: String,
    /// Query parameter carrying the API key
    #[serde(default)]
    pub api_key_param: Option<String>,
    /// Secret reference for the API key (`secret://`, `env://`, `file://` or literal)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-minute request budget, unlimited when absent
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

impl SourceDefinition {
    /// Render the request URL for `key`, without credentials
    pub fn render_url(&self, key: &str) -> Result<Url> {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        Url::parse(&self.url.replace(KEY_PLACEHOLDER, &encoded)).map_err(|e| {
            FetchError::Config(format!("Invalid URL template for source '{}': {}", self.id, e))
        })
    }
}

struct HttpSource {
    definition: SourceDefinition,
    api_key: Option<SecretString>,
}

/// [`SourceFetcher`] for providers declared in configuration
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    sources: HashMap<String, HttpSource>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpSourceFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.sources.keys().collect();
        ids.sort();
        f.debug_struct("HttpSourceFetcher")
            .field("sources", &ids)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpSourceFetcher {
    /// Build the adapter, resolving every API key up front
    pub fn new(
        definitions: &[SourceDefinition],
        secrets: &SecretsManager,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let mut sources = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            // Fail at startup, not on first request
            definition.render_url("sample")?;

            let api_key = definition
                .api_key
                .as_deref()
                .map(|reference| resolve_secret_ref(reference, secrets))
                .transpose()?;

            debug!(
                source = %definition.id,
                authenticated = api_key.is_some(),
                "Registered HTTP source"
            );
            sources.insert(
                definition.id.clone(),
                HttpSource {
                    definition: definition.clone(),
                    api_key,
                },
            );
        }

        Ok(Self {
            client,
            sources,
            timeout,
        })
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn request_url(&self, source: &HttpSource, key: &str) -> Result<Url> {
        let mut url = source.definition.render_url(key)?;
        if let (Some(param), Some(secret)) = (&source.definition.api_key_param, &source.api_key) {
            url.query_pairs_mut().append_pair(param, expose(secret));
        }
        Ok(url)
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch_one(&self, source_id: &str, key: &str) -> Result<Payload> {
        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| FetchError::Config(format!("Unknown source '{}'", source_id)))?;
        let url = self.request_url(source, key)?;

        let start = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    provider: source_id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                // The URL may carry the API key
                FetchError::transport(source_id, e.without_url().to_string())
            }
        })?;

        let status = response.status();
        let latency_ms = start.elapsed().as_millis() as u64;

        if !status.is_success() {
            debug!(source = source_id, status = status.as_u16(), latency_ms, "Upstream rejected request");
            return Err(FetchError::Upstream {
                provider: source_id.to_string(),
                status: Some(status.as_u16()),
                latency_ms,
                message: format!("HTTP {}", status),
            });
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("json"))
            .unwrap_or(false);

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    provider: source_id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                FetchError::transport(source_id, e.without_url().to_string())
            }
        })?;

        let payload = if is_json {
            let value = serde_json::from_slice(&body).map_err(|e| FetchError::Upstream {
                provider: source_id.to_string(),
                status: Some(status.as_u16()),
                latency_ms,
                message: format!("Malformed JSON body: {}", e),
            })?;
            Payload::Json(value)
        } else {
            match String::from_utf8(body.to_vec()) {
                Ok(text) => Payload::Text(text),
                Err(e) => Payload::Binary(e.into_bytes()),
            }
        };

        debug!(
            source = source_id,
            latency_ms,
            bytes = body.len(),
            "Upstream responded"
        );
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::InMemorySecretsProvider;

    fn definition(url: &str) -> SourceDefinition {
        SourceDefinition {
            id: "alphavantage".to_string(),
            url: url.to_string(),
            api_key_param: Some("apikey".to_string()),
            api_key: Some("secret://alphavantage".to_string()),
            requests_per_minute: Some(5),
        }
    }

    fn secrets() -> SecretsManager {
        SecretsManager::new().add_provider(InMemorySecretsProvider::new(HashMap::from([(
            "alphavantage".to_string(),
            "demo-key".to_string(),
        )])))
    }

    #[test]
    fn test_render_url_encodes_key() {
        let url = definition("https://example.com/quote/{key}?range=1d")
            .render_url("BRK B")
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/quote/BRK+B?range=1d");
    }

    #[test]
    fn test_request_url_appends_api_key() {
        let fetcher = HttpSourceFetcher::new(
            &[definition("https://example.com/query?symbol={key}")],
            &secrets(),
            Duration::from_secs(10),
        )
        .unwrap();

        let source = &fetcher.sources["alphavantage"];
        let url = fetcher.request_url(source, "IBM").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/query?symbol=IBM&apikey=demo-key"
        );
    }

    #[test]
    fn test_invalid_template_rejected() {
        let result = HttpSourceFetcher::new(
            &[definition("not a url {key}")],
            &secrets(),
            Duration::from_secs(10),
        );
        assert!(matches!(result, Err(FetchError::Config(_))));
    }

    #[test]
    fn test_missing_secret_rejected() {
        let result = HttpSourceFetcher::new(
            &[definition("https://example.com/{key}")],
            &SecretsManager::new(),
            Duration::from_secs(10),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_hides_keys() {
        let fetcher = HttpSourceFetcher::new(
            &[definition("https://example.com/{key}")],
            &secrets(),
            Duration::from_secs(10),
        )
        .unwrap();
        let debug = format!("{:?}", fetcher);
        assert!(debug.contains("alphavantage"));
        assert!(!debug.contains("demo-key"));
    }
}
