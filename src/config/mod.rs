use crate::cache::CacheConfig;
use crate::circuit_breaker::{CircuitBreakerConfig, RetryConfig};
use crate::error::{FetchError, Result};
use crate::fetcher::{FetchConfig, FetchMode};
use crate::observability::LoggingConfig;
use crate::offline::OfflineConfig;
use crate::scheduler::SchedulerConfig;
use crate::sources::SourceDefinition;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Prefix for environment overrides, e.g. `FETCH__BREAKER__FAILURE_THRESHOLD=3`
pub const ENV_PREFIX: &str = "FETCH";
const ENV_SEPARATOR: &str = "__";

/// Default numeric policy. Server-side aggregation and the client-side data
/// layer historically tuned these differently; pick one as the base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Server,
    Client,
}

impl Preset {
    pub fn defaults(self) -> FetchLayerConfig {
        let mut config = FetchLayerConfig {
            preset: self,
            ..FetchLayerConfig::server_defaults()
        };

        if self == Preset::Client {
            config.breaker = CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                open_timeout_ms: 60_000,
            };
            config.cache.max_capacity = 200;
            config.scheduler = SchedulerConfig {
                max_concurrent: 6,
                retry: RetryConfig {
                    max_retries: 2,
                    ..RetryConfig::default()
                },
            };
            config.fetch.mode = FetchMode::Scheduled;
        }

        config
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLayerConfig {
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
    Redis,
}

/// Durable store for the offline queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory for the file backend
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Connection URL for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key prefix for the redis backend
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

fn default_store_path() -> String {
    "data/offline".to_string()
}

fn default_store_prefix() -> String {
    "fetch".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            redis_url: None,
            prefix: default_store_prefix(),
        }
    }
}

impl Default for FetchLayerConfig {
    fn default() -> Self {
        Preset::Server.defaults()
    }
}

impl FetchLayerConfig {
    fn server_defaults() -> Self {
        Self {
            preset: Preset::Server,
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            offline: OfflineConfig::default(),
            fetch: FetchConfig::default(),
            store: StoreConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Load from a YAML file, layered over the selected preset and under
    /// `FETCH__*` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FetchError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::layered(&content, true)
    }

    /// Parse a YAML document layered over its preset. Environment overrides
    /// are not applied.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::layered(yaml, false)
    }

    fn layered(yaml: &str, with_env: bool) -> Result<Self> {
        let preset = Self::select_preset(yaml, with_env)?;
        let defaults = Config::try_from(&preset.defaults()).map_err(config_error)?;

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from_str(yaml, FileFormat::Yaml));
        if with_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        builder
            .build()
            .and_then(|layered| layered.try_deserialize::<Self>())
            .map_err(config_error)
    }

    /// The preset comes from the environment, then the document, then the default
    fn select_preset(yaml: &str, with_env: bool) -> Result<Preset> {
        if with_env {
            if let Ok(value) = std::env::var(format!("{0}{1}PRESET", ENV_PREFIX, ENV_SEPARATOR)) {
                return serde_yaml::from_str(&value.to_lowercase())
                    .map_err(|e| FetchError::Config(format!("Invalid preset '{}': {}", value, e)));
            }
        }

        let doc: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| FetchError::Config(format!("Failed to parse config: {}", e)))?;
        match doc.get("preset") {
            Some(value) => serde_yaml::from_value(value.clone())
                .map_err(|e| FetchError::Config(format!("Invalid preset: {}", e))),
            None => Ok(Preset::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(FetchError::Config(
                "Circuit breaker thresholds must be > 0".to_string(),
            ));
        }
        if self.cache.max_capacity == 0 {
            return Err(FetchError::Config("Cache capacity must be > 0".to_string()));
        }
        if self.cache.prune_interval_ms == 0 {
            return Err(FetchError::Config(
                "Cache prune interval must be > 0".to_string(),
            ));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(FetchError::Config(
                "Scheduler concurrency must be > 0".to_string(),
            ));
        }
        if self.offline.max_attempts == 0 {
            return Err(FetchError::Config(
                "Offline max attempts must be > 0".to_string(),
            ));
        }
        if self.fetch.attempt_timeout_ms == 0 {
            return Err(FetchError::Config("Attempt timeout must be > 0".to_string()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(FetchError::Config(
                "Redis store requires store.redis_url".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(FetchError::Config("Source id cannot be empty".to_string()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(FetchError::Config(format!(
                    "Duplicate source id: {}",
                    source.id
                )));
            }
            if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
                return Err(FetchError::Config(format!(
                    "Source URL must start with http:// or https:// for source: {}",
                    source.id
                )));
            }
            source.render_url("sample")?;
            if source.api_key_param.is_some() != source.api_key.is_some() {
                return Err(FetchError::Config(format!(
                    "api_key_param and api_key must be set together for source: {}",
                    source.id
                )));
            }
        }

        for id in &self.fetch.default_sources {
            if !seen.contains(id.as_str()) {
                return Err(FetchError::Config(format!(
                    "Default source '{}' is not defined",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Per-minute budgets declared on sources
    pub fn source_quotas(&self) -> HashMap<String, u32> {
        self.sources
            .iter()
            .filter_map(|source| {
                source
                    .requests_per_minute
                    .map(|rate| (source.id.clone(), rate))
            })
            .collect()
    }
}

fn config_error(e: config::ConfigError) -> FetchError {
    FetchError::Config(format!("Failed to load config: {}", e))
}
