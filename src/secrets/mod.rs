//! Provider API keys.
//!
//! Source definitions name their key with a reference such as
//! `secret://alphavantage`, `env://AV_KEY` or `file:///run/keys/av`; the
//! reference is resolved once when the HTTP source adapter is built.

use crate::error::{FetchError, Result};
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Secret string wrapper that keeps keys out of `Debug` output and logs
pub type SecretString = Secret<String>;

/// Default prefix for environment secrets
pub const ENV_SECRET_PREFIX: &str = "FETCH_SECRET_";

/// Mounted secrets directory checked by [`SecretsManager::default`]
pub const MOUNTED_SECRETS_DIR: &str = "/var/run/secrets/fetch";

pub trait SecretsProvider: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<SecretString>;

    fn has_secret(&self, key: &str) -> bool;
}

/// Reads `FETCH_SECRET_<KEY>` environment variables
#[derive(Debug, Clone)]
pub struct EnvSecretsProvider {
    prefix: String,
}

impl EnvSecretsProvider {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('-', "_"))
    }
}

impl Default for EnvSecretsProvider {
    fn default() -> Self {
        Self::new(ENV_SECRET_PREFIX)
    }
}

impl SecretsProvider for EnvSecretsProvider {
    fn get_secret(&self, key: &str) -> Result<SecretString> {
        env::var(self.var_name(key))
            .map(Secret::new)
            .map_err(|_| FetchError::Config(format!("Secret '{}' not found in environment", key)))
    }

    fn has_secret(&self, key: &str) -> bool {
        env::var(self.var_name(key)).is_ok()
    }
}

/// One file per secret in a directory (container-mounted secrets)
#[derive(Debug, Clone)]
pub struct FileSecretsProvider {
    base_path: PathBuf,
}

impl FileSecretsProvider {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl SecretsProvider for FileSecretsProvider {
    fn get_secret(&self, key: &str) -> Result<SecretString> {
        let path = self.base_path.join(key);
        fs::read_to_string(&path)
            .map(|s| Secret::new(s.trim().to_string()))
            .map_err(|e| {
                FetchError::Config(format!(
                    "Failed to read secret from {}: {}",
                    path.display(),
                    e
                ))
            })
    }

    fn has_secret(&self, key: &str) -> bool {
        self.base_path.join(key).is_file()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySecretsProvider {
    secrets: HashMap<String, SecretString>,
}

impl InMemorySecretsProvider {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets: secrets
                .into_iter()
                .map(|(k, v)| (k, Secret::new(v)))
                .collect(),
        }
    }
}

impl SecretsProvider for InMemorySecretsProvider {
    fn get_secret(&self, key: &str) -> Result<SecretString> {
        self.secrets
            .get(key)
            .cloned()
            .ok_or_else(|| FetchError::Config(format!("Secret '{}' not found", key)))
    }

    fn has_secret(&self, key: &str) -> bool {
        self.secrets.contains_key(key)
    }
}

/// Provider chain, checked in order
pub struct SecretsManager {
    providers: Vec<Box<dyn SecretsProvider>>,
}

impl SecretsManager {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn add_provider<P: SecretsProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn get_secret(&self, key: &str) -> Result<SecretString> {
        self.providers
            .iter()
            .find(|provider| provider.has_secret(key))
            .ok_or_else(|| {
                FetchError::Config(format!("Secret '{}' not found in any provider", key))
            })?
            .get_secret(key)
    }

    pub fn has_secret(&self, key: &str) -> bool {
        self.providers.iter().any(|p| p.has_secret(key))
    }
}

impl Default for SecretsManager {
    /// Environment first, then the mounted secrets directory when present
    fn default() -> Self {
        let mut manager = Self::new().add_provider(EnvSecretsProvider::default());

        if Path::new(MOUNTED_SECRETS_DIR).is_dir() {
            info!(dir = MOUNTED_SECRETS_DIR, "Adding mounted secrets provider");
            manager = manager.add_provider(FileSecretsProvider::new(MOUNTED_SECRETS_DIR));
        }

        manager
    }
}

impl std::fmt::Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManager")
            .field("providers", &self.providers.len())
            .finish()
    }
}

/// Resolve a secret reference.
///
/// - `secret://key` looks the key up through `manager`
/// - `env://VAR` reads an environment variable directly
/// - `file:///path` reads a file
/// - anything else is taken literally
pub fn resolve_secret_ref(value: &str, manager: &SecretsManager) -> Result<SecretString> {
    if let Some(key) = value.strip_prefix("secret://") {
        debug!(key, "Resolving secret reference");
        manager.get_secret(key)
    } else if let Some(var) = value.strip_prefix("env://") {
        debug!(var, "Resolving environment reference");
        env::var(var)
            .map(Secret::new)
            .map_err(|_| FetchError::Config(format!("Environment variable '{}' not found", var)))
    } else if let Some(path) = value.strip_prefix("file://") {
        debug!(path, "Resolving file reference");
        fs::read_to_string(path)
            .map(|s| Secret::new(s.trim().to_string()))
            .map_err(|e| FetchError::Config(format!("Failed to read file {}: {}", path, e)))
    } else {
        Ok(Secret::new(value.to_string()))
    }
}

/// Expose a resolved secret for embedding in an outgoing request
pub fn expose(secret: &SecretString) -> &str {
    secret.expose_secret().as_str()
}
