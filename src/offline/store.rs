use crate::error::{FetchError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Durable key-value storage backing the offline queue
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the value stored under `key`
    async fn load(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn save(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`; deleting a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Process-local store, mostly for tests. Not durable across restarts.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One JSON file per key inside a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

fn storage_error(action: &str, path: &Path, e: std::io::Error) -> FetchError {
    error!(path = %path.display(), error = %e, "Failed to {}", action);
    FetchError::Storage(format!("failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", &path, e)),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("create", &self.dir, e))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| storage_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("rename", &path, e))?;

        debug!(path = %path.display(), bytes = value.len(), "Persisted value");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("remove", &path, e)),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Redis-backed store; keys are namespaced with a prefix
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(redis_error)?;
        let connection = ConnectionManager::new(client).await.map_err(redis_error)?;

        Ok(Self {
            connection,
            prefix: prefix.into(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn redis_error(e: redis::RedisError) -> FetchError {
    error!(error = %e, "Redis store error");
    FetchError::Storage(e.to_string())
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        connection
            .get::<_, Option<String>>(self.full_key(key))
            .await
            .map_err(redis_error)
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(self.full_key(key), value)
            .await
            .map_err(redis_error)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .del::<_, ()>(self.full_key(key))
            .await
            .map_err(redis_error)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.load("queue").await.unwrap(), None);

        store.save("queue", "[]").await.unwrap();
        assert_eq!(store.load("queue").await.unwrap().as_deref(), Some("[]"));

        store.remove("queue").await.unwrap();
        store.remove("queue").await.unwrap();
        assert_eq!(store.load("queue").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("offline"));

        assert_eq!(store.load("offline-queue").await.unwrap(), None);
        store.save("offline-queue", r#"[{"id":"a"}]"#).await.unwrap();
        store.save("offline-queue", r#"[{"id":"b"}]"#).await.unwrap();

        let reopened = FileStore::new(dir.path().join("offline"));
        assert_eq!(
            reopened.load("offline-queue").await.unwrap().as_deref(),
            Some(r#"[{"id":"b"}]"#)
        );

        reopened.remove("offline-queue").await.unwrap();
        assert_eq!(store.load("offline-queue").await.unwrap(), None);
    }

    #[test]
    fn test_file_names_are_sanitized() {
        let store = FileStore::new("/var/lib/fetch");
        assert_eq!(
            store.path_for("queue/../../etc"),
            PathBuf::from("/var/lib/fetch/queue_______etc.json")
        );
    }
}
