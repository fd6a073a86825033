//! Durable store-and-forward queue for requests that failed while offline.
//!
//! Records are kept in insertion order and persisted as a single JSON array
//! after every change, so the queue survives restarts. Replay happens only
//! when the host signals that connectivity is back.

mod store;

pub use store::{DurableStore, FileStore, MemoryStore, RedisStore};

use crate::error::{FetchError, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Offline queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Hand connectivity failures to the queue instead of surfacing them
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Failed replays after which a record is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Store key holding the serialized queue
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_storage_key() -> String {
    "offline-queue".to_string()
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            storage_key: default_storage_key(),
        }
    }
}

/// A persisted request awaiting replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRequestRecord {
    pub id: String,
    /// JSON-serialized request descriptor
    pub descriptor: String,
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempts: u32,
}

/// A record dropped after reaching the attempt ceiling
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonedRecord {
    pub id: String,
    pub attempts: u32,
    pub last_error: String,
}

impl AbandonedRecord {
    pub fn error(&self) -> FetchError {
        FetchError::OfflineQueueExhausted {
            id: self.id.clone(),
            attempts: self.attempts,
        }
    }
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    /// Ids replayed successfully and removed
    pub replayed: Vec<String>,
    /// Ids that failed but stay queued for the next pass
    pub retained: Vec<String>,
    pub abandoned: Vec<AbandonedRecord>,
}

enum Outcome {
    Replayed,
    Retained,
    Abandoned,
}

/// Store-and-forward queue over a [`DurableStore`]
pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    config: OfflineConfig,
    records: Mutex<Vec<OfflineRequestRecord>>,
    replay_lock: Mutex<()>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Open the queue, loading any records persisted by a previous run
    pub async fn open(store: Arc<dyn DurableStore>, config: OfflineConfig) -> Result<Self> {
        let records: Vec<OfflineRequestRecord> = match store.load(&config.storage_key).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        info!(
            store = store.name(),
            pending = records.len(),
            "Opened offline queue"
        );
        metrics::record_offline_depth(records.len());

        Ok(Self {
            store,
            config,
            records: Mutex::new(records),
            replay_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Persist `descriptor` and return the generated record id
    pub async fn enqueue<D: Serialize>(&self, descriptor: &D) -> Result<String> {
        let record = OfflineRequestRecord {
            id: Uuid::new_v4().to_string(),
            descriptor: serde_json::to_string(descriptor)?,
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let id = record.id.clone();

        let mut records = self.records.lock().await;
        records.push(record);
        if let Err(e) = self.persist(&records).await {
            records.pop();
            return Err(e);
        }

        info!(id = %id, pending = records.len(), "Queued request for offline replay");
        metrics::record_offline_depth(records.len());
        Ok(id)
    }

    /// Replay every record in insertion order.
    ///
    /// Successful records are removed. A failed record has its attempt count
    /// incremented and is abandoned once the count reaches `max_attempts`.
    /// Records enqueued while the pass runs are kept for the next pass.
    pub async fn process_queue<D, F, Fut>(&self, mut replay: F) -> Result<ReplayReport>
    where
        D: DeserializeOwned,
        F: FnMut(D) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _replaying = self.replay_lock.lock().await;
        let pending = self.records.lock().await.clone();
        if pending.is_empty() {
            return Ok(ReplayReport::default());
        }

        info!(pending = pending.len(), "Replaying offline queue");
        let mut report = ReplayReport::default();
        let mut outcomes = Vec::with_capacity(pending.len());

        for record in &pending {
            let result = match serde_json::from_str::<D>(&record.descriptor) {
                Ok(descriptor) => replay(descriptor).await,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "Dropping unreadable offline record");
                    report.abandoned.push(AbandonedRecord {
                        id: record.id.clone(),
                        attempts: record.attempts,
                        last_error: e.to_string(),
                    });
                    outcomes.push((record.id.clone(), Outcome::Abandoned));
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    debug!(id = %record.id, "Offline record replayed");
                    report.replayed.push(record.id.clone());
                    outcomes.push((record.id.clone(), Outcome::Replayed));
                }
                Err(e) => {
                    let attempts = record.attempts + 1;
                    if attempts >= self.config.max_attempts {
                        warn!(
                            id = %record.id,
                            attempts,
                            error = %e,
                            "Abandoning offline record after max attempts"
                        );
                        report.abandoned.push(AbandonedRecord {
                            id: record.id.clone(),
                            attempts,
                            last_error: e.to_string(),
                        });
                        outcomes.push((record.id.clone(), Outcome::Abandoned));
                    } else {
                        debug!(id = %record.id, attempts, error = %e, "Offline replay failed");
                        report.retained.push(record.id.clone());
                        outcomes.push((record.id.clone(), Outcome::Retained));
                    }
                }
            }
        }

        let mut records = self.records.lock().await;
        for (id, outcome) in outcomes {
            let Some(index) = records.iter().position(|record| record.id == id) else {
                continue;
            };
            match outcome {
                Outcome::Retained => records[index].attempts += 1,
                Outcome::Replayed | Outcome::Abandoned => {
                    records.remove(index);
                }
            }
        }
        self.persist(&records).await?;

        info!(
            replayed = report.replayed.len(),
            retained = report.retained.len(),
            abandoned = report.abandoned.len(),
            "Offline replay finished"
        );
        metrics::record_offline_depth(records.len());
        Ok(report)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Snapshot of the pending records in replay order
    pub async fn records(&self) -> Vec<OfflineRequestRecord> {
        self.records.lock().await.clone()
    }

    async fn persist(&self, records: &[OfflineRequestRecord]) -> Result<()> {
        if records.is_empty() {
            return self.store.remove(&self.config.storage_key).await;
        }
        let raw = serde_json::to_string(records)?;
        self.store.save(&self.config.storage_key, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    async fn queue(max_attempts: u32) -> (OfflineQueue, MemoryStore) {
        let store = MemoryStore::new();
        let queue = OfflineQueue::open(
            Arc::new(store.clone()),
            OfflineConfig {
                max_attempts,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        (queue, store)
    }

    #[tokio::test]
    async fn test_enqueue_persists() {
        let (queue, store) = queue(3).await;
        let id = queue.enqueue(&"quote:AAPL").await.unwrap();

        let raw = store.load("offline-queue").await.unwrap().unwrap();
        let persisted: Vec<OfflineRequestRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, id);
        assert_eq!(persisted[0].descriptor, "\"quote:AAPL\"");
        assert_eq!(persisted[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_replay_in_insertion_order() {
        let (queue, store) = queue(3).await;
        for key in ["quote:AAPL", "quote:MSFT", "quote:TSLA"] {
            queue.enqueue(&key).await.unwrap();
        }

        let seen = SyncMutex::new(Vec::new());
        let report = queue
            .process_queue(|key: String| {
                seen.lock().push(key);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["quote:AAPL", "quote:MSFT", "quote:TSLA"]);
        assert_eq!(report.replayed.len(), 3);
        assert!(queue.is_empty().await);
        assert_eq!(store.load("offline-queue").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_replay_is_retained_then_abandoned() {
        let (queue, _store) = queue(2).await;
        let id = queue.enqueue(&"quote:AAPL").await.unwrap();

        let fail = |_: String| async { Err(FetchError::transport("yahoo", "offline")) };

        let first = queue.process_queue(fail).await.unwrap();
        assert_eq!(first.retained, vec![id.clone()]);
        assert_eq!(queue.records().await[0].attempts, 1);

        let second = queue.process_queue(fail).await.unwrap();
        assert!(second.retained.is_empty());
        assert_eq!(second.abandoned.len(), 1);
        assert_eq!(
            second.abandoned[0].error(),
            FetchError::OfflineQueueExhausted { id, attempts: 2 }
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreadable_descriptor_is_abandoned() {
        let (queue, _store) = queue(3).await;
        queue.enqueue(&serde_json::json!({"nested": true})).await.unwrap();

        let report = queue
            .process_queue(|_: String| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report.abandoned.len(), 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_replay() {
        let (queue, _store) = queue(3).await;
        let report = queue
            .process_queue(|_: String| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report, ReplayReport::default());
    }

    #[tokio::test]
    async fn test_corrupt_store_fails_open() {
        let store = MemoryStore::new();
        store.save("offline-queue", "not json").await.unwrap();

        let result = OfflineQueue::open(Arc::new(store), OfflineConfig::default()).await;
        assert!(matches!(result, Err(FetchError::Serialization(_))));
    }
}
