mod key;

pub use key::RequestKey;

use crate::error::{FetchError, Result};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in cache
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Default time-to-live for cache entries in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Interval between expired-entry sweeps in milliseconds
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
}

fn default_max_capacity() -> usize {
    500
}

fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_prune_interval_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            ttl_ms: default_ttl_ms(),
            prune_interval_ms: default_prune_interval_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// Which entries a clear operation targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    Key(String),
    /// Regular expression matched against keys
    Pattern(String),
    All,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_accessed_at: Instant,
    /// Position in the recency index
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// tick -> key, oldest access first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> CacheState<V> {
    fn touch(&mut self, key: &str, now: Instant) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            entry.last_accessed_at = now;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Bounded least-recently-used cache with per-entry TTL
#[derive(Debug)]
pub struct ResponseCache<V> {
    config: CacheConfig,
    state: Arc<Mutex<CacheState<V>>>,
}

impl<V> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<V: Clone> ResponseCache<V> {
    /// Create a new cache
    pub fn new(config: CacheConfig) -> Self {
        info!(
            max_capacity = config.max_capacity,
            ttl_ms = config.ttl_ms,
            "Initialized response cache"
        );

        Self {
            config,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                evictions: 0,
                expirations: 0,
            })),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.config.max_capacity.max(1)
    }

    /// Look up a live entry, refreshing its recency. Expired entries are removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = state.entries.get(key)?.is_expired(now);
        if expired {
            state.remove(key);
            state.expirations += 1;
            debug!(key = %key, "Cache entry expired on read");
            return None;
        }

        state.touch(key, now);
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Store a value with the configured default TTL
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.config.ttl());
    }

    /// Store a value with an explicit TTL, evicting the LRU entry when full
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let capacity = self.capacity();
        let mut state = self.state.lock();

        if let Some(existing) = state.remove(&key) {
            debug!(key = %key, age_ms = now.duration_since(existing.inserted_at).as_millis() as u64, "Overwriting cache entry");
        } else {
            while state.entries.len() >= capacity {
                match state.evict_lru() {
                    Some(evicted) => debug!(key = %evicted, "Evicted least recently used entry"),
                    None => break,
                }
            }
        }

        let tick = state.next_tick;
        state.next_tick += 1;
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                last_accessed_at: now,
                tick,
            },
        );
    }

    /// Remove every entry older than its TTL; returns how many were removed
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        state.expirations += expired.len() as u64;

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Pruned expired cache entries");
        }
        expired.len()
    }

    /// Invalidate cache entry
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            debug!(key = %key, "Invalidated cache entry");
        }
        removed
    }

    /// Invalidate every key matching a regular expression
    pub fn invalidate_matching(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern).map_err(|e| FetchError::InvalidPattern(e.to_string()))?;
        let mut state = self.state.lock();

        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|key| regex.is_match(key))
            .cloned()
            .collect();
        for key in &matching {
            state.remove(key);
        }

        debug!(pattern = %pattern, removed = matching.len(), "Invalidated matching cache entries");
        Ok(matching.len())
    }

    /// Clear all cache entries
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.recency.clear();
        info!(removed, "Cleared all cache entries");
        removed
    }

    /// Apply a clear scope; returns the number of entries removed
    pub fn clear_scope(&self, scope: &CacheScope) -> Result<usize> {
        match scope {
            CacheScope::Key(key) => Ok(usize::from(self.invalidate(key))),
            CacheScope::Pattern(pattern) => self.invalidate_matching(pattern),
            CacheScope::All => Ok(self.clear()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.lock();
        CacheStats {
            entry_count: state.entries.len(),
            capacity: self.capacity(),
            evictions: state.evictions,
            expirations: state.expirations,
            oldest_entry_age_ms: state
                .entries
                .values()
                .map(|entry| now.duration_since(entry.inserted_at).as_millis() as u64)
                .max(),
            least_recent_idle_ms: state
                .recency
                .first_key_value()
                .and_then(|(_, key)| state.entries.get(key))
                .map(|entry| now.duration_since(entry.last_accessed_at).as_millis() as u64),
        }
    }
}

impl<V: Clone + Send + 'static> ResponseCache<V> {
    /// Sweep expired entries on the configured interval until the handle is aborted
    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.config.prune_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            info!(interval_ms = period.as_millis() as u64, "Started cache pruner");

            loop {
                ticker.tick().await;
                cache.prune();
            }
        })
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub capacity: usize,
    /// Entries dropped to make room, lifetime total
    pub evictions: u64,
    /// Entries dropped for age, lifetime total
    pub expirations: u64,
    pub oldest_entry_age_ms: Option<u64>,
    /// Idle time of the next eviction candidate
    pub least_recent_idle_ms: Option<u64>,
}
