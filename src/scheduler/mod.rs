//! Priority request scheduler with bounded concurrency.
//!
//! Items are ordered by `(priority, sequence)`, so dequeue is strict priority
//! across tiers and FIFO within a tier. Each dequeued item runs as its own
//! task; at most `max_concurrent` run at once and a running item is never
//! preempted. Enqueuing with a dedup key that matches a queued item joins
//! that item instead of adding work.
//!
//! Must be used from within a Tokio runtime.

mod types;

pub use types::{Priority, SchedulerConfig, SchedulerStats};

use crate::circuit_breaker::RetryExecutor;
use crate::error::{FetchError, Result};
use crate::metrics;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

type Operation<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T>> + Send>;
type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

/// A queued unit of work
pub struct QueueItem<T> {
    pub priority: Priority,
    pub dedup_key: String,
    pub enqueued_at: Instant,
    /// Attempts made so far, including retries
    pub attempts: u32,
    /// Callers sharing this item's result
    pub waiters: usize,
    operation: Operation<T>,
    sender: oneshot::Sender<Result<T>>,
    outcome: SharedOutcome<T>,
}

impl<T> std::fmt::Debug for QueueItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("priority", &self.priority)
            .field("dedup_key", &self.dedup_key)
            .field("attempts", &self.attempts)
            .field("waiters", &self.waiters)
            .finish()
    }
}

struct QueueState<T> {
    pending: BTreeMap<(Priority, u64), QueueItem<T>>,
    by_key: HashMap<String, (Priority, u64)>,
    running: usize,
    next_seq: u64,
}

impl<T> QueueState<T> {
    fn next_slot(&mut self, priority: Priority) -> (Priority, u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        (priority, seq)
    }
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    max_concurrent: usize,
    retry: RetryExecutor,
    completed: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
    cancelled: AtomicU64,
}

/// Priority queue with a fixed number of execution slots
pub struct RequestScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RequestScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl<T> RequestScheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    by_key: HashMap::new(),
                    running: 0,
                    next_seq: 0,
                }),
                max_concurrent: config.max_concurrent.max(1),
                retry: RetryExecutor::new(config.retry),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `operation` and start processing.
    ///
    /// `operation` is called once per attempt. When `dedup_key` matches an item
    /// that has not started yet, the returned handle shares that item's result
    /// and the item is promoted if this call is more urgent.
    pub fn enqueue<F, Fut>(
        &self,
        mut operation: F,
        priority: Priority,
        dedup_key: Option<String>,
    ) -> TaskHandle<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let dedup_key = dedup_key.unwrap_or_else(|| format!("task:{}", Uuid::new_v4()));

        let handle = {
            let mut state = self.inner.state.lock();

            match self.coalesce(&mut state, &dedup_key, priority) {
                Some(outcome) => TaskHandle {
                    dedup_key,
                    outcome,
                    scheduler: self.clone(),
                },
                None => {
                    let (sender, receiver) = oneshot::channel();
                    let cancelled_key = dedup_key.clone();
                    let outcome = receiver
                        .map(move |received| {
                            received.unwrap_or(Err(FetchError::Cancelled(cancelled_key)))
                        })
                        .boxed()
                        .shared();

                    let slot = state.next_slot(priority);
                    state.by_key.insert(dedup_key.clone(), slot);
                    state.pending.insert(
                        slot,
                        QueueItem {
                            priority,
                            dedup_key: dedup_key.clone(),
                            enqueued_at: Instant::now(),
                            attempts: 0,
                            waiters: 1,
                            operation: Box::new(move || operation().boxed()),
                            sender,
                            outcome: outcome.clone(),
                        },
                    );

                    debug!(
                        dedup_key = %dedup_key,
                        priority = %priority,
                        queued = state.pending.len(),
                        "Enqueued request"
                    );
                    metrics::record_scheduler_depth(state.pending.len());

                    TaskHandle {
                        dedup_key,
                        outcome,
                        scheduler: self.clone(),
                    }
                }
            }
        };

        self.process();
        handle
    }

    fn coalesce(
        &self,
        state: &mut QueueState<T>,
        dedup_key: &str,
        priority: Priority,
    ) -> Option<SharedOutcome<T>> {
        let slot = *state.by_key.get(dedup_key)?;
        let mut item = state.pending.remove(&slot)?;
        item.waiters += 1;
        self.inner.coalesced.fetch_add(1, Ordering::Relaxed);

        let slot = if priority < item.priority {
            debug!(
                dedup_key = %dedup_key,
                from = %item.priority,
                to = %priority,
                "Promoting coalesced request"
            );
            item.priority = priority;
            state.next_slot(priority)
        } else {
            slot
        };

        debug!(dedup_key = %dedup_key, waiters = item.waiters, "Coalesced duplicate request");
        let outcome = item.outcome.clone();
        state.by_key.insert(dedup_key.to_string(), slot);
        state.pending.insert(slot, item);
        Some(outcome)
    }

    /// Start queued items until every execution slot is busy
    pub fn process(&self) {
        loop {
            let item = {
                let mut state = self.inner.state.lock();
                if state.running >= self.inner.max_concurrent {
                    break;
                }
                let Some((_, item)) = state.pending.pop_first() else {
                    break;
                };
                state.by_key.remove(&item.dedup_key);
                state.running += 1;
                metrics::record_scheduler_depth(state.pending.len());
                item
            };

            self.run(item);
        }
    }

    fn run(&self, mut item: QueueItem<T>) {
        let slot = SlotGuard {
            scheduler: self.clone(),
        };
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let _slot = slot;
            debug!(
                dedup_key = %item.dedup_key,
                priority = %item.priority,
                waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
                "Starting scheduled request"
            );

            let attempts = &mut item.attempts;
            let operation = &mut item.operation;
            let result = inner
                .retry
                .execute(|| {
                    *attempts += 1;
                    operation()
                })
                .await;

            match &result {
                Ok(_) => {
                    inner.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        dedup_key = %item.dedup_key,
                        attempts = item.attempts,
                        error = %e,
                        "Scheduled request failed"
                    );
                }
            }

            if item.sender.send(result).is_err() {
                debug!(dedup_key = %item.dedup_key, "All waiters gone, discarding result");
            }
        });
    }

    /// Remove a queued item that has not started; its waiters receive `Cancelled`
    pub fn cancel(&self, dedup_key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.by_key.remove(dedup_key) else {
            return false;
        };
        let removed = state.pending.remove(&slot);
        metrics::record_scheduler_depth(state.pending.len());

        if let Some(item) = removed {
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(dedup_key = %dedup_key, waiters = item.waiters, "Cancelled queued request");
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            queued: state.pending.len(),
            running: state.running,
            max_concurrent: self.inner.max_concurrent,
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Frees an execution slot when a running item finishes, even by panic
struct SlotGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    scheduler: RequestScheduler<T>,
}

impl<T> Drop for SlotGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        {
            let mut state = self.scheduler.inner.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.scheduler.process();
    }
}

/// Caller's view of a scheduled request. Await it for the result.
pub struct TaskHandle<T> {
    dedup_key: String,
    outcome: SharedOutcome<T>,
    scheduler: RequestScheduler<T>,
}

impl<T> TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    /// Cancel the request if it has not started yet
    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(&self.dedup_key)
    }
}

impl<T> IntoFuture for TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T>;
    type IntoFuture = SharedOutcome<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::RetryConfig;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn scheduler(max_concurrent: usize) -> RequestScheduler<String> {
        RequestScheduler::new(SchedulerConfig {
            max_concurrent,
            retry: RetryConfig::default(),
        })
    }

    /// Occupies a slot until the returned semaphore gets a permit
    fn block(scheduler: &RequestScheduler<String>) -> (Arc<Semaphore>, TaskHandle<String>) {
        let gate = Arc::new(Semaphore::new(0));
        let gate_clone = gate.clone();
        let handle = scheduler.enqueue(
            move || {
                let gate = gate_clone.clone();
                async move {
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|e| FetchError::Internal(e.to_string()))?;
                    Ok("blocker".to_string())
                }
            },
            Priority::Critical,
            Some("blocker".to_string()),
        );
        (gate, handle)
    }

    fn recording(
        scheduler: &RequestScheduler<String>,
        order: &Arc<Mutex<Vec<String>>>,
        name: &str,
        priority: Priority,
    ) -> TaskHandle<String> {
        let order = order.clone();
        let name = name.to_string();
        scheduler.enqueue(
            move || {
                let order = order.clone();
                let name = name.clone();
                async move {
                    order.lock().push(name.clone());
                    Ok(name)
                }
            },
            priority,
            None,
        )
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let scheduler = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate, blocker) = block(&scheduler);

        let handles = vec![
            recording(&scheduler, &order, "low", Priority::Low),
            recording(&scheduler, &order, "critical", Priority::Critical),
            recording(&scheduler, &order, "high-1", Priority::High),
            recording(&scheduler, &order, "high-2", Priority::High),
        ];
        assert_eq!(scheduler.stats().queued, 4);

        gate.add_permits(1);
        assert_eq!(blocker.await.unwrap(), "blocker");
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *order.lock(),
            vec!["critical", "high-1", "high-2", "low"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_is_coalesced() {
        let scheduler = scheduler(1);
        let (gate, _blocker) = block(&scheduler);
        let calls = Arc::new(AtomicU32::new(0));

        let make = |calls: Arc<AtomicU32>| {
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("AAPL 187.25".to_string())
                }
            }
        };

        let first = scheduler.enqueue(make(calls.clone()), Priority::Normal, Some("quote:AAPL".into()));
        let second = scheduler.enqueue(make(calls.clone()), Priority::Normal, Some("quote:AAPL".into()));
        assert_eq!(scheduler.stats().queued, 1);
        assert_eq!(scheduler.stats().coalesced, 1);

        gate.add_permits(1);
        assert_eq!(first.await.unwrap(), "AAPL 187.25");
        assert_eq!(second.await.unwrap(), "AAPL 187.25");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coalesced_item_is_promoted() {
        let scheduler = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate, _blocker) = block(&scheduler);

        let order_clone = order.clone();
        let shared = scheduler.enqueue(
            move || {
                let order = order_clone.clone();
                async move {
                    order.lock().push("shared".to_string());
                    Ok("shared".to_string())
                }
            },
            Priority::Low,
            Some("shared".into()),
        );
        let high = recording(&scheduler, &order, "high", Priority::High);
        let promoted = scheduler.enqueue(
            || async { Ok("unused".to_string()) },
            Priority::Critical,
            Some("shared".into()),
        );

        gate.add_permits(1);
        high.await.unwrap();
        assert_eq!(shared.await.unwrap(), "shared");
        assert_eq!(promoted.await.unwrap(), "shared");
        assert_eq!(*order.lock(), vec!["shared", "high"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_queue() {
        let scheduler = scheduler(1);
        let failing = scheduler.enqueue(
            || async { Err::<String, _>(FetchError::Internal("boom".into())) },
            Priority::High,
            None,
        );
        let succeeding = scheduler.enqueue(
            || async { Ok("ok".to_string()) },
            Priority::Low,
            None,
        );

        assert_eq!(failing.await, Err(FetchError::Internal("boom".into())));
        assert_eq!(succeeding.await.unwrap(), "ok");

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 1);
        // The blocker-free queue drains fully
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_item() {
        let scheduler = scheduler(1);
        let (gate, _blocker) = block(&scheduler);

        let handle = scheduler.enqueue(
            || async { Ok("never".to_string()) },
            Priority::Normal,
            Some("quote:TSLA".into()),
        );
        assert!(handle.cancel());
        assert!(!scheduler.cancel("quote:TSLA"));
        // A running item cannot be cancelled
        assert!(!scheduler.cancel("blocker"));

        assert_eq!(handle.await, Err(FetchError::Cancelled("quote:TSLA".into())));
        assert_eq!(scheduler.stats().cancelled, 1);
        gate.add_permits(1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let scheduler = scheduler(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                scheduler.enqueue(
                    move || {
                        let active = active.clone();
                        let peak = peak.clone();
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(format!("item-{}", i))
                        }
                    },
                    Priority::Normal,
                    None,
                )
            })
            .collect();

        assert_eq!(scheduler.stats().running, 2);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats().completed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_are_retried() {
        let scheduler: RequestScheduler<String> = RequestScheduler::new(SchedulerConfig {
            max_concurrent: 1,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 10,
                max_backoff_ms: 100,
                backoff_multiplier: 2.0,
            },
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let handle = scheduler.enqueue(
            move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FetchError::transport("yahoo", "connection reset"))
                    } else {
                        Ok("recovered".to_string())
                    }
                }
            },
            Priority::Normal,
            None,
        );

        assert_eq!(handle.await.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
