// Batching queue
//
// Accumulates payloads in arrival order, deduplicating by key on the way in,
// and hands the batch to the consumer callback when the deferred timer
// elapses, the threshold is reached, or the owner shuts the queue down.
//
// All mutation happens under one mutex per queue instance. The lock is
// released before the consumer callback runs, so a callback may re-enter
// `enqueue` without deadlocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::BatchConfig;
use crate::key::{self, DedupKey};

type KeyFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;
type AcceptFn<T> = Arc<dyn Fn(T) -> T + Send + Sync>;
type FlushFn<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Timer,
    Threshold,
    Shutdown,
    Manual,
}

impl FlushReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Threshold => "threshold",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    deduplicated: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_items: AtomicU64,
}

/// Point-in-time snapshot of one queue's monotonic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub accepted: u64,
    pub deduplicated: u64,
    pub flushed_batches: u64,
    pub flushed_items: u64,
}

struct QueueState<T> {
    seen: HashMap<DedupKey, T>,
    pending: Vec<T>,
    timer: Option<JoinHandle<()>>,
    // Bumped on every flush; a timer task armed under an older epoch is stale.
    epoch: u64,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
            pending: Vec::new(),
            timer: None,
            epoch: 0,
        }
    }

    /// Clears the timer and both containers before anyone observes the batch.
    fn take_batch(&mut self) -> Vec<T> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.epoch += 1;
        self.seen.clear();
        std::mem::take(&mut self.pending)
    }
}

struct Inner<T> {
    config: BatchConfig,
    key_fn: Option<KeyFn<T>>,
    on_accept: Option<AcceptFn<T>>,
    on_flush: Option<FlushFn<T>>,
    state: Mutex<QueueState<T>>,
    seq: AtomicU64,
    counters: Counters,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn derive_key(&self, payload: &T) -> DedupKey {
        if let Some(key_fn) = &self.key_fn {
            if let Some(field) = key_fn(payload) {
                return DedupKey::Field(field);
            }
        }
        key::synthetic(self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn arm_timer(this: &Arc<Self>, state: &mut QueueState<T>) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime; deferred flush disabled for this window");
                return;
            }
        };

        let queue: Weak<Inner<T>> = Arc::downgrade(this);
        let armed_epoch = state.epoch;
        let delay = this.config.flush_after();
        state.timer = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.timer_fired(armed_epoch);
            }
        }));
    }

    fn timer_fired(&self, armed_epoch: u64) {
        let batch = {
            let mut state = self.state.lock();
            if state.epoch != armed_epoch {
                // Superseded by a threshold, manual or shutdown flush.
                return;
            }
            state.take_batch()
        };
        self.deliver(batch, FlushReason::Timer);
    }

    fn flush(&self, reason: FlushReason) {
        let batch = {
            let mut state = self.state.lock();
            state.take_batch()
        };
        self.deliver(batch, reason);
    }

    fn deliver(&self, batch: Vec<T>, reason: FlushReason) {
        if batch.is_empty() {
            return;
        }

        self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .flushed_items
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(items = batch.len(), reason = reason.as_str(), "flushing batch");

        if let Some(on_flush) = &self.on_flush {
            on_flush(batch);
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Handle to one accumulation queue. Clones share the same state, so a handle
/// can be captured by the flush callback or stored alongside the consumer.
///
/// `shutdown` must be wired by the owning environment; the queue does not
/// self-register for process lifecycle signals. An `enqueue` after `shutdown`
/// starts a fresh accumulation window.
pub struct BatchQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> BatchQueue<T> {
    /// Queue with the given triggers and default callbacks (identity accept,
    /// no-op flush).
    pub fn new(config: BatchConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> BatchQueueBuilder<T> {
        BatchQueueBuilder::default()
    }

    /// Accepts a payload into the current accumulation window.
    ///
    /// A payload whose key was already accepted since the last flush is
    /// silently dropped; the first submission wins. Reaching the threshold
    /// flushes synchronously before this call returns, so the consumer
    /// callback may run on the caller's stack. A callback that re-enters
    /// `enqueue` past the threshold recursively is the caller's
    /// responsibility to bound.
    pub fn enqueue(&self, payload: T) {
        let key = self.inner.derive_key(&payload);

        let batch = {
            let mut state = self.inner.state.lock();
            if state.seen.contains_key(&key) {
                self.inner
                    .counters
                    .deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                trace!(key = ?key, "duplicate payload dropped");
                return;
            }

            let accepted = match &self.inner.on_accept {
                Some(transform) => transform(payload),
                None => payload,
            };
            state.seen.insert(key, accepted.clone());
            state.pending.push(accepted);
            self.inner.counters.accepted.fetch_add(1, Ordering::Relaxed);

            if state.pending.len() >= self.inner.config.threshold {
                Some(state.take_batch())
            } else {
                if state.pending.len() == 1 && state.timer.is_none() {
                    Inner::arm_timer(&self.inner, &mut state);
                }
                None
            }
        };

        if let Some(batch) = batch {
            self.inner.deliver(batch, FlushReason::Threshold);
        }
    }

    /// Forces delivery of everything buffered so far.
    pub fn flush(&self) {
        self.inner.flush(FlushReason::Manual);
    }

    /// Final flush for the owning context's teardown. Idempotent: repeated
    /// calls on an empty queue are no-ops.
    pub fn shutdown(&self) {
        self.inner.flush(FlushReason::Shutdown);
    }

    /// Snapshot of the buffered payloads in arrival order.
    pub fn pending(&self) -> Vec<T> {
        self.inner.state.lock().pending.clone()
    }

    /// Snapshot of the dedup map for the current accumulation window.
    pub fn seen(&self) -> HashMap<DedupKey, T> {
        self.inner.state.lock().seen.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().pending.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.inner.counters.accepted.load(Ordering::Relaxed),
            deduplicated: self.inner.counters.deduplicated.load(Ordering::Relaxed),
            flushed_batches: self.inner.counters.flushed_batches.load(Ordering::Relaxed),
            flushed_items: self.inner.counters.flushed_items.load(Ordering::Relaxed),
        }
    }
}

/// Configures and builds a [`BatchQueue`].
pub struct BatchQueueBuilder<T> {
    config: BatchConfig,
    key_fn: Option<KeyFn<T>>,
    on_accept: Option<AcceptFn<T>>,
    on_flush: Option<FlushFn<T>>,
}

impl<T> Default for BatchQueueBuilder<T> {
    fn default() -> Self {
        Self {
            config: BatchConfig::default(),
            key_fn: None,
            on_accept: None,
            on_flush: None,
        }
    }
}

impl<T: Clone + Send + 'static> BatchQueueBuilder<T> {
    pub fn config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn flush_after(mut self, flush_after: Duration) -> Self {
        self.config.flush_after_ms = flush_after.as_millis() as u64;
        self
    }

    /// Extracts the dedup key from a payload. Returning `None` falls back to
    /// a synthetic per-insertion key, which disables dedup for that payload.
    pub fn dedup_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Pure transform applied to each payload before it is buffered.
    pub fn on_accept<F>(mut self, transform: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.on_accept = Some(Arc::new(transform));
        self
    }

    /// Consumer callback receiving each batch in arrival order. Queue state
    /// is already reset when it runs, so a panicking callback loses only its
    /// own batch.
    pub fn on_flush<F>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        self.on_flush = Some(Arc::new(consumer));
        self
    }

    pub fn build(self) -> BatchQueue<T> {
        BatchQueue {
            inner: Arc::new(Inner {
                config: self.config,
                key_fn: self.key_fn,
                on_accept: self.on_accept,
                on_flush: self.on_flush,
                state: Mutex::new(QueueState::new()),
                seq: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }
}

impl BatchQueueBuilder<Value> {
    /// Dedup JSON payloads by `field`, when present and truthy.
    pub fn dedup_field(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.dedup_key(move |payload: &Value| key::truthy_field(payload, &field))
    }
}
