// Channel registry
//
// One queue per logical channel, torn down together. The registry only
// hands out handles; each queue still owns its state exclusively.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::queue::BatchQueue;

/// Owns one [`BatchQueue`] per named channel.
///
/// The typical wiring calls [`QueueRegistry::shutdown_all`] from the owning
/// context's teardown path, flushing every channel exactly once.
pub struct QueueRegistry<T> {
    queues: Mutex<HashMap<String, BatchQueue<T>>>,
}

impl<T: Clone + Send + 'static> QueueRegistry<T> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, channel: &str) -> Option<BatchQueue<T>> {
        self.queues.lock().get(channel).cloned()
    }

    /// Returns the channel's queue, building it on first use.
    pub fn get_or_insert_with<F>(&self, channel: &str, make: F) -> BatchQueue<T>
    where
        F: FnOnce() -> BatchQueue<T>,
    {
        let mut queues = self.queues.lock();
        queues
            .entry(channel.to_string())
            .or_insert_with(make)
            .clone()
    }

    /// Force-flushes and removes every queue.
    ///
    /// Handles returned earlier stay valid; a later `enqueue` on one of them
    /// simply starts a fresh accumulation window outside the registry.
    pub fn shutdown_all(&self) {
        let drained: Vec<(String, BatchQueue<T>)> = {
            let mut queues = self.queues.lock();
            queues.drain().collect()
        };

        for (channel, queue) in drained {
            debug!(channel = %channel, "shutting down channel queue");
            queue.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}

impl<T: Clone + Send + 'static> Default for QueueRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn channel_queue(sink: Arc<Mutex<Vec<Vec<Value>>>>) -> BatchQueue<Value> {
        BatchQueue::<Value>::builder()
            .threshold(usize::MAX)
            .dedup_field("id")
            .on_flush(move |batch| sink.lock().push(batch))
            .build()
    }

    #[test]
    fn test_handles_for_one_channel_share_state() {
        let registry = QueueRegistry::new();
        let sink = Arc::new(Mutex::new(Vec::new()));

        let first = registry.get_or_insert_with("pageviews", {
            let sink = Arc::clone(&sink);
            || channel_queue(sink)
        });
        first.enqueue(json!({"id": 1}));

        let second = registry
            .get("pageviews")
            .expect("channel registered above");
        assert_eq!(second.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shutdown_all_flushes_every_channel() {
        let registry = QueueRegistry::new();
        let sink = Arc::new(Mutex::new(Vec::new()));

        for channel in ["clicks", "pageviews"] {
            let queue = registry.get_or_insert_with(channel, {
                let sink = Arc::clone(&sink);
                || channel_queue(sink)
            });
            queue.enqueue(json!({"id": channel}));
        }

        registry.shutdown_all();
        assert!(registry.is_empty());
        assert_eq!(sink.lock().len(), 2);
    }

    #[test]
    fn test_shutdown_all_on_empty_registry_is_a_noop() {
        let registry: QueueRegistry<Value> = QueueRegistry::new();
        registry.shutdown_all();
        assert!(registry.is_empty());
    }
}
