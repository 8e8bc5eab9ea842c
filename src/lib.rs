// microbatch - time/threshold-bounded payload accumulator
//
// Payloads are deduplicated by key on acceptance, buffered in arrival order,
// and delivered to a consumer callback when the deferred timer elapses, the
// size threshold is reached, or the owning context shuts the queue down.
//
// The queue never blocks and defines no runtime error conditions: payloads
// without a usable dedup key fall back to unique synthetic keys, and missing
// callbacks default to identity/no-op.

mod config;
mod key;
mod queue;
mod registry;

pub use config::BatchConfig;
pub use key::DedupKey;
pub use queue::{BatchQueue, BatchQueueBuilder, QueueStats};
pub use registry::QueueRegistry;
