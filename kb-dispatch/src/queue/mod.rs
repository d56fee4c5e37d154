//! Durable queue between producers and the delivery worker.
//!
//! A single named list: producers append, the one worker removes from the
//! head. Items are encoded envelopes; the queue never inspects them.

mod lock;
mod memory;
mod redis_queue;

pub use lock::{ConsumerLock, LeaseRecord};
pub use memory::InMemoryQueue;
pub use redis_queue::{DEFAULT_QUEUE_NAME, DEFAULT_REDIS_URL, RedisQueue, RedisQueueConfig};

use crate::error::QueueResult;
use std::time::Duration;

#[async_trait::async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append an item at the tail.
    async fn push(&self, payload: String) -> QueueResult<()>;

    /// Remove and return the head, waiting up to `timeout` when empty.
    ///
    /// Removal is destructive: an item handed out here is gone from the
    /// queue whether or not the caller finishes with it.
    async fn pop(&self, timeout: Duration) -> QueueResult<Option<String>>;

    /// Number of items waiting.
    async fn len(&self) -> QueueResult<u64>;

    async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }
}
