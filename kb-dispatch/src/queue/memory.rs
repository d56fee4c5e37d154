use crate::error::QueueResult;
use crate::queue::DurableQueue;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Process-local queue with the same FIFO and blocking-pop behaviour as the
/// Redis list. Not durable; meant for embedding and tests.
#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<VecDeque<String>>,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the waiting items, head first.
    pub async fn snapshot(&self) -> Vec<String> {
        self.items.lock().await.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl DurableQueue for InMemoryQueue {
    async fn push(&self, payload: String) -> QueueResult<()> {
        self.items.lock().await.push_back(payload);
        self.available.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.items.lock().await.pop_front() {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> QueueResult<u64> {
        Ok(self.items.lock().await.len() as u64)
    }
}
