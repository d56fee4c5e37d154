//! Outbound delivery for the Kinobot Telegram bot.
//!
//! Producers hand send/edit/delete calls to a [`Dispatcher`], which either
//! pushes them onto a durable FIFO queue or runs them directly. A single
//! [`DeliveryWorker`] drains the queue and replays each call against the
//! platform, applying a small table of recoveries for known failures.

mod dispatcher;
mod envelope;
mod error;
pub mod queue;
mod recovery;
mod worker;

#[cfg(test)]
mod testing;

pub use dispatcher::{DirectSink, Delivery, DispatchMode, Dispatcher, OutboundSink, QueueSink};
pub use envelope::{CallOutput, Envelope, Operation, OutboundCall};
pub use error::{DispatchError, QueueError, QueueResult, Result};
pub use queue::{
    ConsumerLock, DurableQueue, InMemoryQueue, LeaseRecord, RedisQueue, RedisQueueConfig,
};
pub use recovery::{DEFAULT_MEDIA_UNAVAILABLE_NOTICE, DropReason, Recovery, RecoveryPolicy};
pub use worker::{DeliveryWorker, Outcome, WorkerConfig, WorkerReport, WorkerState};
