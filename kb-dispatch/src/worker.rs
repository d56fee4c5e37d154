//! Delivery worker: drains the queue and replays each envelope against the
//! platform, strictly one at a time.
//!
//! ```text
//! Idle -> Popping -> Dispatching -> Idle
//!                         \-> Recovering -> Idle
//! ```
//!
//! Pops are destructive and there is no acknowledgement: a job popped by a
//! worker that dies before finishing it is lost. Delivery is at-most-once.
//! Exactly one worker may consume a queue; see [`crate::queue::ConsumerLock`].

use crate::envelope::{Envelope, OutboundCall};
use crate::error::QueueResult;
use crate::queue::DurableQueue;
use crate::recovery::{DropReason, Recovery, RecoveryPolicy};
use kb_telegram::BotApi;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const RAW_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Longest a single pop waits on an empty queue.
    pub pop_timeout: Duration,
    /// Pause after a failed pop before trying again.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pop_timeout: DEFAULT_POP_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Popping,
    Dispatching,
    Recovering,
}

/// How one envelope was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// The first attempt failed and its fallback succeeded.
    Recovered,
    Dropped(DropReason),
    /// Payload could not be decoded into a call.
    Malformed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub delivered: u64,
    pub recovered: u64,
    pub dropped: u64,
    pub malformed: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Recovered => self.recovered += 1,
            Outcome::Dropped(_) => self.dropped += 1,
            Outcome::Malformed => self.malformed += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.delivered + self.recovered + self.dropped + self.malformed
    }
}

pub struct DeliveryWorker {
    queue: Arc<dyn DurableQueue>,
    api: Arc<dyn BotApi>,
    policy: RecoveryPolicy,
    config: WorkerConfig,
    state: WorkerState,
}

impl DeliveryWorker {
    pub fn new(queue: Arc<dyn DurableQueue>, api: Arc<dyn BotApi>) -> Self {
        Self {
            queue,
            api,
            policy: RecoveryPolicy::default(),
            config: WorkerConfig::default(),
            state: WorkerState::Idle,
        }
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs until `shutdown` fires and returns the totals.
    ///
    /// Shutdown is observed between pops only. Abandoning a blocked pop could
    /// drop an item the store already handed out.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) -> WorkerReport {
        tracing::info!(
            pop_timeout_ms = self.config.pop_timeout.as_millis() as u64,
            "delivery worker started"
        );
        let mut report = WorkerReport::default();

        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(outcome)) => report.record(outcome),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "queue pop failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(
            delivered = report.delivered,
            recovered = report.recovered,
            dropped = report.dropped,
            malformed = report.malformed,
            "delivery worker stopped"
        );
        report
    }

    /// Pops at most one envelope and settles it. `None` means the pop timed
    /// out on an empty queue.
    pub async fn process_next(&mut self) -> QueueResult<Option<Outcome>> {
        self.transition(WorkerState::Popping);
        let raw = match self.queue.pop(self.config.pop_timeout).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.transition(WorkerState::Idle);
                return Ok(None);
            }
            Err(e) => {
                self.transition(WorkerState::Idle);
                return Err(e);
            }
        };
        let outcome = self.handle(&raw).await;
        self.transition(WorkerState::Idle);
        Ok(Some(outcome))
    }

    async fn handle(&mut self, raw: &str) -> Outcome {
        let call = match Envelope::decode(raw).and_then(Envelope::into_call) {
            Ok(call) => call,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload = %raw.chars().take(RAW_PREVIEW_CHARS).collect::<String>(),
                    "malformed envelope dropped"
                );
                return Outcome::Malformed;
            }
        };

        self.transition(WorkerState::Dispatching);
        let error = match call.execute(self.api.as_ref()).await {
            Ok(_) => {
                tracing::info!(
                    operation = %call.operation(),
                    chat_id = %chat_label(&call),
                    "delivered"
                );
                return Outcome::Delivered;
            }
            Err(e) => e,
        };

        self.transition(WorkerState::Recovering);
        match self.policy.plan(&call, &error) {
            Recovery::Fallback(fallback) => match fallback.execute(self.api.as_ref()).await {
                Ok(_) => {
                    tracing::warn!(
                        operation = %call.operation(),
                        chat_id = %chat_label(&call),
                        fallback = %fallback.operation(),
                        error = %error,
                        "delivered via fallback"
                    );
                    Outcome::Recovered
                }
                Err(fallback_error) => {
                    tracing::error!(
                        operation = %call.operation(),
                        chat_id = %chat_label(&call),
                        content = %call.preview(),
                        error = %error,
                        fallback_error = %fallback_error,
                        "fallback failed; envelope dropped"
                    );
                    Outcome::Dropped(DropReason::FallbackFailed)
                }
            },
            Recovery::Drop(reason) if reason.is_benign() => {
                tracing::debug!(
                    operation = %call.operation(),
                    chat_id = %chat_label(&call),
                    reason = %reason,
                    "nothing to deliver; envelope dropped"
                );
                Outcome::Dropped(reason)
            }
            Recovery::Drop(reason) => {
                tracing::error!(
                    operation = %call.operation(),
                    chat_id = %chat_label(&call),
                    content = %call.preview(),
                    error = %error,
                    reason = %reason,
                    "delivery failed; envelope dropped"
                );
                Outcome::Dropped(reason)
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }
}

fn chat_label(call: &OutboundCall) -> String {
    call.chat_id()
        .map(ToString::to_string)
        .unwrap_or_else(|| "inline".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchMode, Dispatcher};
    use crate::queue::InMemoryQueue;
    use crate::testing::RecordingBot;
    use kb_telegram::{
        ChatId, EditTextOptions, MediaKind, MessageRef, ParseMode, SendMediaOptions,
        SendTextOptions, TelegramError,
    };

    struct Harness {
        queue: Arc<InMemoryQueue>,
        bot: Arc<RecordingBot>,
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            let queue = Arc::new(InMemoryQueue::new());
            let bot = Arc::new(RecordingBot::new());
            let dispatcher = Dispatcher::new(queue.clone(), bot.clone());
            Self {
                queue,
                bot,
                dispatcher,
            }
        }

        fn worker(&self) -> DeliveryWorker {
            DeliveryWorker::new(self.queue.clone(), self.bot.clone()).with_config(WorkerConfig {
                pop_timeout: Duration::from_millis(10),
                error_backoff: Duration::from_millis(1),
            })
        }

        async fn send_text(&self, chat: &str, text: &str) {
            self.dispatcher
                .send_text(chat, text, SendTextOptions::default(), DispatchMode::Queued)
                .await
                .expect("enqueue succeeds");
        }
    }

    async fn drain(worker: &mut DeliveryWorker) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = worker.process_next().await.expect("pop succeeds") {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn two_texts_for_one_chat_arrive_in_order() {
        let h = Harness::new();
        h.send_text("C1", "hello").await;
        h.send_text("C1", "world").await;

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Delivered, Outcome::Delivered]);
        let delivered: Vec<_> = h
            .bot
            .successful()
            .into_iter()
            .map(|c| (c.method, c.chat_id, c.content))
            .collect();
        assert_eq!(
            delivered,
            [
                ("send_message", Some(ChatId::from("C1")), Some("hello".to_string())),
                ("send_message", Some(ChatId::from("C1")), Some("world".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn consumption_order_matches_enqueue_order() {
        let h = Harness::new();
        for i in 0..25 {
            h.send_text("@reviews", &format!("review {i}")).await;
        }

        drain(&mut h.worker()).await;

        let contents: Vec<String> = h
            .bot
            .successful()
            .into_iter()
            .filter_map(|c| c.content)
            .collect();
        let expected: Vec<String> = (0..25).map(|i| format!("review {i}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn parse_error_is_retried_once_as_plain_text() {
        let h = Harness::new();
        h.bot.fail_next(
            "send_message",
            TelegramError::api(400, "Bad Request: can't parse entities: unclosed tag"),
        );
        h.dispatcher
            .send_text(
                "C1",
                "<b>Dune",
                SendTextOptions {
                    parse_mode: Some(ParseMode::Html),
                    ..Default::default()
                },
                DispatchMode::Queued,
            )
            .await
            .unwrap();

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Recovered]);
        let calls = h.bot.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].succeeded);
        assert_eq!(calls[0].options["parse_mode"], "HTML");
        assert!(calls[1].succeeded);
        assert_eq!(calls[1].method, "send_message");
        assert_eq!(calls[1].content.as_deref(), Some("<b>Dune"));
        assert!(calls[1].options.get("parse_mode").is_none());
    }

    #[tokio::test]
    async fn invalid_media_falls_back_to_caption_text() {
        let h = Harness::new();
        h.bot.fail_next(
            "send_media",
            TelegramError::api(400, "Bad Request: wrong file identifier/HTTP URL specified"),
        );
        h.dispatcher
            .send_media(
                "C1",
                MediaKind::Video,
                "BAACAgIAAxkBAAIC-invalid",
                SendMediaOptions {
                    caption: Some("Movie info".to_string()),
                    parse_mode: Some(ParseMode::Html),
                    ..Default::default()
                },
                DispatchMode::Queued,
            )
            .await
            .unwrap();

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Recovered]);
        let delivered = h.bot.successful();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].method, "send_message");
        assert_eq!(delivered[0].content.as_deref(), Some("Movie info"));
        assert!(delivered[0].options.get("parse_mode").is_none());
        let media_attempts = h
            .bot
            .calls()
            .iter()
            .filter(|c| c.method == "send_media")
            .count();
        assert_eq!(media_attempts, 1, "media is not retried");
    }

    #[tokio::test]
    async fn missing_edit_target_is_logged_and_dropped_without_fallback() {
        let h = Harness::new();
        h.bot.fail_next(
            "edit_message_text",
            TelegramError::api(400, "Bad Request: message to edit not found"),
        );
        h.dispatcher
            .edit_text(
                Some(ChatId::from("C1")),
                "Page 2",
                EditTextOptions {
                    target: MessageRef::message(kb_telegram::MessageId(41)),
                    ..Default::default()
                },
                DispatchMode::Queued,
            )
            .await
            .unwrap();

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Dropped(DropReason::TargetGone)]);
        assert_eq!(h.bot.calls().len(), 1);
        assert!(h.queue.is_empty().await.unwrap(), "never re-enqueued");
    }

    #[tokio::test]
    async fn failed_fallback_drops_the_envelope() {
        let h = Harness::new();
        h.bot.fail_next(
            "send_message",
            TelegramError::api(400, "Bad Request: can't parse entities"),
        );
        h.bot.fail_next(
            "send_message",
            TelegramError::api(400, "Bad Request: message is too long"),
        );
        h.dispatcher
            .send_text(
                "C1",
                "<i>long",
                SendTextOptions {
                    parse_mode: Some(ParseMode::Html),
                    ..Default::default()
                },
                DispatchMode::Queued,
            )
            .await
            .unwrap();

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Dropped(DropReason::FallbackFailed)]);
        assert_eq!(h.bot.calls().len(), 2);
        assert!(h.bot.successful().is_empty());
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn bad_envelope_does_not_stop_the_consumer() {
        let h = Harness::new();
        h.queue.push("{not json".to_string()).await.unwrap();
        h.queue
            .push(r#"{"chat_id":1,"method":"send_photo","content":"x","args":{}}"#.to_string())
            .await
            .unwrap();
        h.send_text("C1", "still here").await;

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(
            outcomes,
            [Outcome::Malformed, Outcome::Malformed, Outcome::Delivered]
        );
        assert_eq!(h.bot.successful().len(), 1);
    }

    #[tokio::test]
    async fn envelope_with_unknown_option_is_malformed_not_replayed() {
        let h = Harness::new();
        h.queue
            .push(
                r#"{"chat_id":1,"method":"send_text","content":"<b>x</b>","args":{"parse_mod":"HTML"}}"#
                    .to_string(),
            )
            .await
            .unwrap();

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Malformed]);
        assert!(h.bot.calls().is_empty(), "nothing sent with the option dropped");
    }

    #[tokio::test]
    async fn unrecognized_failure_is_dropped_not_retried() {
        let h = Harness::new();
        h.bot.fail_next(
            "send_message",
            TelegramError::api(500, "Internal Server Error"),
        );
        h.send_text("C1", "hello").await;

        let outcomes = drain(&mut h.worker()).await;

        assert_eq!(outcomes, [Outcome::Dropped(DropReason::Unrecognized)]);
        assert_eq!(h.bot.calls().len(), 1);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn job_popped_by_a_crashed_worker_is_lost() {
        let h = Harness::new();
        h.bot.stall("send_message");
        h.send_text("C1", "confirmation").await;

        let mut doomed = h.worker();
        let task = tokio::spawn(async move { doomed.process_next().await });
        h.bot.entered_stall.notified().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.bot.successful().is_empty());
        let mut restarted = h.worker();
        assert_eq!(restarted.process_next().await.unwrap(), None);
        assert!(h.bot.successful().is_empty(), "no replay after restart");
    }

    #[tokio::test]
    async fn run_drains_until_shutdown_and_reports_totals() {
        let h = Harness::new();
        h.send_text("C1", "one").await;
        h.send_text("C2", "two").await;
        h.bot.fail_next(
            "send_message",
            TelegramError::api(403, "Forbidden: bot was blocked by the user"),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(h.worker().run(shutdown.clone()));
        for _ in 0..200 {
            if h.bot.calls().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        let report = handle.await.expect("worker task joins");

        assert_eq!(
            report,
            WorkerReport {
                delivered: 1,
                recovered: 0,
                dropped: 1,
                malformed: 0,
            }
        );
        assert_eq!(report.processed(), 2);
    }

    #[tokio::test]
    async fn worker_returns_to_idle_after_each_envelope() {
        let h = Harness::new();
        h.send_text("C1", "hello").await;
        let mut worker = h.worker();
        assert_eq!(worker.state(), WorkerState::Idle);
        worker.process_next().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
    }
}
