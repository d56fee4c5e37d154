//! Scriptable `BotApi` stub shared by the unit tests.

use kb_telegram::{
    BotApi, Chat, ChatId, EditCaptionOptions, EditReplyMarkupOptions, EditResult,
    EditTextOptions, MediaKind, Message, MessageId, SendMediaOptions, SendTextOptions,
    TelegramError,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: &'static str,
    pub chat_id: Option<ChatId>,
    pub content: Option<String>,
    pub options: Value,
    pub succeeded: bool,
}

/// Records every call in order. Failures are scripted per method and used
/// up one per call; a stalled method never returns.
pub struct RecordingBot {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<&'static str, VecDeque<TelegramError>>>,
    stalled: Mutex<HashSet<&'static str>>,
    pub entered_stall: Notify,
    next_message_id: AtomicI64,
}

impl RecordingBot {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashSet::new()),
            entered_stall: Notify::new(),
            next_message_id: AtomicI64::new(100),
        }
    }

    pub fn fail_next(&self, method: &'static str, error: TelegramError) {
        self.failures
            .lock()
            .expect("failures lock")
            .entry(method)
            .or_default()
            .push_back(error);
    }

    pub fn stall(&self, method: &'static str) {
        self.stalled.lock().expect("stalled lock").insert(method);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn successful(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.succeeded).collect()
    }

    async fn record(
        &self,
        method: &'static str,
        chat_id: Option<&ChatId>,
        content: Option<&str>,
        options: Value,
    ) -> kb_telegram::Result<()> {
        let stalled = self.stalled.lock().expect("stalled lock").contains(method);
        if stalled {
            self.entered_stall.notify_one();
            std::future::pending::<()>().await;
        }

        let failure = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        self.calls.lock().expect("calls lock").push(RecordedCall {
            method,
            chat_id: chat_id.cloned(),
            content: content.map(str::to_string),
            options,
            succeeded: failure.is_none(),
        });
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn message(&self, chat_id: &ChatId, text: Option<&str>, caption: Option<&str>) -> Message {
        let id = match chat_id {
            ChatId::Id(id) => *id,
            ChatId::Username(_) => 0,
        };
        Message {
            message_id: MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)),
            chat: Chat {
                id,
                kind: "private".to_string(),
            },
            date: 0,
            text: text.map(str::to_string),
            caption: caption.map(str::to_string),
        }
    }
}

fn to_value(options: &impl serde::Serialize) -> Value {
    serde_json::to_value(options).expect("options serialize")
}

#[async_trait::async_trait]
impl BotApi for RecordingBot {
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: &SendTextOptions,
    ) -> kb_telegram::Result<Message> {
        self.record("send_message", Some(chat_id), Some(text), to_value(options))
            .await?;
        Ok(self.message(chat_id, Some(text), None))
    }

    async fn send_media(
        &self,
        chat_id: &ChatId,
        _kind: MediaKind,
        media: &str,
        options: &SendMediaOptions,
    ) -> kb_telegram::Result<Message> {
        self.record("send_media", Some(chat_id), Some(media), to_value(options))
            .await?;
        Ok(self.message(chat_id, None, options.caption.as_deref()))
    }

    async fn edit_message_text(
        &self,
        chat_id: Option<&ChatId>,
        text: &str,
        options: &EditTextOptions,
    ) -> kb_telegram::Result<EditResult> {
        self.record("edit_message_text", chat_id, Some(text), to_value(options))
            .await?;
        Ok(EditResult::Inline(true))
    }

    async fn edit_message_caption(
        &self,
        chat_id: Option<&ChatId>,
        caption: Option<&str>,
        options: &EditCaptionOptions,
    ) -> kb_telegram::Result<EditResult> {
        self.record("edit_message_caption", chat_id, caption, to_value(options))
            .await?;
        Ok(EditResult::Inline(true))
    }

    async fn edit_message_reply_markup(
        &self,
        chat_id: Option<&ChatId>,
        options: &EditReplyMarkupOptions,
    ) -> kb_telegram::Result<EditResult> {
        self.record("edit_message_reply_markup", chat_id, None, to_value(options))
            .await?;
        Ok(EditResult::Inline(true))
    }

    async fn delete_message(
        &self,
        chat_id: &ChatId,
        message_id: MessageId,
    ) -> kb_telegram::Result<bool> {
        self.record(
            "delete_message",
            Some(chat_id),
            None,
            serde_json::json!({ "message_id": message_id }),
        )
        .await?;
        Ok(true)
    }
}
