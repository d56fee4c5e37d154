//! Producer-side call surface.
//!
//! Application code sends, edits and deletes through a [`Dispatcher`]
//! instead of the platform client. By default every call is serialized and
//! pushed onto the durable queue; [`DispatchMode::Direct`] runs it against
//! the platform right away for call sites that need the result, typically
//! the id of a message they will edit or delete later.

use crate::envelope::{CallOutput, Envelope, OutboundCall};
use crate::error::Result;
use crate::queue::DurableQueue;
use kb_telegram::{
    BotApi, ChatId, EditCaptionOptions, EditReplyMarkupOptions, EditTextOptions, MediaKind,
    MessageId, SendMediaOptions, SendTextOptions,
};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    #[default]
    Queued,
    Direct,
}

/// Result of a dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Pushed onto the queue; the worker will deliver it later.
    Queued,
    /// Executed synchronously; carries what the platform returned.
    Sent(CallOutput),
}

impl Delivery {
    pub fn into_output(self) -> Option<CallOutput> {
        match self {
            Self::Queued => None,
            Self::Sent(output) => Some(output),
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Queued => None,
            Self::Sent(output) => output.message_id(),
        }
    }
}

/// Where a validated outbound call goes.
#[async_trait::async_trait]
pub trait OutboundSink: Send + Sync {
    async fn submit(&self, call: OutboundCall) -> Result<Delivery>;
}

/// Serializes calls and appends them to the durable queue.
pub struct QueueSink {
    queue: Arc<dyn DurableQueue>,
}

impl QueueSink {
    pub fn new(queue: Arc<dyn DurableQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl OutboundSink for QueueSink {
    async fn submit(&self, call: OutboundCall) -> Result<Delivery> {
        let payload = Envelope::from_call(&call)?.encode()?;
        if let Err(e) = self.queue.push(payload).await {
            tracing::error!(
                operation = %call.operation(),
                chat_id = ?call.chat_id(),
                error = %e,
                "enqueue failed"
            );
            return Err(e.into());
        }
        tracing::debug!(operation = %call.operation(), chat_id = ?call.chat_id(), "enqueued");
        Ok(Delivery::Queued)
    }
}

/// Executes calls against the platform immediately.
pub struct DirectSink {
    api: Arc<dyn BotApi>,
}

impl DirectSink {
    pub fn new(api: Arc<dyn BotApi>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl OutboundSink for DirectSink {
    async fn submit(&self, call: OutboundCall) -> Result<Delivery> {
        let output = call.execute(self.api.as_ref()).await?;
        Ok(Delivery::Sent(output))
    }
}

/// Uniform send/edit/delete surface, one method per operation.
///
/// Each call reaches exactly one sink: one queue push in
/// [`DispatchMode::Queued`], one platform call in [`DispatchMode::Direct`].
pub struct Dispatcher {
    queued: Box<dyn OutboundSink>,
    direct: Box<dyn OutboundSink>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn DurableQueue>, api: Arc<dyn BotApi>) -> Self {
        Self::with_sinks(Box::new(QueueSink::new(queue)), Box::new(DirectSink::new(api)))
    }

    pub fn with_sinks(queued: Box<dyn OutboundSink>, direct: Box<dyn OutboundSink>) -> Self {
        Self { queued, direct }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(operation = %call.operation(), mode = ?mode))]
    pub async fn dispatch(&self, call: OutboundCall, mode: DispatchMode) -> Result<Delivery> {
        call.validate()?;
        match mode {
            DispatchMode::Queued => self.queued.submit(call).await,
            DispatchMode::Direct => self.direct.submit(call).await,
        }
    }

    /// Dispatches a call described by name, e.g. from a dynamic call site.
    pub async fn dispatch_parts(
        &self,
        method: &str,
        chat_id: Option<ChatId>,
        content: Option<String>,
        args: Map<String, Value>,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::from_parts(method, chat_id, content, args)?;
        self.dispatch(call, mode).await
    }

    pub async fn send_text(
        &self,
        chat_id: impl Into<ChatId>,
        text: impl Into<String>,
        options: SendTextOptions,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::SendText {
            chat_id: chat_id.into(),
            text: text.into(),
            options,
        };
        self.dispatch(call, mode).await
    }

    pub async fn send_media(
        &self,
        chat_id: impl Into<ChatId>,
        kind: MediaKind,
        media: impl Into<String>,
        options: SendMediaOptions,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::SendMedia {
            chat_id: chat_id.into(),
            kind,
            media: media.into(),
            options,
        };
        self.dispatch(call, mode).await
    }

    pub async fn edit_text(
        &self,
        chat_id: Option<ChatId>,
        text: impl Into<String>,
        options: EditTextOptions,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::EditText {
            chat_id,
            text: text.into(),
            options,
        };
        self.dispatch(call, mode).await
    }

    pub async fn edit_media_caption(
        &self,
        chat_id: Option<ChatId>,
        caption: Option<String>,
        options: EditCaptionOptions,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::EditMediaCaption {
            chat_id,
            caption,
            options,
        };
        self.dispatch(call, mode).await
    }

    pub async fn edit_reply_controls(
        &self,
        chat_id: Option<ChatId>,
        options: EditReplyMarkupOptions,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::EditReplyControls { chat_id, options };
        self.dispatch(call, mode).await
    }

    pub async fn delete(
        &self,
        chat_id: impl Into<ChatId>,
        message_id: impl Into<MessageId>,
        mode: DispatchMode,
    ) -> Result<Delivery> {
        let call = OutboundCall::Delete {
            chat_id: chat_id.into(),
            message_id: message_id.into(),
        };
        self.dispatch(call, mode).await
    }
}
