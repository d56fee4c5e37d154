//! Queue wire format for outbound actions.
//!
//! An [`Envelope`] is one JSON object with exactly four keys: `chat_id`,
//! `method`, `content` and `args`. `args` holds the call's options as plain
//! JSON: enums as their scalar names, keyboards as nested arrays, unset
//! options left out so the platform default applies.

use crate::error::{DispatchError, Result};
use kb_telegram::{
    BotApi, ChatId, DeleteOptions, EditCaptionOptions, EditReplyMarkupOptions, EditResult,
    EditTextOptions, MediaKind, Message, MessageId, MessageRef, SendMediaOptions,
    SendTextOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

const MEDIA_KIND_ARG: &str = "media_kind";
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Operation {
    SendText,
    SendMedia,
    EditText,
    EditMediaCaption,
    EditReplyControls,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::SendText,
        Operation::SendMedia,
        Operation::EditText,
        Operation::EditMediaCaption,
        Operation::EditReplyControls,
        Operation::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendText => "send_text",
            Self::SendMedia => "send_media",
            Self::EditText => "edit_text",
            Self::EditMediaCaption => "edit_media_caption",
            Self::EditReplyControls => "edit_reply_controls",
            Self::Delete => "delete",
        }
    }

    pub fn is_edit(self) -> bool {
        matches!(
            self,
            Self::EditText | Self::EditMediaCaption | Self::EditReplyControls
        )
    }
}

impl FromStr for Operation {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        // Platform method names are what older producers wrote to the queue.
        match s {
            "send_text" | "send_message" => Ok(Self::SendText),
            "send_media" | "send_video" => Ok(Self::SendMedia),
            "edit_text" | "edit_message_text" => Ok(Self::EditText),
            "edit_media_caption" | "edit_message_caption" => Ok(Self::EditMediaCaption),
            "edit_reply_controls" | "edit_message_reply_markup" => Ok(Self::EditReplyControls),
            "delete" | "delete_message" => Ok(Self::Delete),
            other => Err(DispatchError::UnsupportedOperation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Operation {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Operation> for &'static str {
    fn from(value: Operation) -> Self {
        value.as_str()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound action in typed, in-process form.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCall {
    SendText {
        chat_id: ChatId,
        text: String,
        options: SendTextOptions,
    },
    SendMedia {
        chat_id: ChatId,
        kind: MediaKind,
        media: String,
        options: SendMediaOptions,
    },
    EditText {
        chat_id: Option<ChatId>,
        text: String,
        options: EditTextOptions,
    },
    EditMediaCaption {
        chat_id: Option<ChatId>,
        caption: Option<String>,
        options: EditCaptionOptions,
    },
    EditReplyControls {
        chat_id: Option<ChatId>,
        options: EditReplyMarkupOptions,
    },
    Delete {
        chat_id: ChatId,
        message_id: MessageId,
    },
}

impl OutboundCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::SendText { .. } => Operation::SendText,
            Self::SendMedia { .. } => Operation::SendMedia,
            Self::EditText { .. } => Operation::EditText,
            Self::EditMediaCaption { .. } => Operation::EditMediaCaption,
            Self::EditReplyControls { .. } => Operation::EditReplyControls,
            Self::Delete { .. } => Operation::Delete,
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Self::SendText { chat_id, .. }
            | Self::SendMedia { chat_id, .. }
            | Self::Delete { chat_id, .. } => Some(chat_id),
            Self::EditText { chat_id, .. }
            | Self::EditMediaCaption { chat_id, .. }
            | Self::EditReplyControls { chat_id, .. } => chat_id.as_ref(),
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::SendText { text, .. } | Self::EditText { text, .. } => Some(text),
            Self::SendMedia { media, .. } => Some(media),
            Self::EditMediaCaption { caption, .. } => caption.as_deref(),
            Self::EditReplyControls { .. } | Self::Delete { .. } => None,
        }
    }

    /// Content cut down for log lines.
    pub fn preview(&self) -> String {
        self.content()
            .map(|c| c.chars().take(PREVIEW_CHARS).collect())
            .unwrap_or_default()
    }

    /// Rejects calls the platform can never accept.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SendText { text, .. } => require_content(Operation::SendText, text),
            Self::SendMedia { media, .. } => require_content(Operation::SendMedia, media),
            Self::EditText {
                chat_id,
                text,
                options,
            } => {
                require_content(Operation::EditText, text)?;
                require_edit_target(Operation::EditText, chat_id.as_ref(), &options.target)
            }
            Self::EditMediaCaption {
                chat_id, options, ..
            } => require_edit_target(
                Operation::EditMediaCaption,
                chat_id.as_ref(),
                &options.target,
            ),
            Self::EditReplyControls { chat_id, options } => require_edit_target(
                Operation::EditReplyControls,
                chat_id.as_ref(),
                &options.target,
            ),
            Self::Delete { .. } => Ok(()),
        }
    }

    /// Builds a call from loosely-typed parts, the way a dynamic call site or
    /// a queued envelope describes it.
    pub fn from_parts(
        method: &str,
        chat_id: Option<ChatId>,
        content: Option<String>,
        args: Map<String, Value>,
    ) -> Result<Self> {
        let operation = method.parse()?;
        let call = Self::from_operation(operation, chat_id, content, args)?;
        call.validate()?;
        Ok(call)
    }

    fn from_operation(
        operation: Operation,
        chat_id: Option<ChatId>,
        content: Option<String>,
        mut args: Map<String, Value>,
    ) -> Result<Self> {
        let call = match operation {
            Operation::SendText => Self::SendText {
                chat_id: require_chat(operation, chat_id)?,
                text: content.unwrap_or_default(),
                options: options_from_args(operation, args)?,
            },
            Operation::SendMedia => {
                let kind = match args.remove(MEDIA_KIND_ARG) {
                    Some(kind) => serde_json::from_value(kind).map_err(|e| {
                        DispatchError::InvalidCall(format!("{operation} {MEDIA_KIND_ARG}: {e}"))
                    })?,
                    None => MediaKind::default(),
                };
                Self::SendMedia {
                    chat_id: require_chat(operation, chat_id)?,
                    kind,
                    media: content.unwrap_or_default(),
                    options: options_from_args(operation, args)?,
                }
            }
            Operation::EditText => Self::EditText {
                chat_id,
                text: content.unwrap_or_default(),
                options: options_from_args(operation, args)?,
            },
            Operation::EditMediaCaption => Self::EditMediaCaption {
                chat_id,
                caption: content,
                options: options_from_args(operation, args)?,
            },
            Operation::EditReplyControls => Self::EditReplyControls {
                chat_id,
                options: options_from_args(operation, args)?,
            },
            Operation::Delete => {
                let DeleteOptions { message_id } =
                    options_from_args::<DeleteOptions>(operation, args)?;
                Self::Delete {
                    chat_id: require_chat(operation, chat_id)?,
                    message_id,
                }
            }
        };
        Ok(call)
    }

    /// Replays the call against the platform.
    pub async fn execute(&self, api: &dyn BotApi) -> kb_telegram::Result<CallOutput> {
        match self {
            Self::SendText {
                chat_id,
                text,
                options,
            } => api
                .send_message(chat_id, text, options)
                .await
                .map(CallOutput::Sent),
            Self::SendMedia {
                chat_id,
                kind,
                media,
                options,
            } => api
                .send_media(chat_id, *kind, media, options)
                .await
                .map(CallOutput::Sent),
            Self::EditText {
                chat_id,
                text,
                options,
            } => api
                .edit_message_text(chat_id.as_ref(), text, options)
                .await
                .map(CallOutput::Edited),
            Self::EditMediaCaption {
                chat_id,
                caption,
                options,
            } => api
                .edit_message_caption(chat_id.as_ref(), caption.as_deref(), options)
                .await
                .map(CallOutput::Edited),
            Self::EditReplyControls { chat_id, options } => api
                .edit_message_reply_markup(chat_id.as_ref(), options)
                .await
                .map(CallOutput::Edited),
            Self::Delete {
                chat_id,
                message_id,
            } => api
                .delete_message(chat_id, *message_id)
                .await
                .map(CallOutput::Deleted),
        }
    }
}

/// What the platform returned for a call executed synchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    Sent(Message),
    Edited(EditResult),
    Deleted(bool),
}

impl CallOutput {
    /// Platform-assigned id of the created or edited message, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Sent(message) | Self::Edited(EditResult::Message(message)) => {
                Some(message.message_id)
            }
            Self::Edited(EditResult::Inline(_)) | Self::Deleted(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub chat_id: Option<ChatId>,
    pub method: Operation,
    pub content: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Envelope {
    /// Serializes a call into its wire form. Fails only for invalid calls.
    pub fn from_call(call: &OutboundCall) -> Result<Self> {
        call.validate()?;
        let args = match call {
            OutboundCall::SendText { options, .. } => options_to_args(options)?,
            OutboundCall::SendMedia { kind, options, .. } => {
                let mut args = options_to_args(options)?;
                if !kind.is_default() {
                    args.insert(MEDIA_KIND_ARG.to_string(), serde_json::to_value(kind)?);
                }
                args
            }
            OutboundCall::EditText { options, .. } => options_to_args(options)?,
            OutboundCall::EditMediaCaption { options, .. } => options_to_args(options)?,
            OutboundCall::EditReplyControls { options, .. } => options_to_args(options)?,
            OutboundCall::Delete { message_id, .. } => options_to_args(&DeleteOptions {
                message_id: *message_id,
            })?,
        };
        Ok(Self {
            chat_id: call.chat_id().cloned(),
            method: call.operation(),
            content: call.content().map(str::to_string),
            args,
        })
    }

    /// Rebuilds the call arguments in the shape the platform client takes.
    pub fn into_call(self) -> Result<OutboundCall> {
        let call = OutboundCall::from_operation(self.method, self.chat_id, self.content, self.args)?;
        call.validate()?;
        Ok(call)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn options_to_args(options: &impl Serialize) -> Result<Map<String, Value>> {
    match serde_json::to_value(options)? {
        Value::Object(map) => Ok(map),
        other => Err(DispatchError::InvalidCall(format!(
            "options must serialize to an object, got {other}"
        ))),
    }
}

/// Decodes `args` into the operation's options. Keys the options do not
/// carry are rejected, so nothing is silently lost on replay; a `null`
/// value means unset and is accepted.
fn options_from_args<T: Serialize + DeserializeOwned>(
    operation: Operation,
    args: Map<String, Value>,
) -> Result<T> {
    let options: T = serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| DispatchError::InvalidCall(format!("{operation} options: {e}")))?;
    let kept = options_to_args(&options)?;
    let unknown: Vec<&str> = args
        .iter()
        .filter(|(key, value)| !value.is_null() && !kept.contains_key(key.as_str()))
        .map(|(key, _)| key.as_str())
        .collect();
    if !unknown.is_empty() {
        return Err(DispatchError::InvalidCall(format!(
            "{operation} does not accept option(s): {}",
            unknown.join(", ")
        )));
    }
    Ok(options)
}

fn require_chat(operation: Operation, chat_id: Option<ChatId>) -> Result<ChatId> {
    chat_id.ok_or_else(|| DispatchError::InvalidCall(format!("{operation} requires chat_id")))
}

fn require_content(operation: Operation, content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(DispatchError::InvalidCall(format!(
            "{operation} requires non-empty content"
        )));
    }
    Ok(())
}

fn require_edit_target(
    operation: Operation,
    chat_id: Option<&ChatId>,
    target: &MessageRef,
) -> Result<()> {
    match (chat_id, &target.message_id, &target.inline_message_id) {
        (Some(_), Some(_), None) | (None, None, Some(_)) => Ok(()),
        _ => Err(DispatchError::InvalidCall(format!(
            "{operation} needs chat_id with message_id, or inline_message_id alone"
        ))),
    }
}
