//! Fallbacks for platform failures with a known, safe degraded form.
//!
//! | operation                  | failure                  | action                           |
//! |----------------------------|--------------------------|----------------------------------|
//! | `send_text`                | entities fail to parse   | resend once without `parse_mode` |
//! | `send_media`               | invalid file reference   | send the caption as plain text   |
//! | edits and `delete`         | target message is gone   | drop                             |
//!
//! Anything else is dropped as unrecognized. There is no generic retry.

use crate::envelope::OutboundCall;
use kb_telegram::{FailureKind, SendTextOptions, TelegramError};
use std::fmt;

pub const DEFAULT_MEDIA_UNAVAILABLE_NOTICE: &str =
    "⚠️ This media file is no longer available or is invalid.";

#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Execute this replacement call once, synchronously.
    Fallback(OutboundCall),
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Edit or delete target no longer exists.
    TargetGone,
    /// Edit would not change anything.
    NotModified,
    /// Chat is gone or the bot lost access.
    ChatUnavailable,
    /// The replacement call failed as well.
    FallbackFailed,
    Unrecognized,
}

impl DropReason {
    /// Whether dropping for this reason is expected rather than an error.
    pub fn is_benign(self) -> bool {
        matches!(self, Self::NotModified)
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TargetGone => "target_gone",
            Self::NotModified => "not_modified",
            Self::ChatUnavailable => "chat_unavailable",
            Self::FallbackFailed => "fallback_failed",
            Self::Unrecognized => "unrecognized",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    media_unavailable_notice: String,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_UNAVAILABLE_NOTICE)
    }
}

impl RecoveryPolicy {
    /// `media_unavailable_notice` is sent in place of media that has no caption.
    pub fn new(media_unavailable_notice: impl Into<String>) -> Self {
        Self {
            media_unavailable_notice: media_unavailable_notice.into(),
        }
    }

    pub fn plan(&self, call: &OutboundCall, error: &TelegramError) -> Recovery {
        let kind = error.kind();
        match (call, kind) {
            (
                OutboundCall::SendText {
                    chat_id,
                    text,
                    options,
                },
                FailureKind::EntityParse,
            ) if options.parse_mode.is_some() => Recovery::Fallback(OutboundCall::SendText {
                chat_id: chat_id.clone(),
                text: text.clone(),
                options: SendTextOptions {
                    parse_mode: None,
                    ..options.clone()
                },
            }),
            (
                OutboundCall::SendMedia {
                    chat_id, options, ..
                },
                FailureKind::InvalidFileReference,
            ) => {
                let text = options
                    .caption
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| self.media_unavailable_notice.clone());
                Recovery::Fallback(OutboundCall::SendText {
                    chat_id: chat_id.clone(),
                    text,
                    options: SendTextOptions {
                        reply_to_message_id: options.reply_to_message_id,
                        message_thread_id: options.message_thread_id,
                        disable_notification: options.disable_notification,
                        protect_content: options.protect_content,
                        ..Default::default()
                    },
                })
            }
            (
                OutboundCall::EditText { .. }
                | OutboundCall::EditMediaCaption { .. }
                | OutboundCall::EditReplyControls { .. }
                | OutboundCall::Delete { .. },
                FailureKind::TargetMissing,
            ) => Recovery::Drop(DropReason::TargetGone),
            (_, FailureKind::NotModified) if call.operation().is_edit() => {
                Recovery::Drop(DropReason::NotModified)
            }
            (_, FailureKind::ChatUnavailable) => Recovery::Drop(DropReason::ChatUnavailable),
            _ => Recovery::Drop(DropReason::Unrecognized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_telegram::{
        ChatId, EditCaptionOptions, EditReplyMarkupOptions, EditTextOptions,
        InlineKeyboardButton, InlineKeyboardMarkup, MediaKind, MessageId, MessageRef, ParseMode,
        SendMediaOptions,
    };

    fn parse_error() -> TelegramError {
        TelegramError::api(
            400,
            "Bad Request: can't parse entities: Can't find end of the entity starting at byte offset 12",
        )
    }

    fn bad_file() -> TelegramError {
        TelegramError::api(400, "Bad Request: wrong file identifier/HTTP URL specified")
    }

    fn html_text() -> OutboundCall {
        OutboundCall::SendText {
            chat_id: ChatId::from(7_i64),
            text: "<b>Dune".to_string(),
            options: SendTextOptions {
                parse_mode: Some(ParseMode::Html),
                reply_markup: Some(
                    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
                        "More", "more:1",
                    )]])
                    .into(),
                ),
                ..Default::default()
            },
        }
    }

    fn video(caption: Option<&str>) -> OutboundCall {
        OutboundCall::SendMedia {
            chat_id: ChatId::from(7_i64),
            kind: MediaKind::Video,
            media: "BAACAgIAAxkBAAIC-stale".to_string(),
            options: SendMediaOptions {
                caption: caption.map(str::to_string),
                parse_mode: Some(ParseMode::Html),
                reply_markup: Some(InlineKeyboardMarkup::new(vec![]).into()),
                reply_to_message_id: Some(MessageId(3)),
                ..Default::default()
            },
        }
    }

    #[test]
    fn parse_failure_resends_without_formatting() {
        let Recovery::Fallback(fallback) = RecoveryPolicy::default().plan(&html_text(), &parse_error())
        else {
            panic!("expected fallback");
        };
        let OutboundCall::SendText { text, options, .. } = fallback else {
            panic!("fallback must be a text send");
        };
        assert_eq!(text, "<b>Dune");
        assert_eq!(options.parse_mode, None);
        assert!(options.reply_markup.is_some(), "controls survive a parse fallback");
    }

    #[test]
    fn parse_failure_without_parse_mode_is_not_retried() {
        let call = OutboundCall::SendText {
            chat_id: ChatId::from(7_i64),
            text: "plain".to_string(),
            options: SendTextOptions::default(),
        };
        assert_eq!(
            RecoveryPolicy::default().plan(&call, &parse_error()),
            Recovery::Drop(DropReason::Unrecognized)
        );
    }

    #[test]
    fn stale_media_becomes_plain_caption_text() {
        let plan = RecoveryPolicy::default().plan(&video(Some("Movie info")), &bad_file());
        assert_eq!(
            plan,
            Recovery::Fallback(OutboundCall::SendText {
                chat_id: ChatId::from(7_i64),
                text: "Movie info".to_string(),
                options: SendTextOptions {
                    reply_to_message_id: Some(MessageId(3)),
                    ..Default::default()
                },
            })
        );
    }

    #[test]
    fn stale_media_without_caption_sends_the_notice() {
        let policy = RecoveryPolicy::new("media gone");
        let Recovery::Fallback(OutboundCall::SendText { text, .. }) =
            policy.plan(&video(None), &bad_file())
        else {
            panic!("expected text fallback");
        };
        assert_eq!(text, "media gone");
    }

    #[test]
    fn missing_edit_target_is_dropped() {
        let edit = OutboundCall::EditText {
            chat_id: Some(ChatId::from(7_i64)),
            text: "new".to_string(),
            options: EditTextOptions {
                target: MessageRef::message(9_i64),
                ..Default::default()
            },
        };
        let gone = TelegramError::api(400, "Bad Request: message to edit not found");
        assert_eq!(
            RecoveryPolicy::default().plan(&edit, &gone),
            Recovery::Drop(DropReason::TargetGone)
        );

        let unchanged = TelegramError::api(400, "Bad Request: message is not modified");
        assert_eq!(
            RecoveryPolicy::default().plan(&edit, &unchanged),
            Recovery::Drop(DropReason::NotModified)
        );
    }

    #[test]
    fn every_edit_and_delete_drops_a_gone_target() {
        let policy = RecoveryPolicy::default();
        let caption = OutboundCall::EditMediaCaption {
            chat_id: Some(ChatId::from(7_i64)),
            caption: Some("New caption".to_string()),
            options: EditCaptionOptions {
                target: MessageRef::message(9_i64),
                ..Default::default()
            },
        };
        let controls = OutboundCall::EditReplyControls {
            chat_id: None,
            options: EditReplyMarkupOptions {
                target: MessageRef::inline("BAAAAJ-inline"),
                reply_markup: None,
            },
        };
        let edit_gone = TelegramError::api(400, "Bad Request: message to edit not found");
        assert_eq!(
            policy.plan(&caption, &edit_gone),
            Recovery::Drop(DropReason::TargetGone)
        );
        assert_eq!(
            policy.plan(&controls, &edit_gone),
            Recovery::Drop(DropReason::TargetGone)
        );

        let delete = OutboundCall::Delete {
            chat_id: ChatId::from(7_i64),
            message_id: MessageId(9),
        };
        let delete_gone = TelegramError::api(400, "Bad Request: message to delete not found");
        assert_eq!(
            policy.plan(&delete, &delete_gone),
            Recovery::Drop(DropReason::TargetGone)
        );
    }

    #[test]
    fn failures_outside_the_table_are_unrecognized() {
        let policy = RecoveryPolicy::default();
        let server = TelegramError::api(500, "Internal Server Error");
        assert_eq!(
            policy.plan(&html_text(), &server),
            Recovery::Drop(DropReason::Unrecognized)
        );
        // A parse error on media is not the media policy's signature.
        assert_eq!(
            policy.plan(&video(Some("x")), &parse_error()),
            Recovery::Drop(DropReason::Unrecognized)
        );
        let blocked = TelegramError::api(403, "Forbidden: bot was blocked by the user");
        assert_eq!(
            policy.plan(&html_text(), &blocked),
            Recovery::Drop(DropReason::ChatUnavailable)
        );
    }
}
