use crate::error::Result;
use crate::types::{
    ChatId, EditCaptionOptions, EditReplyMarkupOptions, EditResult, EditTextOptions, MediaKind,
    Message, MessageId, SendMediaOptions, SendTextOptions,
};
use async_trait::async_trait;

/// Outbound operations of the messaging platform.
///
/// Edits take an optional chat because inline messages are addressed by
/// `inline_message_id` alone.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: &SendTextOptions,
    ) -> Result<Message>;

    async fn send_media(
        &self,
        chat_id: &ChatId,
        kind: MediaKind,
        media: &str,
        options: &SendMediaOptions,
    ) -> Result<Message>;

    async fn edit_message_text(
        &self,
        chat_id: Option<&ChatId>,
        text: &str,
        options: &EditTextOptions,
    ) -> Result<EditResult>;

    async fn edit_message_caption(
        &self,
        chat_id: Option<&ChatId>,
        caption: Option<&str>,
        options: &EditCaptionOptions,
    ) -> Result<EditResult>;

    async fn edit_message_reply_markup(
        &self,
        chat_id: Option<&ChatId>,
        options: &EditReplyMarkupOptions,
    ) -> Result<EditResult>;

    async fn delete_message(&self, chat_id: &ChatId, message_id: MessageId) -> Result<bool>;
}
