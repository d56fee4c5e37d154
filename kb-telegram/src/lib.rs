//! Telegram Bot API client for KinoBot.
//!
//! Typed argument shapes for the outbound operations the bot performs, the
//! `BotApi` seam the dispatch queue replays against, and the HTTP
//! implementation.

mod error;
mod telegram;
mod traits;
mod types;

pub use error::{FailureKind, Result, TelegramError};
pub use telegram::{TELEGRAM_API_BASE, TelegramBot};
pub use traits::BotApi;
pub use types::{
    Chat, ChatId, DeleteOptions, EditCaptionOptions, EditReplyMarkupOptions, EditResult,
    EditTextOptions, ForceReply, InlineKeyboardButton, InlineKeyboardMarkup, InlineMessageId,
    KeyboardButton, MediaKind, Message, MessageId, MessageRef, ParseMode, ReplyKeyboardMarkup,
    ReplyKeyboardRemove, ReplyMarkup, SendMediaOptions, SendTextOptions,
};
