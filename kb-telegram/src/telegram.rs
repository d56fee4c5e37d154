use crate::error::{Result, TelegramError};
use crate::traits::BotApi;
use crate::types::{
    ChatId, DeleteOptions, EditCaptionOptions, EditReplyMarkupOptions, EditResult,
    EditTextOptions, MediaKind, Message, MessageId, SendMediaOptions, SendTextOptions,
};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TelegramBot {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl TelegramBot {
    pub fn new(bot_token: &str) -> Result<Self> {
        Self::with_options(bot_token, TELEGRAM_API_BASE, TELEGRAM_REQUEST_TIMEOUT)
    }

    pub fn with_options(bot_token: &str, api_base: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Url::parse(&format!("{}/bot{}/{}", self.api_base, self.bot_token, method))
            .map_err(|e| TelegramError::Http(format!("invalid api url: {e}")))
    }

    /// Calls `getMe`; used as a credentials check.
    pub async fn get_me(&self) -> Result<Value> {
        self.call("getMe", Value::Object(Map::new())).await
    }

    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        parse_response(status.as_u16(), &text)
    }
}

#[async_trait::async_trait]
impl BotApi for TelegramBot {
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: &SendTextOptions,
    ) -> Result<Message> {
        let body = request_body(Some(chat_id), Some(("text", Value::from(text))), options)?;
        self.call("sendMessage", body).await
    }

    async fn send_media(
        &self,
        chat_id: &ChatId,
        kind: MediaKind,
        media: &str,
        options: &SendMediaOptions,
    ) -> Result<Message> {
        let (method, field) = kind.api_method();
        let body = request_body(Some(chat_id), Some((field, Value::from(media))), options)?;
        self.call(method, body).await
    }

    async fn edit_message_text(
        &self,
        chat_id: Option<&ChatId>,
        text: &str,
        options: &EditTextOptions,
    ) -> Result<EditResult> {
        let body = request_body(chat_id, Some(("text", Value::from(text))), options)?;
        self.call("editMessageText", body).await
    }

    async fn edit_message_caption(
        &self,
        chat_id: Option<&ChatId>,
        caption: Option<&str>,
        options: &EditCaptionOptions,
    ) -> Result<EditResult> {
        let caption = caption.map(|c| ("caption", Value::from(c)));
        let body = request_body(chat_id, caption, options)?;
        self.call("editMessageCaption", body).await
    }

    async fn edit_message_reply_markup(
        &self,
        chat_id: Option<&ChatId>,
        options: &EditReplyMarkupOptions,
    ) -> Result<EditResult> {
        let body = request_body(chat_id, None, options)?;
        self.call("editMessageReplyMarkup", body).await
    }

    async fn delete_message(&self, chat_id: &ChatId, message_id: MessageId) -> Result<bool> {
        let body = request_body(Some(chat_id), None, &DeleteOptions { message_id })?;
        self.call("deleteMessage", body).await
    }
}

/// Merges the destination and main payload field into the serialized options.
fn request_body(
    chat_id: Option<&ChatId>,
    content: Option<(&str, Value)>,
    options: &impl Serialize,
) -> Result<Value> {
    let mut body = match serde_json::to_value(options)? {
        Value::Object(map) => map,
        other => {
            return Err(TelegramError::ResponseFormat(format!(
                "options must serialize to an object, got {other}"
            )));
        }
    };
    if let Some(chat_id) = chat_id {
        body.insert("chat_id".to_string(), serde_json::to_value(chat_id)?);
    }
    if let Some((field, value)) = content {
        body.insert(field.to_string(), value);
    }
    Ok(Value::Object(body))
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

fn parse_response<T: DeserializeOwned>(status: u16, text: &str) -> Result<T> {
    let parsed: TelegramResponse<T> = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) if (200..300).contains(&status) => return Err(e.into()),
        Err(_) => {
            return Err(TelegramError::Http(format!(
                "telegram request failed: status={status} body={text}"
            )));
        }
    };

    if parsed.ok {
        return parsed.result.ok_or_else(|| {
            TelegramError::ResponseFormat("ok response without result".to_string())
        });
    }

    Err(TelegramError::Api {
        error_code: parsed.error_code.unwrap_or_else(|| i64::from(status)),
        description: parsed
            .description
            .unwrap_or_else(|| format!("telegram returned ok=false with status {status}")),
        retry_after: parsed.parameters.and_then(|p| p.retry_after),
    })
}
