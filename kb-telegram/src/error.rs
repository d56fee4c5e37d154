use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelegramError>;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram api error {error_code}: {description}")]
    Api {
        error_code: i64,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for TelegramError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

/// Failure categories the delivery side knows how to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Text could not be parsed under the requested parse mode.
    EntityParse,
    /// Media file id or URL is invalid or expired for this bot.
    InvalidFileReference,
    /// The message to edit or delete no longer exists.
    TargetMissing,
    /// Edit would leave the message unchanged.
    NotModified,
    /// Chat is gone or the bot lost access to it.
    ChatUnavailable,
    RateLimited,
    Transport,
    Other,
}

const ENTITY_PARSE_MARKERS: &[&str] = &["parse entities", "can't find end of the entity"];

const INVALID_FILE_MARKERS: &[&str] = &[
    "wrong file identifier",
    "wrong remote file identifier",
    "wrong type of the web page content",
    "failed to get http url content",
];

const TARGET_MISSING_MARKERS: &[&str] = &[
    "message to edit not found",
    "message to delete not found",
    "message can't be edited",
    "message can't be deleted",
    "message_id_invalid",
    "message not found",
];

const CHAT_UNAVAILABLE_MARKERS: &[&str] = &[
    "chat not found",
    "bot was blocked by the user",
    "bot was kicked",
    "user is deactivated",
    "not enough rights",
];

impl TelegramError {
    pub fn api(error_code: i64, description: impl Into<String>) -> Self {
        Self::Api {
            error_code,
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Http(_) => FailureKind::Transport,
            Self::ResponseFormat(_) => FailureKind::Other,
            Self::Api {
                error_code,
                description,
                ..
            } => classify(*error_code, description),
        }
    }
}

fn classify(error_code: i64, description: &str) -> FailureKind {
    let description = description.to_ascii_lowercase();
    let matches = |markers: &[&str]| markers.iter().any(|m| description.contains(m));

    if error_code == 429 {
        return FailureKind::RateLimited;
    }
    if matches(ENTITY_PARSE_MARKERS) {
        return FailureKind::EntityParse;
    }
    if matches(INVALID_FILE_MARKERS) {
        return FailureKind::InvalidFileReference;
    }
    if description.contains("message is not modified") {
        return FailureKind::NotModified;
    }
    if matches(TARGET_MISSING_MARKERS) {
        return FailureKind::TargetMissing;
    }
    if error_code == 403 || matches(CHAT_UNAVAILABLE_MARKERS) {
        return FailureKind::ChatUnavailable;
    }
    FailureKind::Other
}
