use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChatId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct QueueEntryId(pub String);

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QueueEntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for QueueEntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ChatId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl MessageId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }

    /// Client-side id for a user message that has not been persisted yet.
    pub fn optimistic() -> Self {
        Self(format!("{}{}", crate::constants::OPTIMISTIC_ID_PREFIX, Uuid::new_v4()))
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueEntryId {
    /// Temporary id used until the server acknowledges the entry.
    pub fn temporary() -> Self {
        Self(format!("{}{}", crate::constants::TEMP_QUEUE_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(crate::constants::TEMP_QUEUE_ID_PREFIX)
    }
}

/// Ordering key parsed from an event-stream frame id.
///
/// The backend emits ids shaped like `<millis>-<seq>`; bare integers are accepted as
/// `<n>-0`. Comparison is lexicographic on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventOrdinal {
    pub major: u64,
    pub minor: u64,
}

impl EventOrdinal {
    pub fn parse(id: &str) -> Option<Self> {
        let id = id.trim();
        match id.split_once('-') {
            Some((major, minor)) => Some(Self {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
            }),
            None => Some(Self {
                major: id.parse().ok()?,
                minor: 0,
            }),
        }
    }
}

impl fmt::Display for EventOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.major, self.minor)
    }
}

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue sync failed: {0}")]
    SyncFailure(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ParleyError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    /// Failures worth retrying later: connection trouble and server-side overload.
    pub fn is_transient(&self) -> bool {
        match &self.inner {
            ParleyError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ParleyError::Io(_) | ParleyError::Transport(_) => true,
            ParleyError::Upstream(status, _) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ParleyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- WIRE TYPES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Plan,
    Ask,
    #[default]
    Auto,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Ask => "ask",
            Self::Auto => "auto",
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = ObservedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Self::Plan),
            "ask" => Ok(Self::Ask),
            "auto" => Ok(Self::Auto),
            other => Err(ParleyError::Validation(format!("unknown permission mode: {}", other)).into()),
        }
    }
}

/// Attachment record as stored by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    #[serde(default)]
    pub file_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A local file waiting to be uploaded alongside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedFile {
    pub filename: String,
    pub mime_type: String,
    pub data: bytes::Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerQueuedMessage {
    pub id: QueueEntryId,
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub thinking_mode: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueUpsertResponse {
    pub id: QueueEntryId,
    pub created: bool,
    pub content: String,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}

/// Body of a queue enqueue call. `content` is the text to merge server-side.
#[derive(Debug, Clone)]
pub struct QueueUpload {
    pub content: String,
    pub model_id: String,
    pub permission_mode: PermissionMode,
    pub thinking_mode: Option<String>,
    pub files: Vec<AttachedFile>,
}

/// Payload of `queue_processing` / `queue_injected` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueInjection {
    pub queued_message_id: QueueEntryId,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    pub content: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub injected_inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreamStatus {
    pub has_active_task: bool,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub chat_id: ChatId,
    pub prompt: String,
    pub model_id: String,
    pub permission_mode: PermissionMode,
    pub thinking_mode: Option<String>,
    pub attached_files: Vec<AttachedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartResponse {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// --- CHAT MESSAGES (cache + view) ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStreamStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Assistant stream events in arrival order.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub stream_status: MessageStreamStatus,
    pub created_at: DateTime<Utc>,
    /// Highest event ordinal already folded into `events`.
    #[serde(skip)]
    pub applied_through: Option<EventOrdinal>,
}

impl ChatMessage {
    pub fn user(chat_id: ChatId, id: MessageId, content: impl Into<String>) -> Self {
        Self {
            id,
            chat_id,
            role: Role::User,
            content: content.into(),
            events: Vec::new(),
            model_id: None,
            attachments: None,
            stream_status: MessageStreamStatus::Completed,
            created_at: Utc::now(),
            applied_through: None,
        }
    }

    pub fn assistant_placeholder(chat_id: ChatId, id: MessageId, model_id: Option<String>) -> Self {
        Self {
            id,
            chat_id,
            role: Role::Assistant,
            content: String::new(),
            events: Vec::new(),
            model_id,
            attachments: None,
            stream_status: MessageStreamStatus::InProgress,
            created_at: Utc::now(),
            applied_through: None,
        }
    }

    /// Concatenated text of the assistant text events received so far.
    pub fn streamed_text(&self) -> String {
        self.events
            .iter()
            .filter(|e| e.get("type").and_then(|t| t.as_str()) == Some("assistant_text"))
            .filter_map(|e| e.get("text").and_then(|t| t.as_str()))
            .collect()
    }
}
