use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_CONVERSATION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Display metadata for a file merged into a turn. The file content itself is
/// never stored on the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub declared_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<AttachmentMeta>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unanswered: bool,
    /// Set on the synthetic user turn that carries uploaded file text.
    #[serde(default, skip_serializing_if = "is_false")]
    pub attachment_context: bool,
}

impl Turn {
    pub fn user(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
            files: None,
            unanswered: false,
            attachment_context: false,
        }
    }

    pub fn assistant(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp,
            files: None,
            unanswered: false,
            attachment_context: false,
        }
    }

    pub fn file_context(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            attachment_context: true,
            ..Self::user(content, timestamp)
        }
    }

    pub fn with_files(mut self, files: Vec<AttachmentMeta>) -> Self {
        if !files.is_empty() {
            self.files = Some(files);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub user_id: String,
    pub conversation_id: String,
    pub turns: Vec<Turn>,
    pub last_timestamp: i64,
    pub expires_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Client-supplied identifiers are opaque but must stay within a URL- and
/// key-safe alphabet.
pub fn is_valid_conversation_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_CONVERSATION_ID_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

/// Returns the index of the first turn whose timestamp does not strictly
/// exceed its predecessor.
pub fn first_ordering_violation(turns: &[Turn]) -> Option<usize> {
    turns
        .windows(2)
        .position(|pair| pair[1].timestamp <= pair[0].timestamp)
        .map(|index| index + 1)
}

pub fn timestamp_millis(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis()
}

fn is_false(value: &bool) -> bool {
    !*value
}
