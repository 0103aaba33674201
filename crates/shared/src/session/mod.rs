mod preview;


use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::attachments::{AttachmentBlock, neutralize_block_tags};
use crate::conversation::{
    Conversation, Turn, first_ordering_violation, is_valid_conversation_id, new_conversation_id,
    timestamp_millis,
};
use crate::llm::ATTACHMENT_CONTEXT_HEADER;
use crate::repos::{HistoryStore, StoreError};

pub use preview::{DEFAULT_PREVIEW_CHARS, build_preview, is_attachment_context};

/// What happens to the user turn when inference fails or the client goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailedTurnPolicy {
    /// Nothing from the failed exchange is written.
    #[default]
    Discard,
    /// The user turn is written with `unanswered: true` and no assistant turn.
    RecordUnanswered,
}

impl FailedTurnPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::RecordUnanswered => "record_unanswered",
        }
    }
}

impl FromStr for FailedTurnPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "record_unanswered" => Ok(Self::RecordUnanswered),
            other => Err(format!(
                "unsupported failed turn policy '{other}', expected discard or record_unanswered"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub failed_turn: FailedTurnPolicy,
    pub preview_chars: usize,
    /// Caps `list_conversations`; `None` returns every live conversation.
    pub list_limit: Option<usize>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            failed_turn: FailedTurnPolicy::default(),
            preview_chars: DEFAULT_PREVIEW_CHARS,
            list_limit: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),
    #[error("turn {index} is not ordered after its predecessor")]
    OutOfOrder { index: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Context assembled for one request cycle, held by the caller until the
/// exchange is committed or abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTurn {
    pub conversation_id: String,
    pub history: Vec<Turn>,
    pub attachment_turn: Option<Turn>,
    pub user_turn: Turn,
    pub forked_from: Option<String>,
}

impl PreparedTurn {
    /// Everything sent to inference, in stored order.
    pub fn context_turns(&self) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(self.history.len() + 2);
        turns.extend(self.history.iter().cloned());
        turns.extend(self.attachment_turn.iter().cloned());
        turns.push(self.user_turn.clone());
        turns
    }

    pub fn user_timestamp(&self) -> i64 {
        self.user_turn.timestamp
    }
}

/// Visible history of a detached conversation, reused under a fresh id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkSeed {
    forked_from: String,
    turns: Vec<Turn>,
}

impl ForkSeed {
    pub fn forked_from(&self) -> &str {
        &self.forked_from
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub last_timestamp: i64,
    pub turn_count: usize,
    pub preview: String,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn HistoryStore>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(store: Arc<dyn HistoryStore>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub async fn prepare_turn(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        message: &str,
        attachments: &[AttachmentBlock],
        now: DateTime<Utc>,
    ) -> Result<PreparedTurn, SessionError> {
        ensure_message(message)?;

        let (conversation_id, history) = match conversation_id {
            None => (new_conversation_id(), Vec::new()),
            Some(conversation_id) => {
                if !is_valid_conversation_id(conversation_id) {
                    return Err(SessionError::InvalidConversationId(
                        conversation_id.to_string(),
                    ));
                }
                let history = self.load_history(user_id, conversation_id, now).await;
                (conversation_id.to_string(), history)
            }
        };

        Ok(assemble(conversation_id, history, None, message, attachments, now))
    }

    /// Like [`Self::prepare_turn`] with no conversation id, but seeded with the
    /// history of a detached conversation.
    pub fn prepare_forked_turn(
        &self,
        seed: ForkSeed,
        message: &str,
        attachments: &[AttachmentBlock],
        now: DateTime<Utc>,
    ) -> Result<PreparedTurn, SessionError> {
        ensure_message(message)?;

        let ForkSeed { forked_from, turns } = seed;
        Ok(assemble(
            new_conversation_id(),
            turns,
            Some(forked_from),
            message,
            attachments,
            now,
        ))
    }

    pub async fn commit_turn(
        &self,
        user_id: &str,
        conversation_id: &str,
        turns: &[Turn],
        now: DateTime<Utc>,
    ) -> Result<Conversation, SessionError> {
        if let Some(index) = first_ordering_violation(turns) {
            return Err(SessionError::OutOfOrder { index });
        }

        let saved = self.store.save(user_id, conversation_id, turns, now).await?;
        debug!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            stored_turns = saved.turns.len(),
            "conversation committed"
        );
        Ok(saved)
    }

    /// Appends the assistant reply to the prepared context and persists it.
    pub async fn complete_turn(
        &self,
        user_id: &str,
        prepared: &PreparedTurn,
        assistant_text: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, SessionError> {
        let timestamp = timestamp_millis(now).max(prepared.user_timestamp() + 1);
        let mut turns = prepared.context_turns();
        turns.push(Turn::assistant(assistant_text, timestamp));

        self.commit_turn(user_id, &prepared.conversation_id, &turns, now)
            .await
    }

    /// Applies the failed-turn policy. A forked seed is always kept under the
    /// new id because its original record is already gone.
    pub async fn abandon_turn(
        &self,
        user_id: &str,
        prepared: &PreparedTurn,
        now: DateTime<Utc>,
    ) -> Result<Option<Conversation>, SessionError> {
        let turns = match self.policy.failed_turn {
            FailedTurnPolicy::RecordUnanswered => {
                let mut turns = prepared.history.clone();
                turns.extend(prepared.attachment_turn.iter().cloned());
                let mut user_turn = prepared.user_turn.clone();
                user_turn.unanswered = true;
                turns.push(user_turn);
                turns
            }
            FailedTurnPolicy::Discard => {
                if prepared.forked_from.is_none() || prepared.history.is_empty() {
                    return Ok(None);
                }
                prepared.history.clone()
            }
        };

        let saved = self
            .commit_turn(user_id, &prepared.conversation_id, &turns, now)
            .await?;
        Ok(Some(saved))
    }

    /// Deletes the stored record of `old_conversation_id` and returns the
    /// turns the caller was showing so they can seed a new conversation.
    pub async fn fork_and_detach(
        &self,
        user_id: &str,
        old_conversation_id: &str,
        visible_turns: Vec<Turn>,
    ) -> Result<ForkSeed, SessionError> {
        if !is_valid_conversation_id(old_conversation_id) {
            return Err(SessionError::InvalidConversationId(
                old_conversation_id.to_string(),
            ));
        }
        if let Some(index) = first_ordering_violation(&visible_turns) {
            return Err(SessionError::OutOfOrder { index });
        }

        let removed = self.store.delete(user_id, old_conversation_id).await?;
        debug!(
            user_id = %user_id,
            conversation_id = %old_conversation_id,
            removed,
            seed_turns = visible_turns.len(),
            "conversation detached for fork"
        );

        Ok(ForkSeed {
            forked_from: old_conversation_id.to_string(),
            turns: visible_turns,
        })
    }

    pub async fn list_conversations(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationSummary>, SessionError> {
        let conversations = self.store.list(user_id, now, self.policy.list_limit).await?;

        Ok(conversations
            .into_iter()
            .map(|conversation| ConversationSummary {
                preview: build_preview(&conversation.turns, self.policy.preview_chars),
                turn_count: conversation.turns.len(),
                last_timestamp: conversation.last_timestamp,
                conversation_id: conversation.conversation_id,
            })
            .collect())
    }

    /// Missing and expired conversations read as empty, as do ids that could
    /// never have been stored.
    pub async fn load_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Turn>, SessionError> {
        if !is_valid_conversation_id(conversation_id) {
            return Ok(Vec::new());
        }

        Ok(self
            .store
            .load(user_id, conversation_id, now)
            .await?
            .map(|conversation| conversation.turns)
            .unwrap_or_default())
    }

    pub async fn delete_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<bool, SessionError> {
        if !is_valid_conversation_id(conversation_id) {
            return Ok(false);
        }

        Ok(self.store.delete(user_id, conversation_id).await?)
    }

    async fn load_history(
        &self,
        user_id: &str,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<Turn> {
        match self.store.load(user_id, conversation_id, now).await {
            Ok(Some(conversation)) => conversation.turns,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    error = %err,
                    "history read failed, continuing with empty context"
                );
                Vec::new()
            }
        }
    }
}

/// Wraps each block in numbered tags. Tag-like sequences inside file text are
/// broken up first, so the only `<file_N>` delimiters are the ones added here.
pub fn render_attachment_context(blocks: &[AttachmentBlock]) -> String {
    let wrapped = blocks
        .iter()
        .enumerate()
        .map(|(index, block)| {
            let number = index + 1;
            format!(
                "<file_{number} name=\"{}\">\n{}\n</file_{number}>",
                block.name,
                neutralize_block_tags(&block.text)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("{ATTACHMENT_CONTEXT_HEADER}\n\n{wrapped}")
}

fn ensure_message(message: &str) -> Result<(), SessionError> {
    if message.trim().is_empty() {
        return Err(SessionError::EmptyMessage);
    }
    Ok(())
}

fn assemble(
    conversation_id: String,
    history: Vec<Turn>,
    forked_from: Option<String>,
    message: &str,
    attachments: &[AttachmentBlock],
    now: DateTime<Utc>,
) -> PreparedTurn {
    // Two slots past the last stored turn leave room for the attachment turn.
    let user_timestamp = match history.last() {
        Some(last) => timestamp_millis(now).max(last.timestamp + 2),
        None => timestamp_millis(now),
    };

    let attachment_turn = (!attachments.is_empty()).then(|| {
        Turn::file_context(render_attachment_context(attachments), user_timestamp - 1)
    });
    let user_turn = Turn::user(message, user_timestamp)
        .with_files(attachments.iter().map(AttachmentBlock::meta).collect());

    PreparedTurn {
        conversation_id,
        history,
        attachment_turn,
        user_turn,
        forked_from,
    }
}
