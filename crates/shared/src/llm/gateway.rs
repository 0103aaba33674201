use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;

use crate::conversation::{Role, Turn};

/// Ordered text fragments as produced by the model.
pub type LlmTokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmGatewayError>> + Send>>;

pub type LlmStreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<LlmTokenStream, LlmGatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmChatRequest {
    pub requester_id: Option<String>,
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

impl LlmChatRequest {
    /// Builds the provider message list from context turns. Adjacent turns
    /// with the same role are merged because providers expect alternation.
    pub fn from_turns(system_prompt: impl Into<String>, turns: &[Turn], max_tokens: u32) -> Self {
        let mut messages: Vec<LlmMessage> = Vec::with_capacity(turns.len());
        for turn in turns {
            match messages.last_mut() {
                Some(previous) if previous.role == turn.role => {
                    previous.content.push_str("\n\n");
                    previous.content.push_str(&turn.content);
                }
                _ => messages.push(LlmMessage {
                    role: turn.role,
                    content: turn.content.clone(),
                }),
            }
        }

        Self {
            requester_id: None,
            system_prompt: system_prompt.into(),
            messages,
            max_tokens,
        }
    }

    pub fn with_requester_id(mut self, requester_id: impl AsRef<str>) -> Self {
        let trimmed = requester_id.as_ref().trim();
        if !trimmed.is_empty() {
            self.requester_id = Some(trimmed.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmGatewayError {
    #[error("llm provider request timed out")]
    Timeout,
    #[error("llm provider request failed: {0}")]
    ProviderFailure(String),
    #[error("llm provider returned an invalid payload: {0}")]
    InvalidProviderPayload(String),
    #[error("llm provider stream ended early: {0}")]
    StreamInterrupted(String),
}

pub trait LlmGateway: Send + Sync {
    /// Resolves once the provider has accepted the request; fragments then
    /// arrive on the returned stream.
    fn stream_chat<'a>(&'a self, request: LlmChatRequest) -> LlmStreamFuture<'a>;
}
