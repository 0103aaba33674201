//! Fan-out of an incremental model response into client events and the text
//! that gets persisted once the response completes.

mod stream;


use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use stream::{
    CollectedRelay, RelayCollectError, SessionTurnSink, SinkFuture, TurnSink, collect_relay,
    relay_stream,
};

pub const INFERENCE_FAILED_MESSAGE: &str = "The assistant could not complete this response.";
pub const PERSISTENCE_FAILED_MESSAGE: &str = "The response could not be saved to history.";

/// Which collaborator caused a terminal `error` event. Never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureOrigin {
    #[default]
    Inference,
    Persistence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Start {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        timestamp: i64,
    },
    Chunk {
        content: String,
    },
    End {
        timestamp: i64,
    },
    Error {
        content: String,
        #[serde(skip)]
        origin: FailureOrigin,
    },
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// One JSON object per line.
pub fn encode_ndjson_line(event: &RelayEvent) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Started,
    Streaming,
    Ended,
    Errored,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Errored)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay cannot {action} while {state:?}")]
    InvalidTransition {
        state: RelayState,
        action: &'static str,
    },
}

/// `Idle -> Started -> Streaming -> {Ended | Errored}`.
///
/// Every forwarded fragment is also appended to an internal buffer, so the
/// text handed to persistence is exactly what the client saw.
#[derive(Debug)]
pub struct StreamingRelay {
    conversation_id: String,
    state: RelayState,
    text: String,
    chunk_count: usize,
}

impl StreamingRelay {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            state: RelayState::Idle,
            text: String::new(),
            chunk_count: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Concatenation of every chunk emitted so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn start(&mut self, timestamp: i64) -> Result<RelayEvent, RelayError> {
        self.ensure(self.state == RelayState::Idle, "start")?;
        self.state = RelayState::Started;
        Ok(RelayEvent::Start {
            conversation_id: self.conversation_id.clone(),
            timestamp,
        })
    }

    /// Empty fragments are swallowed.
    pub fn push_chunk(&mut self, fragment: &str) -> Result<Option<RelayEvent>, RelayError> {
        self.ensure(
            matches!(self.state, RelayState::Started | RelayState::Streaming),
            "push a chunk",
        )?;
        self.state = RelayState::Streaming;
        if fragment.is_empty() {
            return Ok(None);
        }

        self.text.push_str(fragment);
        self.chunk_count += 1;
        Ok(Some(RelayEvent::Chunk {
            content: fragment.to_string(),
        }))
    }

    pub fn end(&mut self, timestamp: i64) -> Result<RelayEvent, RelayError> {
        self.ensure(
            matches!(self.state, RelayState::Started | RelayState::Streaming),
            "end",
        )?;
        self.state = RelayState::Ended;
        Ok(RelayEvent::End { timestamp })
    }

    pub fn fail(
        &mut self,
        origin: FailureOrigin,
        message: impl Into<String>,
    ) -> Result<RelayEvent, RelayError> {
        self.ensure(
            matches!(self.state, RelayState::Started | RelayState::Streaming),
            "fail",
        )?;
        self.state = RelayState::Errored;
        Ok(RelayEvent::Error {
            content: message.into(),
            origin,
        })
    }

    fn ensure(&self, allowed: bool, action: &'static str) -> Result<(), RelayError> {
        if allowed {
            Ok(())
        } else {
            Err(RelayError::InvalidTransition {
                state: self.state,
                action,
            })
        }
    }
}
