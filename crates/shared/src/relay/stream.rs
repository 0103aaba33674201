use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tracing::{error, warn};

use crate::llm::{LlmGatewayError, LlmTokenStream};
use crate::session::{PreparedTurn, SessionError, SessionManager};

use super::{
    FailureOrigin, INFERENCE_FAILED_MESSAGE, PERSISTENCE_FAILED_MESSAGE, RelayEvent,
    StreamingRelay,
};

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send + 'a>>;

/// Where a finished (or failed) exchange goes.
pub trait TurnSink: Send + Sync {
    fn commit<'a>(&'a self, assistant_text: String) -> SinkFuture<'a>;

    fn abandon(&self) -> SinkFuture<'_>;
}

/// Persists through the session manager on behalf of one request.
pub struct SessionTurnSink {
    sessions: SessionManager,
    user_id: String,
    prepared: PreparedTurn,
}

impl SessionTurnSink {
    pub fn new(sessions: SessionManager, user_id: impl Into<String>, prepared: PreparedTurn) -> Self {
        Self {
            sessions,
            user_id: user_id.into(),
            prepared,
        }
    }
}

impl TurnSink for SessionTurnSink {
    fn commit<'a>(&'a self, assistant_text: String) -> SinkFuture<'a> {
        Box::pin(async move {
            self.sessions
                .complete_turn(&self.user_id, &self.prepared, &assistant_text, Utc::now())
                .await
                .map(|_| ())
        })
    }

    fn abandon(&self) -> SinkFuture<'_> {
        Box::pin(async move {
            self.sessions
                .abandon_turn(&self.user_id, &self.prepared, Utc::now())
                .await
                .map(|_| ())
        })
    }
}

/// Runs `abandon` in the background if the relay is dropped before it
/// reached a terminal event.
struct AbandonOnDrop {
    sink: Option<Arc<dyn TurnSink>>,
}

impl AbandonOnDrop {
    fn disarm(&mut self) {
        self.sink = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(err) = sink.abandon().await {
                warn!(error = %err, "failed to apply failed-turn policy after disconnect");
            }
        });
    }
}

/// Drives one inference response through a [`StreamingRelay`].
///
/// The sink is committed before `end` is emitted, so a client that saw `end`
/// can rely on the turn being stored. Dropping the returned stream drops the
/// inference source and abandons the turn.
pub fn relay_stream<F>(
    conversation_id: String,
    source: F,
    sink: Arc<dyn TurnSink>,
) -> impl Stream<Item = RelayEvent> + Send + 'static
where
    F: Future<Output = Result<LlmTokenStream, LlmGatewayError>> + Send + 'static,
{
    async_stream::stream! {
        let mut relay = StreamingRelay::new(conversation_id);
        let mut guard = AbandonOnDrop { sink: Some(sink.clone()) };

        match relay.start(Utc::now().timestamp_millis()) {
            Ok(event) => yield event,
            Err(err) => {
                error!(error = %err, "relay failed to start");
                return;
            }
        }

        let mut failure: Option<LlmGatewayError> = None;
        match source.await {
            Ok(mut tokens) => {
                while let Some(next) = tokens.next().await {
                    match next {
                        Ok(fragment) => match relay.push_chunk(&fragment) {
                            Ok(Some(event)) => yield event,
                            Ok(None) => {}
                            Err(err) => {
                                error!(error = %err, "relay rejected chunk");
                                return;
                            }
                        },
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                // Release the upstream connection before touching storage.
                drop(tokens);
            }
            Err(err) => failure = Some(err),
        }

        guard.disarm();

        if let Some(err) = failure {
            warn!(
                conversation_id = %relay.conversation_id(),
                chunks = relay.chunk_count(),
                error = %err,
                "inference failed mid-relay"
            );
            if let Err(abandon_err) = sink.abandon().await {
                error!(
                    conversation_id = %relay.conversation_id(),
                    error = %abandon_err,
                    "failed to apply failed-turn policy"
                );
            }
            if let Ok(event) = relay.fail(FailureOrigin::Inference, INFERENCE_FAILED_MESSAGE) {
                yield event;
            }
            return;
        }

        match sink.commit(relay.text().to_string()).await {
            Ok(()) => {
                if let Ok(event) = relay.end(Utc::now().timestamp_millis()) {
                    yield event;
                }
            }
            Err(err) => {
                error!(
                    conversation_id = %relay.conversation_id(),
                    error = %err,
                    "failed to persist completed turn"
                );
                let event = relay.fail(FailureOrigin::Persistence, PERSISTENCE_FAILED_MESSAGE);
                if let Ok(event) = event {
                    yield event;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedRelay {
    pub conversation_id: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayCollectError {
    #[error("{message}")]
    Failed {
        origin: FailureOrigin,
        message: String,
        partial_text: String,
    },
    #[error("relay ended without a terminal event")]
    Incomplete,
}

/// Drains a relay stream into a single response.
pub async fn collect_relay<S>(stream: S) -> Result<CollectedRelay, RelayCollectError>
where
    S: Stream<Item = RelayEvent>,
{
    let mut stream = std::pin::pin!(stream);
    let mut conversation_id = String::new();
    let mut text = String::new();

    while let Some(event) = stream.next().await {
        match event {
            RelayEvent::Start {
                conversation_id: id,
                ..
            } => conversation_id = id,
            RelayEvent::Chunk { content } => text.push_str(&content),
            RelayEvent::End { timestamp } => {
                return Ok(CollectedRelay {
                    conversation_id,
                    text,
                    timestamp,
                });
            }
            RelayEvent::Error { content, origin } => {
                return Err(RelayCollectError::Failed {
                    origin,
                    message: content,
                    partial_text: text,
                });
            }
        }
    }

    Err(RelayCollectError::Incomplete)
}
