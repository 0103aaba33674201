#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::{StreamExt, stream};
use shared::llm::{LlmChatRequest, LlmGateway, LlmGatewayError, LlmStreamFuture, LlmTokenStream};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum Script {
    /// Fragments delivered in order, then a clean end.
    Reply(Vec<&'static str>),
    /// Fragments, then a mid-stream failure.
    FailAfter(Vec<&'static str>),
    /// The provider rejects the request before streaming.
    Refuse(LlmGatewayError),
    /// Fragments, then the stream never progresses again.
    Stall(Vec<&'static str>),
}

/// Replays queued scripts and records every request it receives. An empty
/// queue answers with a single `"ok"` fragment.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<LlmChatRequest>>>,
}

impl ScriptedGateway {
    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .expect("scripts lock should not be poisoned")
            .push_back(script);
    }

    pub fn requests(&self) -> Vec<LlmChatRequest> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .clone()
    }

    pub fn last_request(&self) -> LlmChatRequest {
        self.requests()
            .pop()
            .expect("gateway should have received a request")
    }
}

fn fragments(items: Vec<&'static str>) -> Vec<Result<String, LlmGatewayError>> {
    items.into_iter().map(|item| Ok(item.to_string())).collect()
}

impl LlmGateway for ScriptedGateway {
    fn stream_chat<'a>(&'a self, request: LlmChatRequest) -> LlmStreamFuture<'a> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("requests lock should not be poisoned")
                .push(request);
            let script = self
                .scripts
                .lock()
                .expect("scripts lock should not be poisoned")
                .pop_front()
                .unwrap_or(Script::Reply(vec!["ok"]));

            let tokens: LlmTokenStream = match script {
                Script::Reply(items) => Box::pin(stream::iter(fragments(items))),
                Script::FailAfter(items) => {
                    let mut items = fragments(items);
                    items.push(Err(LlmGatewayError::StreamInterrupted(
                        "connection reset".to_string(),
                    )));
                    Box::pin(stream::iter(items))
                }
                Script::Refuse(err) => return Err(err),
                Script::Stall(items) => {
                    Box::pin(stream::iter(fragments(items)).chain(stream::pending()))
                }
            };

            Ok(tokens)
        })
    }
}
