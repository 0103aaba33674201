use std::env;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::gateway::{
    LlmChatRequest, LlmGateway, LlmGatewayError, LlmStreamFuture, LlmTokenStream,
};
use super::sse::{SseEvent, SseLineBuffer};
use crate::config_env::is_http_url;

const DEFAULT_CHAT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

#[derive(Debug, Clone)]
pub struct OpenRouterGatewayConfig {
    pub chat_completions_url: String,
    pub api_key: String,
    pub model: String,
    /// Bound on connecting and receiving response headers.
    pub connect_timeout_ms: u64,
    /// Bound on the gap between two body chunks once streaming.
    pub idle_timeout_ms: u64,
}

impl OpenRouterGatewayConfig {
    pub fn from_env() -> Result<Self, OpenRouterConfigError> {
        let api_key = require_non_empty_env("OPENROUTER_API_KEY")?;
        let chat_completions_url = optional_trimmed_env("OPENROUTER_CHAT_COMPLETIONS_URL")
            .unwrap_or_else(|| DEFAULT_CHAT_COMPLETIONS_URL.to_string());
        if !is_http_url(&chat_completions_url) {
            return Err(OpenRouterConfigError::InvalidConfiguration(
                "OPENROUTER_CHAT_COMPLETIONS_URL must be an absolute http(s) URL".to_string(),
            ));
        }

        let config = Self {
            chat_completions_url,
            api_key,
            model: optional_trimmed_env("OPENROUTER_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            connect_timeout_ms: parse_u64_env("OPENROUTER_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?,
            idle_timeout_ms: parse_u64_env("OPENROUTER_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS)?,
        };
        if config.connect_timeout_ms == 0 || config.idle_timeout_ms == 0 {
            return Err(OpenRouterConfigError::InvalidConfiguration(
                "OPENROUTER_TIMEOUT_MS and OPENROUTER_IDLE_TIMEOUT_MS must be > 0".to_string(),
            ));
        }

        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum OpenRouterConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {key}: {value}")]
    ParseInt { key: String, value: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to build OpenRouter http client: {0}")]
    HttpClient(String),
}

#[derive(Clone)]
pub struct OpenRouterGateway {
    client: reqwest::Client,
    config: OpenRouterGatewayConfig,
}

impl OpenRouterGateway {
    pub fn new(config: OpenRouterGatewayConfig) -> Result<Self, OpenRouterConfigError> {
        // No overall request timeout: a long answer is a legitimate long body.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|err| OpenRouterConfigError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    async fn open_stream(
        &self,
        request: LlmChatRequest,
    ) -> Result<LlmTokenStream, LlmGatewayError> {
        let body = OpenRouterChatBody::new(&self.config.model, &request);

        let send = self
            .client
            .post(&self.config.chat_completions_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send();
        let response = match timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            send,
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) if err.is_timeout() => return Err(LlmGatewayError::Timeout),
            Ok(Err(_)) => {
                return Err(LlmGatewayError::ProviderFailure(
                    "request_unavailable".to_string(),
                ));
            }
            Err(_) => return Err(LlmGatewayError::Timeout),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let provider_code = parse_provider_error_code(&body);
            warn!(
                status = status.as_u16(),
                provider_code = %provider_code,
                "openrouter rejected chat request"
            );
            return Err(LlmGatewayError::ProviderFailure(format!(
                "status={} code={provider_code}",
                status.as_u16()
            )));
        }

        if let Some(request_id) = header_request_id(response.headers()) {
            debug!(provider_request_id = %request_id, "openrouter stream opened");
        }

        let idle = Duration::from_millis(self.config.idle_timeout_ms);
        let mut body = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = SseLineBuffer::new();
            let mut finished = false;

            'read: loop {
                let next = match timeout(idle, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(LlmGatewayError::Timeout);
                        return;
                    }
                };

                let exhausted = next.is_none();
                let events = match next {
                    Some(Ok(bytes)) => buffer.feed(&bytes),
                    Some(Err(err)) => {
                        yield Err(LlmGatewayError::StreamInterrupted(err.to_string()));
                        return;
                    }
                    None => buffer.finish().into_iter().collect(),
                };

                for event in events {
                    match interpret_event(event) {
                        Ok(StreamStep::Fragment(text)) => yield Ok(text),
                        Ok(StreamStep::Skip) => {}
                        Ok(StreamStep::Finished) => {
                            finished = true;
                            break 'read;
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }

                if exhausted {
                    break;
                }
            }

            if !finished {
                yield Err(LlmGatewayError::StreamInterrupted(
                    "provider closed the stream without finishing".to_string(),
                ));
            }
        };

        Ok(Box::pin(stream))
    }
}

impl LlmGateway for OpenRouterGateway {
    fn stream_chat<'a>(&'a self, request: LlmChatRequest) -> LlmStreamFuture<'a> {
        Box::pin(self.open_stream(request))
    }
}

enum StreamStep {
    Fragment(String),
    Skip,
    Finished,
}

fn interpret_event(event: SseEvent) -> Result<StreamStep, LlmGatewayError> {
    let payload = match event {
        SseEvent::Done => return Ok(StreamStep::Finished),
        SseEvent::Data(payload) => payload,
    };

    let chunk: OpenRouterStreamChunk = serde_json::from_str(&payload).map_err(|_| {
        LlmGatewayError::InvalidProviderPayload("stream_chunk_parse_failed".to_string())
    })?;

    if let Some(error) = chunk.error {
        let code = error
            .code
            .map(|code| match code {
                Value::String(code) => code,
                other => other.to_string(),
            })
            .unwrap_or_else(|| "unknown".to_string());
        return Err(LlmGatewayError::StreamInterrupted(format!("code={code}")));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(StreamStep::Skip);
    };

    match choice.delta.and_then(|delta| delta.content) {
        Some(content) if !content.is_empty() => Ok(StreamStep::Fragment(content)),
        _ => Ok(StreamStep::Skip),
    }
}

#[derive(Debug, Serialize)]
struct OpenRouterChatBody<'a> {
    model: &'a str,
    messages: Vec<OpenRouterMessage<'a>>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

impl<'a> OpenRouterChatBody<'a> {
    fn new(model: &'a str, request: &'a LlmChatRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(OpenRouterMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.extend(request.messages.iter().map(|message| OpenRouterMessage {
            role: message.role.as_str(),
            content: &message.content,
        }));

        Self {
            model,
            messages,
            max_tokens: request.max_tokens,
            stream: true,
            user: request.requester_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenRouterMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenRouterStreamChunk {
    #[serde(default)]
    choices: Vec<OpenRouterStreamChoice>,
    error: Option<OpenRouterStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterStreamChoice {
    delta: Option<OpenRouterDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterStreamError {
    code: Option<Value>,
}

fn require_non_empty_env(key: &str) -> Result<String, OpenRouterConfigError> {
    let value = env::var(key).map_err(|_| OpenRouterConfigError::MissingVar(key.to_string()))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(OpenRouterConfigError::MissingVar(key.to_string()));
    }
    Ok(trimmed.to_string())
}

fn parse_u64_env(key: &str, default: u64) -> Result<u64, OpenRouterConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| OpenRouterConfigError::ParseInt {
                key: key.to_string(),
                value,
            }),
        None => Ok(default),
    }
}

fn optional_trimmed_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn header_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn parse_provider_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    #[derive(Deserialize)]
    struct ProviderErrorDetails {
        code: Option<Value>,
    }

    let parsed = serde_json::from_str::<ProviderErrorEnvelope>(body).ok();
    let Some(provider_error_code) = parsed
        .and_then(|envelope| envelope.error)
        .and_then(|details| details.code)
    else {
        return "unknown".to_string();
    };

    match provider_error_code {
        Value::String(code) => code,
        Value::Number(code) => code.to_string(),
        _ => "unknown".to_string(),
    }
}
