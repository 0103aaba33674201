use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration;
use thiserror::Error;

use crate::attachments::DEFAULT_MAX_ATTACHMENT_CHARS;
use crate::config_env::{EnvReader, is_http_url, process_env};
use crate::llm::{DEFAULT_MAX_TOKENS, DEFAULT_SYSTEM_PROMPT};
use crate::repos::{DEFAULT_RETENTION_TTL_DAYS, DEFAULT_RETENTION_TURNS, RetentionPolicy};
use crate::session::{FailedTurnPolicy, SessionPolicy};

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 10;
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 100_000;
pub const DEFAULT_JWKS_CACHE_TTL_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBackend {
    Postgres,
    Memory,
}

impl FromStr for HistoryBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!(
                "unsupported history backend '{other}', expected postgres or memory"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub jwks_url: String,
    pub issuer: String,
    pub audience: String,
    pub jwks_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub max_request_bytes: usize,
    pub max_files: usize,
    pub max_message_chars: usize,
    pub max_attachment_chars: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_files: DEFAULT_MAX_FILES,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            max_attachment_chars: DEFAULT_MAX_ATTACHMENT_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub history_backend: HistoryBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub migrations_dir: PathBuf,
    pub retention_turns: usize,
    pub history_ttl_days: i64,
    pub failed_turn_policy: FailedTurnPolicy,
    pub attachment_dir: PathBuf,
    pub limits: RequestLimits,
    pub identity: IdentityConfig,
    pub system_prompt: String,
    pub llm_max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tick_seconds: u64,
    pub database_url: String,
    pub database_max_connections: u32,
    pub purge_batch_size: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Loads `.env` from the working directory when present. Real environment
/// variables take precedence.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env file");
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader::new(lookup);

        let history_backend = env.parse_with("HISTORY_BACKEND", HistoryBackend::Postgres)?;
        let database_url = match history_backend {
            HistoryBackend::Postgres => Some(env.require("DATABASE_URL")?),
            HistoryBackend::Memory => env.optional_trimmed("DATABASE_URL"),
        };

        let jwks_url = env.require("IDENTITY_JWKS_URL")?;
        if !is_http_url(&jwks_url) {
            return Err(ConfigError::InvalidConfiguration(
                "IDENTITY_JWKS_URL must be an absolute http(s) URL".to_string(),
            ));
        }

        let config = Self {
            bind_addr: env.string_or("API_BIND_ADDR", "127.0.0.1:8080"),
            history_backend,
            database_url,
            database_max_connections: env.parse_positive("DATABASE_MAX_CONNECTIONS", 10)?,
            migrations_dir: env
                .optional_trimmed("MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_migrations_dir),
            retention_turns: env.parse_positive("HISTORY_RETENTION_TURNS", DEFAULT_RETENTION_TURNS)?,
            history_ttl_days: env.parse_positive("HISTORY_TTL_DAYS", DEFAULT_RETENTION_TTL_DAYS)?,
            failed_turn_policy: env.parse_with("FAILED_TURN_POLICY", FailedTurnPolicy::Discard)?,
            attachment_dir: PathBuf::from(env.string_or("ATTACHMENT_DIR", "./data/attachments")),
            limits: RequestLimits {
                max_request_bytes: env
                    .parse_positive("MAX_REQUEST_BYTES", DEFAULT_MAX_REQUEST_BYTES)?,
                max_files: env.parse_int("MAX_FILES", DEFAULT_MAX_FILES)?,
                max_message_chars: env
                    .parse_positive("MAX_MESSAGE_CHARS", DEFAULT_MAX_MESSAGE_CHARS)?,
                max_attachment_chars: env
                    .parse_positive("MAX_ATTACHMENT_CHARS", DEFAULT_MAX_ATTACHMENT_CHARS)?,
            },
            identity: IdentityConfig {
                jwks_url,
                issuer: env.require("IDENTITY_ISSUER")?,
                audience: env.require("IDENTITY_AUDIENCE")?,
                jwks_cache_ttl_seconds: env
                    .parse_positive("JWKS_CACHE_TTL_SECONDS", DEFAULT_JWKS_CACHE_TTL_SECONDS)?,
            },
            system_prompt: env.string_or("SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            llm_max_tokens: env.parse_positive("LLM_MAX_TOKENS", DEFAULT_MAX_TOKENS)?,
        };

        Ok(config)
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy, ConfigError> {
        RetentionPolicy::new(self.retention_turns, Duration::days(self.history_ttl_days))
            .map_err(|err| ConfigError::InvalidConfiguration(err.to_string()))
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            failed_turn: self.failed_turn_policy,
            ..SessionPolicy::default()
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader::new(lookup);

        Ok(Self {
            tick_seconds: env.parse_positive("WORKER_TICK_SECONDS", 300)?,
            database_url: env.require("DATABASE_URL")?,
            database_max_connections: env.parse_positive("DATABASE_MAX_CONNECTIONS", 5)?,
            purge_batch_size: env.parse_positive("CONVERSATION_PURGE_BATCH_SIZE", 500)?,
        })
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../db/migrations")
}
