use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::conversation::{Conversation, Turn, timestamp_millis};

mod memory;
mod postgres;

pub use memory::InMemoryHistoryStore;
pub use postgres::PgHistoryStore;

pub const DEFAULT_RETENTION_TURNS: usize = 20;
pub const DEFAULT_RETENTION_TTL_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Bounded sliding window applied on every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_turns: usize,
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_RETENTION_TURNS,
            ttl: Duration::days(DEFAULT_RETENTION_TTL_DAYS),
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_turns: usize, ttl: Duration) -> Result<Self, StoreError> {
        if max_turns == 0 {
            return Err(StoreError::InvalidData(
                "retention max_turns must be > 0".to_string(),
            ));
        }
        if ttl <= Duration::zero() {
            return Err(StoreError::InvalidData(
                "retention ttl must be positive".to_string(),
            ));
        }

        Ok(Self { max_turns, ttl })
    }

    /// Most recent `max_turns` turns, order untouched.
    pub fn retain<'a>(&self, turns: &'a [Turn]) -> &'a [Turn] {
        let start = turns.len().saturating_sub(self.max_turns);
        &turns[start..]
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }

    pub(crate) fn build_record(
        &self,
        user_id: &str,
        conversation_id: &str,
        turns: &[Turn],
        now: DateTime<Utc>,
    ) -> Conversation {
        let retained = self.retain(turns).to_vec();
        let last_timestamp = retained
            .last()
            .map(|turn| turn.timestamp)
            .unwrap_or_else(|| timestamp_millis(now));

        Conversation {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            turns: retained,
            last_timestamp,
            expires_at: self.expires_at(now),
        }
    }
}

/// Durable per-user conversation log keyed by `(user_id, conversation_id)`.
///
/// Concurrent saves for the same key are last-write-wins; implementations do
/// not reorder or deduplicate turns.
pub trait HistoryStore: Send + Sync {
    /// Expired records are reported as not found even if still physically present.
    fn load<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<Conversation>>;

    /// Applies the retention window and refreshes the expiry.
    fn save<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: &'a str,
        turns: &'a [Turn],
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Conversation>;

    /// Returns whether a record was removed. Deleting a missing record is not an error.
    fn delete<'a>(&'a self, user_id: &'a str, conversation_id: &'a str) -> StoreFuture<'a, bool>;

    /// Live conversations ordered by `last_timestamp` descending. `None` means no cap.
    fn list<'a>(
        &'a self,
        user_id: &'a str,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreFuture<'a, Vec<Conversation>>;

    fn purge_expired_batch(&self, now: DateTime<Utc>, batch_size: usize) -> StoreFuture<'_, u64>;

    fn ping(&self) -> StoreFuture<'_, ()>;
}
