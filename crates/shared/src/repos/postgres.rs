use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::conversation::{Conversation, Turn};

use super::{HistoryStore, RetentionPolicy, StoreError, StoreFuture};

#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
    policy: RetentionPolicy,
}

impl PgHistoryStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        policy: RetentionPolicy,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool, policy })
    }

    pub fn from_pool(pool: PgPool, policy: RetentionPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, StoreError> {
    let Json(turns): Json<Vec<Turn>> = row
        .try_get("turns")
        .map_err(|err| StoreError::InvalidData(format!("conversation turns invalid: {err}")))?;

    Ok(Conversation {
        user_id: row.try_get("user_id")?,
        conversation_id: row.try_get("conversation_id")?,
        turns,
        last_timestamp: row.try_get("last_timestamp")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn limit_to_i64(limit: usize) -> Result<i64, StoreError> {
    i64::try_from(limit)
        .ok()
        .filter(|limit| *limit > 0)
        .ok_or_else(|| StoreError::InvalidData("list limit must be > 0".to_string()))
}

impl HistoryStore for PgHistoryStore {
    fn load<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<Conversation>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT user_id, conversation_id, turns, last_timestamp, expires_at
                 FROM conversations
                 WHERE user_id = $1
                   AND conversation_id = $2
                   AND expires_at > $3",
            )
            .bind(user_id)
            .bind(conversation_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            row.as_ref().map(conversation_from_row).transpose()
        })
    }

    fn save<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: &'a str,
        turns: &'a [Turn],
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Conversation> {
        Box::pin(async move {
            let record = self
                .policy
                .build_record(user_id, conversation_id, turns, now);
            let turn_count = i32::try_from(record.turns.len()).map_err(|_| {
                StoreError::InvalidData("conversation turn_count exceeds i32".to_string())
            })?;

            sqlx::query(
                "INSERT INTO conversations (
                    user_id,
                    conversation_id,
                    turns,
                    turn_count,
                    last_timestamp,
                    created_at,
                    updated_at,
                    expires_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
                 ON CONFLICT (user_id, conversation_id)
                 DO UPDATE SET
                   turns = EXCLUDED.turns,
                   turn_count = EXCLUDED.turn_count,
                   last_timestamp = EXCLUDED.last_timestamp,
                   updated_at = EXCLUDED.updated_at,
                   expires_at = EXCLUDED.expires_at",
            )
            .bind(user_id)
            .bind(conversation_id)
            .bind(Json(&record.turns))
            .bind(turn_count)
            .bind(record.last_timestamp)
            .bind(now)
            .bind(record.expires_at)
            .execute(&self.pool)
            .await?;

            Ok(record)
        })
    }

    fn delete<'a>(&'a self, user_id: &'a str, conversation_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM conversations
                 WHERE user_id = $1
                   AND conversation_id = $2",
            )
            .bind(user_id)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn list<'a>(
        &'a self,
        user_id: &'a str,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreFuture<'a, Vec<Conversation>> {
        Box::pin(async move {
            // LIMIT NULL is no limit in Postgres.
            let limit = limit.map(limit_to_i64).transpose()?;
            let rows = sqlx::query(
                "SELECT user_id, conversation_id, turns, last_timestamp, expires_at
                 FROM conversations
                 WHERE user_id = $1
                   AND expires_at > $2
                 ORDER BY last_timestamp DESC, conversation_id ASC
                 LIMIT $3",
            )
            .bind(user_id)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(conversation_from_row).collect()
        })
    }

    fn purge_expired_batch(&self, now: DateTime<Utc>, batch_size: usize) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let batch_size = limit_to_i64(batch_size)?;
            let result = sqlx::query(
                "DELETE FROM conversations
                 WHERE (user_id, conversation_id) IN (
                    SELECT user_id, conversation_id
                    FROM conversations
                    WHERE expires_at <= $1
                    ORDER BY expires_at ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                 )",
            )
            .bind(now)
            .bind(batch_size)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
            Ok(())
        })
    }
}
