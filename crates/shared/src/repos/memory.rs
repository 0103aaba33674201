use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::conversation::{Conversation, Turn};

use super::{HistoryStore, RetentionPolicy, StoreFuture};

type RecordKey = (String, String);

/// Process-local history store for tests and single-node development runs.
#[derive(Clone, Default)]
pub struct InMemoryHistoryStore {
    records: Arc<RwLock<HashMap<RecordKey, Conversation>>>,
    policy: RetentionPolicy,
}

impl InMemoryHistoryStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    /// Number of physically present records, expired ones included.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

fn key(user_id: &str, conversation_id: &str) -> RecordKey {
    (user_id.to_string(), conversation_id.to_string())
}

impl HistoryStore for InMemoryHistoryStore {
    fn load<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<Conversation>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records
                .get(&key(user_id, conversation_id))
                .filter(|record| !record.is_expired(now))
                .cloned())
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
            self.records
                .write()
                .await
                .insert(key(user_id, conversation_id), record.clone());
            Ok(record)
        })
    }

    fn delete<'a>(&'a self, user_id: &'a str, conversation_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .records
                .write()
                .await
                .remove(&key(user_id, conversation_id))
                .is_some())
        })
    }

    fn list<'a>(
        &'a self,
        user_id: &'a str,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreFuture<'a, Vec<Conversation>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let mut items = records
                .values()
                .filter(|record| record.user_id == user_id && !record.is_expired(now))
                .cloned()
                .collect::<Vec<_>>();
            items.sort_by(|left, right| {
                right
                    .last_timestamp
                    .cmp(&left.last_timestamp)
                    .then_with(|| left.conversation_id.cmp(&right.conversation_id))
            });
            if let Some(limit) = limit {
                items.truncate(limit);
            }
            Ok(items)
        })
    }

    fn purge_expired_batch(&self, now: DateTime<Utc>, batch_size: usize) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let expired = records
                .iter()
                .filter(|(_, record)| record.is_expired(now))
                .map(|(key, _)| key.clone())
                .take(batch_size)
                .collect::<Vec<_>>();
            for key in &expired {
                records.remove(key);
            }
            Ok(expired.len() as u64)
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn exchange(base: i64) -> Vec<Turn> {
        vec![Turn::user("q", base), Turn::assistant("a", base + 1)]
    }

    #[tokio::test]
    async fn save_then_load_preserves_turn_order() {
        let store = InMemoryHistoryStore::default();
        let now = Utc::now();
        let turns = vec![
            Turn::user("first", 10),
            Turn::assistant("second", 20),
            Turn::user("third", 30),
        ];

        store
            .save("user-1", "conv-1", &turns, now)
            .await
            .expect("save should succeed");
        let loaded = store
            .load("user-1", "conv-1", now)
            .await
            .expect("load should succeed")
            .expect("record should exist");

        assert_eq!(loaded.turns, turns);
        assert_eq!(loaded.last_timestamp, 30);
    }

    #[tokio::test]
    async fn expired_records_are_not_found_until_purged() {
        let store = InMemoryHistoryStore::new(
            RetentionPolicy::new(20, Duration::days(1)).expect("policy should build"),
        );
        let now = Utc::now();
        store
            .save("user-1", "conv-1", &exchange(1), now)
            .await
            .expect("save should succeed");

        let later = now + Duration::days(2);
        let loaded = store
            .load("user-1", "conv-1", later)
            .await
            .expect("load should succeed");
        assert!(loaded.is_none());
        assert_eq!(store.record_count().await, 1);

        let purged = store
            .purge_expired_batch(later, 100)
            .await
            .expect("purge should succeed");
        assert_eq!(purged, 1);
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn list_is_scoped_to_user_and_sorted_newest_first() {
        let store = InMemoryHistoryStore::default();
        let now = Utc::now();
        store
            .save("user-1", "old", &exchange(100), now)
            .await
            .expect("save should succeed");
        store
            .save("user-1", "new", &exchange(300), now)
            .await
            .expect("save should succeed");
        store
            .save("user-1", "middle", &exchange(200), now)
            .await
            .expect("save should succeed");
        store
            .save("user-2", "other", &exchange(999), now)
            .await
            .expect("save should succeed");

        let listed = store
            .list("user-1", now, None)
            .await
            .expect("list should succeed");
        let ids = listed
            .iter()
            .map(|record| record.conversation_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "middle", "old"]);
    }

    #[tokio::test]
    async fn list_honours_an_explicit_cap() {
        let store = InMemoryHistoryStore::default();
        let now = Utc::now();
        for timestamp in [100, 200, 300] {
            store
                .save("user-1", &format!("conv-{timestamp}"), &exchange(timestamp), now)
                .await
                .expect("save should succeed");
        }

        let listed = store
            .list("user-1", now, Some(2))
            .await
            .expect("list should succeed");
        let ids = listed
            .iter()
            .map(|record| record.conversation_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["conv-300", "conv-200"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryHistoryStore::default();
        let now = Utc::now();
        store
            .save("user-1", "conv-1", &exchange(1), now)
            .await
            .expect("save should succeed");

        assert!(store.delete("user-1", "conv-1").await.expect("delete"));
        assert!(!store.delete("user-1", "conv-1").await.expect("delete"));
    }
}
