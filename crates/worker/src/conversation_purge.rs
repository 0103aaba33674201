use chrono::{DateTime, Utc};
use shared::repos::HistoryStore;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Deletes one batch of expired conversation records. Store errors are logged
/// and reported as zero purged rows so the next tick retries.
pub(crate) async fn purge_expired_conversations(
    store: &dyn HistoryStore,
    batch_size: usize,
    worker_id: Uuid,
    now: DateTime<Utc>,
) -> u64 {
    let purged_rows = match store.purge_expired_batch(now, batch_size).await {
        Ok(purged_rows) => purged_rows,
        Err(err) => {
            error!(
                worker_id = %worker_id,
                "failed to purge expired conversations: {err}"
            );
            return 0;
        }
    };

    if purged_rows > 0 {
        info!(
            worker_id = %worker_id,
            purged_rows,
            batch_size,
            "conversation purge tick"
        );
    } else {
        debug!(
            worker_id = %worker_id,
            batch_size,
            "conversation purge tick found no expired rows"
        );
    }

    purged_rows
}

pub(crate) async fn purge_tick(store: &dyn HistoryStore, batch_size: usize, worker_id: Uuid) -> u64 {
    purge_expired_conversations(store, batch_size, worker_id, Utc::now()).await
}
