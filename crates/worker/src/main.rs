use shared::config::{WorkerConfig, load_dotenv};
use shared::repos::{PgHistoryStore, RetentionPolicy};
use tokio::signal;
use tokio::time::{self, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod conversation_purge;

#[tokio::main]
async fn main() {
    load_dotenv();
    init_tracing();

    let config = match WorkerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to read worker config: {err}");
            std::process::exit(1);
        }
    };

    // Purging only reads expiry timestamps, so the retention window is irrelevant here.
    let store = match PgHistoryStore::connect(
        &config.database_url,
        config.database_max_connections,
        RetentionPolicy::default(),
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            error!("failed to connect to postgres: {err}");
            std::process::exit(1);
        }
    };

    let worker_id = Uuid::new_v4();
    info!(
        worker_id = %worker_id,
        "worker starting (tick every {} seconds)",
        config.tick_seconds
    );

    let mut ticker = time::interval(Duration::from_secs(config.tick_seconds));

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                conversation_purge::purge_tick(&store, config.purge_batch_size, worker_id).await;
            }
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("worker=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
