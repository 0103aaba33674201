use std::net::SocketAddr;
use std::sync::Arc;

use api_server::http::{self, JwksCache, JwksCacheConfig};
use shared::attachments::{LocalDirBlobStore, UnsupportedDocumentExtractor};
use shared::config::{ApiConfig, HistoryBackend, load_dotenv};
use shared::llm::{OpenRouterGateway, OpenRouterGatewayConfig};
use shared::repos::{HistoryStore, InMemoryHistoryStore, PgHistoryStore};
use shared::session::SessionManager;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "api_server=debug,shared=info,tower_http=info";

#[tokio::main]
async fn main() {
    load_dotenv();
    init_tracing();

    let config = match ApiConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to read config: {err}");
            std::process::exit(1);
        }
    };

    let retention = match config.retention_policy() {
        Ok(policy) => policy,
        Err(err) => {
            error!("invalid retention policy: {err}");
            std::process::exit(1);
        }
    };

    let history: Arc<dyn HistoryStore> = match config.history_backend {
        HistoryBackend::Memory => {
            warn!("using in-memory history store; conversations are lost on restart");
            Arc::new(InMemoryHistoryStore::new(retention))
        }
        HistoryBackend::Postgres => {
            let Some(database_url) = config.database_url.as_deref() else {
                error!("DATABASE_URL is required for the postgres history backend");
                std::process::exit(1);
            };
            let store = match PgHistoryStore::connect(
                database_url,
                config.database_max_connections,
                retention,
            )
            .await
            {
                Ok(store) => store,
                Err(err) => {
                    error!("failed to connect to postgres: {err}");
                    std::process::exit(1);
                }
            };

            let migrator = match sqlx::migrate::Migrator::new(config.migrations_dir.clone()).await
            {
                Ok(migrator) => migrator,
                Err(err) => {
                    error!("failed to load migrations: {err}");
                    std::process::exit(1);
                }
            };
            if let Err(err) = migrator.run(store.pool()).await {
                error!("failed to run migrations: {err}");
                std::process::exit(1);
            }

            Arc::new(store)
        }
    };

    let gateway = match OpenRouterGatewayConfig::from_env().and_then(OpenRouterGateway::new) {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("failed to configure llm gateway: {err}");
            std::process::exit(1);
        }
    };

    let jwks_cache = match JwksCache::new(JwksCacheConfig {
        default_ttl_seconds: config.identity.jwks_cache_ttl_seconds,
        stale_ttl_seconds: config.identity.jwks_cache_ttl_seconds,
    }) {
        Ok(cache) => cache,
        Err(err) => {
            error!("failed to initialize jwks cache: {err}");
            std::process::exit(1);
        }
    };

    let app = http::build_router(http::AppState {
        sessions: SessionManager::new(history.clone(), config.session_policy()),
        history,
        gateway: Arc::new(gateway),
        blob_store: Arc::new(LocalDirBlobStore::new(config.attachment_dir.clone())),
        extractor: Arc::new(UnsupportedDocumentExtractor),
        identity: config.identity.clone(),
        jwks_cache,
        http_client: reqwest::Client::new(),
        limits: config.limits.clone(),
        system_prompt: config.system_prompt.clone(),
        llm_max_tokens: config.llm_max_tokens,
    });

    let addr: SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid API_BIND_ADDR {}: {err}", config.bind_addr);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    info!(
        history_backend = ?config.history_backend,
        failed_turn_policy = config.failed_turn_policy.as_str(),
        "api server listening on {}",
        listener.local_addr().unwrap_or(addr)
    );
    if let Err(err) = axum::serve(listener, app).await {
        error!("server exited with error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
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
