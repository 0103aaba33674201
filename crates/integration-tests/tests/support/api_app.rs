#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use api_server::http::{AppState, JwksCache, JwksCacheConfig, build_router};
use shared::attachments::{InMemoryBlobStore, UnsupportedDocumentExtractor};
use shared::config::{IdentityConfig, RequestLimits};
use shared::repos::{InMemoryHistoryStore, RetentionPolicy};
use shared::session::{FailedTurnPolicy, SessionManager, SessionPolicy};

use super::identity::TestIdentity;
use super::llm_mock::ScriptedGateway;

pub const TEST_SYSTEM_PROMPT: &str = "You are a test assistant.";

pub struct TestApp {
    pub router: axum::Router,
    pub history: Arc<InMemoryHistoryStore>,
    pub gateway: ScriptedGateway,
    pub blobs: InMemoryBlobStore,
    pub identity: TestIdentity,
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(FailedTurnPolicy::Discard, RequestLimits::default()).await
}

pub async fn build_test_app_with(
    failed_turn: FailedTurnPolicy,
    limits: RequestLimits,
) -> TestApp {
    let identity = TestIdentity::start().await;
    let history = Arc::new(InMemoryHistoryStore::new(RetentionPolicy::default()));
    let gateway = ScriptedGateway::default();
    let blobs = InMemoryBlobStore::default();
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("http client should initialize");
    let jwks_cache = JwksCache::new(JwksCacheConfig {
        default_ttl_seconds: 300,
        stale_ttl_seconds: 300,
    })
    .expect("jwks cache should initialize");

    let state = AppState {
        sessions: SessionManager::new(
            history.clone(),
            SessionPolicy {
                failed_turn,
                ..SessionPolicy::default()
            },
        ),
        history: history.clone(),
        gateway: Arc::new(gateway.clone()),
        blob_store: Arc::new(blobs.clone()),
        extractor: Arc::new(UnsupportedDocumentExtractor),
        identity: IdentityConfig {
            jwks_url: identity.jwks_url.clone(),
            issuer: identity.issuer.clone(),
            audience: identity.audience.clone(),
            jwks_cache_ttl_seconds: 300,
        },
        jwks_cache,
        http_client,
        limits,
        system_prompt: TEST_SYSTEM_PROMPT.to_string(),
        llm_max_tokens: 512,
    };

    TestApp {
        router: build_router(state),
        history,
        gateway,
        blobs,
        identity,
    }
}
