use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Router, middleware};
use shared::attachments::{AttachmentBlobStore, DocumentExtractor};
use shared::config::{IdentityConfig, RequestLimits};
use shared::llm::LlmGateway;
use shared::repos::HistoryStore;
use shared::session::SessionManager;

mod authn;
mod chat;
mod conversations;
mod errors;
mod files;
mod health;
mod identity;
mod jwks_cache;
mod observability;

pub use jwks_cache::{JwksCache, JwksCacheConfig};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub history: Arc<dyn HistoryStore>,
    pub gateway: Arc<dyn LlmGateway>,
    pub blob_store: Arc<dyn AttachmentBlobStore>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub identity: IdentityConfig,
    pub jwks_cache: JwksCache,
    pub http_client: reqwest::Client,
    pub limits: RequestLimits,
    pub system_prompt: String,
    pub llm_max_tokens: u32,
}

#[derive(Clone)]
pub(super) struct AuthUser {
    pub(super) user_id: String,
}

pub fn build_router(app_state: AppState) -> Router {
    let max_request_bytes = app_state.limits.max_request_bytes;

    let public_routes = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(app_state.clone());

    let auth_layer_state = app_state.clone();

    let protected_routes = Router::new()
        .route("/chat", post(chat::chat))
        .route("/files", post(files::process_file))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .layer(middleware::from_fn_with_state(
            auth_layer_state,
            authn::auth_middleware,
        ))
        .with_state(app_state);

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(middleware::from_fn(
            observability::request_observability_middleware,
        ))
}
