use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shared::models::OkResponse;
use tracing::warn;

use super::AppState;
use super::errors::service_unavailable_response;

pub(super) async fn healthz() -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

/// Ready once the history store answers a ping.
pub(super) async fn readyz(State(state): State<AppState>) -> Response {
    if let Err(err) = state.history.ping().await {
        warn!(error = %err, "history store failed readiness ping");
        return service_unavailable_response("history_unavailable", "History store not ready");
    }
    (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
}
