use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shared::models::{ErrorBody, ErrorResponse};
use shared::repos::StoreError;
use shared::session::SessionError;
use tracing::error;

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
        .into_response()
}

pub(super) fn bad_request_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, code, message)
}

pub(super) fn payload_too_large_response(message: &str) -> Response {
    error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
}

pub(super) fn bad_gateway_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::BAD_GATEWAY, code, message)
}

pub(super) fn service_unavailable_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, code, message)
}

pub(super) fn unauthorized_response() -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "Missing or invalid bearer token",
    )
}

pub(super) fn internal_error_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}

pub(super) fn store_error_response(err: StoreError) -> Response {
    error!("history store operation failed: {err}");
    internal_error_response("internal_error", "Unexpected server error")
}

pub(super) fn session_error_response(err: SessionError) -> Response {
    match err {
        SessionError::EmptyMessage => {
            bad_request_response("invalid_request", "Message must not be empty")
        }
        SessionError::InvalidConversationId(_) => {
            bad_request_response("invalid_conversation_id", "Conversation id is invalid")
        }
        SessionError::OutOfOrder { index } => {
            error!(index, "conversation turns are out of order");
            internal_error_response("internal_error", "Unexpected server error")
        }
        SessionError::Store(err) => store_error_response(err),
    }
}
