use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use shared::attachments::{
    AttachmentError, AttachmentUpload, StoredAttachment, normalize_attachment,
};
use shared::models::{ChatFile, FileProcessResponse};
use tracing::{error, info, warn};

use super::errors::{bad_request_response, internal_error_response, payload_too_large_response};
use super::observability::RequestContext;
use super::{AppState, AuthUser};

/// Extracts text from a single upload and keeps the raw bytes under a new
/// file id. Unreadable files answer 200 with `success: false`.
pub(super) async fn process_file(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(request_context): Extension<RequestContext>,
    payload: Result<Json<ChatFile>, JsonRejection>,
) -> Response {
    let Json(file) = match payload {
        Ok(payload) => payload,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return payload_too_large_response("Request body is too large");
        }
        Err(rejection) => {
            warn!(
                request_id = %request_context.request_id,
                "file request rejected: {}",
                rejection.body_text()
            );
            return bad_request_response("invalid_request", "Request body is invalid");
        }
    };

    let normalized = normalize_attachment(
        &AttachmentUpload {
            file_name: file.file_name,
            declared_type: file.file_type,
            content_base64: file.file_content,
        },
        state.extractor.as_ref(),
        state.limits.max_attachment_chars,
    );

    match normalized.error.as_ref() {
        Some(AttachmentError::InvalidEncoding) => {
            return bad_request_response(
                "invalid_file_content",
                "File content is not valid base64",
            );
        }
        Some(err) => {
            warn!(
                request_id = %request_context.request_id,
                user_id = %user.user_id,
                file_name = %normalized.block.name,
                error = %err,
                "file could not be processed"
            );
            return (
                StatusCode::OK,
                Json(FileProcessResponse {
                    success: false,
                    file_id: None,
                    file_name: normalized.block.name.clone(),
                    file_size: normalized.bytes.len(),
                    extracted_text: None,
                    text_length: None,
                    error: Some(err.to_string()),
                }),
            )
                .into_response();
        }
        None => {}
    }

    let stored = StoredAttachment::from_normalized(&user.user_id, &normalized, Utc::now());
    if let Err(err) = state.blob_store.put(&stored).await {
        error!(
            request_id = %request_context.request_id,
            user_id = %user.user_id,
            file_id = %stored.metadata.file_id,
            "failed to store uploaded file: {err}"
        );
        return internal_error_response("storage_failed", "Unable to store file");
    }

    let metadata = stored.metadata;
    info!(
        request_id = %request_context.request_id,
        user_id = %user.user_id,
        file_id = %metadata.file_id,
        file_size = metadata.size,
        text_length = metadata.text_length,
        truncated = metadata.truncated,
        "file processed"
    );

    (
        StatusCode::OK,
        Json(FileProcessResponse {
            success: true,
            file_id: Some(metadata.file_id),
            file_name: metadata.file_name,
            file_size: metadata.size,
            extracted_text: Some(metadata.extracted_text),
            text_length: Some(metadata.text_length),
            error: None,
        }),
    )
        .into_response()
}
