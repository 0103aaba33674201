use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use shared::attachments::{
    AttachmentBlock, AttachmentUpload, NormalizedAttachment, StoredAttachment,
    normalize_attachment,
};
use shared::conversation::is_valid_conversation_id;
use shared::llm::LlmChatRequest;
use shared::models::{ChatFile, ChatRequest, ChatResponse};
use shared::relay::{
    FailureOrigin, RelayCollectError, SessionTurnSink, TurnSink, collect_relay,
    encode_ndjson_line, relay_stream,
};
use shared::session::{PreparedTurn, SessionError};
use tracing::{info, warn};

use super::errors::{
    bad_gateway_response, bad_request_response, internal_error_response,
    payload_too_large_response, session_error_response,
};
use super::observability::RequestContext;
use super::{AppState, AuthUser};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub(super) async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(request_context): Extension<RequestContext>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return payload_too_large_response("Request body is too large");
        }
        Err(rejection) => {
            warn!(
                request_id = %request_context.request_id,
                "chat request rejected: {}",
                rejection.body_text()
            );
            return bad_request_response("invalid_request", "Request body is invalid");
        }
    };

    if let Some(response) = validate_chat_request(&req, &state) {
        return response;
    }

    let now = Utc::now();
    let uploads = extract_uploads(&state, &user.user_id, &req.files);
    let attachments = uploads
        .iter()
        .map(|upload| upload.block.clone())
        .collect::<Vec<_>>();

    let prepared = match prepare(&state, &user.user_id, &req, &attachments, now).await {
        Ok(prepared) => prepared,
        Err(err) => return session_error_response(err),
    };
    store_uploads(&state, &user.user_id, &uploads, now).await;

    info!(
        request_id = %request_context.request_id,
        user_id = %user.user_id,
        conversation_id = %prepared.conversation_id,
        history_turns = prepared.history.len(),
        attachments = attachments.len(),
        forked = prepared.forked_from.is_some(),
        stream = req.stream,
        "chat turn prepared"
    );

    let llm_request = LlmChatRequest::from_turns(
        state.system_prompt.clone(),
        &prepared.context_turns(),
        state.llm_max_tokens,
    )
    .with_requester_id(&user.user_id);

    let gateway = state.gateway.clone();
    let source = async move { gateway.stream_chat(llm_request).await };

    let conversation_id = prepared.conversation_id.clone();
    let sink: Arc<dyn TurnSink> = Arc::new(SessionTurnSink::new(
        state.sessions.clone(),
        user.user_id.clone(),
        prepared,
    ));
    let events = relay_stream(conversation_id, source, sink);

    if req.stream {
        let body = Body::from_stream(events.map(|event| encode_ndjson_line(&event)));
        return (
            [
                (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache"),
                (X_ACCEL_BUFFERING, "no"),
            ],
            body,
        )
            .into_response();
    }

    match collect_relay(events).await {
        Ok(collected) => (
            StatusCode::OK,
            Json(ChatResponse {
                response: collected.text,
                conversation_id: collected.conversation_id,
                timestamp: collected.timestamp,
            }),
        )
            .into_response(),
        Err(RelayCollectError::Failed {
            origin: FailureOrigin::Inference,
            message,
            ..
        }) => bad_gateway_response("inference_failed", &message),
        Err(RelayCollectError::Failed {
            origin: FailureOrigin::Persistence,
            message,
            ..
        }) => internal_error_response("persistence_failed", &message),
        Err(RelayCollectError::Incomplete) => {
            internal_error_response("internal_error", "Unexpected server error")
        }
    }
}

fn validate_chat_request(req: &ChatRequest, state: &AppState) -> Option<Response> {
    if req.message.trim().is_empty() {
        return Some(bad_request_response(
            "invalid_request",
            "Message must not be empty",
        ));
    }
    if req.message.chars().count() > state.limits.max_message_chars {
        return Some(bad_request_response(
            "message_too_long",
            "Message exceeds the maximum length",
        ));
    }
    if req.files.len() > state.limits.max_files {
        return Some(bad_request_response(
            "too_many_files",
            "Too many files attached",
        ));
    }
    if req.conversation_id.is_some() && req.fork_from.is_some() {
        return Some(bad_request_response(
            "invalid_request",
            "conversationId and forkFrom cannot be combined",
        ));
    }
    let referenced_ids = [req.conversation_id.as_deref(), req.fork_from.as_deref()];
    if referenced_ids
        .into_iter()
        .flatten()
        .any(|id| !is_valid_conversation_id(id))
    {
        return Some(bad_request_response(
            "invalid_conversation_id",
            "Conversation id is invalid",
        ));
    }

    None
}

/// Extracts text from every upload. A file that cannot be read becomes an
/// inline notice instead of failing the request.
fn extract_uploads(state: &AppState, user_id: &str, files: &[ChatFile]) -> Vec<NormalizedAttachment> {
    files
        .iter()
        .map(|file| {
            let upload = AttachmentUpload {
                file_name: file.file_name.clone(),
                declared_type: file.file_type.clone(),
                content_base64: file.file_content.clone(),
            };
            let normalized = normalize_attachment(
                &upload,
                state.extractor.as_ref(),
                state.limits.max_attachment_chars,
            );
            if let Some(err) = normalized.error.as_ref() {
                warn!(
                    user_id = %user_id,
                    file_name = %normalized.block.name,
                    error = %err,
                    "attachment could not be read"
                );
            }
            normalized
        })
        .collect()
}

/// Keeps the raw bytes once the turn is accepted. Storage failures are logged
/// and never fail the chat request.
async fn store_uploads(
    state: &AppState,
    user_id: &str,
    uploads: &[NormalizedAttachment],
    now: DateTime<Utc>,
) {
    for normalized in uploads {
        let stored = StoredAttachment::from_normalized(user_id, normalized, now);
        if let Err(err) = state.blob_store.put(&stored).await {
            warn!(
                user_id = %user_id,
                file_id = %stored.metadata.file_id,
                error = %err,
                "failed to store attachment blob"
            );
        }
    }
}

async fn prepare(
    state: &AppState,
    user_id: &str,
    req: &ChatRequest,
    attachments: &[AttachmentBlock],
    now: DateTime<Utc>,
) -> Result<PreparedTurn, SessionError> {
    let Some(fork_from) = req.fork_from.as_deref() else {
        return state
            .sessions
            .prepare_turn(
                user_id,
                req.conversation_id.as_deref(),
                &req.message,
                attachments,
                now,
            )
            .await;
    };

    let visible_turns = state
        .sessions
        .load_conversation(user_id, fork_from, now)
        .await?;
    let seed = state
        .sessions
        .fork_and_detach(user_id, fork_from, visible_turns)
        .await?;

    state
        .sessions
        .prepare_forked_turn(seed, &req.message, attachments, now)
}
