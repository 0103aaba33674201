use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use shared::models::{
    ConversationListItem, ConversationListResponse, ConversationResponse,
    DeleteConversationResponse,
};
use tracing::info;

use super::errors::session_error_response;
use super::{AppState, AuthUser};

pub(super) async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    let summaries = match state
        .sessions
        .list_conversations(&user.user_id, Utc::now())
        .await
    {
        Ok(summaries) => summaries,
        Err(err) => return session_error_response(err),
    };

    let conversations = summaries
        .into_iter()
        .map(|summary| ConversationListItem {
            conversation_id: summary.conversation_id,
            timestamp: summary.last_timestamp,
            message_count: summary.turn_count,
            preview: summary.preview,
        })
        .collect::<Vec<_>>();

    (
        StatusCode::OK,
        Json(ConversationListResponse {
            count: conversations.len(),
            conversations,
        }),
    )
        .into_response()
}

pub(super) async fn get_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state
        .sessions
        .load_conversation(&user.user_id, &conversation_id, Utc::now())
        .await
    {
        Ok(messages) => (
            StatusCode::OK,
            Json(ConversationResponse {
                conversation_id,
                messages,
            }),
        )
            .into_response(),
        Err(err) => session_error_response(err),
    }
}

pub(super) async fn delete_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state
        .sessions
        .delete_conversation(&user.user_id, &conversation_id)
        .await
    {
        Ok(removed) => {
            info!(
                user_id = %user.user_id,
                conversation_id = %conversation_id,
                removed,
                "conversation deleted"
            );
            (
                StatusCode::OK,
                Json(DeleteConversationResponse {
                    success: true,
                    conversation_id,
                }),
            )
                .into_response()
        }
        Err(err) => session_error_response(err),
    }
}
