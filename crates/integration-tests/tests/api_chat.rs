mod support;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use serde_json::json;
use shared::config::RequestLimits;
use shared::conversation::Role;
use shared::llm::LlmGatewayError;
use shared::models::ChatResponse;
use shared::repos::HistoryStore;
use shared::session::FailedTurnPolicy;

use support::api_app::{TEST_SYSTEM_PROMPT, build_test_app, build_test_app_with};
use support::llm_mock::Script;
use support::{error_code, request, send_json};

#[tokio::test]
async fn first_message_creates_conversation_and_persists_exchange() {
    let app = build_test_app().await;
    app.gateway.push(Script::Reply(vec!["Hi", " there"]));
    let auth = app.identity.bearer("user-a");

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Hello"})),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let body: ChatResponse =
        serde_json::from_value(response.body).expect("chat response should decode");
    assert_eq!(body.response, "Hi there");
    assert!(!body.conversation_id.is_empty());

    let llm_request = app.gateway.last_request();
    assert_eq!(llm_request.system_prompt, TEST_SYSTEM_PROMPT);
    assert_eq!(llm_request.requester_id.as_deref(), Some("user-a"));
    assert_eq!(llm_request.max_tokens, 512);
    assert_eq!(llm_request.messages.len(), 1);
    assert_eq!(llm_request.messages[0].role, Role::User);
    assert_eq!(llm_request.messages[0].content, "Hello");

    let stored = app
        .history
        .load("user-a", &body.conversation_id, Utc::now())
        .await
        .expect("load should succeed")
        .expect("conversation should be stored");
    assert_eq!(stored.turns.len(), 2);
    assert_eq!(stored.turns[0].role, Role::User);
    assert_eq!(stored.turns[0].content, "Hello");
    assert_eq!(stored.turns[1].role, Role::Assistant);
    assert_eq!(stored.turns[1].content, "Hi there");
    assert!(stored.turns[0].timestamp < stored.turns[1].timestamp);
}

#[tokio::test]
async fn follow_up_message_sends_prior_turns_as_context() {
    let app = build_test_app().await;
    let auth = app.identity.bearer("user-a");
    app.gateway.push(Script::Reply(vec!["Paris."]));
    app.gateway.push(Script::Reply(vec!["About 2 million."]));

    let first = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Capital of France?"})),
        ),
    )
    .await;
    assert_eq!(first.status, StatusCode::OK);
    let conversation_id = first.body["conversationId"]
        .as_str()
        .expect("conversation id should be returned")
        .to_string();

    let second = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Population?", "conversationId": conversation_id})),
        ),
    )
    .await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body["conversationId"], conversation_id.as_str());
    assert_eq!(second.body["response"], "About 2 million.");

    let llm_request = app.gateway.last_request();
    let contents = llm_request
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        contents,
        vec![
            (Role::User, "Capital of France?"),
            (Role::Assistant, "Paris."),
            (Role::User, "Population?"),
        ]
    );

    let stored = app
        .history
        .load("user-a", &conversation_id, Utc::now())
        .await
        .expect("load should succeed")
        .expect("conversation should be stored");
    assert_eq!(stored.turns.len(), 4);
    assert!(
        stored
            .turns
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    );
}

#[tokio::test]
async fn unknown_conversation_id_starts_fresh_under_that_id() {
    let app = build_test_app().await;
    let auth = app.identity.bearer("user-a");

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Hello", "conversationId": "client-chosen-id"})),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["conversationId"], "client-chosen-id");
    assert_eq!(app.gateway.last_request().messages.len(), 1);
}

#[tokio::test]
async fn inference_failure_returns_bad_gateway_and_stores_nothing() {
    let app = build_test_app().await;
    let auth = app.identity.bearer("user-a");
    app.gateway.push(Script::Refuse(LlmGatewayError::ProviderFailure(
        "status=503 code=overloaded".to_string(),
    )));

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Hello"})),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&response.body), Some("inference_failed"));
    assert_eq!(app.history.record_count().await, 0);
}

#[tokio::test]
async fn mid_stream_failure_without_streaming_discards_partial_answer() {
    let app = build_test_app().await;
    let auth = app.identity.bearer("user-a");
    app.gateway.push(Script::FailAfter(vec!["Part", "ial"]));

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Hello"})),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&response.body), Some("inference_failed"));
    assert_eq!(app.history.record_count().await, 0);
}

#[tokio::test]
async fn record_unanswered_policy_keeps_the_failed_question() {
    let app = build_test_app_with(FailedTurnPolicy::RecordUnanswered, RequestLimits::default())
        .await;
    let auth = app.identity.bearer("user-a");
    app.gateway.push(Script::FailAfter(vec!["Part"]));

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "Hello", "conversationId": "kept-question"})),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);

    let stored = app
        .history
        .load("user-a", "kept-question", Utc::now())
        .await
        .expect("load should succeed")
        .expect("unanswered turn should be stored");
    assert_eq!(stored.turns.len(), 1);
    assert_eq!(stored.turns[0].content, "Hello");
    assert!(stored.turns[0].unanswered);
}

#[tokio::test]
async fn invalid_request_bodies_are_rejected_before_inference() {
    let app = build_test_app_with(
        FailedTurnPolicy::Discard,
        RequestLimits {
            max_files: 1,
            max_message_chars: 20,
            ..RequestLimits::default()
        },
    )
    .await;
    let auth = app.identity.bearer("user-a");
    let file = json!({"fileName": "a.txt", "fileType": "text/plain", "fileContent": "YQ=="});

    let cases = [
        (json!({"message": "   "}), "invalid_request"),
        (json!({"message": "x".repeat(21)}), "message_too_long"),
        (json!({"message": "Hi", "files": [file.clone(), file]}), "too_many_files"),
        (
            json!({"message": "Hi", "conversationId": "a", "forkFrom": "b"}),
            "invalid_request",
        ),
        (
            json!({"message": "Hi", "conversationId": "not a valid id!"}),
            "invalid_conversation_id",
        ),
        (json!({"text": "missing message"}), "invalid_request"),
    ];

    for (body, expected_code) in cases {
        let response = send_json(
            &app.router,
            request(Method::POST, "/chat", Some(auth.as_str()), Some(body)),
        )
        .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response.body), Some(expected_code));
    }

    assert!(app.gateway.requests().is_empty());
    assert_eq!(app.history.record_count().await, 0);
}

#[tokio::test]
async fn oversized_body_is_rejected_with_payload_too_large() {
    let app = build_test_app_with(
        FailedTurnPolicy::Discard,
        RequestLimits {
            max_request_bytes: 1024,
            ..RequestLimits::default()
        },
    )
    .await;
    let auth = app.identity.bearer("user-a");

    let response = send_json(
        &app.router,
        request(
            Method::POST,
            "/chat",
            Some(auth.as_str()),
            Some(json!({"message": "x".repeat(4096)})),
        ),
    )
    .await;

    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&response.body), Some("payload_too_large"));
    assert!(app.gateway.requests().is_empty());
}

#[tokio::test]
async fn unauthenticated_requests_have_no_side_effects() {
    let app = build_test_app().await;
    let body = json!({"message": "Hello"});
    let expired = format!(
        "Bearer {}",
        app.identity.expired_token_for_subject("user-a")
    );
    let wrong_audience = format!(
        "Bearer {}",
        app.identity.token_with_audience("user-a", "another-api")
    );

    let headers = [
        None,
        Some("Bearer "),
        Some("Basic abc"),
        Some(expired.as_str()),
        Some(wrong_audience.as_str()),
    ];
    for auth in headers {
        let response = send_json(
            &app.router,
            request(Method::POST, "/chat", auth, Some(body.clone())),
        )
        .await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&response.body), Some("unauthorized"));
    }

    let list = send_json(&app.router, request(Method::GET, "/conversations", None, None)).await;
    assert_eq!(list.status, StatusCode::UNAUTHORIZED);

    assert!(app.gateway.requests().is_empty());
    assert_eq!(app.history.record_count().await, 0);
}

#[tokio::test]
async fn health_endpoints_are_public() {
    let app = build_test_app().await;

    let healthz = send_json(&app.router, request(Method::GET, "/healthz", None, None)).await;
    assert_eq!(healthz.status, StatusCode::OK);
    assert_eq!(healthz.body["ok"], true);

    let readyz = send_json(&app.router, request(Method::GET, "/readyz", None, None)).await;
    assert_eq!(readyz.status, StatusCode::OK);
    assert_eq!(readyz.body["ok"], true);
}
