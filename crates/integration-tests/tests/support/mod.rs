#![allow(dead_code)]

pub mod api_app;
pub mod identity;
pub mod llm_mock;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use shared::relay::RelayEvent;
use tower::ServiceExt;

pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Value,
}

pub async fn send_json(app: &axum::Router, request: Request<Body>) -> JsonResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");
    let body = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));

    JsonResponse { status, body }
}

pub struct NdjsonResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub accel_buffering: Option<String>,
    pub events: Vec<Value>,
}

/// Reads a streamed body to completion and splits it into one JSON value per line.
pub async fn send_ndjson(app: &axum::Router, request: Request<Body>) -> NdjsonResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let header_value = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let status = response.status();
    let content_type = header_value(header::CONTENT_TYPE.as_str());
    let cache_control = header_value(header::CACHE_CONTROL.as_str());
    let accel_buffering = header_value("x-accel-buffering");

    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");
    let text = String::from_utf8(body.to_vec()).expect("ndjson body should be utf-8");
    assert!(
        text.is_empty() || text.ends_with('\n'),
        "every ndjson record should be newline terminated"
    );
    let events = text
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("each line should be json"))
        .collect();

    NdjsonResponse {
        status,
        content_type,
        cache_control,
        accel_buffering,
        events,
    }
}

pub fn request(method: Method, path: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::ACCEPT, "application/json");

    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, token);
    }

    let request_body = body
        .map(|value| {
            serde_json::to_vec(&value).expect("json body should serialize for integration request")
        })
        .unwrap_or_default();
    if !request_body.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }

    builder
        .body(Body::from(request_body))
        .expect("integration request should build")
}

pub fn error_code(body: &Value) -> Option<&str> {
    body.get("error")?.get("code")?.as_str()
}

pub fn event_types(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default())
        .collect()
}

pub fn decode_event(value: &Value) -> RelayEvent {
    serde_json::from_value(value.clone()).expect("event should decode")
}
