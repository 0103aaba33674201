use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::header::HeaderName;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const REQUEST_ID_MAX_CHARS: usize = 128;

/// Per-request correlation data handed to handlers as an extension.
#[derive(Clone, Debug)]
pub(super) struct RequestContext {
    pub(super) request_id: String,
}

/// Tags every request with an `x-request-id`, runs it inside a span carrying
/// that id, and emits one completion line per request.
pub(super) async fn request_observability_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize_request_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let line = CompletionLine::for_request(&req);
    req.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
    });

    let span = info_span!("http_request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID.clone(), value);
    }
    line.emit(&request_id, response.status());
    response
}

struct CompletionLine {
    method: Method,
    route: String,
    started_at: Instant,
}

impl CompletionLine {
    fn for_request(req: &Request) -> Self {
        // Matched routes keep conversation ids out of the log line.
        let route = match req.extensions().get::<MatchedPath>() {
            Some(matched) => matched.as_str().to_string(),
            None => req.uri().path().to_string(),
        };
        Self {
            method: req.method().clone(),
            route,
            started_at: Instant::now(),
        }
    }

    fn emit(self, request_id: &str, status: StatusCode) {
        let latency_ms = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let status_code = status.as_u16();
        if status.is_server_error() {
            warn!(
                request_id,
                method = %self.method,
                route = %self.route,
                status = status_code,
                latency_ms,
                "request completed with server error"
            );
        } else {
            info!(
                request_id,
                method = %self.method,
                route = %self.route,
                status = status_code,
                latency_ms,
                "request completed"
            );
        }
    }
}

/// Accepts client ids made of ASCII alphanumerics plus `-`, `_` and `.`.
fn normalize_request_id(raw: &str) -> Option<String> {
    let candidate = raw.trim();
    let acceptable = !candidate.is_empty()
        && candidate.len() <= REQUEST_ID_MAX_CHARS
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    acceptable.then(|| candidate.to_string())
}
