use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use super::errors::{bad_gateway_response, unauthorized_response};
use super::identity::{IdentityError, verify_identity_token};
use super::{AppState, AuthUser};

/// Resolves the caller from the bearer token before any handler runs. The
/// token subject becomes the opaque user id every store call is scoped by.
pub(super) async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        debug!("request without a usable bearer token");
        return unauthorized_response();
    };

    let verified =
        verify_identity_token(&state.http_client, &state.jwks_cache, &state.identity, token).await;
    let user_id = match verified {
        Ok(identity) => identity.subject,
        Err(IdentityError::InvalidToken { code, message }) => {
            warn!(code, reason = %message, "bearer token rejected");
            return unauthorized_response();
        }
        Err(IdentityError::UpstreamUnavailable { code, message }) => {
            warn!(code, reason = %message, "identity keys unavailable");
            return bad_gateway_response(code, message);
        }
    };

    req.extensions_mut().insert(AuthUser { user_id });
    next.run(req).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use axum::http::header::AUTHORIZATION;

    use super::bearer_token;

    fn headers_with(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn extracts_trimmed_bearer_token() {
        let headers = headers_with("Bearer  eyJ.payload.sig ");
        assert_eq!(bearer_token(&headers), Some("eyJ.payload.sig"));
    }

    #[test]
    fn other_schemes_and_blank_tokens_are_ignored() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
        for value in ["Basic dXNlcjpwYXNz", "Bearer ", "Bearer    ", "bearer abc"] {
            assert_eq!(bearer_token(&headers_with(value)), None, "{value}");
        }
    }
}
