use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use shared::config::IdentityConfig;

use super::jwks_cache::{JwksCache, JwksCacheError};

const CLOCK_SKEW_SECONDS: i64 = 60;
const REQUIRED_CLAIMS: [&str; 5] = ["exp", "iat", "iss", "aud", "sub"];

/// The caller as established by a verified bearer token.
#[derive(Debug, Clone)]
pub(super) struct VerifiedIdentity {
    pub(super) subject: String,
}

#[derive(Debug, Clone)]
pub(super) enum IdentityError {
    /// The token itself is unacceptable; answered with 401.
    InvalidToken {
        code: &'static str,
        message: &'static str,
    },
    /// The provider's keys could not be obtained; answered with 502.
    UpstreamUnavailable {
        code: &'static str,
        message: &'static str,
    },
}

#[derive(Deserialize)]
struct TokenClaims {
    sub: String,
    iat: i64,
}

pub(super) async fn verify_identity_token(
    http_client: &reqwest::Client,
    jwks_cache: &JwksCache,
    identity: &IdentityConfig,
    token: &str,
) -> Result<VerifiedIdentity, IdentityError> {
    let header = decode_header(token).map_err(|_| rejected("Bearer token is malformed"))?;
    if header.alg != Algorithm::RS256 {
        return Err(rejected("Bearer token algorithm is unsupported"));
    }
    let key_id = header
        .kid
        .ok_or_else(|| rejected("Bearer token key id is missing"))?;

    let key = jwks_cache
        .signing_key(http_client, &identity.jwks_url, &key_id)
        .await
        .map_err(|err| match err {
            JwksCacheError::UnknownKeyId | JwksCacheError::ZeroTtl(_) => {
                rejected("Bearer token key was not recognized")
            }
            JwksCacheError::UpstreamUnavailable => IdentityError::UpstreamUnavailable {
                code: "jwks_unavailable",
                message: "Unable to reach identity provider JWKS endpoint",
            },
        })?;

    verify_with_key(token, &key, &identity.issuer, &identity.audience)
}

fn verify_with_key(
    token: &str,
    key: &DecodingKey,
    issuer: &str,
    audience: &str,
) -> Result<VerifiedIdentity, IdentityError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);
    validation.leeway = CLOCK_SKEW_SECONDS.unsigned_abs();
    validation.set_required_spec_claims(&REQUIRED_CLAIMS);

    let claims = decode::<TokenClaims>(token, key, &validation)
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => IdentityError::InvalidToken {
                code: "expired_token",
                message: "Bearer token is expired",
            },
            ErrorKind::InvalidAudience => rejected("Bearer token audience does not match"),
            ErrorKind::InvalidIssuer => rejected("Bearer token issuer is invalid"),
            _ => rejected("Bearer token validation failed"),
        })?
        .claims;

    if claims.iat > Utc::now().timestamp() + CLOCK_SKEW_SECONDS {
        return Err(rejected("Bearer token issue time is invalid"));
    }

    let subject = claims.sub.trim();
    if subject.is_empty() {
        return Err(rejected("Bearer token subject is missing"));
    }

    Ok(VerifiedIdentity {
        subject: subject.to_string(),
    })
}

fn rejected(message: &'static str) -> IdentityError {
    IdentityError::InvalidToken {
        code: "invalid_token",
        message,
    }
}

#[cfg(test)]
mod tests;
