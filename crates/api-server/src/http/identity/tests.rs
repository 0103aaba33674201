use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use rand::thread_rng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use serde::Serialize;

use super::super::jwks_cache::SigningKeys;
use super::{IdentityError, VerifiedIdentity, verify_with_key};

const KEY_ID: &str = "unit-key";
const ISSUER: &str = "https://identity.example.test";
const AUDIENCE: &str = "chat-api";

struct Keys {
    encoding: EncodingKey,
    published: SigningKeys,
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    iat: i64,
    exp: i64,
    iss: &'a str,
    aud: &'a str,
}

fn keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private_key =
            RsaPrivateKey::new(&mut thread_rng(), 2048).expect("rsa key should generate");
        let public_key = private_key.to_public_key();
        let pem = private_key
            .to_pkcs8_pem(Default::default())
            .expect("rsa key should serialize");
        let jwks = serde_json::json!({
            "keys": [{
                "kid": KEY_ID,
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            }]
        });

        Keys {
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes()).expect("pem should load"),
            published: SigningKeys::from_jwks_json(&jwks.to_string())
                .expect("published jwks should parse"),
        }
    })
}

fn published_key() -> &'static DecodingKey {
    keys().published.get(KEY_ID).expect("key should be published")
}

fn token(subject: &str, audience: &str, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KEY_ID.to_string());
    let claims = Claims {
        sub: subject,
        iat: issued_at.timestamp(),
        exp: expires_at.timestamp(),
        iss: ISSUER,
        aud: audience,
    };
    encode(&header, &claims, &keys().encoding).expect("token should sign")
}

fn current_token(subject: &str, audience: &str) -> String {
    let now = Utc::now();
    token(subject, audience, now - Duration::minutes(1), now + Duration::minutes(5))
}

fn verify(token: &str) -> Result<VerifiedIdentity, IdentityError> {
    verify_with_key(token, published_key(), ISSUER, AUDIENCE)
}

fn rejection_message(result: Result<VerifiedIdentity, IdentityError>) -> &'static str {
    match result {
        Err(IdentityError::InvalidToken { message, .. }) => message,
        Err(other) => panic!("expected an invalid token, got {other:?}"),
        Ok(identity) => panic!("expected rejection, verified {}", identity.subject),
    }
}

#[test]
fn valid_token_yields_trimmed_subject() {
    let identity = verify(&current_token(" user_123 ", AUDIENCE)).expect("token should verify");
    assert_eq!(identity.subject, "user_123");
}

#[test]
fn expired_token_reports_expired_code() {
    let now = Utc::now();
    let stale = token("user_123", AUDIENCE, now - Duration::minutes(10), now - Duration::minutes(5));

    assert!(matches!(
        verify(&stale),
        Err(IdentityError::InvalidToken {
            code: "expired_token",
            ..
        })
    ));
}

#[test]
fn token_for_another_audience_is_rejected() {
    assert_eq!(
        rejection_message(verify(&current_token("user_123", "billing-api"))),
        "Bearer token audience does not match"
    );
}

#[test]
fn blank_subject_is_rejected() {
    assert_eq!(
        rejection_message(verify(&current_token("   ", AUDIENCE))),
        "Bearer token subject is missing"
    );
}

#[test]
fn issue_time_beyond_clock_skew_is_rejected() {
    let now = Utc::now();
    let early = token("user_123", AUDIENCE, now + Duration::minutes(10), now + Duration::minutes(20));

    assert_eq!(
        rejection_message(verify(&early)),
        "Bearer token issue time is invalid"
    );
}

#[test]
fn token_signed_by_another_key_fails_validation() {
    let foreign =
        DecodingKey::from_rsa_components("sXch", "AQAB").expect("components should decode");
    let result = verify_with_key(&current_token("user_123", AUDIENCE), &foreign, ISSUER, AUDIENCE);

    assert_eq!(rejection_message(result), "Bearer token validation failed");
}
