#![allow(dead_code)]

use std::sync::OnceLock;

use axum::Router;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rand::thread_rng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const KEY_ID: &str = "integration-identity-key";

/// Identity provider stand-in: publishes one RSA key over HTTP and signs
/// tokens with its private half.
pub struct TestIdentity {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    jwks_server: JoinHandle<()>,
}

struct SigningKey {
    encoding: EncodingKey,
    jwks: Value,
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    iss: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl TestIdentity {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("jwks listener should bind");
        let addr = listener.local_addr().expect("jwks listener address");
        let jwks = signing_key().jwks.clone();
        let app = Router::new().route(
            "/jwks",
            get(move || {
                let jwks = jwks.clone();
                async move { ([("cache-control", "public, max-age=300")], axum::Json(jwks)) }
            }),
        );
        let jwks_server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("jwks server should run");
        });

        Self {
            issuer: "https://identity.example.test".to_string(),
            audience: "chat-api".to_string(),
            jwks_url: format!("http://{addr}/jwks"),
            jwks_server,
        }
    }

    /// `Authorization` header value carrying a currently valid token.
    pub fn bearer(&self, subject: &str) -> String {
        format!("Bearer {}", self.issue(subject, &self.audience, Duration::minutes(5)))
    }

    pub fn expired_token_for_subject(&self, subject: &str) -> String {
        self.issue(subject, &self.audience, Duration::minutes(-5))
    }

    pub fn token_with_audience(&self, subject: &str, audience: &str) -> String {
        self.issue(subject, audience, Duration::minutes(5))
    }

    fn issue(&self, subject: &str, audience: &str, valid_for: Duration) -> String {
        let now = Utc::now();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(KEY_ID.to_string());
        let claims = Claims {
            sub: subject,
            iss: &self.issuer,
            aud: audience,
            iat: (now - Duration::minutes(10)).timestamp(),
            exp: (now + valid_for).timestamp(),
        };

        encode(&header, &claims, &signing_key().encoding).expect("token should sign")
    }
}

impl Drop for TestIdentity {
    fn drop(&mut self) {
        self.jwks_server.abort();
    }
}

fn signing_key() -> &'static SigningKey {
    static KEY: OnceLock<SigningKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let private_key =
            RsaPrivateKey::new(&mut thread_rng(), 2048).expect("rsa key should generate");
        let public_key = private_key.to_public_key();
        let pem = private_key
            .to_pkcs8_pem(Default::default())
            .expect("rsa key should serialize");

        SigningKey {
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes()).expect("pem should load"),
            jwks: json!({
                "keys": [{
                    "kid": KEY_ID,
                    "kty": "RSA",
                    "alg": "RS256",
                    "use": "sig",
                    "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
                    "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
                }]
            }),
        }
    })
}
