use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::DecodingKey;
use reqwest::header::{CACHE_CONTROL, HeaderMap};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const TTL_FLOOR_SECONDS: u64 = 60;
const TTL_CEILING_SECONDS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    /// Used when the JWKS response carries no usable `max-age`.
    pub default_ttl_seconds: u64,
    /// How long past expiry a cached key set may still be served while the
    /// identity provider is unreachable.
    pub stale_ttl_seconds: u64,
}

#[derive(Debug, Error)]
pub enum JwksCacheError {
    #[error("jwks cache {0} ttl must be greater than zero")]
    ZeroTtl(&'static str),
    #[error("token key id is not published by the identity provider")]
    UnknownKeyId,
    #[error("identity provider key set is unavailable")]
    UpstreamUnavailable,
}

/// RS256 signing keys published by the identity provider, indexed by `kid`.
#[derive(Clone)]
pub(super) struct SigningKeys {
    by_kid: HashMap<String, DecodingKey>,
}

#[derive(Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<PublishedKey>,
}

#[derive(Deserialize)]
struct PublishedKey {
    kid: Option<String>,
    kty: String,
    alg: Option<String>,
    #[serde(rename = "use")]
    key_use: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

impl SigningKeys {
    /// Keeps only RSA signature keys usable for RS256. Malformed entries are
    /// skipped so one bad key does not hide the rest of the set.
    pub(super) fn from_jwks_json(raw: &str) -> Option<Self> {
        let document: JwksDocument = serde_json::from_str(raw).ok()?;
        let by_kid = document
            .keys
            .into_iter()
            .filter(|key| key.kty == "RSA")
            .filter(|key| matches!(key.key_use.as_deref(), None | Some("sig")))
            .filter(|key| matches!(key.alg.as_deref(), None | Some("RS256")))
            .filter_map(|key| {
                let kid = key.kid?;
                let decoding_key =
                    DecodingKey::from_rsa_components(key.n.as_deref()?, key.e.as_deref()?).ok()?;
                Some((kid, decoding_key))
            })
            .collect::<HashMap<_, _>>();

        (!by_kid.is_empty()).then_some(Self { by_kid })
    }

    pub(super) fn get(&self, key_id: &str) -> Option<&DecodingKey> {
        self.by_kid.get(key_id)
    }

    fn len(&self) -> usize {
        self.by_kid.len()
    }
}

#[derive(Clone)]
struct CachedKeySet {
    keys: Arc<SigningKeys>,
    fresh_until: DateTime<Utc>,
    stale_until: DateTime<Utc>,
}

impl CachedKeySet {
    fn fresh_key(&self, key_id: &str, now: DateTime<Utc>) -> Option<DecodingKey> {
        if now > self.fresh_until {
            return None;
        }
        self.keys.get(key_id).cloned()
    }

    fn stale_key(&self, key_id: &str, now: DateTime<Utc>) -> Option<DecodingKey> {
        if now > self.stale_until {
            return None;
        }
        self.keys.get(key_id).cloned()
    }
}

/// In-process JWKS cache shared by every request this server handles.
#[derive(Clone)]
pub struct JwksCache {
    current: Arc<RwLock<Option<CachedKeySet>>>,
    refresh: Arc<Mutex<()>>,
    config: JwksCacheConfig,
}

impl JwksCache {
    pub fn new(config: JwksCacheConfig) -> Result<Self, JwksCacheError> {
        if config.default_ttl_seconds == 0 {
            return Err(JwksCacheError::ZeroTtl("default"));
        }
        if config.stale_ttl_seconds == 0 {
            return Err(JwksCacheError::ZeroTtl("stale"));
        }

        Ok(Self {
            current: Arc::new(RwLock::new(None)),
            refresh: Arc::new(Mutex::new(())),
            config,
        })
    }

    /// Resolves the verification key for `key_id`. An expired set, or one
    /// that lacks the key after a rotation, triggers a single refetch shared
    /// by concurrent callers.
    pub(super) async fn signing_key(
        &self,
        http_client: &reqwest::Client,
        jwks_url: &str,
        key_id: &str,
    ) -> Result<DecodingKey, JwksCacheError> {
        if let Some(key) = self.snapshot().await.and_then(|set| set.fresh_key(key_id, Utc::now())) {
            return Ok(key);
        }

        let _refreshing = self.refresh.lock().await;
        let previous = self.snapshot().await;
        let now = Utc::now();
        // Another caller may have refreshed while this one waited.
        if let Some(key) = previous.as_ref().and_then(|set| set.fresh_key(key_id, now)) {
            return Ok(key);
        }

        match self.refetch(http_client, jwks_url).await {
            Ok(fetched) => fetched
                .keys
                .get(key_id)
                .cloned()
                .ok_or(JwksCacheError::UnknownKeyId),
            Err(err) => match previous.and_then(|set| set.stale_key(key_id, now)) {
                Some(key) => {
                    warn!(key_id, "serving stale jwks because refresh failed");
                    Ok(key)
                }
                None => Err(err),
            },
        }
    }

    async fn snapshot(&self) -> Option<CachedKeySet> {
        self.current.read().await.clone()
    }

    async fn refetch(
        &self,
        http_client: &reqwest::Client,
        jwks_url: &str,
    ) -> Result<CachedKeySet, JwksCacheError> {
        let response = http_client
            .get(jwks_url)
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "jwks request failed");
                JwksCacheError::UpstreamUnavailable
            })?;
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "jwks endpoint returned an error");
            return Err(JwksCacheError::UpstreamUnavailable);
        }

        let ttl_seconds = ttl_from_headers(response.headers(), self.config.default_ttl_seconds);
        let body = response
            .text()
            .await
            .map_err(|_| JwksCacheError::UpstreamUnavailable)?;
        let keys = SigningKeys::from_jwks_json(&body).ok_or_else(|| {
            warn!("jwks response held no usable RS256 keys");
            JwksCacheError::UpstreamUnavailable
        })?;

        let fresh_until = after_seconds(Utc::now(), ttl_seconds);
        let entry = CachedKeySet {
            keys: Arc::new(keys),
            fresh_until,
            stale_until: after_seconds(fresh_until, self.config.stale_ttl_seconds),
        };
        debug!(ttl_seconds, key_count = entry.keys.len(), "jwks refreshed");
        *self.current.write().await = Some(entry.clone());

        Ok(entry)
    }
}

fn after_seconds(base: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| base.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn ttl_from_headers(headers: &HeaderMap, default_ttl_seconds: u64) -> u64 {
    headers
        .get(CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(max_age_directive)
        .unwrap_or(default_ttl_seconds)
        .clamp(TTL_FLOOR_SECONDS, TTL_CEILING_SECONDS)
}

fn max_age_directive(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        value.trim().parse().ok()
    })
}
