//! Remote signing key set: lazy fetch, wholesale replace, bounded staleness.
//!
//! The provider publishes its public keys at a well-known endpoint. The
//! cache holds one immutable snapshot of that document, swapped atomically
//! on refresh. Concurrent misses collapse into a single upstream fetch, and
//! a fetch failure keeps serving the previous snapshot rather than turning
//! a provider outage into token rejections.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use url::Url;

const ED25519_PUBLIC_KEY_LENGTH: usize = 32;

/// One key as published in the provider's key set document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default)]
    pub n: Option<String>,
    /// RSA public exponent, base64url.
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub crv: Option<String>,
    /// Ed25519 public key, base64url.
    #[serde(default)]
    pub x: Option<String>,
}

/// The provider's full published key set.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySetDocument {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Error)]
pub enum KeySetError {
    /// The key set was fetched but holds no key with this id. The token is
    /// unverifiable, not necessarily invalid.
    #[error("no key matches kid {kid}")]
    NoMatchingKey { kid: String },

    /// The provider could not be reached or answered garbage. Distinct from
    /// [`KeySetError::NoMatchingKey`]: callers must treat this as "cannot
    /// verify right now", never as a permanent rejection.
    #[error("key set unavailable: {0}")]
    Unavailable(String),
}

/// Key material ready for signature verification.
#[derive(Clone)]
pub struct ResolvedKey {
    pub algorithm: Algorithm,
    pub decoding_key: Arc<DecodingKey>,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("algorithm", &self.algorithm)
            .field("decoding_key", &"<redacted>")
            .finish()
    }
}

/// Fetches the provider's full key set document.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    async fn fetch(&self) -> Result<KeySetDocument, KeySetError>;
}

/// Fetches the key set from the provider's well-known HTTPS endpoint.
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    url: Url,
}

impl HttpKeySetFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self) -> Result<KeySetDocument, KeySetError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|err| KeySetError::Unavailable(format!("key set fetch failed: {err}")))?;
        if !response.status().is_success() {
            return Err(KeySetError::Unavailable(format!(
                "key set fetch returned {}",
                response.status()
            )));
        }
        response
            .json::<KeySetDocument>()
            .await
            .map_err(|err| KeySetError::Unavailable(format!("malformed key set document: {err}")))
    }
}

struct Snapshot {
    keys: HashMap<String, ResolvedKey>,
    fetched_at: Instant,
}

/// Process-wide cache of the provider's public keys.
pub struct RemoteKeySet {
    fetcher: Arc<dyn KeySetFetcher>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh: Mutex<()>,
}

impl RemoteKeySet {
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Resolve a key id, refreshing the cached set when it is stale or the
    /// id is unknown.
    pub async fn resolve_key(&self, kid: &str) -> Result<ResolvedKey, KeySetError> {
        let observed = {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.fetched_at.elapsed() < self.ttl {
                    if let Some(key) = snapshot.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
                Some(snapshot.fetched_at)
            } else {
                None
            }
        };

        match self.refresh_snapshot(observed).await {
            Ok(snapshot) => snapshot
                .keys
                .get(kid)
                .cloned()
                .ok_or_else(|| KeySetError::NoMatchingKey {
                    kid: kid.to_string(),
                }),
            Err(err) => {
                // A stale snapshot that knows the key beats refusing to
                // answer while the provider is down.
                if let Some(snapshot) = self.current().await {
                    if let Some(key) = snapshot.keys.get(kid) {
                        warn!(kid, "serving stale signing key: {err}");
                        return Ok(key.clone());
                    }
                }
                Err(err)
            }
        }
    }

    async fn current(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Replace the snapshot wholesale. Concurrent callers serialize on the
    /// refresh lock; whoever waited behind an in-flight fetch reuses the
    /// snapshot that fetch published instead of issuing another one.
    /// `observed` is the snapshot the caller based its miss on.
    async fn refresh_snapshot(
        &self,
        observed: Option<Instant>,
    ) -> Result<Arc<Snapshot>, KeySetError> {
        let _guard = self.refresh.lock().await;
        if let Some(snapshot) = self.current().await {
            if Some(snapshot.fetched_at) != observed {
                return Ok(snapshot);
            }
        }

        let document = self.fetcher.fetch().await?;
        let mut keys = HashMap::new();
        for jwk in &document.keys {
            match decoding_key_for(jwk) {
                Ok(resolved) => {
                    keys.insert(jwk.kid.clone(), resolved);
                }
                Err(reason) => {
                    debug!(kid = %jwk.kid, "skipping unusable key in set: {reason}");
                }
            }
        }
        debug!(count = keys.len(), "refreshed remote key set");

        let snapshot = Arc::new(Snapshot {
            keys,
            fetched_at: Instant::now(),
        });
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }
}

/// Turn a published key into verification material, or say why it cannot be.
fn decoding_key_for(jwk: &Jwk) -> Result<ResolvedKey, String> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().ok_or("RSA key missing modulus")?;
            let e = jwk.e.as_deref().ok_or("RSA key missing exponent")?;
            URL_SAFE_NO_PAD
                .decode(n)
                .map_err(|err| format!("RSA modulus is not base64url: {err}"))?;
            let decoding_key = DecodingKey::from_rsa_components(n, e)
                .map_err(|err| format!("invalid RSA components: {err}"))?;
            let algorithm = match jwk.alg.as_deref() {
                Some("RS384") => Algorithm::RS384,
                Some("RS512") => Algorithm::RS512,
                _ => Algorithm::RS256,
            };
            Ok(ResolvedKey {
                algorithm,
                decoding_key: Arc::new(decoding_key),
            })
        }
        "OKP" => {
            if jwk.crv.as_deref() != Some("Ed25519") {
                return Err(format!(
                    "unsupported OKP curve: {}",
                    jwk.crv.as_deref().unwrap_or("none")
                ));
            }
            let x = jwk.x.as_deref().ok_or("OKP key missing public key")?;
            let bytes = URL_SAFE_NO_PAD
                .decode(x)
                .map_err(|err| format!("OKP public key is not base64url: {err}"))?;
            if bytes.len() != ED25519_PUBLIC_KEY_LENGTH {
                return Err(format!(
                    "expected {ED25519_PUBLIC_KEY_LENGTH}-byte Ed25519 key, got {}",
                    bytes.len()
                ));
            }
            let decoding_key = DecodingKey::from_ed_components(x)
                .map_err(|err| format!("invalid Ed25519 component: {err}"))?;
            Ok(ResolvedKey {
                algorithm: Algorithm::EdDSA,
                decoding_key: Arc::new(decoding_key),
            })
        }
        other => Err(format!("unsupported key type: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use std::sync::Mutex as StdMutex;

    fn test_jwk(kid: &str) -> Jwk {
        let signing_key = SigningKey::generate(&mut rand_core::OsRng);
        let x = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes());
        Jwk {
            kid: kid.to_string(),
            kty: "OKP".to_string(),
            alg: Some("EdDSA".to_string()),
            n: None,
            e: None,
            crv: Some("Ed25519".to_string()),
            x: Some(x),
        }
    }

    /// Scripted fetcher: serves the configured document or fails on demand.
    struct MemoryFetcher {
        document: StdMutex<KeySetDocument>,
        fail: StdMutex<bool>,
        fetches: StdMutex<u32>,
    }

    impl MemoryFetcher {
        fn new(keys: Vec<Jwk>) -> Self {
            Self {
                document: StdMutex::new(KeySetDocument { keys }),
                fail: StdMutex::new(false),
                fetches: StdMutex::new(0),
            }
        }

        fn set_keys(&self, keys: Vec<Jwk>) {
            self.document.lock().unwrap().keys = keys;
        }

        fn set_failing(&self, failing: bool) {
            *self.fail.lock().unwrap() = failing;
        }

        fn fetch_count(&self) -> u32 {
            *self.fetches.lock().unwrap()
        }
    }

    #[async_trait]
    impl KeySetFetcher for MemoryFetcher {
        async fn fetch(&self) -> Result<KeySetDocument, KeySetError> {
            *self.fetches.lock().unwrap() += 1;
            if *self.fail.lock().unwrap() {
                return Err(KeySetError::Unavailable("connection refused".to_string()));
            }
            Ok(self.document.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn lazy_fetch_then_cache_hit() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        let keys = RemoteKeySet::new(fetcher.clone(), Duration::from_secs(300));

        assert!(keys.resolve_key("key-1").await.is_ok());
        assert!(keys.resolve_key("key-1").await.is_ok());
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_after_refresh_is_no_matching_key() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        let keys = RemoteKeySet::new(fetcher, Duration::from_secs(300));

        let err = keys.resolve_key("key-2").await.unwrap_err();
        assert!(matches!(err, KeySetError::NoMatchingKey { kid } if kid == "key-2"));
    }

    #[tokio::test]
    async fn rotation_is_picked_up_on_miss() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        let keys = RemoteKeySet::new(fetcher.clone(), Duration::from_secs(300));

        assert!(keys.resolve_key("key-1").await.is_ok());
        let err = keys.resolve_key("key-2").await.unwrap_err();
        assert!(matches!(err, KeySetError::NoMatchingKey { .. }));

        // Provider rotates: the next miss refreshes and finds the new key.
        fetcher.set_keys(vec![test_jwk("key-2")]);
        assert!(keys.resolve_key("key-2").await.is_ok());
    }

    #[tokio::test]
    async fn wholesale_replace_drops_removed_keys() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        // Zero TTL: every lookup refreshes from the fetcher.
        let keys = RemoteKeySet::new(fetcher.clone(), Duration::ZERO);

        assert!(keys.resolve_key("key-1").await.is_ok());
        fetcher.set_keys(vec![test_jwk("key-2")]);

        let err = keys.resolve_key("key-1").await.unwrap_err();
        assert!(matches!(err, KeySetError::NoMatchingKey { .. }));
    }

    #[tokio::test]
    async fn outage_serves_stale_snapshot() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        let keys = RemoteKeySet::new(fetcher.clone(), Duration::ZERO);

        assert!(keys.resolve_key("key-1").await.is_ok());

        fetcher.set_failing(true);
        assert!(keys.resolve_key("key-1").await.is_ok());
    }

    #[tokio::test]
    async fn outage_without_snapshot_is_unavailable() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        fetcher.set_failing(true);
        let keys = RemoteKeySet::new(fetcher, Duration::from_secs(300));

        let err = keys.resolve_key("key-1").await.unwrap_err();
        assert!(matches!(err, KeySetError::Unavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_fetch() {
        let fetcher = Arc::new(MemoryFetcher::new(vec![test_jwk("key-1")]));
        let keys = Arc::new(RemoteKeySet::new(fetcher.clone(), Duration::from_secs(300)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let keys = Arc::clone(&keys);
            handles.push(tokio::spawn(
                async move { keys.resolve_key("key-1").await },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[test]
    fn unusable_keys_are_described() {
        let mut jwk = test_jwk("weird");
        jwk.kty = "EC".to_string();
        assert!(decoding_key_for(&jwk).is_err());

        let mut jwk = test_jwk("short");
        jwk.x = Some(URL_SAFE_NO_PAD.encode([1u8; 4]));
        assert!(decoding_key_for(&jwk).is_err());

        let mut jwk = test_jwk("not-base64");
        jwk.x = Some("!!!".to_string());
        assert!(decoding_key_for(&jwk).is_err());
    }

    #[test]
    fn rsa_keys_resolve_with_configured_algorithm() {
        let jwk = Jwk {
            kid: "rsa-1".to_string(),
            kty: "RSA".to_string(),
            alg: Some("RS512".to_string()),
            n: Some(URL_SAFE_NO_PAD.encode([0xABu8; 256])),
            e: Some("AQAB".to_string()),
            crv: None,
            x: None,
        };
        let resolved = decoding_key_for(&jwk).expect("rsa key resolves");
        assert!(matches!(resolved.algorithm, Algorithm::RS512));
    }
}
