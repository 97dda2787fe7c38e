//! Caching of authorization verdicts.
//!
//! The cache is always soft: any failure falls through to the upstream
//! authorizer and never fails the request.

pub mod memcached;

use crate::auth::{AuthorizeError, ClusterAuthorization, ClusterAuthorizer};
use crate::metrics_defs::{AUTHORIZE_CACHE_GETS_TOTAL, AUTHORIZE_CACHE_STORE_FAILURES_TOTAL};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::counter;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache operation timed out")]
    Timeout,

    #[error("unexpected response from cache server: {0}")]
    Protocol(String),

    #[error("no cache servers available")]
    NoServers,
}

/// Byte-oriented cache with per-entry TTL, safe for concurrent use.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;
}

/// Derives the cache key for an authorization call from the external bearer.
/// Empty tokens are not cacheable.
pub fn cache_key(token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    let digest = Sha256::digest(token.as_bytes());
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    Some(key)
}

/// Decorates a [`ClusterAuthorizer`] with a response cache. Only accepted
/// verdicts are stored; rejections always re-consult the upstream. Concurrent
/// misses for the same key may race to the upstream, which is harmless.
pub struct CachedAuthorizer {
    cache: Arc<dyn Cache>,
    inner: Arc<dyn ClusterAuthorizer>,
    ttl: Duration,
}

impl CachedAuthorizer {
    pub fn new(cache: Arc<dyn Cache>, inner: Arc<dyn ClusterAuthorizer>, ttl: Duration) -> Self {
        CachedAuthorizer { cache, inner, ttl }
    }
}

#[async_trait]
impl ClusterAuthorizer for CachedAuthorizer {
    async fn authorize_cluster(
        &self,
        token: &str,
        cluster: &str,
    ) -> Result<ClusterAuthorization, AuthorizeError> {
        let Some(key) = cache_key(token) else {
            return self.inner.authorize_cluster(token, cluster).await;
        };

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<ClusterAuthorization>(&bytes) {
                Ok(authorization) => {
                    counter!(AUTHORIZE_CACHE_GETS_TOTAL, "result" => "hit").increment(1);
                    return Ok(authorization);
                }
                Err(error) => {
                    tracing::warn!(%error, "discarding corrupt cache entry");
                    counter!(AUTHORIZE_CACHE_GETS_TOTAL, "result" => "error").increment(1);
                }
            },
            Ok(None) => {
                counter!(AUTHORIZE_CACHE_GETS_TOTAL, "result" => "miss").increment(1);
            }
            Err(error) => {
                tracing::warn!(%error, "cache lookup failed");
                counter!(AUTHORIZE_CACHE_GETS_TOTAL, "result" => "error").increment(1);
            }
        }

        let authorization = self.inner.authorize_cluster(token, cluster).await?;

        match serde_json::to_vec(&authorization) {
            Ok(bytes) => {
                if let Err(error) = self.cache.set(&key, &bytes, self.ttl).await {
                    tracing::warn!(%error, "failed to store authorization verdict in cache");
                    counter!(AUTHORIZE_CACHE_STORE_FAILURES_TOTAL).increment(1);
                }
            }
            Err(error) => tracing::warn!(%error, "could not serialize authorization verdict"),
        }

        Ok(authorization)
    }
}
