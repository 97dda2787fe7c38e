pub mod keys;
pub mod oidc;
pub mod tokens;
pub mod upstream;

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The verdict of the authorization service for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAuthorization {
    pub subject: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthorizeError {
    /// The upstream refused this cluster; status and body are echoed to the
    /// caller verbatim and the request is never retried.
    #[error("cluster rejected by upstream: {status}")]
    Rejected { status: StatusCode, body: String },

    /// Network failure, 5xx, or an unreadable upstream response.
    #[error("upstream authorization failed: {0}")]
    Transient(String),
}

/// Decides whether a cluster may push metrics.
///
/// Handlers hold one of these without knowing whether it is the accept-all
/// stub, the HTTP authorizer, or the caching decorator around either.
#[async_trait]
pub trait ClusterAuthorizer: Send + Sync {
    async fn authorize_cluster(
        &self,
        token: &str,
        cluster: &str,
    ) -> Result<ClusterAuthorization, AuthorizeError>;
}

/// Accept-all authorizer for deployments without an --authorize endpoint.
/// Only suitable for local and test setups.
pub struct StubAuthorizer;

#[async_trait]
impl ClusterAuthorizer for StubAuthorizer {
    async fn authorize_cluster(
        &self,
        _token: &str,
        cluster: &str,
    ) -> Result<ClusterAuthorization, AuthorizeError> {
        Ok(ClusterAuthorization {
            subject: cluster.to_string(),
            labels: BTreeMap::new(),
        })
    }
}
