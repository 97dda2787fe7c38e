//! HTTP client against the operator-configured authorization service.

use super::oidc::OidcTokenSource;
use super::{AuthorizeError, ClusterAuthorization, ClusterAuthorizer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 10;

/// Outbound client with the transport defaults shared by authorization and
/// OIDC calls.
pub fn default_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .build()
}

/// The registration payload sent upstream. The client's external bearer
/// travels in the body so the Authorization header stays free for OIDC.
#[derive(Serialize)]
struct ClusterRegistration<'a> {
    authorization_token: &'a str,
    cluster_id: &'a str,
}

#[derive(Deserialize)]
struct UpstreamVerdict {
    subject: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

pub struct UpstreamAuthorizer {
    client: reqwest::Client,
    url: Url,
    oidc: Option<Arc<OidcTokenSource>>,
}

impl UpstreamAuthorizer {
    pub fn new(url: Url, client: reqwest::Client, oidc: Option<Arc<OidcTokenSource>>) -> Self {
        UpstreamAuthorizer { client, url, oidc }
    }
}

#[async_trait]
impl ClusterAuthorizer for UpstreamAuthorizer {
    async fn authorize_cluster(
        &self,
        token: &str,
        cluster: &str,
    ) -> Result<ClusterAuthorization, AuthorizeError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .json(&ClusterRegistration {
                authorization_token: token,
                cluster_id: cluster,
            });

        if let Some(oidc) = &self.oidc {
            let access_token = oidc
                .access_token()
                .await
                .map_err(|e| AuthorizeError::Transient(e.to_string()))?;
            request = request.bearer_auth(access_token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthorizeError::Transient(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            let verdict: UpstreamVerdict = response.json().await.map_err(|e| {
                AuthorizeError::Transient(format!("malformed authorization response: {e}"))
            })?;
            return Ok(ClusterAuthorization {
                subject: verdict.subject,
                labels: verdict.labels,
            });
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthorizeError::Rejected { status, body });
        }

        Err(AuthorizeError::Transient(format!(
            "upstream authorization returned {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn authorizer_for(server: &MockServer) -> UpstreamAuthorizer {
        let url = Url::parse(&server.uri()).expect("mock url");
        UpstreamAuthorizer::new(url, default_client().expect("client"), None)
    }

    #[tokio::test]
    async fn accepted_clusters_carry_subject_and_labels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({
                "authorization_token": "ext-xyz",
                "cluster_id": "cluster-A",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subject": "cluster-A",
                "labels": {"region": "us"},
            })))
            .mount(&server)
            .await;

        let authorization = authorizer_for(&server)
            .await
            .authorize_cluster("ext-xyz", "cluster-A")
            .await
            .expect("accepted");
        assert_eq!(authorization.subject, "cluster-A");
        assert_eq!(authorization.labels["region"], "us");
    }

    #[tokio::test]
    async fn client_errors_are_permanent_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("cluster denied"))
            .mount(&server)
            .await;

        let err = authorizer_for(&server)
            .await
            .authorize_cluster("ext-xyz", "cluster-A")
            .await
            .unwrap_err();
        match err {
            AuthorizeError::Rejected { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "cluster denied");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = authorizer_for(&server)
            .await
            .authorize_cluster("ext-xyz", "cluster-A")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizeError::Transient(_)));
    }

    #[tokio::test]
    async fn malformed_bodies_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = authorizer_for(&server)
            .await
            .authorize_cluster("ext-xyz", "cluster-A")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizeError::Transient(_)));
    }
}
