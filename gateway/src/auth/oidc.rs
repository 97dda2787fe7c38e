//! Client-credentials token source for calls to the authorization service.

use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Tokens are refreshed this long before they would expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum OidcError {
    #[error("OIDC provider discovery failed: {0}")]
    Discovery(String),

    #[error("token request failed: {0}")]
    TokenRequest(String),
}

#[derive(Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct OidcTokenSource {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    current: Mutex<Option<CachedToken>>,
}

impl OidcTokenSource {
    /// Resolves the token endpoint from the issuer's discovery document.
    pub async fn discover(
        client: reqwest::Client,
        issuer: &str,
        client_id: String,
        client_secret: String,
    ) -> Result<Self, OidcError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let document: DiscoveryDocument = client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| OidcError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| OidcError::Discovery(e.to_string()))?;

        Ok(OidcTokenSource {
            client,
            token_endpoint: document.token_endpoint,
            client_id,
            client_secret,
            current: Mutex::new(None),
        })
    }

    /// Returns an access token, fetching a fresh one shortly before the
    /// cached one expires. Concurrent refreshes may race; every racer ends up
    /// holding a valid token and the last writer wins.
    pub async fn access_token(&self) -> Result<String, OidcError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let response: TokenResponse = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| OidcError::TokenRequest(e.to_string()))?
            .json()
            .await
            .map_err(|e| OidcError::TokenRequest(e.to_string()))?;

        let expires_at = Instant::now() + Duration::from_secs(response.expires_in.unwrap_or(60));
        *self.current.lock() = Some(CachedToken {
            access_token: response.access_token.clone(),
            expires_at,
        });
        Ok(response.access_token)
    }

    fn cached(&self) -> Option<String> {
        let current = self.current.lock();
        current
            .as_ref()
            .filter(|token| token.expires_at > Instant::now() + EXPIRY_MARGIN)
            .map(|token| token.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn start_provider(expires_in: u64, expected_requests: u64) -> MockServer {
        let server = MockServer::start().await;
        let token_endpoint = format!("{}/oauth/token", server.uri());

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_endpoint": token_endpoint,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "service-token",
                "expires_in": expires_in,
            })))
            .expect(expected_requests)
            .mount(&server)
            .await;

        server
    }

    #[tokio::test]
    async fn tokens_are_reused_until_close_to_expiry() {
        let server = start_provider(3600, 1).await;
        let source = OidcTokenSource::discover(
            reqwest::Client::new(),
            &server.uri(),
            "gateway".into(),
            "secret".into(),
        )
        .await
        .expect("discovery");

        assert_eq!(source.access_token().await.expect("token"), "service-token");
        assert_eq!(source.access_token().await.expect("token"), "service-token");
    }

    #[tokio::test]
    async fn short_lived_tokens_are_refetched() {
        // expires_in below the refresh margin, so each call fetches anew
        let server = start_provider(10, 2).await;
        let source = OidcTokenSource::discover(
            reqwest::Client::new(),
            &server.uri(),
            "gateway".into(),
            "secret".into(),
        )
        .await
        .expect("discovery");

        source.access_token().await.expect("token");
        source.access_token().await.expect("token");
    }
}
