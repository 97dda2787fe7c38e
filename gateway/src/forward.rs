//! Thin remote-write client for accepted batches.

use crate::metrics_defs::FORWARD_REQUESTS_TOTAL;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use shared::counter;
use std::time::Duration;
use url::Url;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
pub const TENANT_HEADER: &str = "THANOS-TENANT";

#[derive(thiserror::Error, Debug)]
#[error("failed to forward request: {0}")]
pub struct ForwardError(String);

pub struct Forwarder {
    client: reqwest::Client,
    url: Url,
}

impl Forwarder {
    pub fn new(url: Url) -> Result<Self, reqwest::Error> {
        Ok(Forwarder {
            client: reqwest::Client::builder()
                .timeout(FORWARD_TIMEOUT)
                .build()?,
            url,
        })
    }

    /// POSTs one batch upstream. `Ok` carries the upstream status verbatim;
    /// `Err` means the request never completed.
    pub async fn forward(
        &self,
        body: Bytes,
        content_type: Option<HeaderValue>,
        tenant: &str,
    ) -> Result<StatusCode, ForwardError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(TENANT_HEADER, tenant)
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let result = if status.is_success() { "success" } else { "error" };
                counter!(FORWARD_REQUESTS_TOTAL, "result" => result).increment(1);
                Ok(status)
            }
            Err(error) => {
                counter!(FORWARD_REQUESTS_TOTAL, "result" => "error").increment(1);
                Err(ForwardError(error.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn forwards_with_tenant_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(TENANT_HEADER, "cluster-A"))
            .and(header("content-type", "application/x-protobuf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(Url::parse(&server.uri()).unwrap()).expect("forwarder");
        let status = forwarder
            .forward(
                Bytes::from_static(b"payload"),
                Some(HeaderValue::from_static("application/x-protobuf")),
                "cluster-A",
            )
            .await
            .expect("forward");
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn upstream_status_is_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(Url::parse(&server.uri()).unwrap()).expect("forwarder");
        let status = forwarder
            .forward(Bytes::from_static(b"payload"), None, "cluster-A")
            .await
            .expect("forward");
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn connection_failures_error_out() {
        // reserved port with nothing listening
        let forwarder =
            Forwarder::new(Url::parse("http://127.0.0.1:1/push").unwrap()).expect("forwarder");
        let result = forwarder
            .forward(Bytes::from_static(b"payload"), None, "cluster-A")
            .await;
        assert!(result.is_err());
    }
}
