//! The two HTTP surfaces: the tenant-facing external service and the
//! operator-facing internal service.

pub mod authorize;
pub mod receive;
pub mod upload;

use crate::auth::ClusterAuthorizer;
use crate::auth::tokens::{TokenSigner, TokenVerifier};
use crate::forward::Forwarder;
use crate::metrics_defs::HTTP_REQUESTS_TOTAL;
use crate::ratelimit::RateLimiter;
use crate::transform::MultiTransformer;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use shared::counter;
use shared::http::{full_body, make_error_response};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type SvcBody = BoxBody<Bytes, Infallible>;

/// Everything the external handlers share. Built once at startup; read-only
/// afterwards except for the internally synchronized rate-limit table.
pub struct AppState {
    pub signer: TokenSigner,
    pub verifier: TokenVerifier,
    pub authorizer: Arc<dyn ClusterAuthorizer>,
    pub transforms: MultiTransformer,
    pub rate_limiter: RateLimiter,
    pub forwarder: Forwarder,
    pub partition_label: String,
    pub required_labels: BTreeMap<String, String>,
    pub tenant_key: String,
    pub limit_bytes: u64,
}

/// Request-level failure taxonomy. Every handler error funnels through
/// [`ApiError::into_response`], which owns the status mapping and logging.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("request too big")]
    PayloadTooLarge,

    #[error("too many uploads for this cluster")]
    RateLimited(Duration),

    #[error("upstream failure: {0}")]
    BadGateway(String),

    /// 4xx verdicts from the upstream authorizer, echoed verbatim.
    #[error("upstream rejected the request")]
    UpstreamRejected { status: StatusCode, body: String },

    /// Non-2xx from the forward target, status propagated verbatim.
    #[error("upstream remote write failed")]
    ForwardRejected { status: StatusCode },

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn into_response(self) -> Response<SvcBody> {
        match self {
            ApiError::Unauthorized(reason) => {
                make_error_response(StatusCode::UNAUTHORIZED, &reason)
            }
            ApiError::BadRequest(reason) => make_error_response(StatusCode::BAD_REQUEST, &reason),
            ApiError::PayloadTooLarge => {
                make_error_response(StatusCode::PAYLOAD_TOO_LARGE, "request too big")
            }
            ApiError::RateLimited(retry_after) => {
                let mut response = make_error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "this cluster recently pushed a batch, slow down",
                );
                let seconds =
                    retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
                response
            }
            ApiError::BadGateway(reason) => {
                tracing::warn!(error = %reason, "upstream failure");
                make_error_response(StatusCode::BAD_GATEWAY, "upstream failure")
            }
            ApiError::UpstreamRejected { status, body } => {
                let mut response = Response::new(full_body(body));
                *response.status_mut() = status;
                response
            }
            ApiError::ForwardRejected { status } => {
                make_error_response(status, "upstream remote write failed")
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<crate::auth::AuthorizeError> for ApiError {
    fn from(err: crate::auth::AuthorizeError) -> Self {
        match err {
            crate::auth::AuthorizeError::Rejected { status, body } => {
                ApiError::UpstreamRejected { status, body }
            }
            crate::auth::AuthorizeError::Transient(reason) => ApiError::BadGateway(reason),
        }
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))
}

/// Reads the whole request body, bounded. Reads past the limit are 413.
pub(crate) async fn read_body_limited(body: Incoming, limit: usize) -> Result<Bytes, ApiError> {
    match http_body_util::Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(error) if error.is::<http_body_util::LengthLimitError>() => {
            Err(ApiError::PayloadTooLarge)
        }
        Err(error) => Err(ApiError::Internal(format!(
            "failed to read request body: {error}"
        ))),
    }
}

pub(crate) fn content_type(headers: &HeaderMap) -> Option<HeaderValue> {
    headers.get(CONTENT_TYPE).cloned()
}

#[derive(Serialize)]
struct Paths<'a> {
    paths: &'a [&'a str],
}

const EXTERNAL_PATHS: &[&str] = &[
    "/",
    "/authorize",
    "/upload",
    "/healthz",
    "/healthz/ready",
    "/metrics/v1/receive",
];
const INTERNAL_PATHS: &[&str] = &["/", "/metrics", "/healthz", "/healthz/ready"];

fn paths_response(paths: &[&str]) -> Response<SvcBody> {
    let body = serde_json::to_vec_pretty(&Paths { paths }).unwrap_or_default();
    let mut response = Response::new(full_body(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn ok_response() -> Response<SvcBody> {
    Response::new(full_body("ok\n"))
}

fn status_response(status: StatusCode) -> Response<SvcBody> {
    let mut response = Response::new(full_body(""));
    *response.status_mut() = status;
    response
}

#[derive(Clone)]
pub struct ExternalService {
    state: Arc<AppState>,
}

impl ExternalService {
    pub fn new(state: Arc<AppState>) -> Self {
        ExternalService { state }
    }
}

impl HyperService<Request<Incoming>> for ExternalService {
    type Response = Response<SvcBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();

            let (handler, response) = match (&method, path.as_str()) {
                (&Method::GET, "/") => ("index", paths_response(EXTERNAL_PATHS)),
                (&Method::GET, "/healthz") | (&Method::GET, "/healthz/ready") => {
                    ("health", ok_response())
                }
                (&Method::POST, "/authorize") => (
                    "authorize",
                    authorize::handle(&state, req)
                        .await
                        .unwrap_or_else(ApiError::into_response),
                ),
                (&Method::POST, "/upload") => (
                    "upload",
                    upload::handle(&state, req)
                        .await
                        .unwrap_or_else(ApiError::into_response),
                ),
                (&Method::POST, "/metrics/v1/receive") => (
                    "receive",
                    receive::handle(&state, req)
                        .await
                        .unwrap_or_else(ApiError::into_response),
                ),
                (_, "/authorize" | "/upload" | "/metrics/v1/receive") => (
                    "method_not_allowed",
                    make_error_response(StatusCode::METHOD_NOT_ALLOWED, ""),
                ),
                _ => ("not_found", make_error_response(StatusCode::NOT_FOUND, "")),
            };

            counter!(
                HTTP_REQUESTS_TOTAL,
                "handler" => handler,
                "code" => response.status().as_u16().to_string()
            )
            .increment(1);
            Ok(response)
        })
    }
}

#[derive(Clone)]
pub struct InternalService {
    prometheus: PrometheusHandle,
}

impl InternalService {
    pub fn new(prometheus: PrometheusHandle) -> Self {
        InternalService { prometheus }
    }
}

impl HyperService<Request<Incoming>> for InternalService {
    type Response = Response<SvcBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let prometheus = self.prometheus.clone();
        Box::pin(async move {
            let response = match (req.method(), req.uri().path()) {
                (&Method::GET, "/") => paths_response(INTERNAL_PATHS),
                (&Method::GET, "/healthz") | (&Method::GET, "/healthz/ready") => ok_response(),
                (&Method::GET, "/metrics") => {
                    let mut response = Response::new(full_body(prometheus.render()));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                _ => make_error_response(StatusCode::NOT_FOUND, ""),
            };
            Ok(response)
        })
    }
}
