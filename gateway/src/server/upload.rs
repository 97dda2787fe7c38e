//! The v1 upload pipeline: verify the gateway-issued token, bound and parse
//! the body, run the transform chain, rate-limit, forward.

use super::{
    ApiError, AppState, SvcBody, bearer_token, content_type, read_body_limited, status_response,
};
use crate::metrics_defs::RATELIMITED_REQUESTS_TOTAL;
use crate::prompb::WriteRequest;
use crate::transform::{AddLabels, SortLabels};
use hyper::body::Incoming;
use hyper::{Request, Response};
use prost::Message;
use shared::counter;
use std::sync::Arc;

pub(super) async fn handle(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<SvcBody>, ApiError> {
    let (parts, body) = req.into_parts();

    let token = bearer_token(&parts.headers)?;
    let identity = state
        .verifier
        .verify(token)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

    let body = read_body_limited(body, state.limit_bytes as usize).await?;
    let raw = snap::raw::Decoder::new()
        .decompress_vec(&body)
        .map_err(|_| ApiError::BadRequest("failed to decode request body".to_string()))?;
    let mut batch = WriteRequest::decode(raw.as_slice())
        .map_err(|_| ApiError::BadRequest("failed to decode protobuf from body".to_string()))?;

    // The token's labels and the tenant identity are stamped onto every
    // series, after the configured chain and before normalization.
    let mut stamped = identity.labels.clone();
    stamped.insert(state.partition_label.clone(), identity.subject.clone());
    let chain = state
        .transforms
        .clone()
        .with(Arc::new(AddLabels::new(stamped)))
        .with(Arc::new(SortLabels));
    chain
        .apply(&mut batch)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Err(retry_after) = state.rate_limiter.admit(&identity.subject) {
        counter!(RATELIMITED_REQUESTS_TOTAL).increment(1);
        return Err(ApiError::RateLimited(retry_after));
    }

    let payload = batch.encode_to_vec();
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&payload)
        .map_err(|e| ApiError::Internal(format!("failed to compress batch: {e}")))?;

    let status = state
        .forwarder
        .forward(
            compressed.into(),
            content_type(&parts.headers),
            &identity.subject,
        )
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;
    if !status.is_success() {
        return Err(ApiError::ForwardRejected { status });
    }
    Ok(status_response(status))
}
