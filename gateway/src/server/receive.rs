//! The v2 receive pipeline: authenticate the bearer payload against the
//! authorization service, bound the body, structurally validate labels, and
//! forward the original compressed batch.

use super::{
    ApiError, AppState, SvcBody, bearer_token, content_type, read_body_limited, status_response,
};
use crate::prompb::WriteRequest;
use crate::transform::NAME_LABEL;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hyper::body::Incoming;
use hyper::{Request, Response};
use prost::Message;

/// Based on historic push sizes; most batches stay under 6 KiB.
pub(super) const REQUEST_LIMIT_BYTES: usize = 15 * 1024;

struct BearerPayload {
    token: String,
    cluster: String,
}

/// The v2 bearer is a base64-encoded JSON object carrying the external
/// authorization token and, under the configured tenant key, the cluster id.
fn decode_bearer_payload(bearer: &str, tenant_key: &str) -> Result<BearerPayload, ApiError> {
    let unauthorized = || ApiError::Unauthorized("malformed bearer payload".to_string());

    let raw = BASE64.decode(bearer).map_err(|_| unauthorized())?;
    let payload: serde_json::Value = serde_json::from_slice(&raw).map_err(|_| unauthorized())?;

    let token = payload
        .get("authorization_token")
        .and_then(|value| value.as_str())
        .ok_or_else(unauthorized)?;
    let cluster = payload
        .get(tenant_key)
        .and_then(|value| value.as_str())
        .ok_or_else(|| {
            ApiError::Unauthorized(format!("bearer payload carries no {tenant_key}"))
        })?;

    Ok(BearerPayload {
        token: token.to_string(),
        cluster: cluster.to_string(),
    })
}

/// Asserts that every series carries all required label names. The compressed
/// body is left untouched for forwarding.
fn validate_labels(body: &[u8], required: &[&str]) -> Result<(), ApiError> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|_| ApiError::BadRequest("failed to decode request body".to_string()))?;
    let batch = WriteRequest::decode(raw.as_slice())
        .map_err(|_| ApiError::BadRequest("failed to decode protobuf from body".to_string()))?;

    for series in &batch.timeseries {
        for name in required {
            if series.label_value(name).is_none() {
                return Err(ApiError::BadRequest(
                    "a required label is missing from the metric".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub(super) async fn handle(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<SvcBody>, ApiError> {
    let (parts, body) = req.into_parts();

    let bearer = bearer_token(&parts.headers)?;
    let payload = decode_bearer_payload(bearer, &state.tenant_key)?;
    let authorization = state
        .authorizer
        .authorize_cluster(&payload.token, &payload.cluster)
        .await?;

    let body = read_body_limited(body, REQUEST_LIMIT_BYTES).await?;
    validate_labels(&body, &[NAME_LABEL, state.partition_label.as_str()])?;

    let status = state
        .forwarder
        .forward(body, content_type(&parts.headers), &authorization.subject)
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;
    if !status.is_success() {
        return Err(ApiError::ForwardRejected { status });
    }
    Ok(status_response(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompb::{Label, TimeSeries};

    fn encode_batch(series: &[&[(&str, &str)]]) -> Vec<u8> {
        let batch = WriteRequest {
            timeseries: series
                .iter()
                .map(|labels| TimeSeries {
                    labels: labels
                        .iter()
                        .map(|(name, value)| Label {
                            name: name.to_string(),
                            value: value.to_string(),
                        })
                        .collect(),
                    samples: Vec::new(),
                })
                .collect(),
        };
        snap::raw::Encoder::new()
            .compress_vec(&batch.encode_to_vec())
            .expect("compress")
    }

    #[test]
    fn bearer_payload_round_trip() {
        let bearer = BASE64.encode(
            serde_json::json!({
                "authorization_token": "ext-xyz",
                "cluster_id": "cluster-A",
            })
            .to_string(),
        );
        let payload = decode_bearer_payload(&bearer, "cluster_id").expect("payload");
        assert_eq!(payload.token, "ext-xyz");
        assert_eq!(payload.cluster, "cluster-A");
    }

    #[test]
    fn bearer_payload_requires_the_tenant_key() {
        let bearer = BASE64.encode(
            serde_json::json!({"authorization_token": "ext-xyz"}).to_string(),
        );
        assert!(decode_bearer_payload(&bearer, "cluster_id").is_err());
        assert!(decode_bearer_payload("not base64!", "cluster_id").is_err());
    }

    #[test]
    fn batches_with_all_required_labels_pass() {
        let body = encode_batch(&[
            &[("__name__", "up"), ("_id", "cluster-A")],
            &[("__name__", "node_load1"), ("_id", "cluster-A"), ("job", "node")],
        ]);
        validate_labels(&body, &[NAME_LABEL, "_id"]).expect("valid batch");
    }

    #[test]
    fn one_nonconforming_series_fails_the_batch() {
        let body = encode_batch(&[
            &[("__name__", "up"), ("_id", "cluster-A")],
            &[("__name__", "node_load1")],
        ]);
        let err = validate_labels(&body, &[NAME_LABEL, "_id"]).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn undecodable_bodies_are_client_errors() {
        let err = validate_labels(b"not snappy", &[NAME_LABEL]).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let compressed_garbage = snap::raw::Encoder::new()
            .compress_vec(&[0xff; 32])
            .expect("compress");
        let err = validate_labels(&compressed_garbage, &[NAME_LABEL]).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
