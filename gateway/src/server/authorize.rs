//! The v1 token-exchange handler.
//!
//! A client presents its external bearer and a cluster id; on upstream
//! acceptance it gets back a short-lived signed token for `/upload`.

use super::{ApiError, AppState, SvcBody, bearer_token};
use hyper::body::Incoming;
use hyper::{Request, Response};
use shared::http::full_body;
use std::collections::BTreeMap;

const CLUSTER_ID_PARAM: &str = "id";

pub(super) async fn handle(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<SvcBody>, ApiError> {
    let (parts, _body) = req.into_parts();
    let token = bearer_token(&parts.headers)?;

    let mut query = BTreeMap::new();
    if let Some(raw) = parts.uri.query() {
        for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            query.insert(name.into_owned(), value.into_owned());
        }
    }
    let Some(cluster) = query.get(CLUSTER_ID_PARAM).filter(|id| !id.is_empty()) else {
        return Err(ApiError::BadRequest("no cluster id provided".to_string()));
    };

    let authorization = state.authorizer.authorize_cluster(token, cluster).await?;

    // Required labels must be vouched for by the upstream or supplied
    // explicitly on the request; otherwise the exchange fails.
    let mut labels = authorization.labels;
    for (name, value) in &state.required_labels {
        if labels.get(name) == Some(value) {
            continue;
        }
        if query.get(name) == Some(value) {
            labels.insert(name.clone(), value.clone());
            continue;
        }
        return Err(ApiError::BadRequest(format!(
            "required label {name}={value} missing from request"
        )));
    }

    let minted = state
        .signer
        .mint(cluster, labels)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::debug!(cluster = %cluster, "issued upload token");
    Ok(Response::new(full_body(minted)))
}
