//! HTTP surface of the agent.
//!
//! Handlers parse and validate their input, then ask the dispatcher where
//! the request belongs.  A request is served here when it resolves to this
//! node or when a peer already forwarded it (it carries
//! [`FORWARDED_HEADER`]); otherwise the peer's response is streamed back.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::browse::Browser;
use crate::cluster::ClusterService;
use crate::error::ProxyError;
use crate::proxy::{forwardable_headers, Dispatch, Dispatcher, MemberOutcome, OutboundRequest, FORWARDED_HEADER};
use crate::routing::RouteKey;

mod agents;
mod browse;
mod error;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ClusterService>,
    pub dispatcher: Arc<Dispatcher>,
    pub browser: Arc<Browser>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/ping", get(agents::ping))
        .route("/agents", get(agents::list))
        .route("/volumes", get(agents::volumes))
        .route("/browse/ls", get(browse::list))
        .route("/browse/get", get(browse::download))
        .route(
            "/browse/put",
            post(browse::put).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/browse/delete", delete(browse::delete))
        .with_state(state)
}

/// Where a request ended up after routing.
pub(crate) enum Routed {
    /// Serve it on this node.
    Local,
    /// A peer (or several) answered; send this back as is.
    Done(Response),
}

pub(crate) fn is_forwarded(headers: &HeaderMap) -> bool {
    headers.contains_key(FORWARDED_HEADER)
}

pub(crate) fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Routes `request` by `key`, unless a peer already did.
pub(crate) async fn route(
    state: &AppState,
    headers: &HeaderMap,
    key: &RouteKey,
    request: &OutboundRequest,
) -> Result<Routed, ApiError> {
    if is_forwarded(headers) {
        if request.is_mutating() && !state.dispatcher.gate().is_enabled() {
            return Err(ProxyError::ManagementDisabled.into());
        }
        return Ok(Routed::Local);
    }

    let snapshot = state.cluster.snapshot();
    match state.dispatcher.route(key, &snapshot, request).await? {
        Dispatch::Local => Ok(Routed::Local),
        Dispatch::Remote(response) => Ok(Routed::Done(relay(response))),
        Dispatch::Broadcast(outcomes) => Ok(Routed::Done(aggregate(outcomes))),
    }
}

/// Streams an upstream response back to the caller.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());
    let mut response = Body::from_stream(upstream.bytes_stream()).into_response();
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Per-member entry of a broadcast answer.
#[derive(Debug, Serialize)]
pub(crate) struct NodeResult {
    pub node: String,
    pub address: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<MemberOutcome> for NodeResult {
    fn from(outcome: MemberOutcome) -> Self {
        let MemberOutcome { member, result } = outcome;
        match result {
            Ok(reply) => {
                let data = serde_json::from_slice(&reply.body).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&reply.body).into_owned())
                });
                NodeResult {
                    node: member.id,
                    address: member.address,
                    ok: reply.status.is_success(),
                    status: Some(reply.status.as_u16()),
                    data: Some(data),
                    error: None,
                    details: None,
                }
            }
            Err(e) => NodeResult {
                node: member.id,
                address: member.address,
                ok: false,
                status: None,
                data: None,
                error: Some(e.kind()),
                details: Some(e.to_string()),
            },
        }
    }
}

fn aggregate(outcomes: Vec<MemberOutcome>) -> Response {
    let results: Vec<NodeResult> = outcomes.into_iter().map(NodeResult::from).collect();
    Json(results).into_response()
}

#[cfg(test)]
mod tests;
