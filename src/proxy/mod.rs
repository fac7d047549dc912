//! Dispatch/proxy layer.
//!
//! Takes a [`RouteKey`], resolves it against a directory snapshot and
//! executes the decision:
//!
//! * **Unicast** to this node returns [`Dispatch::Local`]; the caller serves
//!   the request itself without touching the network.
//! * **Unicast** to a peer forwards the request over a pooled HTTP client
//!   and hands back the upstream response for streaming.  Only connection
//!   failures are retried, and only against that same peer: a volume has
//!   exactly one correct owner.
//! * **Broadcast** sends the request to every member concurrently and
//!   reports one outcome per member.
//! * **Unresolved** fails immediately.
//!
//! Mutating requests are checked against the [`ManagementGate`] before any
//! of the above happens.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures_util::future::join_all;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use tokio::time::{sleep, timeout};

use crate::cluster::Snapshot;
use crate::error::ProxyError;
use crate::routing::{resolve, Decision, RouteKey};
use crate::types::Member;

mod gate;

pub use gate::ManagementGate;

/// Marks a request that was already routed by a peer.  The receiver serves
/// it locally and never forwards it again.
pub const FORWARDED_HEADER: &str = "x-herd-forwarded";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Total attempts against one member, first try included.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(3),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// A file upload, rebuilt as multipart for every attempt.
#[derive(Debug, Clone)]
pub struct Upload {
    pub path: String,
    pub file_name: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub enum OutboundBody {
    Empty,
    Bytes(Bytes),
    Upload(Upload),
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: OutboundBody,
}

impl OutboundRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: OutboundBody::Empty,
        }
    }

    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        self.headers = forwardable_headers(headers);
        self
    }

    pub fn with_body(mut self, body: OutboundBody) -> Self {
        self.body = body;
        self
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD)
    }
}

#[derive(Debug)]
pub enum Dispatch {
    Local,
    Remote(reqwest::Response),
    Broadcast(Vec<MemberOutcome>),
}

/// Buffered answer from one member of a broadcast.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct MemberOutcome {
    pub member: Member,
    pub result: Result<Reply, ProxyError>,
}

pub struct Dispatcher {
    client: reqwest::Client,
    gate: ManagementGate,
    settings: ProxySettings,
    local_id: String,
}

impl Dispatcher {
    pub fn new(
        local_id: impl Into<String>,
        gate: ManagementGate,
        settings: ProxySettings,
    ) -> anyhow::Result<Self> {
        // No total timeout: it would also cut off long streamed bodies.
        // `unicast` bounds the wait for response headers instead, and reads
        // fail only after a stall.
        let client = reqwest::Client::builder()
            .read_timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            gate,
            settings,
            local_id: local_id.into(),
        })
    }

    pub fn gate(&self) -> &ManagementGate {
        &self.gate
    }

    /// Resolves `key` against `snapshot` and executes the decision.
    pub async fn route(
        &self,
        key: &RouteKey,
        snapshot: &Snapshot,
        request: &OutboundRequest,
    ) -> Result<Dispatch, ProxyError> {
        if request.is_mutating() && !self.gate.is_enabled() {
            return Err(ProxyError::ManagementDisabled);
        }

        match resolve(key, snapshot, &self.local_id) {
            Decision::Unicast(member) if member.id == self.local_id => Ok(Dispatch::Local),
            Decision::Unicast(member) => {
                debug!(
                    "Forwarding {} {} to {}",
                    request.method, request.path_and_query, member.id
                );
                self.unicast(&member, request).await.map(Dispatch::Remote)
            }
            Decision::Broadcast(members) => {
                Ok(Dispatch::Broadcast(self.broadcast(&members, request).await))
            }
            Decision::Unresolved => Err(ProxyError::Unresolved(match key {
                RouteKey::Volume(volume) => volume.clone(),
                RouteKey::Local => self.local_id.clone(),
                RouteKey::Broadcast => "cluster".to_string(),
            })),
        }
    }

    /// Forwards `request` to `member`.  Connection failures are retried up
    /// to the configured number of attempts; timeouts are not, since the
    /// member may already have applied the request.  The request timeout
    /// covers the wait for response headers, not the body.
    pub async fn unicast(
        &self,
        member: &Member,
        request: &OutboundRequest,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = format!("http://{}{}", member.address, request.path_and_query);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let send = self.build(&url, request).send();
            let Ok(sent) = timeout(self.settings.request_timeout, send).await else {
                return Err(ProxyError::Timeout {
                    member: member.id.clone(),
                });
            };
            match sent {
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => {
                    return Err(ProxyError::Timeout {
                        member: member.id.clone(),
                    })
                }
                Err(e) if e.is_connect() && attempt < max_attempts => {
                    warn!(
                        "Connection to {} ({}) failed on attempt {}/{}: {}",
                        member.id, member.address, attempt, max_attempts, e
                    );
                    sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ProxyError::Unreachable {
                        member: member.id.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Sends `request` to every member concurrently.  Outcomes are returned
    /// in the order of `members`; a failing member does not affect others.
    pub async fn broadcast(&self, members: &[Member], request: &OutboundRequest) -> Vec<MemberOutcome> {
        let calls = members.iter().map(|member| async move {
            let result = match self.unicast(member, request).await {
                Ok(response) => {
                    let status = response.status();
                    response
                        .bytes()
                        .await
                        .map(|body| Reply { status, body })
                        .map_err(|e| body_error(member, e))
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Broadcast to {} failed: {}", member.id, e);
            }
            MemberOutcome {
                member: member.clone(),
                result,
            }
        });
        join_all(calls).await
    }

    fn build(&self, url: &str, request: &OutboundRequest) -> reqwest::RequestBuilder {
        let mut headers = request.headers.clone();
        if let Ok(origin) = HeaderValue::from_str(&self.local_id) {
            headers.insert(HeaderName::from_static(FORWARDED_HEADER), origin);
        }

        let builder = self.client.request(request.method.clone(), url);
        match &request.body {
            OutboundBody::Empty => builder.headers(headers),
            OutboundBody::Bytes(bytes) => builder.headers(headers).body(bytes.clone()),
            OutboundBody::Upload(upload) => {
                // reqwest writes its own multipart boundary.
                headers.remove(header::CONTENT_TYPE);
                let part = Part::stream_with_length(
                    reqwest::Body::from(upload.content.clone()),
                    upload.content.len() as u64,
                )
                .file_name(upload.file_name.clone());
                let form = Form::new().text("Path", upload.path.clone()).part("file", part);
                builder.headers(headers).multipart(form)
            }
        }
    }
}

fn body_error(member: &Member, e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Timeout {
            member: member.id.clone(),
        }
    } else {
        ProxyError::Unreachable {
            member: member.id.clone(),
            attempts: 1,
            reason: e.to_string(),
        }
    }
}

/// Copies `headers` without hop-by-hop entries.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    out.remove(FORWARDED_HEADER);
    out
}
