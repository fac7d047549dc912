use std::time::Duration;

use axum::http::{header, Method, Request, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tower::ServiceExt;

use super::*;
use crate::cluster::testing::{quick_settings, FakeProtocol};
use crate::proxy::{ManagementGate, ProxySettings};
use crate::testing::{bind, spawn, unreachable_addr, FakeRuntime, Upstream};
use crate::types::{Member, MembershipEvent, TagKey, VOLUME_LOCAL};

const BOUNDARY: &str = "herd-test-boundary";
const VOLUME: &str = "test";

struct Node {
    state: AppState,
    app: Router,
    host: TempDir,
    volume: TempDir,
}

impl Node {
    fn new(id: &str, address: &str, owns: Option<&str>, management: bool) -> Self {
        let host = tempfile::tempdir().unwrap();
        let volume = tempfile::tempdir().unwrap();

        let mut runtime = FakeRuntime::default();
        let mut local = Member::new(id, address).with_tag(TagKey::Role, "worker");
        if let Some(name) = owns {
            runtime = runtime.with_volume(name, volume.path());
            local = local.with_tag(TagKey::volume(name), VOLUME_LOCAL);
        }

        let settings = ProxySettings {
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(200),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(5),
        };
        let state = AppState {
            cluster: Arc::new(ClusterService::new(
                local,
                Arc::new(FakeProtocol::default()),
                quick_settings(),
            )),
            dispatcher: Arc::new(
                Dispatcher::new(id, ManagementGate::new(management), settings).unwrap(),
            ),
            browser: Arc::new(Browser::new(host.path(), Arc::new(runtime))),
        };
        let app = router(state.clone(), 16 * 1024 * 1024);
        Self {
            state,
            app,
            host,
            volume,
        }
    }

    /// Builds a node and serves it on a loopback port.
    async fn start(id: &str, owns: Option<&str>, management: bool) -> Self {
        let (listener, addr) = bind().await;
        let node = Self::new(id, &addr.to_string(), owns, management);
        spawn(listener, node.app.clone());
        node
    }

    fn member(&self) -> Member {
        self.state.cluster.local_member()
    }

    fn knows(&self, member: Member) {
        self.state
            .cluster
            .handle_membership_event(MembershipEvent::Join(member));
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::body::Bytes) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }
}

fn owner_at(id: &str, address: String) -> Member {
    Member::new(id, address).with_tag(TagKey::volume(VOLUME), VOLUME_LOCAL)
}

fn multipart(path: Option<&str>, file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(path) = path {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"Path\"\r\n\r\n{path}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((name, content)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn put(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn error_kind(body: &[u8]) -> String {
    let json: Value = serde_json::from_slice(body).unwrap();
    json["error"].as_str().unwrap_or_default().to_string()
}

fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

#[tokio::test]
async fn agents_lists_known_members() {
    let node = Node::new("node-a", "127.0.0.1:1", None, true);
    node.knows(owner_at("node-b", "127.0.0.1:2".into()));

    let (status, body) = node.send(request(Method::GET, "/agents")).await;
    assert_eq!(status, StatusCode::OK);
    let members: Vec<Member> = serde_json::from_slice(&body).unwrap();
    let ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["node-a", "node-b"]);
    assert!(members[1].has_tag(&TagKey::volume(VOLUME), VOLUME_LOCAL));
}

#[tokio::test]
async fn put_and_delete_on_host_root() {
    let node = Node::new("node-a", "127.0.0.1:1", None, true);
    let content = b"plain text upload".to_vec();

    let (status, _) = node
        .send(put(
            "/browse/put",
            multipart(Some("./testing"), Some(("put_test.txt", &content))),
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let stored = node.host.path().join("testing/put_test.txt");
    assert_eq!(std::fs::read(&stored).unwrap(), content);

    let (status, _) = node
        .send(request(
            Method::DELETE,
            "/browse/delete?path=./testing/put_test.txt",
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!stored.exists());
}

#[tokio::test]
async fn missing_input_is_rejected_before_routing() {
    let upstream = Upstream::start().await;
    let node = Node::new("node-a", "127.0.0.1:1", None, true);
    node.knows(owner_at("node-b", upstream.addr()));

    let (status, _) = node
        .send(put(
            "/browse/put?volumeID=test",
            multipart(None, Some(("put_test.txt", b"x"))),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = node
        .send(put("/browse/put?volumeID=test", multipart(Some("/testing"), None)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = node
        .send(request(Method::DELETE, "/browse/delete?volumeID=test"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "invalid_request");

    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn management_disabled_blocks_mutations_without_network() {
    let upstream = Upstream::start().await;
    let node = Node::new("node-a", "127.0.0.1:1", None, false);
    node.knows(owner_at("node-b", upstream.addr()));

    for uri in ["/browse/put", "/browse/put?volumeID=test"] {
        let (status, body) = node
            .send(put(uri, multipart(Some("/testing"), Some(("a.txt", b"x")))))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_kind(&body), "management_disabled");
    }

    let (status, body) = node
        .send(request(
            Method::DELETE,
            "/browse/delete?volumeID=test&path=/testing/a.txt",
        ))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_kind(&body), "management_disabled");
    assert!(!node.host.path().join("testing").exists());

    // Reads still go through.
    let (status, _) = node
        .send(request(Method::GET, "/browse/ls?volumeID=test&path=/"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn unknown_volume_is_unavailable() {
    let node = Node::new("node-a", "127.0.0.1:1", None, true);
    let (status, body) = node
        .send(request(
            Method::DELETE,
            "/browse/delete?volumeID=ghost&path=/a.txt",
        ))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_kind(&body), "unresolved");
}

#[tokio::test]
async fn unreachable_owner_is_unavailable() {
    let node = Node::new("node-a", "127.0.0.1:1", None, true);
    node.knows(owner_at("node-b", unreachable_addr()));
    let (status, body) = node
        .send(request(Method::GET, "/browse/ls?volumeID=test&path=/"))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_kind(&body), "unreachable");
}

#[tokio::test]
async fn upload_lands_on_owner_byte_for_byte() {
    let owner = Node::start("node-b", Some(VOLUME), true).await;
    let entry = Node::new("node-a", "127.0.0.1:1", None, true);
    entry.knows(owner.member());

    let content: Vec<u8> = (0..64 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    let (status, _) = entry
        .send(put(
            "/browse/put?volumeID=test",
            multipart(Some("/binarytest"), Some(("binary_test.jpg", &content))),
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let stored = owner.volume.path().join("binarytest/binary_test.jpg");
    assert_eq!(sha256(&std::fs::read(&stored).unwrap()), sha256(&content));
    assert!(!entry.host.path().join("binarytest").exists());

    let (status, body) = entry
        .send(request(
            Method::GET,
            "/browse/get?volumeID=test&path=/binarytest/binary_test.jpg",
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sha256(&body), sha256(&content));

    let (status, body) = entry
        .send(request(Method::GET, "/browse/ls?volumeID=test&path=/binarytest"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let listing: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing[0]["name"], "binary_test.jpg");
    assert_eq!(listing[0]["size"], content.len());

    let (status, _) = entry
        .send(request(
            Method::DELETE,
            "/browse/delete?volumeID=test&path=/binarytest/binary_test.jpg",
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!stored.exists());
}

#[tokio::test]
async fn volumes_broadcast_reports_partial_failure() {
    let a = Node::start("node-a", Some("alpha"), true).await;
    let b = Node::start("node-b", Some(VOLUME), true).await;
    a.knows(b.member());
    a.knows(Member::new("node-c", unreachable_addr()));

    let (status, body) = a.send(request(Method::GET, "/volumes")).await;
    assert_eq!(status, StatusCode::OK);

    let results: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(results.len(), 3);
    let ok: Vec<&str> = results
        .iter()
        .filter(|r| r["ok"] == true)
        .map(|r| r["node"].as_str().unwrap())
        .collect();
    assert_eq!(ok, vec!["node-a", "node-b"]);
    assert_eq!(results[0]["data"][0]["name"], "alpha");
    assert_eq!(results[1]["data"][0]["name"], VOLUME);
    assert_eq!(results[2]["ok"], false);
    assert_eq!(results[2]["error"], "unreachable");
}

#[tokio::test]
async fn forwarded_request_is_served_locally() {
    let node = Node::new("node-b", "127.0.0.1:1", Some(VOLUME), true);
    std::fs::write(node.volume.path().join("here.txt"), b"x").unwrap();

    let forwarded = Request::builder()
        .method(Method::GET)
        .uri("/browse/ls?volumeID=test&path=/")
        .header(FORWARDED_HEADER, "node-a")
        .body(Body::empty())
        .unwrap();
    let (status, body) = node.send(forwarded).await;
    assert_eq!(status, StatusCode::OK);
    let listing: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing[0]["name"], "here.txt");
}
