//! Test doubles: loopback servers used as proxy targets and an in-memory
//! container runtime.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::proxy::FORWARDED_HEADER;
use crate::runtime::{ContainerRuntime, VolumeInfo};
use crate::types::VolumeUpdate;

/// Counts every request it receives and echoes what it saw as JSON.
/// `/slow` never answers in time, `/drip` answers at once but trickles its
/// body, and `/upload` reports the multipart form it was sent.
pub struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub async fn start() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/drip", get(drip))
            .route("/upload", post(upload))
            .fallback(echo)
            .with_state(Arc::clone(&hits));
        let addr = serve(app).await;
        Self { addr, hits }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn echo(State(hits): State<Arc<AtomicUsize>>, uri: Uri, headers: HeaderMap) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    if uri.path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(5)).await;
        return StatusCode::NO_CONTENT.into_response();
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "uri": uri.to_string(),
        "forwarded_by": header(FORWARDED_HEADER),
        "custom": header("x-custom"),
    }))
    .into_response()
}

async fn drip(State(hits): State<Arc<AtomicUsize>>) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    let chunks = stream::unfold(0u8, |i| async move {
        if i == 4 {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let chunk = Bytes::from(vec![b'0' + i]);
        Some((Ok::<_, std::io::Error>(chunk), i + 1))
    });
    Body::from_stream(chunks).into_response()
}

async fn upload(State(hits): State<Arc<AtomicUsize>>, mut form: Multipart) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    let mut seen = serde_json::Map::new();
    while let Ok(Some(field)) = form.next_field().await {
        match field.name() {
            Some("Path") => {
                seen.insert("path".into(), json!(field.text().await.unwrap_or_default()));
            }
            Some("file") => {
                let file_name = field.file_name().map(str::to_string);
                let len = field.bytes().await.map(|b| b.len()).unwrap_or_default();
                seen.insert("file_name".into(), json!(file_name));
                seen.insert("len".into(), json!(len));
            }
            _ => {}
        }
    }
    Json(serde_json::Value::Object(seen)).into_response()
}

/// Serves `app` on an ephemeral loopback port.
pub async fn serve(app: Router) -> SocketAddr {
    let (listener, addr) = bind().await;
    spawn(listener, app);
    addr
}

/// Binds an ephemeral loopback port, for servers that need to know their
/// own address before they are built.
pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn spawn(listener: TcpListener, app: Router) {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// An address nothing listens on.
pub fn unreachable_addr() -> String {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// Container runtime backed by a fixed name to directory map.
#[derive(Default)]
pub struct FakeRuntime {
    volumes: BTreeMap<String, PathBuf>,
}

impl FakeRuntime {
    pub fn with_volume(mut self, name: &str, mountpoint: &Path) -> Self {
        self.volumes.insert(name.to_string(), mountpoint.to_path_buf());
        self
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn monitor(&self, update_tx: mpsc::Sender<VolumeUpdate>) -> anyhow::Result<()> {
        let names = self.volumes.keys().cloned().collect();
        update_tx.send(VolumeUpdate::Snapshot { names }).await?;
        Ok(())
    }

    async fn list_volumes(&self) -> anyhow::Result<Vec<VolumeInfo>> {
        Ok(self
            .volumes
            .iter()
            .map(|(name, path)| VolumeInfo {
                name: name.clone(),
                driver: "local".to_string(),
                mountpoint: path.display().to_string(),
            })
            .collect())
    }

    async fn volume_mountpoint(&self, name: &str) -> anyhow::Result<Option<PathBuf>> {
        Ok(self.volumes.get(name).cloned())
    }
}
