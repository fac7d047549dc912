use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::cluster::ClusterSettings;
use crate::gossip::DetectorSettings;
use crate::proxy::ProxySettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Stable member id.  Defaults to the host name.  Resolved by `load`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// `manager` or `worker`.
    pub role: String,
    pub http_bind: SocketAddr,
    /// Address peers use to reach this node.  Defaults to `http_bind`, and
    /// is required when `http_bind` is a wildcard address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub topic_id: String,
    pub bootstrap_peers: Vec<String>,
    pub cluster_secret: String,
    pub management_enabled: bool,
    /// Root for browse requests that do not name a volume.
    pub host_root: String,
    pub max_upload_bytes: usize,

    pub join_attempts: u32,
    pub join_backoff_ms: u64,
    pub leave_timeout_ms: u64,

    pub heartbeat_interval_ms: u64,
    pub suspect_after_ms: u64,
    pub fail_after_ms: u64,
    pub reap_after_ms: u64,

    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub proxy_max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: None,
            role: "worker".into(),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 9001)),
            advertise_addr: None,
            bind_ip: None,
            // Default topic: 32 bytes of 0x42 encoded as hex
            topic_id: "4242424242424242424242424242424242424242424242424242424242424242".into(),
            bootstrap_peers: Vec::new(),
            cluster_secret: "default_insecure_secret".into(),
            management_enabled: false,
            host_root: "/host".into(),
            max_upload_bytes: 512 * 1024 * 1024,
            join_attempts: 3,
            join_backoff_ms: 2_000,
            leave_timeout_ms: 3_000,
            heartbeat_interval_ms: 1_000,
            suspect_after_ms: 5_000,
            fail_after_ms: 15_000,
            reap_after_ms: 60_000,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 3_000,
            proxy_max_attempts: 2,
            retry_backoff_ms: 100,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("herd.toml"))
                .merge(Json::file("herd.json"))
                .merge(Env::prefixed("HERD_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("HERD_CLUSTER_SECRET_FILE") {
            config.cluster_secret = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        // If bind_ip is set, override the IP part of http_bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.http_bind.port();
            config.http_bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        config.node_name = Some(resolve_node_name(
            config.node_name.take(),
            std::env::var("HOSTNAME").ok(),
            hostname::get().ok().and_then(|h| h.into_string().ok()),
        )?);
        config.advertise_addr = Some(resolve_advertise_addr(
            config.advertise_addr.take(),
            config.http_bind,
        )?);

        Ok(config)
    }

    pub fn node_name(&self) -> String {
        self.node_name.clone().unwrap_or_default()
    }

    pub fn advertise_addr(&self) -> String {
        self.advertise_addr.clone().unwrap_or_default()
    }

    pub fn cluster(&self) -> ClusterSettings {
        ClusterSettings {
            join_attempts: self.join_attempts,
            join_backoff: Duration::from_millis(self.join_backoff_ms),
            leave_timeout: Duration::from_millis(self.leave_timeout_ms),
        }
    }

    pub fn detector(&self) -> DetectorSettings {
        DetectorSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            suspect_after: Duration::from_millis(self.suspect_after_ms),
            fail_after: Duration::from_millis(self.fail_after_ms),
            reap_after: Duration::from_millis(self.reap_after_ms),
        }
    }

    pub fn proxy(&self) -> ProxySettings {
        ProxySettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_attempts: self.proxy_max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Member id: configured name, then `$HOSTNAME`, then the OS host name.
/// The network address is never used, since every node would share it.
fn resolve_node_name(
    configured: Option<String>,
    env: Option<String>,
    os: Option<String>,
) -> anyhow::Result<String> {
    [configured, env, os]
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| anyhow::anyhow!("No node name: set node_name or HERD_NODE_NAME"))
}

/// Address peers dial.  A wildcard bind address is not dialable, so it
/// needs an explicit `advertise_addr`.
fn resolve_advertise_addr(configured: Option<String>, http_bind: SocketAddr) -> anyhow::Result<String> {
    match configured.filter(|a| !a.trim().is_empty()) {
        Some(addr) => {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                if parsed.ip().is_unspecified() {
                    anyhow::bail!("advertise_addr {} is not reachable by peers", addr);
                }
            }
            Ok(addr)
        }
        None if http_bind.ip().is_unspecified() => anyhow::bail!(
            "http_bind {} listens on all interfaces; set advertise_addr (HERD_ADVERTISE_ADDR) or bind_ip",
            http_bind
        ),
        None => Ok(http_bind.to_string()),
    }
}
