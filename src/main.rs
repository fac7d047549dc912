//! Herd agent entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;

mod browse;
mod cluster;
mod config;
mod error;
mod gossip;
mod http;
mod proxy;
mod routing;
mod runtime;
mod types;

#[cfg(test)]
mod testing;

use cluster::ClusterService;
use config::Config;
use gossip::GossipMembership;
use proxy::{Dispatcher, ManagementGate};
use runtime::{ContainerRuntime, DockerRuntime};
use types::{Member, TagKey};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting herd agent {} as {} (management {})",
        cfg.node_name(),
        cfg.role,
        if cfg.management_enabled { "enabled" } else { "disabled" }
    );

    let local = Member::new(cfg.node_name(), cfg.advertise_addr())
        .with_tag(TagKey::Role, cfg.role.clone())
        .with_tag(TagKey::Version, env!("CARGO_PKG_VERSION"));

    // Membership
    let membership = GossipMembership::bind(
        local.id.clone(),
        &cfg.topic_id,
        cfg.cluster_secret.clone(),
        cfg.detector(),
    )
    .await?;
    info!("Seed id for other nodes: {}", membership.node_id());
    let cluster = Arc::new(ClusterService::new(local, Arc::new(membership), cfg.cluster()));
    let events_handle = cluster.run_events();

    if let Err(e) = cluster.join(&cfg.bootstrap_peers).await {
        // Local requests are still served; peers may join us later.
        error!("Failed to join cluster: {}", e);
    }

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let (volume_tx, mut volume_rx) = mpsc::channel(128);
    let monitor_runtime = Arc::clone(&runtime);
    let runtime_handle = tokio::spawn(async move {
        if let Err(e) = monitor_runtime.monitor(volume_tx).await {
            error!("Container runtime failed: {}", e);
        }
    });
    let cluster_for_volumes = Arc::clone(&cluster);
    let volumes_handle = tokio::spawn(async move {
        while let Some(update) = volume_rx.recv().await {
            info!("Volume change: {:?}", update);
            cluster_for_volumes
                .update_local_tags(|tags| update.apply_to(tags))
                .await;
        }
    });

    // Dispatch
    let gate = ManagementGate::new(cfg.management_enabled);
    let dispatcher = Arc::new(Dispatcher::new(
        cluster.local_id().to_string(),
        gate.clone(),
        cfg.proxy(),
    )?);
    let reload_handle = tokio::spawn(reload_on_hangup(gate));

    // HTTP API
    let state = http::AppState {
        cluster: Arc::clone(&cluster),
        dispatcher,
        browser: Arc::new(browse::Browser::new(cfg.host_root.clone(), runtime)),
    };
    let app = http::router(state, cfg.max_upload_bytes);
    let listener = TcpListener::bind(cfg.http_bind).await?;
    info!("HTTP API listening on {}", cfg.http_bind);

    // Graceful Shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server failed: {}", e);
    }

    cluster.leave().await;

    // Abort tasks
    runtime_handle.abort();
    volumes_handle.abort();
    reload_handle.abort();
    events_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
}

/// Re-reads `management_enabled` on every SIGHUP.
async fn reload_on_hangup(gate: ManagementGate) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Configuration reload unavailable: {}", e);
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match Config::load() {
            Ok(cfg) => {
                let previous = gate.set(cfg.management_enabled);
                info!(
                    "Reloaded configuration, management {} -> {}",
                    previous, cfg.management_enabled
                );
            }
            Err(e) => error!("Failed to reload configuration: {}", e),
        }
    }
}
