use super::{ContainerRuntime, VolumeInfo};
use crate::types::VolumeUpdate;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::system::EventsOptions;
use bollard::volume::ListVolumesOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        // Unix socket on Linux, named pipe on Windows, DOCKER_HOST if set.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    async fn volume_names(&self) -> Result<Vec<String>> {
        Ok(self
            .list_volumes()
            .await?
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn send(update_tx: &mpsc::Sender<VolumeUpdate>, update: VolumeUpdate) -> Result<()> {
        update_tx
            .send(update)
            .await
            .map_err(|_| anyhow!("Channel closed"))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn monitor(&self, update_tx: mpsc::Sender<VolumeUpdate>) -> Result<()> {
        loop {
            // Initial scan
            match self.volume_names().await {
                Ok(names) => {
                    info!("Initial scan found {} volumes", names.len());
                    Self::send(&update_tx, VolumeUpdate::Snapshot { names }).await?;
                }
                Err(e) => {
                    error!("Failed initial volume scan: {}. Retrying in 5s...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            }

            // Event stream
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["volume"].as_slice()),
                    ("event", ["create", "destroy"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));

            info!("Listening for Docker volume events...");
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(event) => {
                        let name = event.actor.and_then(|a| a.id).unwrap_or_default();
                        if name.is_empty() {
                            continue;
                        }
                        let action = event.action.unwrap_or_default();
                        debug!("Volume event: {} for {}", action, name);

                        let update = match action.as_str() {
                            "create" => VolumeUpdate::Add { name },
                            "destroy" => VolumeUpdate::Remove { name },
                            _ => continue,
                        };
                        Self::send(&update_tx, update).await?;
                    }
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to rescan
                    }
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeInfo {
                name: v.name,
                driver: v.driver,
                mountpoint: v.mountpoint,
            })
            .collect())
    }

    async fn volume_mountpoint(&self, name: &str) -> Result<Option<PathBuf>> {
        match self.docker.inspect_volume(name).await {
            Ok(volume) if !volume.mountpoint.is_empty() => Ok(Some(PathBuf::from(volume.mountpoint))),
            Ok(_) => Ok(None),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
