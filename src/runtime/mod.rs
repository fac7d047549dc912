use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::VolumeUpdate;

pub mod docker;
pub use docker::DockerRuntime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start monitoring the runtime for volume changes.
    /// Updates should be sent to the provided channel.
    async fn monitor(&self, update_tx: mpsc::Sender<VolumeUpdate>) -> Result<()>;

    /// Volumes present on this host.
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Host path of a local volume, `None` if the volume does not exist here.
    async fn volume_mountpoint(&self, name: &str) -> Result<Option<PathBuf>>;
}
