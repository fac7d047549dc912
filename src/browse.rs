//! Local file operations behind the `/browse` endpoints.
//!
//! Paths are always relative to a root: the volume mountpoint when a
//! volume is addressed, the configured host root otherwise.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use log::debug;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::runtime::ContainerRuntime;

#[derive(Debug, Error)]
pub enum BrowseError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("container runtime: {0}")]
    Runtime(#[from] anyhow::Error),
    #[error(transparent)]
    Io(std::io::Error),
}

impl BrowseError {
    fn io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            BrowseError::NotFound(path.display().to_string())
        } else {
            BrowseError::Io(e)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub dir: bool,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

pub struct Browser {
    host_root: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Browser {
    pub fn new(host_root: impl Into<PathBuf>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            host_root: host_root.into(),
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    async fn root(&self, volume: Option<&str>) -> Result<PathBuf, BrowseError> {
        match volume {
            None => Ok(self.host_root.clone()),
            Some(name) => self
                .runtime
                .volume_mountpoint(name)
                .await?
                .ok_or_else(|| BrowseError::NotFound(format!("volume {name}"))),
        }
    }

    async fn resolve(&self, volume: Option<&str>, path: &str) -> Result<PathBuf, BrowseError> {
        Ok(self.root(volume).await?.join(relative(path)?))
    }

    /// Stores `content` as `dir/file_name`.  The file is written next to its
    /// destination and renamed into place, so readers never see a partial
    /// upload.
    pub async fn put(
        &self,
        volume: Option<&str>,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<PathBuf, BrowseError> {
        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BrowseError::InvalidPath(file_name.to_string()))?;

        let dir = self.resolve(volume, dir).await?;
        fs::create_dir_all(&dir).await.map_err(|e| BrowseError::io(&dir, e))?;

        let target = dir.join(name);
        let staging = dir.join(format!(".{name}.herd-upload"));
        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            fs::rename(&staging, &target).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(BrowseError::io(&target, e));
        }

        debug!("Stored {} bytes at {}", content.len(), target.display());
        Ok(target)
    }

    pub async fn delete(&self, volume: Option<&str>, path: &str) -> Result<(), BrowseError> {
        // Never the root itself.
        if relative(path)?.as_os_str().is_empty() {
            return Err(BrowseError::InvalidPath(path.to_string()));
        }
        let target = self.resolve(volume, path).await?;
        let meta = fs::metadata(&target).await.map_err(|e| BrowseError::io(&target, e))?;
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        removed.map_err(|e| BrowseError::io(&target, e))?;
        debug!("Deleted {}", target.display());
        Ok(())
    }

    pub async fn list(&self, volume: Option<&str>, path: &str) -> Result<Vec<FileInfo>, BrowseError> {
        let dir = self.resolve(volume, path).await?;
        let mut entries = fs::read_dir(&dir).await.map_err(|e| BrowseError::io(&dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(BrowseError::Io)? {
            let meta = entry.metadata().await.map_err(BrowseError::Io)?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or_default();
            files.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                dir: meta.is_dir(),
                modified,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub async fn open(&self, volume: Option<&str>, path: &str) -> Result<(String, fs::File), BrowseError> {
        let target = self.resolve(volume, path).await?;
        let file = fs::File::open(&target).await.map_err(|e| BrowseError::io(&target, e))?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok((name, file))
    }
}

/// Turns a caller-supplied path into a relative path that cannot escape
/// its root.
fn relative(path: &str) -> Result<PathBuf, BrowseError> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BrowseError::InvalidPath(path.to_string()))
            }
        }
    }
    Ok(out)
}
