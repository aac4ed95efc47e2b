//! Local disk filesystem.
//!
//! Serves plain paths and `file://` URLs. This is where identifiers that are
//! not XRootD addresses end up.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::fs::{Filesystem, FsConnector, Query};

const FILE_SCHEME: &str = "file://";

/// Connector producing [`LocalFilesystem`] handles. Query parameters have no
/// meaning on local disk and are dropped.
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

#[async_trait]
impl FsConnector for LocalConnector {
    async fn connect(&self, root_url: &str, query: &Query) -> Result<Arc<dyn Filesystem>> {
        if !query.is_empty() {
            debug!(url = %root_url, "Ignoring query parameters for local filesystem");
        }
        Ok(Arc::new(LocalFilesystem::new(root_url)))
    }
}

pub struct LocalFilesystem {
    root_url: String,
    base_path: PathBuf,
}

impl LocalFilesystem {
    pub fn new(root_url: impl Into<String>) -> Self {
        let root_url = root_url.into();
        let base_path = PathBuf::from(root_url.strip_prefix(FILE_SCHEME).unwrap_or(&root_url));
        Self { root_url, base_path }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(StorageError::InvalidArgument(format!(
                "path escapes filesystem root: {}",
                path
            )));
        }
        if path.is_empty() {
            Ok(self.base_path.clone())
        } else {
            Ok(self.base_path.join(rel))
        }
    }
}

fn map_io(err: std::io::Error, path: &Path) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        std::io::ErrorKind::AlreadyExists => {
            StorageError::AlreadyExists(path.display().to_string())
        }
        _ => StorageError::Io(err),
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    fn root_url(&self) -> &str {
        &self.root_url
    }

    async fn make_dir(&self, path: &str, recursive: bool, allow_existing: bool) -> Result<()> {
        let dir = self.full_path(path)?;
        if tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            if allow_existing {
                return Ok(());
            }
            return Err(StorageError::AlreadyExists(dir.display().to_string()));
        }
        let created = if recursive {
            tokio::fs::create_dir_all(&dir).await
        } else {
            tokio::fs::create_dir(&dir).await
        };
        match created {
            Ok(()) => Ok(()),
            // Lost a race with another creator.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && allow_existing => Ok(()),
            Err(e) => Err(map_io(e, &dir)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full = self.full_path(path)?;
        let meta = tokio::fs::metadata(&full).await.map_err(|e| map_io(e, &full))?;
        Ok(meta.len())
    }

    async fn allocate(&self, path: &str, size: u64) -> Result<()> {
        let full = self.full_path(path)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        file.set_len(size).await?;
        file.sync_all().await?;
        debug!(path = %full.display(), size, "Allocated local file");
        Ok(())
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let full = self.full_path(path)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn sync(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        file.sync_all().await?;
        debug!(path = %full.display(), "Synced local file");
        Ok(())
    }

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let full = self.full_path(path)?;
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        debug!(path = %full.display(), "Removed local file");
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        if entries.next_entry().await?.is_some() {
            return Err(StorageError::DirectoryNotEmpty(full.display().to_string()));
        }
        tokio::fs::remove_dir(&full)
            .await
            .map_err(|e| map_io(e, &full))?;
        Ok(())
    }
}
