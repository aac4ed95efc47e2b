//! XRootD file storage.
//!
//! Identifiers of the form `root://host/path` (or `roots://`) are served
//! through the remote connector; anything else falls back to the base
//! storage's own resolution.
//!
//! XRootD v3.x servers only report adler32 checksums, even when the storage
//! system behind them reports something else (e.g. MD5). Set
//! `XROOTD_CHECKSUM_ALGO` to override the algorithm name the server reports.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use xrootd_common::fs::{is_xrootd_url, split_url};
use xrootd_common::storage::compute_checksum;
use xrootd_common::{
    ChecksumOptions, FileLocation, FileStorage, FsConnector, FsFileStorage, Query, Result,
    StorageConfig, StorageError,
};

pub struct XRootDFileStorage {
    base: FsFileStorage,
    remote: Arc<dyn FsConnector>,
    checksum_algo: Option<String>,
}

impl XRootDFileStorage {
    pub fn new(base: FsFileStorage, remote: Arc<dyn FsConnector>, config: &StorageConfig) -> Self {
        Self {
            base,
            remote,
            checksum_algo: config.xrootd_checksum_algo.clone(),
        }
    }

    /// Algorithm name that replaces the server-reported one.
    pub fn checksum_algo(&self) -> Option<&str> {
        self.checksum_algo.as_deref()
    }

    pub fn base(&self) -> &FsFileStorage {
        &self.base
    }

    /// Resolve the identifier, attaching `query` to the remote connection.
    ///
    /// The handle is rooted at the identifier's directory; with `create_dir`
    /// that directory (and its parents) is created if missing.
    pub async fn resolve_with_query(
        &self,
        create_dir: bool,
        query: Option<&Query>,
    ) -> Result<FileLocation> {
        let url = self.base.file_url();
        if !is_xrootd_url(url) {
            return self.base.resolve(create_dir).await;
        }

        let (dir, name) = split_url(url);
        let empty = Query::new();
        let fs = self.remote.connect(dir, query.unwrap_or(&empty)).await?;
        if create_dir {
            fs.make_dir("", true, true).await?;
        }

        debug!(url = %url, create_dir, "Resolved XRootD location");
        Ok(FileLocation {
            fs,
            path: name.to_string(),
        })
    }
}

/// Checksum reported by the server when the handle can provide one, the
/// generic streamed checksum otherwise.
///
/// Only a missing or refusing capability triggers the fallback; any other
/// failure is returned as-is.
pub async fn server_checksum<S>(
    storage: &S,
    algo_override: Option<&str>,
    opts: ChecksumOptions,
) -> Result<String>
where
    S: FileStorage + ?Sized,
{
    if opts.use_default_impl {
        return compute_checksum(storage, opts).await;
    }

    let loc = storage.resolve(false).await?;
    let reported = match loc.fs.server_checksum() {
        Some(capability) => capability.checksum(&loc.path).await,
        None => Err(StorageError::Unsupported(format!(
            "server checksum on {}",
            loc.fs.root_url()
        ))),
    };

    match reported {
        Ok((algo, value)) => Ok(format!("{}:{}", algo_override.unwrap_or(&algo), value)),
        Err(StorageError::Unsupported(reason)) => {
            debug!(url = %storage.file_url(), %reason, "Falling back to local checksum");
            compute_checksum(storage, opts).await
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl FileStorage for XRootDFileStorage {
    fn file_url(&self) -> &str {
        self.base.file_url()
    }

    fn clean_dir(&self) -> bool {
        self.base.clean_dir()
    }

    fn chunk_size(&self) -> usize {
        self.base.chunk_size()
    }

    async fn resolve(&self, create_dir: bool) -> Result<FileLocation> {
        self.resolve_with_query(create_dir, None).await
    }

    async fn checksum(&self, opts: ChecksumOptions) -> Result<String> {
        server_checksum(self, self.checksum_algo(), opts).await
    }
}
