//! Base file storage.
//!
//! A [`FileStorage`] owns one file identifier and knows how to resolve it into
//! a filesystem handle plus a path relative to that handle. Everything else
//! (initialize, save, update, open, delete, checksum) is built on top of
//! `resolve` by the default methods. Implementations that override one of
//! those and still need the generic behavior call the matching free function
//! (`initialize_file`, `save_stream`, ...).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{Result, StorageError};
use crate::fs::{split_url, Filesystem, FsConnector, Query};

/// Name of the digest used by the generic checksum implementation.
pub const DEFAULT_CHECKSUM_ALGO: &str = "sha256";

/// Called with `(bytes_done, total)` as data is streamed.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A resolved file: the handle and the path relative to it.
#[derive(Clone)]
pub struct FileLocation {
    pub fs: Arc<dyn Filesystem>,
    pub path: String,
}

/// Outcome of `initialize` and `save`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub uri: String,
    pub size: u64,
    pub checksum: Option<String>,
}

#[derive(Clone, Default)]
pub struct ChecksumOptions {
    pub chunk_size: Option<usize>,
    pub progress: Option<ProgressCallback>,
    /// Skip any backend-specific shortcut and digest the bytes.
    pub use_default_impl: bool,
}

impl ChecksumOptions {
    pub fn default_impl() -> Self {
        Self {
            use_default_impl: true,
            ..Default::default()
        }
    }
}

#[derive(Clone, Default)]
pub struct SaveOptions {
    /// Declared size of the incoming stream.
    pub size: Option<u64>,
    /// Reject streams longer than this.
    pub size_limit: Option<u64>,
    pub chunk_size: Option<usize>,
    pub progress: Option<ProgressCallback>,
}

impl SaveOptions {
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    fn file_url(&self) -> &str;

    /// Remove the file's directory along with the file on delete.
    fn clean_dir(&self) -> bool {
        true
    }

    /// Chunk size used when the caller does not pass one.
    fn chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    async fn resolve(&self, create_dir: bool) -> Result<FileLocation>;

    async fn checksum(&self, opts: ChecksumOptions) -> Result<String> {
        compute_checksum(self, opts).await
    }

    async fn initialize(&self, size: Option<u64>) -> Result<StoredFile> {
        initialize_file(self, size).await
    }

    async fn save(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        opts: SaveOptions,
    ) -> Result<StoredFile> {
        save_stream(self, stream, opts).await
    }

    /// Overwrite part of the file starting at `seek`. Returns the number of
    /// bytes written and the checksum of those bytes.
    async fn update(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        seek: u64,
        opts: SaveOptions,
    ) -> Result<(u64, String)> {
        update_stream(self, stream, seek, opts).await
    }

    async fn open(&self) -> Result<StorageReader> {
        open_file(self).await
    }

    async fn delete(&self) -> Result<()> {
        delete_file(self).await
    }
}

/// Sequential reader over a stored file.
pub struct StorageReader {
    location: FileLocation,
    offset: u64,
    size: u64,
}

impl StorageReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Next chunk of at most `max` bytes; empty at EOF.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        let chunk = self
            .location
            .fs
            .read_at(&self.location.path, self.offset, max)
            .await?;
        self.offset += chunk.len() as u64;
        Ok(chunk)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size.saturating_sub(self.offset) as usize);
        loop {
            let chunk = self.read_chunk(DEFAULT_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }
}

fn format_checksum(hasher: Sha256) -> String {
    format!("{}:{}", DEFAULT_CHECKSUM_ALGO, hex::encode(hasher.finalize()))
}

/// Generic checksum: stream the file and digest it.
pub async fn compute_checksum<S>(storage: &S, opts: ChecksumOptions) -> Result<String>
where
    S: FileStorage + ?Sized,
{
    let chunk_size = opts.chunk_size.unwrap_or_else(|| storage.chunk_size());
    let mut reader = storage.open().await?;
    let total = reader.size();
    let mut hasher = Sha256::new();
    loop {
        let chunk = reader.read_chunk(chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(&chunk);
        if let Some(progress) = &opts.progress {
            progress(reader.position(), total);
        }
    }
    Ok(format_checksum(hasher))
}

pub async fn initialize_file<S>(storage: &S, size: Option<u64>) -> Result<StoredFile>
where
    S: FileStorage + ?Sized,
{
    let size = size.unwrap_or(0);
    let loc = storage.resolve(true).await?;
    loc.fs.allocate(&loc.path, size).await?;
    debug!(url = %storage.file_url(), size, "Initialized file");
    Ok(StoredFile {
        uri: storage.file_url().to_string(),
        size,
        checksum: None,
    })
}

pub async fn save_stream<S>(
    storage: &S,
    stream: &mut (dyn AsyncRead + Send + Unpin),
    opts: SaveOptions,
) -> Result<StoredFile>
where
    S: FileStorage + ?Sized,
{
    let loc = storage.resolve(true).await?;
    loc.fs.allocate(&loc.path, 0).await?;
    let chunk_size = opts.chunk_size.unwrap_or_else(|| storage.chunk_size());
    let (written, checksum) = write_stream(&loc, stream, 0, chunk_size, &opts).await?;
    debug!(url = %storage.file_url(), bytes = written, "Saved file");
    Ok(StoredFile {
        uri: storage.file_url().to_string(),
        size: written,
        checksum: Some(checksum),
    })
}

pub async fn update_stream<S>(
    storage: &S,
    stream: &mut (dyn AsyncRead + Send + Unpin),
    seek: u64,
    opts: SaveOptions,
) -> Result<(u64, String)>
where
    S: FileStorage + ?Sized,
{
    let loc = storage.resolve(false).await?;
    if !loc.fs.exists(&loc.path).await? {
        return Err(StorageError::NotFound(storage.file_url().to_string()));
    }
    let chunk_size = opts.chunk_size.unwrap_or_else(|| storage.chunk_size());
    write_stream(&loc, stream, seek, chunk_size, &opts).await
}

pub async fn open_file<S>(storage: &S) -> Result<StorageReader>
where
    S: FileStorage + ?Sized,
{
    let location = storage.resolve(false).await?;
    let size = location.fs.size(&location.path).await?;
    Ok(StorageReader {
        location,
        offset: 0,
        size,
    })
}

pub async fn delete_file<S>(storage: &S) -> Result<()>
where
    S: FileStorage + ?Sized,
{
    let loc = storage.resolve(false).await?;
    if loc.fs.exists(&loc.path).await? {
        loc.fs.remove(&loc.path).await?;
    }
    if storage.clean_dir() && loc.fs.exists("").await? {
        loc.fs.remove_dir("").await?;
    }
    debug!(url = %storage.file_url(), "Deleted file");
    Ok(())
}

/// Copy `stream` into the file at `offset`, then sync it. `progress` is called
/// after each chunk with the bytes written so far and the declared size, or
/// the bytes written so far when no size was declared.
async fn write_stream(
    loc: &FileLocation,
    stream: &mut (dyn AsyncRead + Send + Unpin),
    offset: u64,
    chunk_size: usize,
    opts: &SaveOptions,
) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut written: u64 = 0;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(limit) = opts.size_limit {
            if written + n as u64 > limit {
                return Err(StorageError::FileSizeLimit { limit });
            }
        }
        let position = offset.checked_add(written).ok_or_else(|| {
            StorageError::InvalidArgument(format!("write offset {} out of range", offset))
        })?;
        loc.fs.write_at(&loc.path, position, &buf[..n]).await?;
        hasher.update(&buf[..n]);
        written += n as u64;
        if let Some(progress) = &opts.progress {
            progress(written, opts.size.unwrap_or(written));
        }
    }
    loc.fs.sync(&loc.path).await?;
    if let Some(expected) = opts.size {
        if expected != written {
            return Err(StorageError::UnexpectedFileSize {
                expected,
                actual: written,
            });
        }
    }
    Ok((written, format_checksum(hasher)))
}

/// Storage for any identifier a connector understands: the identifier's
/// directory becomes the handle root and its last segment the file name.
#[derive(Clone)]
pub struct FsFileStorage {
    file_url: String,
    size: Option<u64>,
    clean_dir: bool,
    chunk_size: usize,
    connector: Arc<dyn FsConnector>,
}

impl FsFileStorage {
    pub fn new(file_url: impl Into<String>, connector: Arc<dyn FsConnector>) -> Self {
        Self {
            file_url: file_url.into(),
            size: None,
            clean_dir: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connector,
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn with_clean_dir(mut self, clean_dir: bool) -> Self {
        self.clean_dir = clean_dir;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Size recorded for the file by the owning framework, if known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

#[async_trait]
impl FileStorage for FsFileStorage {
    fn file_url(&self) -> &str {
        &self.file_url
    }

    fn clean_dir(&self) -> bool {
        self.clean_dir
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn resolve(&self, create_dir: bool) -> Result<FileLocation> {
        let (dir, name) = split_url(&self.file_url);
        let fs = self.connector.connect(dir, &Query::new()).await?;
        if create_dir {
            fs.make_dir("", true, true).await?;
        }
        Ok(FileLocation {
            fs,
            path: name.to_string(),
        })
    }
}
