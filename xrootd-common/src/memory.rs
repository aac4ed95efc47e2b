//! In-memory filesystem.
//!
//! Every handle created by one [`MemoryConnector`] shares the same tree, so a
//! directory made through one connection is visible through the next. The
//! connector keeps a log of connections and directory creations, which makes
//! it a convenient stand-in for a remote filesystem client in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};
use crate::fs::{url_with_query, Filesystem, FsConnector, Query, ServerChecksum};

/// One call to [`FsConnector::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    pub root_url: String,
    pub query: Query,
    /// `root_url` with the query rendered onto it.
    pub url: String,
}

/// One call to [`Filesystem::make_dir`], with the path made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeDirRecord {
    pub path: String,
    pub recursive: bool,
    pub allow_existing: bool,
}

/// Largest file a memory handle will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone)]
enum ChecksumMode {
    Absent,
    Report(String),
    Refuse,
}

#[derive(Default)]
struct MemoryState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    connections: Vec<ConnectRecord>,
    make_dirs: Vec<MakeDirRecord>,
    syncs: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    checksum: ChecksumMode,
    failure: Option<String>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            checksum: ChecksumMode::Absent,
            failure: None,
        }
    }

    /// Handles report server checksums under `algo`, valued with the SHA-256
    /// hex digest of the file content.
    pub fn with_server_checksum(mut self, algo: impl Into<String>) -> Self {
        self.checksum = ChecksumMode::Report(algo.into());
        self
    }

    /// Handles expose the capability but the server refuses to answer.
    pub fn with_refused_server_checksum(mut self) -> Self {
        self.checksum = ChecksumMode::Refuse;
        self
    }

    /// Every `connect` fails with a transport error carrying `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    pub fn connections(&self) -> Vec<ConnectRecord> {
        self.state().connections.clone()
    }

    pub fn make_dir_calls(&self) -> Vec<MakeDirRecord> {
        self.state().make_dirs.clone()
    }

    /// Files flushed through [`Filesystem::sync`], in call order.
    pub fn sync_calls(&self) -> Vec<String> {
        self.state().syncs.clone()
    }

    pub fn file(&self, url: &str) -> Option<Vec<u8>> {
        self.state().files.get(url).cloned()
    }

    pub fn dir_exists(&self, url: &str) -> bool {
        let state = self.state();
        dir_exists(&state, url)
    }

    /// Place a file directly, creating its parent directories.
    pub fn put_file(&self, url: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.state();
        if let Some((parent, _)) = url.rsplit_once('/') {
            insert_dir_all(&mut state, parent);
        }
        state.files.insert(url.to_string(), data.into());
    }
}

#[async_trait]
impl FsConnector for MemoryConnector {
    async fn connect(&self, root_url: &str, query: &Query) -> Result<Arc<dyn Filesystem>> {
        if let Some(msg) = &self.failure {
            return Err(anyhow::anyhow!("{}", msg).into());
        }
        self.state().connections.push(ConnectRecord {
            root_url: root_url.to_string(),
            query: query.clone(),
            url: url_with_query(root_url, query),
        });
        Ok(Arc::new(MemoryFilesystem {
            root_url: root_url.to_string(),
            state: Arc::clone(&self.state),
            checksum: self.checksum.clone(),
        }))
    }
}

pub struct MemoryFilesystem {
    root_url: String,
    state: Arc<Mutex<MemoryState>>,
    checksum: ChecksumMode,
}

impl MemoryFilesystem {
    fn key(&self, path: &str) -> String {
        if path.is_empty() {
            self.root_url.clone()
        } else {
            format!(
                "{}/{}",
                self.root_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Roots that exist without being created: `""`, `/` and `scheme://host`.
fn is_implicit_dir(key: &str) -> bool {
    if key.is_empty() || key == "/" {
        return true;
    }
    match key.split_once("://") {
        Some((_, rest)) => !rest.contains('/'),
        None => false,
    }
}

fn dir_exists(state: &MemoryState, key: &str) -> bool {
    is_implicit_dir(key) || state.dirs.contains(key)
}

fn parent_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn insert_dir_all(state: &mut MemoryState, key: &str) {
    let mut current = key;
    while !is_implicit_dir(current) {
        state.dirs.insert(current.to_string());
        current = parent_of(current);
    }
}

/// End of the byte range `offset..offset + len`, bounded by [`MAX_FILE_SIZE`].
fn range_end(offset: u64, len: usize) -> Result<usize> {
    offset
        .checked_add(len as u64)
        .filter(|&end| end <= MAX_FILE_SIZE)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or(StorageError::FileSizeLimit {
            limit: MAX_FILE_SIZE,
        })
}

fn require_parent(state: &MemoryState, key: &str) -> Result<()> {
    let parent = parent_of(key);
    if dir_exists(state, parent) {
        Ok(())
    } else {
        Err(StorageError::NotFound(parent.to_string()))
    }
}

#[async_trait]
impl Filesystem for MemoryFilesystem {
    fn root_url(&self) -> &str {
        &self.root_url
    }

    async fn make_dir(&self, path: &str, recursive: bool, allow_existing: bool) -> Result<()> {
        let key = self.key(path);
        let mut state = lock(&self.state);
        state.make_dirs.push(MakeDirRecord {
            path: key.clone(),
            recursive,
            allow_existing,
        });
        if dir_exists(&state, &key) {
            return if allow_existing {
                Ok(())
            } else {
                Err(StorageError::AlreadyExists(key))
            };
        }
        if recursive {
            insert_dir_all(&mut state, &key);
        } else {
            require_parent(&state, &key)?;
            state.dirs.insert(key);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        let state = lock(&self.state);
        Ok(state.files.contains_key(&key) || dir_exists(&state, &key))
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let key = self.key(path);
        let state = lock(&self.state);
        state
            .files
            .get(&key)
            .map(|data| data.len() as u64)
            .ok_or(StorageError::NotFound(key))
    }

    async fn allocate(&self, path: &str, size: u64) -> Result<()> {
        let key = self.key(path);
        let mut state = lock(&self.state);
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len as u64 <= MAX_FILE_SIZE)
            .ok_or(StorageError::FileSizeLimit {
                limit: MAX_FILE_SIZE,
            })?;
        require_parent(&state, &key)?;
        state.files.insert(key, vec![0; len]);
        Ok(())
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let end = range_end(offset, data.len())?;
        let start = end - data.len();
        let key = self.key(path);
        let mut state = lock(&self.state);
        let file = state
            .files
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn sync(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        let mut state = lock(&self.state);
        if !state.files.contains_key(&key) {
            return Err(StorageError::NotFound(key));
        }
        state.syncs.push(key);
        Ok(())
    }

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let key = self.key(path);
        let state = lock(&self.state);
        let file = state
            .files
            .get(&key)
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(file.len());
        let end = start.saturating_add(len).min(file.len());
        Ok(Bytes::copy_from_slice(&file[start..end]))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        let mut state = lock(&self.state);
        match state.files.remove(&key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key)),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        let mut state = lock(&self.state);
        if !state.dirs.contains(&key) {
            return Err(StorageError::NotFound(key));
        }
        let prefix = format!("{}/", key);
        let occupied = state.files.keys().any(|k| k.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix));
        if occupied {
            return Err(StorageError::DirectoryNotEmpty(key));
        }
        state.dirs.remove(&key);
        Ok(())
    }

    fn server_checksum(&self) -> Option<&dyn ServerChecksum> {
        match self.checksum {
            ChecksumMode::Absent => None,
            _ => Some(self),
        }
    }
}

#[async_trait]
impl ServerChecksum for MemoryFilesystem {
    async fn checksum(&self, path: &str) -> Result<(String, String)> {
        let algo = match &self.checksum {
            ChecksumMode::Report(algo) => algo.clone(),
            _ => {
                return Err(StorageError::Unsupported(format!(
                    "server checksum for {}",
                    self.root_url
                )))
            }
        };
        let key = self.key(path);
        let state = lock(&self.state);
        let data = state
            .files
            .get(&key)
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        Ok((algo, hex::encode(Sha256::digest(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_is_recorded() {
        let connector = MemoryConnector::new();
        let mut query = Query::new();
        query.insert("eos.bookingsize".to_string(), "2048".to_string());
        connector.connect("root://eos.example/data", &query).await.unwrap();

        let records = connector.connections();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].root_url, "root://eos.example/data");
        assert_eq!(records[0].url, "root://eos.example/data?eos.bookingsize=2048");
    }

    #[tokio::test]
    async fn test_make_dir_semantics() {
        let connector = MemoryConnector::new();
        let fs = connector
            .connect("root://eos.example/a/b/c", &Query::new())
            .await
            .unwrap();

        // Parent missing
        assert!(matches!(
            fs.make_dir("", false, true).await,
            Err(StorageError::NotFound(_))
        ));
        fs.make_dir("", true, true).await.unwrap();
        assert!(connector.dir_exists("root://eos.example/a"));
        assert!(connector.dir_exists("root://eos.example/a/b/c"));

        fs.make_dir("", true, true).await.unwrap();
        assert!(matches!(
            fs.make_dir("", true, false).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(connector.make_dir_calls().len(), 4);
    }

    #[tokio::test]
    async fn test_file_io() {
        let connector = MemoryConnector::new();
        let fs = connector.connect("/srv/files", &Query::new()).await.unwrap();
        assert!(matches!(
            fs.allocate("data", 4).await,
            Err(StorageError::NotFound(_))
        ));

        fs.make_dir("", true, true).await.unwrap();
        fs.allocate("data", 4).await.unwrap();
        assert_eq!(connector.file("/srv/files/data"), Some(vec![0; 4]));

        fs.write_at("data", 2, b"xyz").await.unwrap();
        assert_eq!(fs.size("data").await.unwrap(), 5);
        assert_eq!(&fs.read_at("data", 2, 10).await.unwrap()[..], b"xyz");
        assert!(fs.read_at("data", 9, 10).await.unwrap().is_empty());

        assert!(matches!(
            fs.remove_dir("").await,
            Err(StorageError::DirectoryNotEmpty(_))
        ));
        fs.remove("data").await.unwrap();
        fs.remove_dir("").await.unwrap();
        assert!(!fs.exists("").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_size_limit() {
        let connector = MemoryConnector::new();
        connector.put_file("/srv/files/data", b"abc".to_vec());
        let fs = connector.connect("/srv/files", &Query::new()).await.unwrap();

        assert!(matches!(
            fs.write_at("data", u64::MAX - 1, b"XY").await,
            Err(StorageError::FileSizeLimit { .. })
        ));
        assert!(matches!(
            fs.write_at("data", MAX_FILE_SIZE - 1, b"XY").await,
            Err(StorageError::FileSizeLimit { .. })
        ));
        assert!(matches!(
            fs.allocate("big", u64::MAX).await,
            Err(StorageError::FileSizeLimit { limit }) if limit == MAX_FILE_SIZE
        ));
        assert_eq!(connector.file("/srv/files/data"), Some(b"abc".to_vec()));
        assert!(connector.file("/srv/files/big").is_none());
        assert!(fs.read_at("data", u64::MAX, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_checksum_modes() {
        let plain = MemoryConnector::new();
        let fs = plain.connect("root://h/d", &Query::new()).await.unwrap();
        assert!(fs.server_checksum().is_none());

        let reporting = MemoryConnector::new().with_server_checksum("adler32");
        reporting.put_file("root://h/d/f", b"abc".to_vec());
        let fs = reporting.connect("root://h/d", &Query::new()).await.unwrap();
        let (algo, value) = fs.server_checksum().unwrap().checksum("f").await.unwrap();
        assert_eq!(algo, "adler32");
        assert_eq!(value, hex::encode(Sha256::digest(b"abc")));

        let refusing = MemoryConnector::new().with_refused_server_checksum();
        let fs = refusing.connect("root://h/d", &Query::new()).await.unwrap();
        assert!(matches!(
            fs.server_checksum().unwrap().checksum("f").await,
            Err(StorageError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_connector() {
        let connector = MemoryConnector::new().failing("auth failed");
        let err = connector
            .connect("root://h/d", &Query::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Transport(_)));
        assert!(connector.connections().is_empty());
    }
}
