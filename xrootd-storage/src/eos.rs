//! File storage for EOS via XRootD.
//!
//! EOS needs to know a file's size up front so it can place the file on a
//! disk server with enough free space. The size is passed as
//! `eos.bookingsize=<bytes>` on the connection URL. This storage sets it for
//! the two operations that allocate space on the server, `initialize` and
//! `save`, and clears it again when they finish.
//!
//! Clients of this storage must therefore declare the file size, unless a
//! default booking size is configured.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use xrootd_common::storage::{initialize_file, save_stream};
use xrootd_common::{
    ChecksumOptions, FileLocation, FileStorage, Query, Result, SaveOptions, StorageConfig,
    StorageError, StoredFile,
};

use crate::xrootd::{server_checksum, XRootDFileStorage};

/// Query parameter carrying the booking size.
pub const BOOKING_SIZE_PARAM: &str = "eos.bookingsize";

pub struct EosFileStorage {
    xrootd: XRootDFileStorage,
    default_booking_size: Option<u64>,
    booking_size: Mutex<Option<u64>>,
}

/// Clears the booking size when dropped, whether the wrapped call returned
/// normally, failed, or its future was dropped midway.
struct BookingSizeGuard<'a> {
    slot: &'a Mutex<Option<u64>>,
}

impl Drop for BookingSizeGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

fn lock(slot: &Mutex<Option<u64>>) -> MutexGuard<'_, Option<u64>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sizes of zero carry no booking information.
fn non_zero(size: Option<u64>) -> Option<u64> {
    size.filter(|&n| n > 0)
}

impl EosFileStorage {
    /// `default_booking_size` falls back to `MAX_CONTENT_LENGTH`.
    pub fn new(
        xrootd: XRootDFileStorage,
        default_booking_size: Option<u64>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            xrootd,
            default_booking_size: non_zero(default_booking_size).or(config.max_content_length),
            booking_size: Mutex::new(None),
        }
    }

    pub fn default_booking_size(&self) -> Option<u64> {
        self.default_booking_size
    }

    /// Booking size of the call in flight, if any.
    pub fn booking_size(&self) -> Option<u64> {
        *lock(&self.booking_size)
    }

    /// Set the booking size for the next server allocation. An explicit size
    /// wins over the default; with neither, fails with `SizeRequired` and
    /// leaves the current value untouched.
    pub fn set_booking_size(&self, size: Option<u64>) -> Result<()> {
        if size.is_none() && self.default_booking_size.is_none() {
            return Err(StorageError::SizeRequired);
        }
        let booked = non_zero(size).or(self.default_booking_size);
        *lock(&self.booking_size) = booked;
        debug!(url = %self.file_url(), booking_size = ?booked, "Set EOS booking size");
        Ok(())
    }

    fn book(&self, size: Option<u64>) -> Result<BookingSizeGuard<'_>> {
        self.set_booking_size(size)?;
        Ok(BookingSizeGuard {
            slot: &self.booking_size,
        })
    }

    fn booking_query(&self) -> Query {
        let mut query = Query::new();
        if let Some(size) = non_zero(self.booking_size()) {
            query.insert(BOOKING_SIZE_PARAM.to_string(), size.to_string());
        }
        query
    }
}

#[async_trait]
impl FileStorage for EosFileStorage {
    fn file_url(&self) -> &str {
        self.xrootd.file_url()
    }

    fn clean_dir(&self) -> bool {
        self.xrootd.clean_dir()
    }

    fn chunk_size(&self) -> usize {
        self.xrootd.chunk_size()
    }

    async fn resolve(&self, create_dir: bool) -> Result<FileLocation> {
        let query = self.booking_query();
        self.xrootd.resolve_with_query(create_dir, Some(&query)).await
    }

    async fn checksum(&self, opts: ChecksumOptions) -> Result<String> {
        server_checksum(self, self.xrootd.checksum_algo(), opts).await
    }

    async fn initialize(&self, size: Option<u64>) -> Result<StoredFile> {
        let _booking = self.book(size)?;
        initialize_file(self, size).await
    }

    async fn save(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        opts: SaveOptions,
    ) -> Result<StoredFile> {
        let _booking = self.book(opts.size)?;
        save_stream(self, stream, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use xrootd_common::memory::MemoryConnector;
    use xrootd_common::FsFileStorage;

    const URL: &str = "root://eos.example/data/file1";

    fn eos(remote: &MemoryConnector, default: Option<u64>, config: StorageConfig) -> EosFileStorage {
        let base = FsFileStorage::new(URL, Arc::new(MemoryConnector::new()));
        let xrootd = XRootDFileStorage::new(base, Arc::new(remote.clone()), &config);
        EosFileStorage::new(xrootd, default, &config)
    }

    #[test]
    fn test_default_booking_size_resolution() {
        let remote = MemoryConnector::new();
        assert_eq!(eos(&remote, None, StorageConfig::default()).default_booking_size(), None);
        assert_eq!(
            eos(&remote, Some(10), StorageConfig::default()).default_booking_size(),
            Some(10)
        );

        let config = StorageConfig {
            max_content_length: Some(1000),
            ..Default::default()
        };
        assert_eq!(eos(&remote, None, config.clone()).default_booking_size(), Some(1000));
        assert_eq!(eos(&remote, Some(10), config).default_booking_size(), Some(10));
    }

    #[test]
    fn test_set_booking_size_requires_size() {
        let s = eos(&MemoryConnector::new(), None, StorageConfig::default());
        assert!(matches!(
            s.set_booking_size(None),
            Err(StorageError::SizeRequired)
        ));
        assert_eq!(s.booking_size(), None);

        s.set_booking_size(Some(7)).unwrap();
        assert!(s.set_booking_size(None).is_err());
        assert_eq!(s.booking_size(), Some(7));
    }

    #[test]
    fn test_set_booking_size_prefers_explicit() {
        let s = eos(&MemoryConnector::new(), Some(1000), StorageConfig::default());
        s.set_booking_size(None).unwrap();
        assert_eq!(s.booking_size(), Some(1000));
        s.set_booking_size(Some(500)).unwrap();
        assert_eq!(s.booking_size(), Some(500));
        s.set_booking_size(Some(0)).unwrap();
        assert_eq!(s.booking_size(), Some(1000));
    }

    #[test]
    fn test_zero_size_without_default() {
        let s = eos(&MemoryConnector::new(), None, StorageConfig::default());
        s.set_booking_size(Some(0)).unwrap();
        assert_eq!(s.booking_size(), None);
        assert!(s.booking_query().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_carries_booking_size() {
        let remote = MemoryConnector::new();
        let s = eos(&remote, None, StorageConfig::default());
        s.set_booking_size(Some(2048)).unwrap();
        s.resolve(false).await.unwrap();

        let conn = &remote.connections()[0];
        assert_eq!(conn.query.get(BOOKING_SIZE_PARAM).map(String::as_str), Some("2048"));
        assert_eq!(conn.url, "root://eos.example/data?eos.bookingsize=2048");
    }

    #[tokio::test]
    async fn test_resolve_without_booking_size() {
        let remote = MemoryConnector::new();
        let s = eos(&remote, Some(100), StorageConfig::default());
        s.resolve(false).await.unwrap();
        assert!(remote.connections()[0].query.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_clears_booking_size() {
        let remote = MemoryConnector::new();
        let s = eos(&remote, None, StorageConfig::default());
        let stored = s.initialize(Some(2048)).await.unwrap();
        assert_eq!(stored.size, 2048);
        assert_eq!(s.booking_size(), None);
        assert_eq!(remote.file(URL).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn test_initialize_without_size_fails_before_connecting() {
        let remote = MemoryConnector::new();
        let s = eos(&remote, None, StorageConfig::default());
        assert!(matches!(
            s.initialize(None).await,
            Err(StorageError::SizeRequired)
        ));
        assert!(remote.connections().is_empty());
    }

    #[tokio::test]
    async fn test_failed_call_still_clears_booking_size() {
        let remote = MemoryConnector::new().failing("no route to host");
        let s = eos(&remote, None, StorageConfig::default());
        let err = s.initialize(Some(2048)).await.unwrap_err();
        assert!(matches!(err, StorageError::Transport(_)));
        assert_eq!(s.booking_size(), None);
    }

    #[tokio::test]
    async fn test_save_uses_declared_size() {
        let remote = MemoryConnector::new();
        let s = eos(&remote, Some(4096), StorageConfig::default());
        let mut stream: &[u8] = b"0123456789";
        s.save(&mut stream, SaveOptions::with_size(10)).await.unwrap();

        assert_eq!(remote.connections()[0].url, "root://eos.example/data?eos.bookingsize=10");
        assert_eq!(s.booking_size(), None);
        assert_eq!(remote.file(URL), Some(b"0123456789".to_vec()));
    }

    #[tokio::test]
    async fn test_checksum_does_not_book() {
        let remote = MemoryConnector::new().with_server_checksum("adler32");
        remote.put_file(URL, b"abc".to_vec());
        let config = StorageConfig {
            xrootd_checksum_algo: Some("md5".to_string()),
            ..Default::default()
        };
        let s = eos(&remote, Some(4096), config);
        let checksum = s.checksum(ChecksumOptions::default()).await.unwrap();
        assert!(checksum.starts_with("md5:"));
        assert!(remote.connections()[0].query.is_empty());
    }
}
