//! Filesystem client seam.
//!
//! A [`FsConnector`] turns a directory-like address (plus optional query
//! parameters) into a [`Filesystem`] handle rooted at that directory. All
//! paths passed to a handle are relative to its root; `""` is the root itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Connection/query parameters attached to a filesystem address.
pub type Query = BTreeMap<String, String>;

const XROOTD_SCHEMES: [&str; 2] = ["root://", "roots://"];

/// A handle on a directory of some (local or remote) filesystem.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// The address this handle is rooted at, without query parameters.
    fn root_url(&self) -> &str;

    /// Create a directory. With `allow_existing`, an existing directory is
    /// not an error; with `recursive`, missing parents are created too.
    async fn make_dir(&self, path: &str, recursive: bool, allow_existing: bool) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Size in bytes of a file.
    async fn size(&self, path: &str) -> Result<u64>;

    /// Create the file, or truncate it, so that it is exactly `size` bytes.
    async fn allocate(&self, path: &str, size: u64) -> Result<()>;

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush a written file to stable storage.
    async fn sync(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Read up to `len` bytes at `offset`. Returns an empty buffer at EOF.
    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Remove an empty directory.
    async fn remove_dir(&self, path: &str) -> Result<()>;

    /// Server-side checksum capability, if this handle has one.
    fn server_checksum(&self) -> Option<&dyn ServerChecksum> {
        None
    }
}

/// Checksums computed and cached by the storage server itself.
#[async_trait]
pub trait ServerChecksum: Send + Sync {
    /// Returns `(algorithm, value)` as reported by the server.
    async fn checksum(&self, path: &str) -> Result<(String, String)>;
}

/// Builds filesystem handles from addresses.
#[async_trait]
pub trait FsConnector: Send + Sync {
    async fn connect(&self, root_url: &str, query: &Query) -> Result<Arc<dyn Filesystem>>;
}

/// Whether an identifier addresses an XRootD endpoint.
pub fn is_xrootd_url(url: &str) -> bool {
    XROOTD_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
}

/// Split an identifier into its directory part and its final path segment.
pub fn split_url(url: &str) -> (&str, &str) {
    match url.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", url),
    }
}

/// Render `url?key=value&...` with encoded keys and values.
pub fn url_with_query(url: &str, query: &Query) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let params: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    format!("{}?{}", url, params.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_xrootd_url() {
        assert!(is_xrootd_url("root://eos.example/data/file1"));
        assert!(is_xrootd_url("roots://eos.example//eos/file1"));
        assert!(!is_xrootd_url("file:///local/path"));
        assert!(!is_xrootd_url("/var/data/file"));
        assert!(!is_xrootd_url("xroot://eos.example/file"));
    }

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("root://eos.example/data/file1"),
            ("root://eos.example/data", "file1")
        );
        assert_eq!(split_url("root://eos.example/file1"), ("root://eos.example", "file1"));
        assert_eq!(
            split_url("root://eos.example//eos/a/b/data"),
            ("root://eos.example//eos/a/b", "data")
        );
        assert_eq!(split_url("/tmp/x"), ("/tmp", "x"));
        assert_eq!(split_url("data"), ("", "data"));
    }

    #[test]
    fn test_url_with_query() {
        let mut query = Query::new();
        assert_eq!(url_with_query("root://h/d", &query), "root://h/d");

        query.insert("eos.bookingsize".to_string(), "2048".to_string());
        query.insert("eos.app".to_string(), "files rest".to_string());
        assert_eq!(
            url_with_query("root://h/d", &query),
            "root://h/d?eos.app=files%20rest&eos.bookingsize=2048"
        );
    }
}
