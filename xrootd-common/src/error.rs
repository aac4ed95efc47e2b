/// Errors raised by file storages and the filesystem handles beneath them.
///
/// Only `Unsupported` is ever recovered from internally (server checksum
/// fallback). Everything else reaches the caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("File size required: no size given and no default booking size configured")]
    SizeRequired,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("File size limit exceeded: more than {limit} bytes")]
    FileSizeLimit { limit: u64 },

    #[error("Unexpected file size: expected {expected} bytes, got {actual}")]
    UnexpectedFileSize { expected: u64, actual: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by a remote filesystem client, passed through untouched.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
