pub mod config;
pub mod error;
pub mod factory;
pub mod fs;
pub mod local;
pub mod memory;
pub mod storage;

pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use fs::{Filesystem, FsConnector, Query, ServerChecksum};
pub use storage::{
    ChecksumOptions, FileLocation, FileStorage, FsFileStorage, SaveOptions, StorageReader,
    StoredFile,
};
