//! XRootD and EOS file storages.
//!
//! [`XRootDFileStorage`] serves `root://` identifiers through a remote
//! filesystem client and prefers server-side checksums. [`EosFileStorage`]
//! additionally declares the file size to EOS before it allocates space.

pub mod eos;
pub mod factory;
pub mod xrootd;

pub use eos::{EosFileStorage, BOOKING_SIZE_PARAM};
pub use factory::{eos_storage_factory, xrootd_storage_factory, StorageContext};
pub use xrootd::{server_checksum, XRootDFileStorage};
