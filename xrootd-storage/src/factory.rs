use std::sync::Arc;

use xrootd_common::factory::fs_storage_factory;
use xrootd_common::factory::FactoryParams;
use xrootd_common::{FsConnector, Result, StorageConfig};

use crate::eos::EosFileStorage;
use crate::xrootd::XRootDFileStorage;

/// What the factories need besides the per-file parameters.
#[derive(Clone)]
pub struct StorageContext {
    pub config: StorageConfig,
    /// Client for `root://` and `roots://` identifiers.
    pub remote: Arc<dyn FsConnector>,
    /// Filesystem for every other identifier.
    pub local: Arc<dyn FsConnector>,
}

impl StorageContext {
    pub fn new(
        config: StorageConfig,
        remote: Arc<dyn FsConnector>,
        local: Arc<dyn FsConnector>,
    ) -> Self {
        Self {
            config,
            remote,
            local,
        }
    }
}

/// File storage factory for XRootD.
pub fn xrootd_storage_factory(
    ctx: &StorageContext,
    params: &FactoryParams,
) -> Result<XRootDFileStorage> {
    let base = fs_storage_factory(params, &ctx.config, Arc::clone(&ctx.local))?;
    Ok(XRootDFileStorage::new(
        base,
        Arc::clone(&ctx.remote),
        &ctx.config,
    ))
}

/// File storage factory for EOS.
pub fn eos_storage_factory(
    ctx: &StorageContext,
    params: &FactoryParams,
    default_booking_size: Option<u64>,
) -> Result<EosFileStorage> {
    let xrootd = xrootd_storage_factory(ctx, params)?;
    Ok(EosFileStorage::new(
        xrootd,
        default_booking_size,
        &ctx.config,
    ))
}
