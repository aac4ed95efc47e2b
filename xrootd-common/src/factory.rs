use std::sync::Arc;

use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::fs::FsConnector;
use crate::storage::FsFileStorage;

/// File name used for files placed under a default location.
pub const DATA_FILE_NAME: &str = "data";

/// The owning framework's record of a stored file.
#[derive(Debug, Clone)]
pub struct FileInstance {
    pub id: Uuid,
    pub uri: Option<String>,
    pub size: Option<u64>,
}

/// Arguments handed to a storage factory.
#[derive(Debug, Clone)]
pub struct FactoryParams {
    pub file_instance: Option<FileInstance>,
    pub default_location: Option<String>,
    pub file_url: Option<String>,
    pub size: Option<u64>,
    pub clean_dir: bool,
}

impl Default for FactoryParams {
    fn default() -> Self {
        Self {
            file_instance: None,
            default_location: None,
            file_url: None,
            size: None,
            clean_dir: true,
        }
    }
}

impl FactoryParams {
    pub fn for_instance(instance: FileInstance, default_location: Option<String>) -> Self {
        Self {
            file_instance: Some(instance),
            default_location,
            ..Default::default()
        }
    }

    pub fn for_url(file_url: impl Into<String>, size: u64) -> Self {
        Self {
            file_url: Some(file_url.into()),
            size: Some(size),
            ..Default::default()
        }
    }
}

/// Build `{base}/{id[0..n]}/{id[n..2n]}/.../{rest}/{filename}`.
///
/// The id is cut into `dimensions` prefixes of `split_length` characters;
/// whatever remains forms the last directory.
pub fn make_path(
    base: &str,
    id: &str,
    filename: &str,
    dimensions: usize,
    split_length: usize,
) -> Result<String> {
    let prefix_len = dimensions.checked_mul(split_length).ok_or_else(|| {
        StorageError::InvalidArgument(format!(
            "{} parts of {} characters overflow an id",
            dimensions, split_length
        ))
    })?;
    if id.len() <= prefix_len || !id.is_ascii() {
        return Err(StorageError::InvalidArgument(format!(
            "id '{}' too short to split into {} parts of {} characters",
            id, dimensions, split_length
        )));
    }
    let mut parts = Vec::with_capacity(dimensions + 3);
    parts.push(base.trim_end_matches('/'));
    let mut rest = id;
    for _ in 0..dimensions {
        let (head, tail) = rest.split_at(split_length);
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);
    parts.push(filename);
    Ok(parts.join("/"))
}

/// Work out the file identifier and recorded size a storage should be
/// constructed with.
pub fn resolve_location(
    params: &FactoryParams,
    config: &StorageConfig,
) -> Result<(String, Option<u64>)> {
    if let Some(instance) = &params.file_instance {
        if let Some(uri) = &instance.uri {
            return Ok((uri.clone(), instance.size));
        }
        let location = params.default_location.as_deref().ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "file instance {} has no URI and no default location was given",
                instance.id
            ))
        })?;
        let url = make_path(
            location,
            &instance.id.to_string(),
            DATA_FILE_NAME,
            config.path_dimensions,
            config.path_split_length,
        )?;
        return Ok((url, instance.size));
    }

    match (&params.file_url, params.size) {
        (Some(url), Some(size)) => Ok((url.clone(), Some(size))),
        _ => Err(StorageError::InvalidArgument(
            "either a file instance or both a file URL and a size are required".to_string(),
        )),
    }
}

/// Factory for the base storage.
pub fn fs_storage_factory(
    params: &FactoryParams,
    config: &StorageConfig,
    connector: Arc<dyn FsConnector>,
) -> Result<FsFileStorage> {
    let (file_url, size) = resolve_location(params, config)?;
    Ok(FsFileStorage::new(file_url, connector)
        .with_size(size)
        .with_clean_dir(params.clean_dir)
        .with_chunk_size(config.default_chunk_size))
}
