use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_PATH_DIMENSIONS: usize = 2;
pub const DEFAULT_PATH_SPLIT_LENGTH: usize = 2;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Storage settings, resolved once and handed to storage constructors.
///
/// Keys use the upper-case names of the application configuration so the
/// same TOML file or environment can be shared with the owning framework.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Overrides the checksum algorithm name reported by the XRootD server.
    #[serde(rename = "XROOTD_CHECKSUM_ALGO", default)]
    pub xrootd_checksum_algo: Option<String>,
    /// Fallback booking size for EOS uploads that do not declare a size.
    #[serde(rename = "MAX_CONTENT_LENGTH", default)]
    pub max_content_length: Option<u64>,
    #[serde(
        rename = "FILES_REST_STORAGE_PATH_DIMENSIONS",
        default = "default_path_dimensions"
    )]
    pub path_dimensions: usize,
    #[serde(
        rename = "FILES_REST_STORAGE_PATH_SPLIT_LENGTH",
        default = "default_path_split_length"
    )]
    pub path_split_length: usize,
    #[serde(rename = "FILES_REST_DEFAULT_CHUNK_SIZE", default = "default_chunk_size")]
    pub default_chunk_size: usize,
}

fn default_path_dimensions() -> usize {
    DEFAULT_PATH_DIMENSIONS
}

fn default_path_split_length() -> usize {
    DEFAULT_PATH_SPLIT_LENGTH
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            xrootd_checksum_algo: None,
            max_content_length: None,
            path_dimensions: DEFAULT_PATH_DIMENSIONS,
            path_split_length: DEFAULT_PATH_SPLIT_LENGTH,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl StorageConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: StorageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read settings from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an env-style lookup. Unset or empty keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_num = |key: &str| -> anyhow::Result<Option<u64>> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
                None => Ok(None),
            }
        };

        let mut config = StorageConfig {
            xrootd_checksum_algo: get("XROOTD_CHECKSUM_ALGO"),
            max_content_length: parse_num("MAX_CONTENT_LENGTH")?,
            ..Default::default()
        };
        if let Some(n) = parse_num("FILES_REST_STORAGE_PATH_DIMENSIONS")? {
            config.path_dimensions = n as usize;
        }
        if let Some(n) = parse_num("FILES_REST_STORAGE_PATH_SPLIT_LENGTH")? {
            config.path_split_length = n as usize;
        }
        if let Some(n) = parse_num("FILES_REST_DEFAULT_CHUNK_SIZE")? {
            config.default_chunk_size = n as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(algo) = &self.xrootd_checksum_algo {
            if algo.trim().is_empty() {
                anyhow::bail!("XROOTD_CHECKSUM_ALGO must not be empty when set");
            }
        }
        if self.path_split_length == 0 {
            anyhow::bail!("FILES_REST_STORAGE_PATH_SPLIT_LENGTH must be positive");
        }
        let shard_chars = self.path_dimensions.checked_mul(self.path_split_length);
        if !matches!(shard_chars, Some(n) if n < uuid::fmt::Hyphenated::LENGTH) {
            anyhow::bail!(
                "FILES_REST_STORAGE_PATH_DIMENSIONS * FILES_REST_STORAGE_PATH_SPLIT_LENGTH must be below {}",
                uuid::fmt::Hyphenated::LENGTH
            );
        }
        if self.default_chunk_size == 0 {
            anyhow::bail!("FILES_REST_DEFAULT_CHUNK_SIZE must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_valid_config() {
        let toml_str = r#"
XROOTD_CHECKSUM_ALGO = "md5"
MAX_CONTENT_LENGTH = 104857600
"#;
        let config = StorageConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.xrootd_checksum_algo.as_deref(), Some("md5"));
        assert_eq!(config.max_content_length, Some(104_857_600));
        assert_eq!(config.path_dimensions, DEFAULT_PATH_DIMENSIONS);
        assert_eq!(config.default_chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StorageConfig::from_toml_str("").unwrap();
        assert!(config.xrootd_checksum_algo.is_none());
        assert!(config.max_content_length.is_none());
        assert_eq!(config.path_split_length, DEFAULT_PATH_SPLIT_LENGTH);
    }

    #[test]
    fn test_empty_algo_rejected() {
        assert!(StorageConfig::from_toml_str(r#"XROOTD_CHECKSUM_ALGO = " ""#).is_err());
    }

    #[test]
    fn test_path_sharding_bounded() {
        assert!(StorageConfig::from_toml_str(
            "FILES_REST_STORAGE_PATH_DIMENSIONS = 4\nFILES_REST_STORAGE_PATH_SPLIT_LENGTH = 8"
        )
        .is_ok());
        assert!(StorageConfig::from_toml_str(
            "FILES_REST_STORAGE_PATH_DIMENSIONS = 6\nFILES_REST_STORAGE_PATH_SPLIT_LENGTH = 6"
        )
        .is_err());
        assert!(StorageConfig::from_toml_str(&format!(
            "FILES_REST_STORAGE_PATH_DIMENSIONS = {}\nFILES_REST_STORAGE_PATH_SPLIT_LENGTH = 2",
            i64::MAX
        ))
        .is_err());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(StorageConfig::from_toml_str("FILES_REST_DEFAULT_CHUNK_SIZE = 0").is_err());
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("XROOTD_CHECKSUM_ALGO", "adler32"),
            ("MAX_CONTENT_LENGTH", "4096"),
            ("FILES_REST_STORAGE_PATH_DIMENSIONS", "3"),
            ("FILES_REST_DEFAULT_CHUNK_SIZE", ""),
        ]
        .into_iter()
        .collect();
        let config =
            StorageConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.xrootd_checksum_algo.as_deref(), Some("adler32"));
        assert_eq!(config.max_content_length, Some(4096));
        assert_eq!(config.path_dimensions, 3);
        assert_eq!(config.default_chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_from_lookup_bad_number() {
        let result = StorageConfig::from_lookup(|k| {
            (k == "MAX_CONTENT_LENGTH").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "MAX_CONTENT_LENGTH = 10\n").unwrap();
        let config = StorageConfig::load(&path).unwrap();
        assert_eq!(config.max_content_length, Some(10));

        assert!(StorageConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
