//! Mount-time tunables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine configuration chosen at mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    /// Reject every mutating operation with `ReadOnly`.
    pub read_only: bool,
    /// Inode cache slots.
    pub icache_capacity: usize,
    /// Bounded number of cached children per directory.
    pub dcache_max_children: usize,
    /// Blocks reserved for a new regular file.
    pub file_prealloc_blocks: u16,
    /// Blocks reserved for a new directory.
    pub dir_prealloc_blocks: u16,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            icache_capacity: kfs_inode::DEFAULT_CAPACITY,
            dcache_max_children: 32,
            file_prealloc_blocks: 1,
            dir_prealloc_blocks: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

impl MountConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.icache_capacity == 0 {
            return Err(ConfigError::Invalid("icache_capacity must be at least 1"));
        }
        if self.dcache_max_children == 0 {
            return Err(ConfigError::Invalid("dcache_max_children must be at least 1"));
        }
        if self.dir_prealloc_blocks == 0 {
            return Err(ConfigError::Invalid("dir_prealloc_blocks must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"read_only": true, "icache_capacity": 16}}"#).unwrap();
        let config = MountConfig::load(file.path()).unwrap();
        assert!(config.read_only);
        assert_eq!(config.icache_capacity, 16);
        assert_eq!(config.dcache_max_children, 32);
        assert_eq!(config.file_prealloc_blocks, 1);
    }

    #[test]
    fn unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"journal": true}}"#).unwrap();
        assert!(matches!(
            MountConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = MountConfig {
            icache_capacity: 0,
            ..MountConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = MountConfig::load("/nonexistent/kfs.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kfs.json"));
    }
}
