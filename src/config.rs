//! TOML configuration
//!
//! ```toml
//! [world]
//! chunk_capacity = 10240
//!
//! [storage]
//! type = "sql"
//! path = "maps.db"
//! dialect = "sqlite"
//! compression = "gzip"
//!
//! [lowres]
//! tile_size = 500
//! lod_count = 3
//! lod_factor = 5
//! ```
//!
//! Every section and key is optional.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::lowres::LowresConfig;
use crate::storage::sql::SqlOptions;
use crate::storage::{Dialect, FileStorage, SqlStorage, Storage, StorageBackend, StorageResult};
use crate::world::WorldCacheConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub world: WorldCacheConfig,
    pub storage: StorageConfig,
    pub lowres: LowresConfig,
    pub housekeeping: HousekeepingConfig,
}

impl MapperConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.lowres.validate().map_err(ConfigError::Invalid)
    }
}

/// Which backend stores the maps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    File {
        root: PathBuf,
        #[serde(default = "default_compression")]
        compression: Compression,
    },
    Sql {
        path: PathBuf,
        #[serde(default = "default_dialect")]
        dialect: String,
        #[serde(default = "default_compression")]
        compression: Compression,
        #[serde(flatten)]
        options: SqlOptions,
    },
}

fn default_compression() -> Compression {
    Compression::Gzip
}

fn default_dialect() -> String {
    Dialect::SQLITE.name.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            root: PathBuf::from("web/maps"),
            compression: default_compression(),
        }
    }
}

impl StorageConfig {
    /// Open the configured backend
    pub fn create(&self) -> StorageResult<Storage> {
        let backend: Arc<dyn StorageBackend> = match self {
            StorageConfig::File { root, compression } => {
                log::info!("Using file storage at {}", root.display());
                Arc::new(FileStorage::new(root, *compression))
            }
            StorageConfig::Sql {
                path,
                dialect,
                compression,
                options,
            } => Arc::new(SqlStorage::open(path, dialect, *compression, options)?),
        };
        Ok(Storage::new(backend))
    }
}

/// Background maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Duration` as whole milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
