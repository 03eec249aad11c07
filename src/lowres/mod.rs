//! Lowres level-of-detail pyramid
//!
//! Samples produced for the finest lowres level are written into square tiles
//! of `tile_size` points. Every tile carries one extra row and column copied
//! from its right and bottom neighbours so adjacent tiles agree on their
//! shared edge. When a tile is saved it is averaged down by `lod_factor` on
//! each axis and the result is written into the next, coarser level.

pub mod layer;
pub mod manager;
pub mod sample;
pub mod tile;

pub use layer::LowresLayer;
pub use manager::LowresTileManager;
pub use sample::{Color, Sample};
pub use tile::LowresTile;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

pub type LowresResult<T> = Result<T, LowresError>;

#[derive(Debug, thiserror::Error)]
pub enum LowresError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("tile image is {found_width}x{found_height}, expected {width}x{height}")]
    TileSize {
        width: u32,
        height: u32,
        found_width: u32,
        found_height: u32,
    },

    #[error("invalid lowres config: {0}")]
    Config(String),
}

/// Shape of the pyramid and its tile caches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LowresConfig {
    /// Points along each edge of a tile, without the seam margin
    pub tile_size: u32,
    /// Number of lowres levels
    pub lod_count: u16,
    /// Points of one level averaged into one point of the next, per axis
    pub lod_factor: u32,
    /// Tiles held per level before the least recently used one is saved and dropped
    pub cache_capacity: usize,
    /// Cached tiles are saved and dropped this long after they were loaded
    #[serde(with = "crate::config::duration_secs")]
    pub tile_expiry: Duration,
    /// Housekeeping saves dirty tiles not saved for this long
    #[serde(with = "crate::config::duration_secs")]
    pub save_interval: Duration,
    /// Housekeeping trims each level down to this many resident tiles
    pub max_resident_tiles: usize,
}

impl Default for LowresConfig {
    fn default() -> Self {
        Self {
            tile_size: 500,
            lod_count: 3,
            lod_factor: 5,
            cache_capacity: 100,
            tile_expiry: Duration::from_secs(60),
            save_interval: Duration::from_secs(2 * 60),
            max_resident_tiles: 10,
        }
    }
}

impl LowresConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size == 0 {
            return Err("tile_size must be positive".into());
        }
        if self.lod_count == 0 {
            return Err("lod_count must be at least 1".into());
        }
        if self.lod_factor < 2 {
            return Err("lod_factor must be at least 2".into());
        }
        if self.tile_size % self.lod_factor != 0 {
            return Err(format!(
                "tile_size {} is not divisible by lod_factor {}",
                self.tile_size, self.lod_factor
            ));
        }
        if self.cache_capacity == 0 {
            return Err("cache_capacity must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(LowresConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_indivisible_tile_size_is_rejected() {
        let config = LowresConfig {
            tile_size: 50,
            lod_factor: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_point_factor_is_rejected() {
        let config = LowresConfig {
            lod_factor: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
