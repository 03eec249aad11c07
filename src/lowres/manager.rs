use std::sync::Arc;

use crate::storage::MapStorage;

use super::{LowresConfig, LowresError, LowresLayer, LowresResult, Sample};

/// Entry point of the pyramid for one map
///
/// Updates go into the finest level. Coarser levels only change when a tile
/// of the level below is saved.
pub struct LowresTileManager {
    config: LowresConfig,
    layers: Vec<Arc<LowresLayer>>,
}

impl LowresTileManager {
    pub fn new(map: &MapStorage, config: LowresConfig) -> LowresResult<Self> {
        config.validate().map_err(LowresError::Config)?;

        let mut layers = Vec::with_capacity(config.lod_count as usize);
        let mut next = None;
        for lod in (1..=config.lod_count).rev() {
            let layer = LowresLayer::new(map, lod, &config, next.take());
            next = Some(layer.clone());
            layers.push(layer);
        }
        layers.reverse();

        log::debug!(
            "Lowres pyramid for map '{}' with {} levels of {} point tiles",
            map.id(),
            config.lod_count,
            config.tile_size
        );
        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &LowresConfig {
        &self.config
    }

    /// Layer `lod`, starting at 1
    pub fn layer(&self, lod: u16) -> Option<&Arc<LowresLayer>> {
        lod.checked_sub(1).and_then(|index| self.layers.get(index as usize))
    }

    pub fn layers(&self) -> &[Arc<LowresLayer>] {
        &self.layers
    }

    /// Set one point of the finest level
    pub fn update(&self, x: i32, z: i32, sample: &Sample) {
        self.layers[0].set(x, z, sample);
    }

    /// Save every changed tile, finest level first so each level sees the
    /// changes folded in from below before it is saved itself.
    pub fn save(&self) {
        for layer in &self.layers {
            layer.save();
        }
    }

    /// Save stale tiles and trim every level's cache
    pub fn housekeeping(&self) {
        for layer in &self.layers {
            layer.housekeeping(self.config.save_interval, self.config.max_resident_tiles);
        }
    }

    /// Save and release every resident tile
    pub fn flush(&self) {
        for layer in &self.layers {
            layer.flush();
        }
    }
}

impl std::fmt::Debug for LowresTileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowresTileManager")
            .field("config", &self.config)
            .field("layers", &self.layers)
            .finish()
    }
}
