//! One level of the pyramid with its write-back tile cache

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::LoadingCache;
use crate::storage::{GridStorage, MapStorage, StorageError};

use super::{LowresConfig, LowresResult, LowresTile, Sample};

type TilePos = (i32, i32);

/// Tiles of one lod level
///
/// Tiles are held by a bounded cache that saves them when they leave it.
/// Underneath, a map of weak references hands out the same tile instance for
/// a position as long as anyone still holds it, even after eviction.
pub struct LowresLayer {
    lod: u16,
    tile_size: u32,
    lod_factor: u32,
    storage: GridStorage,
    next_layer: Option<Arc<LowresLayer>>,
    tiles: LoadingCache<TilePos, Arc<LowresTile>>,
    live_tiles: Mutex<HashMap<TilePos, Weak<LowresTile>>>,
}

impl LowresLayer {
    /// Layer `lod` saving into `map`, feeding averaged tiles into `next_layer`
    pub fn new(map: &MapStorage, lod: u16, config: &LowresConfig, next_layer: Option<Arc<LowresLayer>>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<LowresLayer>| {
            let this = this.clone();
            let tiles: LoadingCache<TilePos, Arc<LowresTile>> = LoadingCache::builder()
                .max_capacity(config.cache_capacity)
                .expire_after_write(config.tile_expiry)
                .removal_listener(move |pos: &TilePos, tile: Arc<LowresTile>, _| {
                    if let Some(layer) = this.upgrade() {
                        layer.save_tile(pos.0, pos.1, &tile, false);
                    }
                })
                .build();

            LowresLayer {
                lod,
                tile_size: config.tile_size,
                lod_factor: config.lod_factor,
                storage: map.lowres_tiles(lod),
                next_layer,
                tiles,
                live_tiles: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn lod(&self) -> u16 {
        self.lod
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn next_layer(&self) -> Option<&Arc<LowresLayer>> {
        self.next_layer.as_ref()
    }

    /// Tile at tile coordinates, loaded from storage if not resident
    pub fn tile(&self, tile_x: i32, tile_z: i32) -> Arc<LowresTile> {
        let pos = (tile_x, tile_z);
        self.tiles.get_or_load(pos, || {
            if let Some(tile) = self.live_tiles.lock().get(&pos).and_then(Weak::upgrade) {
                return tile;
            }

            let loaded = Arc::new(self.load_tile(tile_x, tile_z));
            let mut live = self.live_tiles.lock();
            // Someone outside the cache may have revived the tile meanwhile
            if let Some(tile) = live.get(&pos).and_then(Weak::upgrade) {
                return tile;
            }
            live.insert(pos, Arc::downgrade(&loaded));
            loaded
        })
    }

    fn load_tile(&self, tile_x: i32, tile_z: i32) -> LowresTile {
        match self.read_tile(tile_x, tile_z) {
            Ok(Some(tile)) => tile,
            Ok(None) => LowresTile::new(self.tile_size),
            Err(e) => {
                log::warn!(
                    "Failed to load lowres tile {},{} of lod {}, starting from a blank tile: {}",
                    tile_x,
                    tile_z,
                    self.lod,
                    e
                );
                LowresTile::new(self.tile_size)
            }
        }
    }

    fn read_tile(&self, tile_x: i32, tile_z: i32) -> LowresResult<Option<LowresTile>> {
        let Some(reader) = self.storage.read(tile_x, tile_z)? else {
            return Ok(None);
        };
        let data = reader.read_to_vec()?;
        Ok(Some(LowresTile::from_png(self.tile_size, &data)?))
    }

    /// Set the point at `x, z` in this layer's point grid.
    ///
    /// A point on a tile's left or top edge is also written into the margin
    /// of the neighbouring tile(s) sharing that edge or corner.
    pub fn set(&self, x: i32, z: i32, sample: &Sample) {
        let size = self.tile_size as i32;
        let (tile_x, tile_z) = (x.div_euclid(size), z.div_euclid(size));
        let (offset_x, offset_z) = (x.rem_euclid(size) as u32, z.rem_euclid(size) as u32);

        self.tile(tile_x, tile_z).set(offset_x, offset_z, sample);

        let margin = self.tile_size;
        if offset_x == 0 {
            self.tile(tile_x - 1, tile_z).set(margin, offset_z, sample);
        }
        if offset_z == 0 {
            self.tile(tile_x, tile_z - 1).set(offset_x, margin, sample);
        }
        if offset_x == 0 && offset_z == 0 {
            self.tile(tile_x - 1, tile_z - 1).set(margin, margin, sample);
        }
    }

    pub fn get(&self, x: i32, z: i32) -> Sample {
        let size = self.tile_size as i32;
        self.tile(x.div_euclid(size), z.div_euclid(size))
            .get(x.rem_euclid(size) as u32, z.rem_euclid(size) as u32)
    }

    /// Write `tile` to storage if it changed, or always when `force` is set,
    /// then fold it into the next layer.
    pub fn save_tile(&self, tile_x: i32, tile_z: i32, tile: &LowresTile, force: bool) {
        if !tile.take_dirty() && !force {
            return;
        }

        if let Err(e) = self.write_tile(tile_x, tile_z, tile) {
            tile.mark_dirty();
            log::error!("Failed to save lowres tile {},{} of lod {}: {}", tile_x, tile_z, self.lod, e);
            return;
        }
        tile.mark_saved();
        log::trace!("Saved lowres tile {},{} of lod {}", tile_x, tile_z, self.lod);

        if let Some(next) = &self.next_layer {
            self.propagate(next, tile_x, tile_z, tile);
        }
    }

    fn write_tile(&self, tile_x: i32, tile_z: i32, tile: &LowresTile) -> LowresResult<()> {
        let png = tile.to_png()?;
        let mut writer = self.storage.write(tile_x, tile_z)?;
        writer.write_all(&png).map_err(StorageError::from)?;
        writer.commit()?;
        Ok(())
    }

    /// Average groups of `lod_factor²` points into single points of `next`.
    ///
    /// The whole tile is averaged before anything is written downstream.
    fn propagate(&self, next: &LowresLayer, tile_x: i32, tile_z: i32, tile: &LowresTile) {
        let size = self.tile_size as usize;
        let factor = self.lod_factor as usize;
        let groups = size / factor;
        let points = tile.interior();

        let mut group = Vec::with_capacity(factor * factor);
        let mut averaged = Vec::with_capacity(groups * groups);
        for group_z in 0..groups {
            for group_x in 0..groups {
                group.clear();
                for dz in 0..factor {
                    let row = (group_z * factor + dz) * size;
                    for dx in 0..factor {
                        group.push(points[row + group_x * factor + dx]);
                    }
                }
                averaged.push(Sample::average(&group));
            }
        }

        let groups = groups as i32;
        let origin_x = tile_x * groups;
        let origin_z = tile_z * groups;
        for (index, sample) in averaged.iter().enumerate() {
            let index = index as i32;
            next.set(origin_x + index % groups, origin_z + index / groups, sample);
        }
    }

    /// Save every resident tile that changed
    pub fn save(&self) {
        for ((tile_x, tile_z), tile) in self.tiles.entries() {
            self.save_tile(tile_x, tile_z, &tile, false);
        }
    }

    /// Save tiles whose last save is older than `stale_after`, then drop
    /// the oldest tiles until at most `max_tiles` are resident.
    pub fn housekeeping(&self, stale_after: Duration, max_tiles: usize) {
        let now = Instant::now();
        for ((tile_x, tile_z), tile) in self.tiles.entries() {
            if now.duration_since(tile.last_save()) >= stale_after {
                self.save_tile(tile_x, tile_z, &tile, false);
            }
        }

        self.tiles.clean_up();
        self.tiles.trim_to(max_tiles);
        self.live_tiles.lock().retain(|_, tile| tile.strong_count() > 0);
    }

    /// Save and drop every resident tile
    pub fn flush(&self) {
        self.tiles.invalidate_all();
    }

    pub fn resident_tiles(&self) -> usize {
        self.tiles.len()
    }
}

impl std::fmt::Debug for LowresLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowresLayer")
            .field("lod", &self.lod)
            .field("tile_size", &self.tile_size)
            .field("resident_tiles", &self.tiles.len())
            .finish()
    }
}
