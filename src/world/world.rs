//! Cached access to a world's region folder

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::LoadingCache;
use crate::world::chunk::Chunk;
use crate::world::decoder::{ChunkDecoder, NbtChunkDecoder};
use crate::world::loader::ChunkLoader;
use crate::world::position::{ChunkPos, RegionPos};
use crate::world::region::{ChunkConsumer, Region, RegionTypeRegistry};

/// Bounds of the region and chunk caches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldCacheConfig {
    pub region_capacity: usize,
    pub chunk_capacity: usize,
    /// Entries are dropped this long after they were loaded
    #[serde(with = "crate::config::duration_secs")]
    pub expire_after_write: Duration,
}

impl Default for WorldCacheConfig {
    fn default() -> Self {
        Self {
            region_capacity: 64,
            chunk_capacity: 10240,
            expire_after_write: Duration::from_secs(10 * 60),
        }
    }
}

/// A world's region folder with region handles and decoded chunks cached
///
/// Both caches are safe to share between threads. A chunk is loaded at most
/// once at a time; concurrent requests for it wait on the same load.
pub struct World {
    region_folder: PathBuf,
    registry: RegionTypeRegistry,
    decoder: Arc<dyn ChunkDecoder>,
    loader: ChunkLoader,
    region_cache: LoadingCache<RegionPos, Arc<dyn Region>>,
    chunk_cache: LoadingCache<ChunkPos, Arc<Chunk>>,
}

impl World {
    pub fn new(region_folder: impl Into<PathBuf>, config: &WorldCacheConfig) -> Self {
        Self {
            region_folder: region_folder.into(),
            registry: RegionTypeRegistry::default(),
            decoder: Arc::new(NbtChunkDecoder),
            loader: ChunkLoader::default(),
            region_cache: LoadingCache::builder()
                .max_capacity(config.region_capacity)
                .expire_after_write(config.expire_after_write)
                .build(),
            chunk_cache: LoadingCache::builder()
                .max_capacity(config.chunk_capacity)
                .expire_after_write(config.expire_after_write)
                .build(),
        }
    }

    pub fn with_registry(mut self, registry: RegionTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ChunkDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_loader(mut self, loader: ChunkLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn region_folder(&self) -> &Path {
        &self.region_folder
    }

    pub fn registry(&self) -> &RegionTypeRegistry {
        &self.registry
    }

    pub fn loader(&self) -> &ChunkLoader {
        &self.loader
    }

    pub fn region(&self, region_x: i32, region_z: i32) -> Arc<dyn Region> {
        let pos = RegionPos::new(region_x, region_z);
        self.region_cache.get_or_load(pos, || {
            log::trace!("Opening region {},{}", region_x, region_z);
            self.registry.open(&self.region_folder, pos, self.decoder.clone())
        })
    }

    /// Chunk at chunk coordinates, the empty chunk if it can't be loaded
    pub fn chunk(&self, chunk_x: i32, chunk_z: i32) -> Arc<Chunk> {
        let pos = ChunkPos::new(chunk_x, chunk_z);
        self.chunk_cache.get_or_load(pos, || {
            let region_pos = pos.region();
            let region = self.region(region_pos.x, region_pos.z);
            Arc::new(self.loader.load(region.as_ref(), pos))
        })
    }

    pub fn chunk_at_block(&self, block_x: i32, block_z: i32) -> Arc<Chunk> {
        let pos = ChunkPos::from_block(block_x, block_z);
        self.chunk(pos.x, pos.z)
    }

    /// Read every chunk of one region in a single pass and cache them.
    ///
    /// Chunks already cached are skipped without decoding. Returns the number
    /// of chunks added.
    pub fn preload_region_chunks(&self, region_x: i32, region_z: i32) -> usize {
        let region = self.region(region_x, region_z);
        let mut consumer = PreloadConsumer {
            cache: &self.chunk_cache,
            loaded: 0,
        };

        if let Err(e) = region.iter_chunks(&mut consumer) {
            log::warn!(
                "Failed to preload region {},{} from {}: {}",
                region_x,
                region_z,
                region.path().display(),
                e
            );
        }
        consumer.loaded
    }

    /// Preload several regions on the rayon pool
    pub fn preload_regions(&self, regions: &[RegionPos]) -> usize {
        regions
            .par_iter()
            .map(|pos| self.preload_region_chunks(pos.x, pos.z))
            .sum()
    }

    pub fn invalidate_chunk(&self, chunk_x: i32, chunk_z: i32) {
        self.chunk_cache.invalidate(&ChunkPos::new(chunk_x, chunk_z));
    }

    pub fn invalidate_chunk_cache(&self) {
        self.chunk_cache.invalidate_all();
    }

    /// Drop a region handle and every chunk cached from it
    pub fn invalidate_region(&self, region_x: i32, region_z: i32) {
        let pos = RegionPos::new(region_x, region_z);
        self.region_cache.invalidate(&pos);
        self.chunk_cache.invalidate_if(|chunk| chunk.region() == pos);
    }

    /// Evict expired entries, skipped if a cache is busy
    pub fn clean_up(&self) {
        self.region_cache.clean_up();
        self.chunk_cache.clean_up();
    }

    /// Region coordinates present in the region folder, each listed once
    pub fn list_regions(&self) -> io::Result<Vec<RegionPos>> {
        let entries = match fs::read_dir(&self.region_folder) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut regions = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((_, pos)) = self.registry.parse_file_name(name) {
                regions.insert(pos);
            }
        }
        Ok(regions.into_iter().collect())
    }

    pub fn cached_chunk_count(&self) -> usize {
        self.chunk_cache.len()
    }

    pub fn cached_region_count(&self) -> usize {
        self.region_cache.len()
    }
}

struct PreloadConsumer<'a> {
    cache: &'a LoadingCache<ChunkPos, Arc<Chunk>>,
    loaded: usize,
}

impl ChunkConsumer for PreloadConsumer<'_> {
    fn filter(&mut self, chunk_x: i32, chunk_z: i32, _timestamp: i64) -> bool {
        self.cache.get_if_present(&ChunkPos::new(chunk_x, chunk_z)).is_none()
    }

    fn accept(&mut self, chunk_x: i32, chunk_z: i32, chunk: Chunk) {
        self.cache.insert(ChunkPos::new(chunk_x, chunk_z), Arc::new(chunk));
        self.loaded += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::nbt::ChunkNbt;
    use crate::world::region::{ChunkCompression, McaRegionWriter, RegionType};

    fn write_region(folder: &Path, pos: RegionPos, chunks: &[(i32, i32, i32)]) {
        let path = folder.join(RegionType::MCA.file_name(pos.x, pos.z));
        let mut writer = McaRegionWriter::new(pos, path, ChunkCompression::Zlib);
        for &(x, z, version) in chunks {
            let nbt = ChunkNbt {
                data_version: version,
                x_pos: Some(x),
                z_pos: Some(z),
                status: "minecraft:full".into(),
                ..Default::default()
            };
            writer.write_chunk(x, z, 0, &nbt.to_bytes().expect("nbt")).expect("write");
        }
        writer.finish().expect("finish");
    }

    #[test]
    fn test_chunk_is_cached_until_invalidated() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_region(dir.path(), RegionPos::new(0, 0), &[(1, 2, 100)]);

        let world = World::new(dir.path(), &WorldCacheConfig::default());
        let first = world.chunk(1, 2);
        assert_eq!(first.data_version(), 100);
        assert!(Arc::ptr_eq(&first, &world.chunk(1, 2)));

        write_region(dir.path(), RegionPos::new(0, 0), &[(1, 2, 200)]);
        assert_eq!(world.chunk(1, 2).data_version(), 100);

        world.invalidate_chunk(1, 2);
        assert_eq!(world.chunk(1, 2).data_version(), 200);
    }

    #[test]
    fn test_missing_region_gives_empty_chunks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let world = World::new(dir.path(), &WorldCacheConfig::default());
        assert!(world.chunk(-100, 55).is_empty());
    }

    #[test]
    fn test_preload_and_invalidate_region() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_region(dir.path(), RegionPos::new(-1, 0), &[(-1, 0, 1), (-2, 3, 1), (-32, 31, 1)]);
        write_region(dir.path(), RegionPos::new(0, 0), &[(0, 0, 1)]);

        let world = World::new(dir.path(), &WorldCacheConfig::default());
        assert_eq!(world.preload_regions(&[RegionPos::new(-1, 0), RegionPos::new(0, 0)]), 4);
        assert_eq!(world.cached_chunk_count(), 4);
        assert_eq!(world.preload_region_chunks(-1, 0), 0);

        world.invalidate_region(-1, 0);
        assert_eq!(world.cached_chunk_count(), 1);
    }

    #[test]
    fn test_list_regions() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_region(dir.path(), RegionPos::new(3, -4), &[]);
        fs::write(dir.path().join("r.3.-4.linear"), b"").expect("write");
        fs::write(dir.path().join("r.0.0.mca.tmp"), b"").expect("write");
        fs::write(dir.path().join("notes.txt"), b"").expect("write");

        let world = World::new(dir.path(), &WorldCacheConfig::default());
        assert_eq!(world.list_regions().expect("list"), vec![RegionPos::new(3, -4)]);
    }

    #[test]
    fn test_config_from_toml() {
        let config: WorldCacheConfig = toml::from_str("chunk_capacity = 5\nexpire_after_write = 30").expect("toml");
        assert_eq!(config.chunk_capacity, 5);
        assert_eq!(config.region_capacity, 64);
        assert_eq!(config.expire_after_write, Duration::from_secs(30));
    }
}
