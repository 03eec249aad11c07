//! Reading both region layouts through the public API

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use earth_mapper::world::nbt::ChunkNbt;
use earth_mapper::world::region::{
    ChunkCompression, ChunkConsumer, LinearRegion, LinearRegionWriter, McaRegion, McaRegionWriter, Region,
    RegionType,
};
use earth_mapper::world::{
    Chunk, ChunkDecoder, ChunkPos, NbtChunkDecoder, RegionError, RegionPos, RegionResult, World, WorldCacheConfig,
};

fn chunk_nbt(x: i32, z: i32) -> Vec<u8> {
    ChunkNbt {
        data_version: 3000 + x * 32 + z,
        x_pos: Some(x),
        z_pos: Some(z),
        status: "minecraft:full".into(),
        ..Default::default()
    }
    .to_bytes()
    .expect("nbt")
}

/// Decoder counting how often it runs
#[derive(Default)]
struct CountingDecoder {
    decoded: AtomicUsize,
}

impl ChunkDecoder for CountingDecoder {
    fn decode(&self, pos: ChunkPos, data: &[u8]) -> RegionResult<Chunk> {
        self.decoded.fetch_add(1, Ordering::SeqCst);
        NbtChunkDecoder.decode(pos, data)
    }
}

#[derive(Default)]
struct Collect {
    accepted: Vec<(i32, i32, i32)>,
    timestamps: Vec<i64>,
    failed: usize,
    reject_all: bool,
}

impl ChunkConsumer for Collect {
    fn filter(&mut self, _chunk_x: i32, _chunk_z: i32, timestamp: i64) -> bool {
        self.timestamps.push(timestamp);
        !self.reject_all
    }

    fn accept(&mut self, chunk_x: i32, chunk_z: i32, chunk: Chunk) {
        self.accepted.push((chunk_x, chunk_z, chunk.data_version()));
    }

    fn fail(&mut self, _chunk_x: i32, _chunk_z: i32, _error: RegionError) {
        self.failed += 1;
    }
}

const CHUNKS: [(i32, i32); 4] = [(-32, 0), (-31, 5), (-1, 31), (-20, 17)];

fn write_mca(dir: &Path, compression: ChunkCompression) -> std::path::PathBuf {
    let path = dir.join(RegionType::MCA.file_name(-1, 0));
    let mut writer = McaRegionWriter::new(RegionPos::new(-1, 0), &path, compression);
    for (x, z) in CHUNKS {
        writer.write_chunk(x, z, 1_700_000_000, &chunk_nbt(x, z)).expect("write");
    }
    writer.finish().expect("finish");
    path
}

fn write_linear(dir: &Path) -> std::path::PathBuf {
    let path = dir.join(RegionType::LINEAR.file_name(-1, 0));
    let mut writer = LinearRegionWriter::new(RegionPos::new(-1, 0), &path);
    for (x, z) in CHUNKS {
        writer.write_chunk(x, z, 1_700_000_000, &chunk_nbt(x, z)).expect("write");
    }
    writer.finish().expect("finish");
    path
}

fn assert_region_contents(region: &dyn Region) {
    for (x, z) in CHUNKS {
        let chunk = region.load_chunk(x, z).expect("load");
        assert_eq!(chunk.data_version(), 3000 + x * 32 + z);
        assert_eq!(chunk.pos(), ChunkPos::new(x, z));
    }
    assert!(region.load_chunk(-2, 2).expect("load").is_empty());

    let mut collect = Collect::default();
    region.iter_chunks(&mut collect).expect("iterate");
    let seen: HashSet<(i32, i32)> = collect.accepted.iter().map(|&(x, z, _)| (x, z)).collect();
    assert_eq!(seen, CHUNKS.into_iter().collect());
    assert!(collect.timestamps.iter().all(|&t| t == 1_700_000_000));
    assert_eq!(collect.failed, 0);
}

#[test]
fn mca_round_trip_for_every_compression() {
    for compression in [
        ChunkCompression::Gzip,
        ChunkCompression::Zlib,
        ChunkCompression::None,
        ChunkCompression::Lz4,
    ] {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = write_mca(dir.path(), compression);
        let region = McaRegion::new(RegionPos::new(-1, 0), path, Arc::new(NbtChunkDecoder));
        assert_region_contents(&region);
    }
}

#[test]
fn linear_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_linear(dir.path());
    let region = LinearRegion::new(RegionPos::new(-1, 0), path, Arc::new(NbtChunkDecoder));
    assert_region_contents(&region);
}

#[test]
fn rejected_linear_chunks_are_never_decoded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_linear(dir.path());
    let decoder = Arc::new(CountingDecoder::default());
    let region = LinearRegion::new(RegionPos::new(-1, 0), path, decoder.clone());

    let mut collect = Collect {
        reject_all: true,
        ..Default::default()
    };
    region.iter_chunks(&mut collect).expect("iterate");

    assert_eq!(collect.timestamps.len(), CHUNKS.len());
    assert!(collect.accepted.is_empty());
    assert_eq!(decoder.decoded.load(Ordering::SeqCst), 0);
}

#[test]
fn rejected_mca_chunks_are_never_decoded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_mca(dir.path(), ChunkCompression::Zlib);
    let decoder = Arc::new(CountingDecoder::default());
    let region = McaRegion::new(RegionPos::new(-1, 0), path, decoder.clone());

    let mut collect = Collect {
        reject_all: true,
        ..Default::default()
    };
    region.iter_chunks(&mut collect).expect("iterate");
    assert_eq!(decoder.decoded.load(Ordering::SeqCst), 0);
}

#[test]
fn world_reads_either_layout() {
    let mca_dir = tempfile::tempdir().expect("temp dir");
    write_mca(mca_dir.path(), ChunkCompression::Gzip);
    let linear_dir = tempfile::tempdir().expect("temp dir");
    write_linear(linear_dir.path());

    for dir in [mca_dir.path(), linear_dir.path()] {
        let world = World::new(dir, &WorldCacheConfig::default());
        assert_eq!(world.list_regions().expect("list"), vec![RegionPos::new(-1, 0)]);
        assert_eq!(world.chunk(-31, 5).data_version(), 3000 - 31 * 32 + 5);
        // Block coordinates inside chunk (-20, 17)
        assert_eq!(world.chunk_at_block(-20 * 16 + 3, 17 * 16 + 15).data_version(), 3000 - 20 * 32 + 17);
        assert!(world.chunk(5, 5).is_empty());
    }
}
