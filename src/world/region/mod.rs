//! Region file formats
//!
//! A region stores the 32x32 chunks of one region coordinate. Two on-disk
//! layouts are supported, selected per file through the [`RegionTypeRegistry`].

mod linear;
mod lz4_block;
mod mca;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compression::Compression;
use crate::world::chunk::Chunk;
use crate::world::decoder::ChunkDecoder;
use crate::world::error::{RegionError, RegionResult};
use crate::world::position::RegionPos;

pub use linear::{LinearRegion, LinearRegionWriter};
pub use lz4_block::{Lz4BlockReader, encode_lz4_blocks};
pub use mca::{McaRegion, McaRegionWriter};

/// Region coordinates parsed from file names must lie within this bound
pub const MAX_REGION_COORDINATE: i32 = 100_000;

/// Read access to one region file
pub trait Region: Send + Sync {
    fn pos(&self) -> RegionPos;

    fn path(&self) -> &Path;

    /// Load a single chunk by its global chunk coordinates.
    ///
    /// Cells that were never written come back as [`Chunk::empty`].
    fn load_chunk(&self, chunk_x: i32, chunk_z: i32) -> RegionResult<Chunk>;

    /// Scan every stored chunk.
    ///
    /// Errors scoped to a single chunk go to [`ChunkConsumer::fail`]; only a
    /// structurally broken region aborts the scan with `Err`.
    fn iter_chunks(&self, consumer: &mut dyn ChunkConsumer) -> RegionResult<()>;
}

/// Receives chunks from [`Region::iter_chunks`]
pub trait ChunkConsumer {
    /// Decide whether a chunk should be decoded at all.
    ///
    /// `timestamp` is the last modification time in seconds.
    fn filter(&mut self, _chunk_x: i32, _chunk_z: i32, _timestamp: i64) -> bool {
        true
    }

    fn accept(&mut self, chunk_x: i32, chunk_z: i32, chunk: Chunk);

    fn fail(&mut self, chunk_x: i32, chunk_z: i32, error: RegionError) {
        log::warn!("Failed to load chunk {},{}: {}", chunk_x, chunk_z, error);
    }
}

/// Compression type codes found in front of sectored chunk payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCompression {
    Gzip,
    Zlib,
    None,
    Lz4,
}

impl ChunkCompression {
    /// Type-code bit flagging a payload stored in an external `.mcc` file
    pub const EXTERNAL_FLAG: u8 = 0x80;

    pub fn from_code(code: u8) -> RegionResult<Self> {
        match code {
            // 0 is not written by the game but some tools emit it for raw payloads
            0 | 3 => Ok(ChunkCompression::None),
            1 => Ok(ChunkCompression::Gzip),
            2 => Ok(ChunkCompression::Zlib),
            4 => Ok(ChunkCompression::Lz4),
            other => Err(RegionError::UnsupportedCompression(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ChunkCompression::Gzip => 1,
            ChunkCompression::Zlib => 2,
            ChunkCompression::None => 3,
            ChunkCompression::Lz4 => 4,
        }
    }

    /// Wrap a compressed payload so that reads yield the raw NBT
    pub fn decompress<'a, R: Read + Send + 'a>(self, source: R) -> RegionResult<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            ChunkCompression::Gzip => Compression::Gzip.decompress(source)?,
            ChunkCompression::Zlib => Compression::Zlib.decompress(source)?,
            ChunkCompression::None => Compression::None.decompress(source)?,
            ChunkCompression::Lz4 => Box::new(Lz4BlockReader::new(source)),
        })
    }

    pub fn compress(self, data: &[u8]) -> RegionResult<Vec<u8>> {
        Ok(match self {
            ChunkCompression::Gzip => Compression::Gzip.compress_bytes(data)?,
            ChunkCompression::Zlib => Compression::Zlib.compress_bytes(data)?,
            ChunkCompression::None => data.to_vec(),
            ChunkCompression::Lz4 => encode_lz4_blocks(data),
        })
    }
}

type RegionOpener = fn(RegionPos, PathBuf, Arc<dyn ChunkDecoder>) -> Arc<dyn Region>;

fn open_mca(pos: RegionPos, path: PathBuf, decoder: Arc<dyn ChunkDecoder>) -> Arc<dyn Region> {
    Arc::new(McaRegion::new(pos, path, decoder))
}

fn open_linear(pos: RegionPos, path: PathBuf, decoder: Arc<dyn ChunkDecoder>) -> Arc<dyn Region> {
    Arc::new(LinearRegion::new(pos, path, decoder))
}

/// A region file layout: how files are named and how they are opened
#[derive(Clone, Copy)]
pub struct RegionType {
    id: &'static str,
    extension: &'static str,
    opener: RegionOpener,
}

impl std::fmt::Debug for RegionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionType")
            .field("id", &self.id)
            .field("extension", &self.extension)
            .finish()
    }
}

impl PartialEq for RegionType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl RegionType {
    /// 4KiB-sectored `.mca` files
    pub const MCA: RegionType = RegionType {
        id: "mca",
        extension: ".mca",
        opener: open_mca,
    };

    /// Single zstd stream `.linear` files
    pub const LINEAR: RegionType = RegionType {
        id: "linear",
        extension: ".linear",
        opener: open_linear,
    };

    pub const fn new(id: &'static str, extension: &'static str, opener: RegionOpener) -> Self {
        Self { id, extension, opener }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn file_name(&self, region_x: i32, region_z: i32) -> String {
        format!("r.{}.{}{}", region_x, region_z, self.extension)
    }

    /// Parse `r.<x>.<z><extension>`, rejecting out-of-range coordinates
    pub fn parse_file_name(&self, file_name: &str) -> Option<RegionPos> {
        let coords = file_name.strip_prefix("r.")?.strip_suffix(self.extension)?;
        let (x, z) = coords.split_once('.')?;
        let x: i32 = x.parse().ok()?;
        let z: i32 = z.parse().ok()?;

        let in_range = |v: i32| (-MAX_REGION_COORDINATE..=MAX_REGION_COORDINATE).contains(&v);
        (in_range(x) && in_range(z)).then_some(RegionPos::new(x, z))
    }

    pub fn open(&self, pos: RegionPos, path: PathBuf, decoder: Arc<dyn ChunkDecoder>) -> Arc<dyn Region> {
        (self.opener)(pos, path, decoder)
    }
}

/// Region types in lookup priority order
///
/// Built once and shared by reference; nothing registers types globally.
#[derive(Debug, Clone)]
pub struct RegionTypeRegistry {
    types: Vec<RegionType>,
    default_type: RegionType,
}

impl Default for RegionTypeRegistry {
    fn default() -> Self {
        Self {
            types: vec![RegionType::MCA, RegionType::LINEAR],
            default_type: RegionType::MCA,
        }
    }
}

impl RegionTypeRegistry {
    pub fn new(default_type: RegionType) -> Self {
        Self {
            types: vec![default_type],
            default_type,
        }
    }

    /// Append a type with the lowest priority so far
    pub fn register(&mut self, region_type: RegionType) {
        if !self.types.contains(&region_type) {
            self.types.push(region_type);
        }
    }

    pub fn types(&self) -> &[RegionType] {
        &self.types
    }

    pub fn get(&self, id: &str) -> Option<RegionType> {
        self.types.iter().copied().find(|t| t.id == id)
    }

    pub fn default_type(&self) -> RegionType {
        self.default_type
    }

    /// File backing region `pos`: the first existing file in priority order,
    /// or the default type's file name when none exists yet
    pub fn locate(&self, region_folder: &Path, pos: RegionPos) -> (RegionType, PathBuf) {
        self.types
            .iter()
            .map(|t| (*t, region_folder.join(t.file_name(pos.x, pos.z))))
            .find(|(_, path)| path.is_file())
            .unwrap_or_else(|| {
                let default = self.default_type;
                (default, region_folder.join(default.file_name(pos.x, pos.z)))
            })
    }

    pub fn open(&self, region_folder: &Path, pos: RegionPos, decoder: Arc<dyn ChunkDecoder>) -> Arc<dyn Region> {
        let (region_type, path) = self.locate(region_folder, pos);
        region_type.open(pos, path, decoder)
    }

    /// Match a file name against every registered type
    pub fn parse_file_name(&self, file_name: &str) -> Option<(RegionType, RegionPos)> {
        self.types
            .iter()
            .find_map(|t| t.parse_file_name(file_name).map(|pos| (*t, pos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names_roundtrip() {
        for region_type in [RegionType::MCA, RegionType::LINEAR] {
            let name = region_type.file_name(-3, 12);
            assert_eq!(region_type.parse_file_name(&name), Some(RegionPos::new(-3, 12)));
        }
        assert_eq!(RegionType::MCA.file_name(1, -1), "r.1.-1.mca");
    }

    #[test]
    fn test_rejects_garbage_file_names() {
        let mca = RegionType::MCA;
        assert_eq!(mca.parse_file_name("r.1.2.linear"), None);
        assert_eq!(mca.parse_file_name("r.1.mca"), None);
        assert_eq!(mca.parse_file_name("r.a.2.mca"), None);
        assert_eq!(mca.parse_file_name("r.100001.0.mca"), None);
        assert_eq!(mca.parse_file_name("c.1.2.mcc"), None);
        assert_eq!(mca.parse_file_name("r.100000.-100000.mca"), Some(RegionPos::new(100_000, -100_000)));
    }

    #[test]
    fn test_registry_prefers_existing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = RegionTypeRegistry::default();

        let (region_type, path) = registry.locate(dir.path(), RegionPos::new(0, 0));
        assert_eq!(region_type.id(), "mca");
        assert!(path.ends_with("r.0.0.mca"));

        std::fs::write(dir.path().join("r.0.0.linear"), b"").expect("write");
        let (region_type, _) = registry.locate(dir.path(), RegionPos::new(0, 0));
        assert_eq!(region_type.id(), "linear");

        std::fs::write(dir.path().join("r.0.0.mca"), b"").expect("write");
        let (region_type, _) = registry.locate(dir.path(), RegionPos::new(0, 0));
        assert_eq!(region_type.id(), "mca");
    }

    #[test]
    fn test_chunk_compression_codes() {
        for compression in [
            ChunkCompression::Gzip,
            ChunkCompression::Zlib,
            ChunkCompression::None,
            ChunkCompression::Lz4,
        ] {
            assert_eq!(ChunkCompression::from_code(compression.code()).ok(), Some(compression));
        }
        assert!(matches!(
            ChunkCompression::from_code(127),
            Err(RegionError::UnsupportedCompression(127))
        ));
    }
}
