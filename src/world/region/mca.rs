//! Sectored `.mca` region files
//!
//! Layout: 1024 big-endian location entries (3 byte sector offset, 1 byte
//! sector count), 1024 big-endian timestamps, then 4KiB sectors. Each chunk
//! starts with a 4 byte length (type byte included), the compression type
//! byte and the payload.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::world::chunk::Chunk;
use crate::world::decoder::ChunkDecoder;
use crate::world::error::{corrupt_chunk, corrupt_region, RegionResult};
use crate::world::position::{ChunkPos, RegionPos, CHUNKS_PER_REGION};

use super::{ChunkCompression, ChunkConsumer, Region};

pub const SECTOR_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = 2 * SECTOR_SIZE;
const MAX_SECTORS_PER_CHUNK: usize = 255;
const MAX_SECTOR_OFFSET: usize = (1 << 24) - 1;

struct Header {
    locations: Vec<u32>,
    timestamps: Vec<u32>,
}

impl Header {
    fn read(reader: &mut impl Read) -> io::Result<Self> {
        let mut raw = vec![0u8; HEADER_SIZE];
        reader.read_exact(&mut raw)?;

        let words: Vec<u32> = raw
            .chunks_exact(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let (locations, timestamps) = words.split_at(CHUNKS_PER_REGION);
        Ok(Self {
            locations: locations.to_vec(),
            timestamps: timestamps.to_vec(),
        })
    }

    fn sector_offset(&self, index: usize) -> u64 {
        (self.locations[index] >> 8) as u64
    }

    fn sector_count(&self, index: usize) -> usize {
        (self.locations[index] & 0xFF) as usize
    }
}

/// Reader for one `.mca` file
///
/// The file is opened per call, so an externally replaced file is picked up
/// on the next read.
pub struct McaRegion {
    pos: RegionPos,
    path: PathBuf,
    decoder: Arc<dyn ChunkDecoder>,
}

impl McaRegion {
    pub fn new(pos: RegionPos, path: PathBuf, decoder: Arc<dyn ChunkDecoder>) -> Self {
        Self { pos, path, decoder }
    }

    /// Open the file and parse its header, `None` for a missing or empty file
    fn open(&self) -> RegionResult<Option<(BufReader<File>, Header)>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let length = file.metadata()?.len();
        if length == 0 {
            return Ok(None);
        }
        if length < HEADER_SIZE as u64 {
            return Err(corrupt_region(
                &self.path,
                format!("file is {} bytes, shorter than the region header", length),
            ));
        }

        let mut reader = BufReader::new(file);
        let header = Header::read(&mut reader)?;
        Ok(Some((reader, header)))
    }

    fn read_chunk(
        &self,
        reader: &mut BufReader<File>,
        header: &Header,
        index: usize,
        pos: ChunkPos,
    ) -> RegionResult<Chunk> {
        let sector_count = header.sector_count(index);
        if sector_count == 0 {
            return Ok(Chunk::empty(pos));
        }

        let offset = header.sector_offset(index);
        if offset < 2 {
            return Err(corrupt_chunk(pos.x, pos.z, format!("sector offset {} overlaps the header", offset)));
        }

        reader.seek(SeekFrom::Start(offset * SECTOR_SIZE as u64))?;
        let mut prefix = [0u8; 5];
        reader.read_exact(&mut prefix)?;

        let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let type_code = prefix[4];
        if length == 0 {
            return Err(corrupt_chunk(pos.x, pos.z, "zero payload length"));
        }
        if length + 4 > sector_count * SECTOR_SIZE {
            return Err(corrupt_chunk(
                pos.x,
                pos.z,
                format!("payload length {} exceeds {} allocated sectors", length, sector_count),
            ));
        }

        let compression = ChunkCompression::from_code(type_code & !ChunkCompression::EXTERNAL_FLAG)?;
        let compressed = if type_code & ChunkCompression::EXTERNAL_FLAG != 0 {
            let external = external_chunk_path(&self.path, pos);
            fs::read(&external).map_err(|e| {
                corrupt_chunk(pos.x, pos.z, format!("external chunk {}: {}", external.display(), e))
            })?
        } else {
            let mut data = vec![0u8; length - 1];
            reader.read_exact(&mut data)?;
            data
        };

        let mut raw = Vec::new();
        compression.decompress(compressed.as_slice())?.read_to_end(&mut raw)?;
        self.decoder.decode(pos, &raw)
    }
}

impl Region for McaRegion {
    fn pos(&self) -> RegionPos {
        self.pos
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load_chunk(&self, chunk_x: i32, chunk_z: i32) -> RegionResult<Chunk> {
        let pos = ChunkPos::new(chunk_x, chunk_z);
        let Some((mut reader, header)) = self.open()? else {
            return Ok(Chunk::empty(pos));
        };
        self.read_chunk(&mut reader, &header, pos.region_index(), pos)
    }

    fn iter_chunks(&self, consumer: &mut dyn ChunkConsumer) -> RegionResult<()> {
        let Some((mut reader, header)) = self.open()? else {
            return Ok(());
        };

        for index in 0..CHUNKS_PER_REGION {
            if header.sector_count(index) == 0 {
                continue;
            }

            let pos = self.pos.chunk_at_index(index);
            if !consumer.filter(pos.x, pos.z, header.timestamps[index] as i64) {
                continue;
            }

            match self.read_chunk(&mut reader, &header, index, pos) {
                Ok(chunk) => consumer.accept(pos.x, pos.z, chunk),
                Err(e) => consumer.fail(pos.x, pos.z, e),
            }
        }
        Ok(())
    }
}

/// `c.<x>.<z>.mcc` next to the region file
fn external_chunk_path(region_path: &Path, pos: ChunkPos) -> PathBuf {
    let name = format!("c.{}.{}.mcc", pos.x, pos.z);
    match region_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Builds a complete `.mca` file in memory and writes it atomically
///
/// Chunks needing more than 255 sectors are stored in an external `.mcc` file
/// and flagged in the type byte.
pub struct McaRegionWriter {
    pos: RegionPos,
    path: PathBuf,
    compression: ChunkCompression,
    chunks: BTreeMap<usize, (u32, Vec<u8>)>,
}

impl McaRegionWriter {
    pub fn new(pos: RegionPos, path: impl Into<PathBuf>, compression: ChunkCompression) -> Self {
        Self {
            pos,
            path: path.into(),
            compression,
            chunks: BTreeMap::new(),
        }
    }

    /// Store raw (uncompressed) NBT for a chunk of this region
    pub fn write_chunk(&mut self, chunk_x: i32, chunk_z: i32, timestamp: u32, nbt: &[u8]) -> RegionResult<()> {
        let pos = ChunkPos::new(chunk_x, chunk_z);
        if !self.pos.contains(pos) {
            return Err(corrupt_chunk(
                chunk_x,
                chunk_z,
                format!("chunk is outside region {},{}", self.pos.x, self.pos.z),
            ));
        }

        let compressed = self.compression.compress(nbt)?;
        self.chunks.insert(pos.region_index(), (timestamp, compressed));
        Ok(())
    }

    pub fn write(&mut self, chunk: &Chunk, timestamp: u32) -> RegionResult<()> {
        let nbt = chunk.to_nbt().to_bytes()?;
        let pos = chunk.pos();
        self.write_chunk(pos.x, pos.z, timestamp, &nbt)
    }

    /// Lay out sectors and replace the target file
    pub fn finish(self) -> RegionResult<()> {
        let mut header = vec![0u8; HEADER_SIZE];
        let mut body = Vec::new();
        let mut next_sector = HEADER_SIZE / SECTOR_SIZE;

        for (&index, (timestamp, compressed)) in &self.chunks {
            let pos = self.pos.chunk_at_index(index);
            let code = self.compression.code();

            let mut payload = Vec::with_capacity(compressed.len() + 5);
            let sectors_needed = (compressed.len() + 5 + SECTOR_SIZE - 1) / SECTOR_SIZE;
            if sectors_needed > MAX_SECTORS_PER_CHUNK {
                let external = external_chunk_path(&self.path, pos);
                write_replacing(&external, compressed)?;
                log::debug!("Chunk {},{} stored externally in {}", pos.x, pos.z, external.display());

                payload.extend_from_slice(&1u32.to_be_bytes());
                payload.push(code | ChunkCompression::EXTERNAL_FLAG);
            } else {
                payload.extend_from_slice(&(compressed.len() as u32 + 1).to_be_bytes());
                payload.push(code);
                payload.extend_from_slice(compressed);
            }

            let sectors = (payload.len() + SECTOR_SIZE - 1) / SECTOR_SIZE;
            if next_sector > MAX_SECTOR_OFFSET {
                return Err(corrupt_region(&self.path, "region exceeds the addressable sector range"));
            }

            payload.resize(sectors * SECTOR_SIZE, 0);
            body.extend_from_slice(&payload);

            let location = ((next_sector as u32) << 8) | sectors as u32;
            header[index * 4..index * 4 + 4].copy_from_slice(&location.to_be_bytes());
            let ts_offset = SECTOR_SIZE + index * 4;
            header[ts_offset..ts_offset + 4].copy_from_slice(&timestamp.to_be_bytes());
            next_sector += sectors;
        }

        header.extend_from_slice(&body);
        write_replacing(&self.path, &header)?;
        log::debug!(
            "Wrote region {} with {} chunks",
            self.path.display(),
            self.chunks.len()
        );
        Ok(())
    }
}

/// Write to a uniquely named temp file in the target's folder, then rename
/// it over `path`
///
/// Concurrent writers each stage their own file, so readers see either the
/// old content or one complete new file. An unpersisted temp file is removed
/// when it is dropped.
pub(super) fn write_replacing(path: &Path, data: &[u8]) -> io::Result<()> {
    let folder = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = NamedTempFile::new_in(folder)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::world::decoder::NbtChunkDecoder;
    use crate::world::error::RegionError;
    use crate::world::nbt::ChunkNbt;

    fn region(dir: &Path) -> McaRegion {
        McaRegion::new(RegionPos::new(0, 0), dir.join("r.0.0.mca"), Arc::new(NbtChunkDecoder))
    }

    #[test]
    fn test_missing_and_empty_files_have_no_chunks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let region = region(dir.path());
        assert!(region.load_chunk(3, 4).expect("load").is_empty());

        fs::write(region.path(), b"").expect("write");
        assert!(region.load_chunk(3, 4).expect("load").is_empty());
    }

    #[test]
    fn test_short_header_is_corrupt_region() {
        let dir = tempfile::tempdir().expect("temp dir");
        let region = region(dir.path());
        fs::write(region.path(), vec![0u8; 100]).expect("write");

        assert!(matches!(region.load_chunk(0, 0), Err(RegionError::CorruptRegion { .. })));
    }

    #[test]
    fn test_unknown_type_code_fails_one_chunk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.0.0.mca");

        let mut data = vec![0u8; HEADER_SIZE + SECTOR_SIZE];
        data[0..4].copy_from_slice(&((2u32 << 8) | 1).to_be_bytes());
        data[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&2u32.to_be_bytes());
        data[HEADER_SIZE + 4] = 42;
        fs::write(&path, &data).expect("write");

        let region = region(dir.path());
        assert!(matches!(
            region.load_chunk(0, 0),
            Err(RegionError::UnsupportedCompression(42))
        ));
        assert!(region.load_chunk(1, 0).expect("load").is_empty());
    }

    #[test]
    fn test_oversized_chunk_goes_external() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.0.0.mca");

        use crate::world::nbt::{BlockStatesNbt, ChunkNbt, SectionNbt};

        // 140k longs is just over 255 sectors when stored uncompressed
        let nbt = ChunkNbt {
            data_version: 3465,
            x_pos: Some(5),
            z_pos: Some(6),
            status: "minecraft:full".into(),
            sections: vec![SectionNbt {
                y: 0,
                block_states: Some(BlockStatesNbt {
                    palette: Vec::new(),
                    data: Some(fastnbt::LongArray::new(vec![0x0123_4567; 140_000])),
                }),
                block_light: None,
            }],
            ..Default::default()
        }
        .to_bytes()
        .expect("nbt");
        assert!(nbt.len() > MAX_SECTORS_PER_CHUNK * SECTOR_SIZE);

        let mut writer = McaRegionWriter::new(RegionPos::new(0, 0), &path, ChunkCompression::None);
        writer.write_chunk(5, 6, 1, &nbt).expect("write chunk");
        writer.finish().expect("finish");

        assert!(dir.path().join("c.5.6.mcc").is_file());
        let chunk = region(dir.path()).load_chunk(5, 6).expect("load");
        assert!(!chunk.is_empty());
        assert_eq!(chunk.data_version(), 3465);
    }

    fn chunk_nbt(data_version: i32) -> Vec<u8> {
        ChunkNbt {
            data_version,
            x_pos: Some(2),
            z_pos: Some(3),
            status: "minecraft:full".into(),
            ..Default::default()
        }
        .to_bytes()
        .expect("nbt")
    }

    #[test]
    fn test_concurrent_writers_never_mix_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.0.0.mca");

        let writers: Vec<_> = [1000, 2000]
            .into_iter()
            .map(|version| {
                let path = path.clone();
                thread::spawn(move || {
                    for round in 0..20 {
                        let mut writer = McaRegionWriter::new(RegionPos::new(0, 0), &path, ChunkCompression::Zlib);
                        // Chunk count differs per round so the files differ in length
                        for i in 0..=round {
                            writer.write_chunk(i, 3, 1, &chunk_nbt(version)).expect("write chunk");
                        }
                        writer.write_chunk(2, 3, 1, &chunk_nbt(version)).expect("write chunk");
                        writer.finish().expect("finish");
                    }
                })
            })
            .collect();

        let reader = region(dir.path());
        for _ in 0..200 {
            let chunk = reader.load_chunk(2, 3).expect("load");
            if !chunk.is_empty() {
                assert!(matches!(chunk.data_version(), 1000 | 2000));
            }
        }
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let version = reader.load_chunk(2, 3).expect("load").data_version();
        assert!(matches!(version, 1000 | 2000));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .filter(|name| name != "r.0.0.mca")
            .collect();
        assert!(leftovers.is_empty(), "left behind {:?}", leftovers);
    }
}
