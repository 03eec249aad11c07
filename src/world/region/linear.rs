//! Single-stream `.linear` region files
//!
//! ```text
//! u64 signature | u8 version | i64 newest timestamp | i8 level | i16 chunk count
//! i32 data length | i64 hash | zstd data | u64 signature
//! ```
//!
//! All integers are big-endian. The zstd stream starts with 1024 pairs of
//! (i32 length, i32 timestamp) followed by the uncompressed chunk NBT in
//! index order. Version 1 files carry no meaningful per-chunk timestamps.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::world::chunk::Chunk;
use crate::world::decoder::ChunkDecoder;
use crate::world::error::{corrupt_chunk, corrupt_region, RegionResult};
use crate::world::position::{ChunkPos, RegionPos, CHUNKS_PER_REGION};

use super::mca::write_replacing;
use super::{ChunkConsumer, Region};

pub const SIGNATURE: u64 = 0xc3ff_1318_3cca_9d9a;
pub const VERSION_1: u8 = 1;
pub const VERSION_2: u8 = 2;
const FILE_HEADER_SIZE: u64 = 8 + 1 + 8 + 1 + 2 + 4 + 8;
const FOOTER_SIZE: u64 = 8;
const DEFAULT_LEVEL: i8 = 6;

#[derive(Debug, Clone, Copy)]
struct FileHeader {
    version: u8,
    timestamp: i64,
    chunk_count: i16,
    data_length: u64,
}

/// Per-chunk entry of the decompressed header
#[derive(Debug, Clone, Copy, Default)]
struct ChunkEntry {
    length: usize,
    timestamp: i64,
}

/// Reader for one `.linear` file
///
/// There is no random access: `load_chunk` streams the region up to the
/// requested chunk. Chunks that are not wanted are skipped in the
/// decompressed stream and never handed to the decoder.
pub struct LinearRegion {
    pos: RegionPos,
    path: PathBuf,
    decoder: Arc<dyn ChunkDecoder>,
}

impl LinearRegion {
    pub fn new(pos: RegionPos, path: PathBuf, decoder: Arc<dyn ChunkDecoder>) -> Self {
        Self { pos, path, decoder }
    }

    /// Validate the container and return the decompressed stream positioned
    /// after the chunk table, `None` for a missing or empty file
    fn open(&self) -> RegionResult<Option<(impl Read, Vec<ChunkEntry>)>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file_length = file.metadata()?.len();
        if file_length == 0 {
            return Ok(None);
        }
        if file_length < FILE_HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt_region(&self.path, format!("file is only {} bytes", file_length)));
        }

        let header = self.read_file_header(&mut file)?;
        let expected = FILE_HEADER_SIZE + header.data_length + FOOTER_SIZE;
        if expected != file_length {
            return Err(corrupt_region(
                &self.path,
                format!("length mismatch: header implies {} bytes, file has {}", expected, file_length),
            ));
        }

        file.seek(SeekFrom::Start(file_length - FOOTER_SIZE))?;
        if read_u64(&mut file)? != SIGNATURE {
            return Err(corrupt_region(&self.path, "bad footer signature"));
        }
        file.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;

        let compressed = BufReader::new(file.take(header.data_length));
        let mut stream = zstd::Decoder::with_buffer(compressed)?;

        let mut table = vec![0u8; CHUNKS_PER_REGION * 8];
        stream
            .read_exact(&mut table)
            .map_err(|e| corrupt_region(&self.path, format!("truncated chunk table: {}", e)))?;

        let entries: Vec<ChunkEntry> = table
            .chunks_exact(8)
            .map(|b| {
                let length = i32::from_be_bytes([b[0], b[1], b[2], b[3]]).max(0) as usize;
                let timestamp = match header.version {
                    VERSION_1 => header.timestamp,
                    _ => i32::from_be_bytes([b[4], b[5], b[6], b[7]]) as i64,
                };
                ChunkEntry { length, timestamp }
            })
            .collect();

        let stored = entries.iter().filter(|e| e.length > 0).count();
        if stored != header.chunk_count.max(0) as usize {
            log::debug!(
                "Region {} declares {} chunks but stores {}",
                self.path.display(),
                header.chunk_count,
                stored
            );
        }

        Ok(Some((stream, entries)))
    }

    fn read_file_header(&self, file: &mut File) -> RegionResult<FileHeader> {
        let mut raw = [0u8; FILE_HEADER_SIZE as usize];
        file.read_exact(&mut raw)?;

        let signature = u64::from_be_bytes(raw[0..8].try_into().unwrap_or_default());
        if signature != SIGNATURE {
            return Err(corrupt_region(&self.path, "bad signature"));
        }

        let version = raw[8];
        if version != VERSION_1 && version != VERSION_2 {
            return Err(corrupt_region(&self.path, format!("unsupported version {}", version)));
        }

        let data_length = i32::from_be_bytes(raw[20..24].try_into().unwrap_or_default());
        if data_length < 0 {
            return Err(corrupt_region(&self.path, "negative data length"));
        }

        Ok(FileHeader {
            version,
            timestamp: i64::from_be_bytes(raw[9..17].try_into().unwrap_or_default()),
            chunk_count: i16::from_be_bytes([raw[18], raw[19]]),
            data_length: data_length as u64,
        })
    }

    fn decode(&self, pos: ChunkPos, stream: &mut impl Read, length: usize) -> RegionResult<Chunk> {
        // The table length is untrusted, grow the buffer only as data arrives
        let mut data = Vec::new();
        stream
            .by_ref()
            .take(length as u64)
            .read_to_end(&mut data)
            .map_err(|e| corrupt_chunk(pos.x, pos.z, format!("unreadable payload: {}", e)))?;
        if data.len() != length {
            return Err(corrupt_chunk(
                pos.x,
                pos.z,
                format!("truncated payload: {} of {} bytes", data.len(), length),
            ));
        }
        self.decoder.decode(pos, &data)
    }
}

/// Advance the decompressed stream without keeping the bytes
fn skip(stream: &mut impl Read, length: usize) -> io::Result<()> {
    let skipped = io::copy(&mut stream.by_ref().take(length as u64), &mut io::sink())?;
    if skipped != length as u64 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunk data ends early"));
    }
    Ok(())
}

impl Region for LinearRegion {
    fn pos(&self) -> RegionPos {
        self.pos
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load_chunk(&self, chunk_x: i32, chunk_z: i32) -> RegionResult<Chunk> {
        let pos = ChunkPos::new(chunk_x, chunk_z);
        let Some((mut stream, entries)) = self.open()? else {
            return Ok(Chunk::empty(pos));
        };

        let index = pos.region_index();
        let length = entries[index].length;
        if length == 0 {
            return Ok(Chunk::empty(pos));
        }

        let preceding: usize = entries[..index].iter().map(|e| e.length).sum();
        skip(&mut stream, preceding).map_err(|e| corrupt_region(&self.path, e.to_string()))?;
        self.decode(pos, &mut stream, length)
    }

    fn iter_chunks(&self, consumer: &mut dyn ChunkConsumer) -> RegionResult<()> {
        let Some((mut stream, entries)) = self.open()? else {
            return Ok(());
        };

        for (index, entry) in entries.iter().enumerate() {
            if entry.length == 0 {
                continue;
            }

            let pos = self.pos.chunk_at_index(index);
            if !consumer.filter(pos.x, pos.z, entry.timestamp) {
                // A short stream here means every later chunk is unreachable too
                skip(&mut stream, entry.length).map_err(|e| corrupt_region(&self.path, e.to_string()))?;
                continue;
            }

            match self.decode(pos, &mut stream, entry.length) {
                Ok(chunk) => consumer.accept(pos.x, pos.z, chunk),
                Err(e) => consumer.fail(pos.x, pos.z, e),
            }
        }
        Ok(())
    }
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Builds a version 2 `.linear` file and writes it atomically
///
/// The data hash is written as 0; readers do not verify it.
pub struct LinearRegionWriter {
    pos: RegionPos,
    path: PathBuf,
    level: i8,
    chunks: Vec<Option<(i32, Vec<u8>)>>,
}

impl LinearRegionWriter {
    pub fn new(pos: RegionPos, path: impl Into<PathBuf>) -> Self {
        Self {
            pos,
            path: path.into(),
            level: DEFAULT_LEVEL,
            chunks: vec![None; CHUNKS_PER_REGION],
        }
    }

    pub fn with_level(mut self, level: i8) -> Self {
        self.level = level.clamp(1, 22);
        self
    }

    /// Store raw NBT for a chunk of this region
    pub fn write_chunk(&mut self, chunk_x: i32, chunk_z: i32, timestamp: i32, nbt: &[u8]) -> RegionResult<()> {
        let pos = ChunkPos::new(chunk_x, chunk_z);
        if !self.pos.contains(pos) {
            return Err(corrupt_chunk(
                chunk_x,
                chunk_z,
                format!("chunk is outside region {},{}", self.pos.x, self.pos.z),
            ));
        }
        self.chunks[pos.region_index()] = Some((timestamp, nbt.to_vec()));
        Ok(())
    }

    pub fn write(&mut self, chunk: &Chunk, timestamp: i32) -> RegionResult<()> {
        let nbt = chunk.to_nbt().to_bytes()?;
        let pos = chunk.pos();
        self.write_chunk(pos.x, pos.z, timestamp, &nbt)
    }

    pub fn finish(self) -> RegionResult<()> {
        let mut raw = Vec::with_capacity(CHUNKS_PER_REGION * 8);
        let mut newest = 0i64;
        let mut count = 0i16;

        for entry in &self.chunks {
            let (length, timestamp) = match entry {
                Some((timestamp, data)) => {
                    count += 1;
                    newest = newest.max(*timestamp as i64);
                    (data.len() as i32, *timestamp)
                }
                None => (0, 0),
            };
            raw.extend_from_slice(&length.to_be_bytes());
            raw.extend_from_slice(&timestamp.to_be_bytes());
        }
        for (_, data) in self.chunks.iter().flatten() {
            raw.extend_from_slice(data);
        }

        let compressed = zstd::encode_all(raw.as_slice(), self.level as i32)?;
        let data_length = i32::try_from(compressed.len())
            .map_err(|_| corrupt_region(&self.path, "compressed region exceeds 2GiB"))?;

        let mut out = Vec::with_capacity(compressed.len() + (FILE_HEADER_SIZE + FOOTER_SIZE) as usize);
        out.extend_from_slice(&SIGNATURE.to_be_bytes());
        out.push(VERSION_2);
        out.extend_from_slice(&newest.to_be_bytes());
        out.push(self.level as u8);
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&data_length.to_be_bytes());
        out.extend_from_slice(&0i64.to_be_bytes());
        out.extend_from_slice(&compressed);
        out.extend_from_slice(&SIGNATURE.to_be_bytes());

        write_replacing(&self.path, &out)?;
        log::debug!("Wrote linear region {} with {} chunks", self.path.display(), count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::decoder::NbtChunkDecoder;
    use crate::world::error::RegionError;
    use crate::world::nbt::ChunkNbt;

    fn nbt(x: i32, z: i32, version: i32) -> Vec<u8> {
        ChunkNbt {
            data_version: version,
            x_pos: Some(x),
            z_pos: Some(z),
            status: "minecraft:full".into(),
            ..Default::default()
        }
        .to_bytes()
        .expect("nbt")
    }

    fn region(path: PathBuf) -> LinearRegion {
        LinearRegion::new(RegionPos::new(-1, 0), path, Arc::new(NbtChunkDecoder))
    }

    #[test]
    fn test_load_chunk_skips_to_index() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.-1.0.linear");

        let mut writer = LinearRegionWriter::new(RegionPos::new(-1, 0), &path);
        writer.write_chunk(-32, 0, 10, &nbt(-32, 0, 100)).expect("write");
        writer.write_chunk(-1, 31, 20, &nbt(-1, 31, 200)).expect("write");
        writer.finish().expect("finish");

        let region = region(path);
        assert_eq!(region.load_chunk(-1, 31).expect("load").data_version(), 200);
        assert_eq!(region.load_chunk(-32, 0).expect("load").data_version(), 100);
        assert!(region.load_chunk(-2, 5).expect("load").is_empty());
    }

    #[test]
    fn test_bad_footer_is_corrupt_region() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.-1.0.linear");

        let mut writer = LinearRegionWriter::new(RegionPos::new(-1, 0), &path);
        writer.write_chunk(-32, 0, 1, &nbt(-32, 0, 1)).expect("write");
        writer.finish().expect("finish");

        let mut data = std::fs::read(&path).expect("read");
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).expect("write");

        assert!(matches!(region(path).load_chunk(-32, 0), Err(RegionError::CorruptRegion { .. })));
    }

    #[test]
    fn test_truncated_file_is_corrupt_region() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.-1.0.linear");

        let mut writer = LinearRegionWriter::new(RegionPos::new(-1, 0), &path);
        writer.write_chunk(-32, 0, 1, &nbt(-32, 0, 1)).expect("write");
        writer.finish().expect("finish");

        let data = std::fs::read(&path).expect("read");
        std::fs::write(&path, &data[..data.len() - 20]).expect("write");

        let mut accepted = 0;
        struct Count<'a>(&'a mut usize);
        impl ChunkConsumer for Count<'_> {
            fn accept(&mut self, _: i32, _: i32, _: Chunk) {
                *self.0 += 1;
            }
        }
        assert!(region(path).iter_chunks(&mut Count(&mut accepted)).is_err());
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_oversized_table_length_is_corrupt_chunk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("r.-1.0.linear");

        let mut table = vec![0u8; CHUNKS_PER_REGION * 8];
        table[0..4].copy_from_slice(&i32::MAX.to_be_bytes());
        table.extend_from_slice(&[7u8; 100]);
        let compressed = zstd::encode_all(table.as_slice(), 3).expect("zstd");

        let mut data = SIGNATURE.to_be_bytes().to_vec();
        data.push(VERSION_2);
        data.extend_from_slice(&1i64.to_be_bytes());
        data.push(DEFAULT_LEVEL as u8);
        data.extend_from_slice(&1i16.to_be_bytes());
        data.extend_from_slice(&(compressed.len() as i32).to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&compressed);
        data.extend_from_slice(&SIGNATURE.to_be_bytes());
        std::fs::write(&path, &data).expect("write");

        assert!(matches!(region(path).load_chunk(-32, 0), Err(RegionError::CorruptChunk { .. })));
    }
}
