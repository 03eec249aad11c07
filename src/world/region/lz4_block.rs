//! LZ4 block stream used by region type code 4
//!
//! The stream is a sequence of blocks, each prefixed with the 8 byte magic
//! `LZ4Block`, a token byte (method in the high nibble, level in the low
//! nibble) and three little-endian u32 fields: compressed length, original
//! length and checksum. A block with an original length of 0 ends the stream.
//!
//! Checksums are not verified; the writer stores 0.

use std::io::{self, Read};

const MAGIC: &[u8; 8] = b"LZ4Block";
const HEADER_LENGTH: usize = MAGIC.len() + 1 + 4 + 4 + 4;
const METHOD_RAW: u8 = 0x10;
const METHOD_LZ4: u8 = 0x20;
const BLOCK_SIZE: usize = 64 * 1024;
/// Largest block the token's level nibble can describe (level 15)
const MAX_BLOCK_SIZE: usize = 1 << 25;

/// Decompressing reader over an LZ4 block stream
pub struct Lz4BlockReader<R> {
    inner: R,
    buffer: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R: Read> Lz4BlockReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            position: 0,
            finished: false,
        }
    }

    /// Load the next block into the buffer, returns false at end of stream
    fn next_block(&mut self) -> io::Result<bool> {
        let mut header = [0u8; HEADER_LENGTH];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(false),
            n if n < HEADER_LENGTH => {
                return Err(invalid("truncated LZ4 block header"));
            }
            _ => {}
        }

        if &header[..8] != MAGIC {
            return Err(invalid("bad LZ4 block magic"));
        }

        let method = header[8] & 0xF0;
        let compressed_length = u32::from_le_bytes([header[9], header[10], header[11], header[12]]) as usize;
        let original_length = u32::from_le_bytes([header[13], header[14], header[15], header[16]]) as usize;

        if original_length == 0 {
            return Ok(false);
        }
        if original_length > MAX_BLOCK_SIZE {
            return Err(invalid(&format!("LZ4 block of {} bytes exceeds the block size limit", original_length)));
        }
        if compressed_length > lz4_flex::block::get_maximum_output_size(original_length) {
            return Err(invalid("LZ4 block is larger than its worst-case compressed size"));
        }

        let mut compressed = Vec::new();
        self.inner
            .by_ref()
            .take(compressed_length as u64)
            .read_to_end(&mut compressed)?;
        if compressed.len() != compressed_length {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated LZ4 block"));
        }

        self.buffer = match method {
            METHOD_RAW => {
                if compressed_length != original_length {
                    return Err(invalid("raw LZ4 block length mismatch"));
                }
                compressed
            }
            METHOD_LZ4 => lz4_flex::block::decompress(&compressed, original_length)
                .map_err(|e| invalid(&format!("LZ4 block decompression failed: {}", e)))?,
            other => return Err(invalid(&format!("unknown LZ4 block method {:#x}", other))),
        };
        self.position = 0;
        Ok(true)
    }
}

impl<R: Read> Read for Lz4BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.buffer.len() {
            if self.finished || !self.next_block()? {
                self.finished = true;
                return Ok(0);
            }
        }

        let available = &self.buffer[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Encode `data` as an LZ4 block stream including the end marker
pub fn encode_lz4_blocks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + HEADER_LENGTH * 2);
    // log2(64KiB) - 10
    let level = 6u8;

    for block in data.chunks(BLOCK_SIZE) {
        let compressed = lz4_flex::block::compress(block);
        let (method, payload) = if compressed.len() < block.len() {
            (METHOD_LZ4, compressed.as_slice())
        } else {
            (METHOD_RAW, block)
        };

        out.extend_from_slice(MAGIC);
        out.push(method | level);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(payload);
    }

    out.extend_from_slice(MAGIC);
    out.push(METHOD_RAW | level);
    out.extend_from_slice(&[0u8; 12]);
    out
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        Lz4BlockReader::new(data).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_multiple_blocks() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode_lz4_blocks(&data);
        assert!(encoded.len() < data.len());
        assert_eq!(decode(&encoded).expect("decode"), data);
    }

    #[test]
    fn test_roundtrip_empty() {
        assert!(decode(&encode_lz4_blocks(&[])).expect("decode").is_empty());
    }

    #[test]
    fn test_stream_without_end_marker() {
        let data = b"incompressible?".to_vec();
        let mut encoded = encode_lz4_blocks(&data);
        encoded.truncate(encoded.len() - HEADER_LENGTH);
        assert_eq!(decode(&encoded).expect("decode"), data);
    }

    #[test]
    fn test_bad_magic_is_an_error() {
        let mut encoded = encode_lz4_blocks(b"hello hello hello hello");
        encoded[0] = b'X';
        assert!(decode(&encoded).is_err());
    }

    fn block_header(compressed_length: u32, original_length: u32) -> Vec<u8> {
        let mut header = MAGIC.to_vec();
        header.push(METHOD_LZ4 | 6);
        header.extend_from_slice(&compressed_length.to_le_bytes());
        header.extend_from_slice(&original_length.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header
    }

    #[test]
    fn test_oversized_block_is_rejected_before_reading() {
        let err = decode(&block_header(16, u32::MAX)).expect_err("oversized");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = decode(&block_header(u32::MAX, 1024)).expect_err("inflated compressed length");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_block_payload() {
        let mut data = block_header(900, 1000);
        data.extend_from_slice(&[0u8; 10]);
        let err = decode(&data).expect_err("truncated");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
