//! Named codec registry shared by region files and tile storage
//!
//! Every codec has a stable string id (persisted in storage metadata and the
//! database) and a file suffix used by the filesystem backend. Codecs wrap
//! byte streams so callers can write or read without buffering whole payloads.

use std::fmt;
use std::io::{self, Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};

/// Result type for codec operations
pub type CompressionResult<T> = Result<T, CompressionError>;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("no such codec: {0:?}")]
    UnknownCodec(String),

    #[error("codec I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Compression algorithms supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Compression {
    /// No compression
    None,
    /// Gzip compression (good compression, moderate speed)
    Gzip,
    /// Zlib compression (faster than gzip)
    Zlib,
    /// Zstandard compression (best compression ratio)
    Zstd,
    /// LZ4 frame compression (fastest)
    Lz4,
}

/// Compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Fast,
    #[default]
    Default,
    Best,
}

impl CompressionLevel {
    fn to_flate2(self) -> FlateCompression {
        match self {
            CompressionLevel::Fast => FlateCompression::fast(),
            CompressionLevel::Default => FlateCompression::default(),
            CompressionLevel::Best => FlateCompression::best(),
        }
    }

    fn to_zstd(self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Default => 3,
            CompressionLevel::Best => 9,
        }
    }
}

impl Compression {
    /// Every registered codec, in id order
    pub const ALL: [Compression; 5] = [
        Compression::None,
        Compression::Gzip,
        Compression::Zlib,
        Compression::Zstd,
        Compression::Lz4,
    ];

    /// Stable identifier persisted alongside compressed data
    pub fn id(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }

    /// Suffix appended to file names holding data in this codec
    pub fn file_suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zlib => ".zlib",
            Compression::Zstd => ".zst",
            Compression::Lz4 => ".lz4",
        }
    }

    /// Look a codec up by its id
    pub fn for_id(id: &str) -> CompressionResult<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| CompressionError::UnknownCodec(id.to_string()))
    }

    /// Wrap `sink` so that everything written to it gets compressed.
    ///
    /// The returned encoder must be [`Encoder::finish`]ed to flush trailers.
    pub fn compress<W: Write>(self, sink: W) -> CompressionResult<Encoder<W>> {
        self.compress_with_level(sink, CompressionLevel::Default)
    }

    pub fn compress_with_level<W: Write>(
        self,
        sink: W,
        level: CompressionLevel,
    ) -> CompressionResult<Encoder<W>> {
        Ok(match self {
            Compression::None => Encoder::None(sink),
            Compression::Gzip => Encoder::Gzip(GzEncoder::new(sink, level.to_flate2())),
            Compression::Zlib => Encoder::Zlib(ZlibEncoder::new(sink, level.to_flate2())),
            Compression::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(sink, level.to_zstd())?),
            Compression::Lz4 => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
        })
    }

    /// Wrap `source` so that reads yield decompressed bytes
    pub fn decompress<'a, R: Read + Send + 'a>(
        self,
        source: R,
    ) -> CompressionResult<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Compression::None => Box::new(source),
            Compression::Gzip => Box::new(GzDecoder::new(source)),
            Compression::Zlib => Box::new(ZlibDecoder::new(source)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
            Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(source)),
        })
    }

    /// Compress a whole buffer
    pub fn compress_bytes(self, data: &[u8]) -> CompressionResult<Vec<u8>> {
        let mut encoder = self.compress(Vec::with_capacity(data.len() / 2))?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    /// Decompress a whole buffer
    pub fn decompress_bytes(self, data: &[u8]) -> CompressionResult<Vec<u8>> {
        let mut decompressed = Vec::with_capacity(data.len() * 2);
        self.decompress(data)?.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl TryFrom<String> for Compression {
    type Error = CompressionError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::for_id(&id)
    }
}

impl From<Compression> for String {
    fn from(compression: Compression) -> Self {
        compression.id().to_string()
    }
}

/// Compressing writer returned by [`Compression::compress`]
pub enum Encoder<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Zlib(ZlibEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Flush codec trailers and hand back the inner sink
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::None(mut sink) => {
                sink.flush()?;
                Ok(sink)
            }
            Encoder::Gzip(encoder) => encoder.finish(),
            Encoder::Zlib(encoder) => encoder.finish(),
            Encoder::Zstd(encoder) => encoder.finish(),
            Encoder::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::None(sink) => sink.write(buf),
            Encoder::Gzip(encoder) => encoder.write(buf),
            Encoder::Zlib(encoder) => encoder.write(buf),
            Encoder::Zstd(encoder) => encoder.write(buf),
            Encoder::Lz4(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::None(sink) => sink.flush(),
            Encoder::Gzip(encoder) => encoder.flush(),
            Encoder::Zlib(encoder) => encoder.flush(),
            Encoder::Zstd(encoder) => encoder.flush(),
            Encoder::Lz4(encoder) => encoder.flush(),
        }
    }
}
