//! Region and chunk error handling

use std::io;
use std::path::PathBuf;

use crate::compression::CompressionError;

/// Result type for region and chunk operations
pub type RegionResult<T> = Result<T, RegionError>;

/// Errors raised while reading the world's save data
///
/// `CorruptRegion` invalidates the whole region file, every other variant is
/// scoped to the single chunk being read.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt region file {}: {reason}", path.display())]
    CorruptRegion { path: PathBuf, reason: String },

    #[error("corrupt chunk {x},{z}: {reason}")]
    CorruptChunk { x: i32, z: i32, reason: String },

    #[error("unsupported chunk compression type {0}")]
    UnsupportedCompression(u8),

    #[error("chunk NBT decoding failed: {0}")]
    Nbt(#[from] fastnbt::error::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Create a corrupt region error
pub fn corrupt_region(path: impl Into<PathBuf>, reason: impl Into<String>) -> RegionError {
    RegionError::CorruptRegion {
        path: path.into(),
        reason: reason.into(),
    }
}

/// Create a corrupt chunk error
pub fn corrupt_chunk(x: i32, z: i32, reason: impl Into<String>) -> RegionError {
    RegionError::CorruptChunk {
        x,
        z,
        reason: reason.into(),
    }
}
