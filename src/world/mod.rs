//! World save data
//!
//! Region files hold 32x32 chunks each. [`region`] reads the two supported
//! file layouts, [`World`] caches region handles and decoded chunks on top of
//! them, and [`RegionWatchService`] reports region files changed on disk.

pub mod chunk;
pub mod decoder;
pub mod error;
pub mod loader;
pub mod nbt;
pub mod position;
pub mod region;
pub mod watcher;
#[allow(clippy::module_inception)]
pub mod world;

pub use chunk::{BlockState, Chunk, ChunkSection};
pub use decoder::{ChunkDecoder, NbtChunkDecoder};
pub use error::{RegionError, RegionResult};
pub use loader::ChunkLoader;
pub use position::{ChunkPos, RegionPos, CHUNK_SIZE, REGION_SIZE};
pub use watcher::{RegionWatchService, WatchError};
pub use world::{World, WorldCacheConfig};
