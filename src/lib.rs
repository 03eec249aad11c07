//! Map data engine: reads region files of a voxel world, caches decoded
//! chunks, stores rendered tiles in files or a database and maintains a
//! level-of-detail pyramid of lowres tiles.

pub mod cache;
pub mod compression;
pub mod config;
pub mod housekeeping;
pub mod lowres;
pub mod storage;
pub mod util;
pub mod world;

pub use cache::{LoadingCache, RemovalCause};
pub use compression::{Compression, CompressionError};
pub use config::{ConfigError, HousekeepingConfig, MapperConfig, StorageConfig};
pub use housekeeping::Housekeeper;
pub use lowres::{LowresConfig, LowresTileManager, Sample};
pub use storage::{GridKind, MapStorage, Storage, StorageError, StorageResult};
pub use util::{BitPackedArray, Interrupt};
pub use world::{Chunk, ChunkPos, RegionPos, World, WorldCacheConfig};
