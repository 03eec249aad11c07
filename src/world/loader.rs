use std::time::Duration;

use crate::util::Interrupt;
use crate::world::chunk::Chunk;
use crate::world::position::ChunkPos;
use crate::world::region::Region;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Loads chunks from a region, absorbing transient failures
///
/// A region file may be rewritten by the server while it is read, which shows
/// up as a truncated or corrupt payload. The loader retries a few times before
/// giving up and returning the empty chunk.
#[derive(Debug, Clone)]
pub struct ChunkLoader {
    max_attempts: u32,
    retry_delay: Duration,
    interrupt: Interrupt,
}

impl Default for ChunkLoader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

impl ChunkLoader {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
            interrupt: Interrupt::new(),
        }
    }

    /// Share an externally owned interrupt, so shutdown can cut retries short
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Load a chunk, never failing
    ///
    /// Errors are logged; after the last attempt, or when interrupted while
    /// waiting, the empty chunk is returned.
    pub fn load(&self, region: &dyn Region, pos: ChunkPos) -> Chunk {
        let mut attempt = 1;
        loop {
            match region.load_chunk(pos.x, pos.z) {
                Ok(chunk) => return chunk,
                Err(e) if attempt >= self.max_attempts => {
                    log::error!(
                        "Failed to load chunk {},{} from {} after {} attempts: {}",
                        pos.x,
                        pos.z,
                        region.path().display(),
                        attempt,
                        e
                    );
                    return Chunk::empty(pos);
                }
                Err(e) => {
                    log::warn!(
                        "Loading chunk {},{} failed (attempt {}), retrying: {}",
                        pos.x,
                        pos.z,
                        attempt,
                        e
                    );
                }
            }

            if self.interrupt.sleep(self.retry_delay).is_err() {
                log::warn!("Interrupted while loading chunk {},{}", pos.x, pos.z);
                return Chunk::empty(pos);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::error::{corrupt_chunk, RegionResult};
    use crate::world::position::RegionPos;
    use crate::world::region::ChunkConsumer;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Fails the first `failures` loads
    struct FlakyRegion {
        failures: u32,
        calls: AtomicU32,
    }

    impl Region for FlakyRegion {
        fn pos(&self) -> RegionPos {
            RegionPos::new(0, 0)
        }

        fn path(&self) -> &Path {
            Path::new("r.0.0.mca")
        }

        fn load_chunk(&self, chunk_x: i32, chunk_z: i32) -> RegionResult<Chunk> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(corrupt_chunk(chunk_x, chunk_z, "truncated"));
            }
            let nbt = crate::world::nbt::ChunkNbt {
                data_version: 3000,
                ..Default::default()
            };
            Ok(Chunk::from_nbt(ChunkPos::new(chunk_x, chunk_z), nbt))
        }

        fn iter_chunks(&self, _consumer: &mut dyn ChunkConsumer) -> RegionResult<()> {
            Ok(())
        }
    }

    fn flaky(failures: u32) -> FlakyRegion {
        FlakyRegion {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    #[test]
    fn test_recovers_within_attempts() {
        let region = flaky(2);
        let loader = ChunkLoader::new(3, Duration::from_millis(1));

        let chunk = loader.load(&region, ChunkPos::new(1, 1));
        assert!(!chunk.is_empty());
        assert_eq!(region.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_falls_back_to_empty() {
        let region = flaky(u32::MAX);
        let loader = ChunkLoader::new(3, Duration::from_millis(1));

        assert!(loader.load(&region, ChunkPos::new(1, 1)).is_empty());
        assert_eq!(region.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_interrupt_aborts_retries() {
        let region = flaky(u32::MAX);
        let loader = ChunkLoader::new(100, Duration::from_secs(30));
        loader.interrupt().interrupt();

        let start = Instant::now();
        assert!(loader.load(&region, ChunkPos::new(1, 1)).is_empty());
        assert_eq!(region.calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
