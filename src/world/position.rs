use serde::{Deserialize, Serialize};

/// Width of a chunk in blocks
pub const CHUNK_SIZE: i32 = 16;

/// Width of a region in chunks
pub const REGION_SIZE: i32 = 32;

/// Number of chunk cells in one region
pub const CHUNKS_PER_REGION: usize = (REGION_SIZE * REGION_SIZE) as usize;

/// Position of a chunk in the world (chunk coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing the block column at `block_x`, `block_z`
    pub fn from_block(block_x: i32, block_z: i32) -> Self {
        Self::new(block_x.div_euclid(CHUNK_SIZE), block_z.div_euclid(CHUNK_SIZE))
    }

    /// Region this chunk is stored in
    pub fn region(&self) -> RegionPos {
        RegionPos::new(self.x.div_euclid(REGION_SIZE), self.z.div_euclid(REGION_SIZE))
    }

    /// Offset of this chunk inside its region, each axis in `0..32`
    pub fn local(&self) -> (usize, usize) {
        (
            self.x.rem_euclid(REGION_SIZE) as usize,
            self.z.rem_euclid(REGION_SIZE) as usize,
        )
    }

    /// Row-major (z outer, x inner) index of this chunk inside its region
    pub fn region_index(&self) -> usize {
        let (x, z) = self.local();
        z * REGION_SIZE as usize + x
    }

    /// First block column of the chunk
    pub fn min_block(&self) -> (i32, i32) {
        (self.x * CHUNK_SIZE, self.z * CHUNK_SIZE)
    }
}

/// Position of a region file (region coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Global chunk position of the local cell `local_x`, `local_z`
    pub fn chunk(&self, local_x: usize, local_z: usize) -> ChunkPos {
        ChunkPos::new(
            self.x * REGION_SIZE + local_x as i32,
            self.z * REGION_SIZE + local_z as i32,
        )
    }

    /// Global chunk position for a row-major region index
    pub fn chunk_at_index(&self, index: usize) -> ChunkPos {
        self.chunk(index % REGION_SIZE as usize, index / REGION_SIZE as usize)
    }

    /// Whether `chunk` is stored in this region
    pub fn contains(&self, chunk: ChunkPos) -> bool {
        chunk.region() == *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_chunk_maps_to_negative_region() {
        let chunk = ChunkPos::new(-1, -33);
        assert_eq!(chunk.region(), RegionPos::new(-1, -2));
        assert_eq!(chunk.local(), (31, 31));
        assert_eq!(chunk.region_index(), 1023);
    }

    #[test]
    fn test_index_roundtrip() {
        let region = RegionPos::new(3, -4);
        for index in [0, 1, 31, 32, 500, 1023] {
            let chunk = region.chunk_at_index(index);
            assert!(region.contains(chunk));
            assert_eq!(chunk.region_index(), index);
        }
    }

    #[test]
    fn test_from_block_floors() {
        assert_eq!(ChunkPos::from_block(-1, 15), ChunkPos::new(-1, 0));
        assert_eq!(ChunkPos::from_block(16, -16), ChunkPos::new(1, -1));
        assert_eq!(ChunkPos::new(2, -1).min_block(), (32, -16));
    }
}
