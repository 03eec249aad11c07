use crate::world::chunk::Chunk;
use crate::world::error::RegionResult;
use crate::world::nbt::ChunkNbt;
use crate::world::position::ChunkPos;

/// Turns a decompressed chunk payload into a [`Chunk`]
///
/// Region readers hand every accepted payload to a decoder; rejected chunks
/// never reach it.
pub trait ChunkDecoder: Send + Sync {
    fn decode(&self, pos: ChunkPos, data: &[u8]) -> RegionResult<Chunk>;
}

/// Decodes the NBT chunk compound
#[derive(Debug, Clone, Copy, Default)]
pub struct NbtChunkDecoder;

impl ChunkDecoder for NbtChunkDecoder {
    fn decode(&self, pos: ChunkPos, data: &[u8]) -> RegionResult<Chunk> {
        let nbt = ChunkNbt::from_bytes(data)?;
        if let (Some(x), Some(z)) = (nbt.x_pos, nbt.z_pos) {
            if x != pos.x || z != pos.z {
                log::debug!(
                    "Chunk stored at {},{} claims position {},{}",
                    pos.x,
                    pos.z,
                    x,
                    z
                );
            }
        }
        Ok(Chunk::from_nbt(pos, nbt))
    }
}
