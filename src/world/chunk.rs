use std::collections::BTreeMap;

use fastnbt::{ByteArray, LongArray};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::util::{BitPackedArray, PackingMode};
use crate::world::nbt::{BlockStatesNbt, ChunkNbt, HeightmapsNbt, PaletteEntryNbt, SectionNbt};
use crate::world::position::ChunkPos;

/// First data version whose packed arrays never span two words (20w17a)
pub const ALIGNED_PACKING_DATA_VERSION: i32 = 2529;

const SECTION_SIZE: usize = 16;
const SECTION_VOLUME: usize = SECTION_SIZE * SECTION_SIZE * SECTION_SIZE;
const COLUMN_COUNT: usize = 256;

lazy_static! {
    static ref AIR: BlockState = BlockState::new("minecraft:air");
}

/// A block id with its state properties
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockState {
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

impl BlockState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn air() -> &'static BlockState {
        &AIR
    }

    pub fn is_air(&self) -> bool {
        matches!(
            self.name.as_str(),
            "minecraft:air" | "minecraft:cave_air" | "minecraft:void_air"
        )
    }
}

/// One 16x16x16 slice of a chunk
#[derive(Debug, Clone)]
pub struct ChunkSection {
    y: i32,
    palette: Vec<BlockState>,
    blocks: Option<BitPackedArray>,
    block_light: Option<Vec<i8>>,
}

impl ChunkSection {
    fn from_nbt(section: SectionNbt, mode: PackingMode) -> Self {
        let (palette, blocks) = match section.block_states {
            Some(states) => {
                let palette: Vec<BlockState> = states
                    .palette
                    .into_iter()
                    .map(|entry| BlockState {
                        name: entry.name,
                        properties: entry.properties,
                    })
                    .collect();
                let blocks = states
                    .data
                    .filter(|data| !data.is_empty())
                    .map(|data| packed_from_longs(&data, SECTION_VOLUME, mode));
                (palette, blocks)
            }
            None => (Vec::new(), None),
        };

        Self {
            y: section.y as i32,
            palette,
            blocks,
            block_light: section.block_light.map(|light| light.to_vec()),
        }
    }

    fn to_nbt(&self) -> SectionNbt {
        SectionNbt {
            y: self.y as i8,
            block_states: Some(BlockStatesNbt {
                palette: self
                    .palette
                    .iter()
                    .map(|state| PaletteEntryNbt {
                        name: state.name.clone(),
                        properties: state.properties.clone(),
                    })
                    .collect(),
                data: self
                    .blocks
                    .as_ref()
                    .map(|blocks| LongArray::new(blocks.words().iter().map(|&w| w as i64).collect())),
            }),
            block_light: self.block_light.clone().map(ByteArray::new),
        }
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn palette(&self) -> &[BlockState] {
        &self.palette
    }

    /// Block at section-local coordinates
    pub fn block_state(&self, x: usize, y: usize, z: usize) -> &BlockState {
        let palette_index = match &self.blocks {
            Some(blocks) => blocks.get(section_index(x, y, z)) as usize,
            None => 0,
        };
        self.palette.get(palette_index).unwrap_or(&AIR)
    }

    /// Block light (0-15) at section-local coordinates
    pub fn block_light(&self, x: usize, y: usize, z: usize) -> u8 {
        let Some(light) = &self.block_light else {
            return 0;
        };
        let index = section_index(x, y, z);
        let Some(&byte) = light.get(index >> 1) else {
            return 0;
        };
        let byte = byte as u8;
        if index & 1 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }
}

fn section_index(x: usize, y: usize, z: usize) -> usize {
    (y & 15) << 8 | (z & 15) << 4 | (x & 15)
}

/// Derive the value width from the array length, then wrap it
fn packed_from_longs(longs: &[i64], value_count: usize, mode: PackingMode) -> BitPackedArray {
    let bits = match mode {
        PackingMode::WordAligned => {
            let values_per_word = (value_count + longs.len() - 1) / longs.len();
            (64 / values_per_word.max(1)) as u32
        }
        PackingMode::Continuous => (longs.len() * 64 / value_count) as u32,
    };
    BitPackedArray::from_longs(longs, bits, mode)
}

/// Decoded contents of one region cell
///
/// `Chunk::empty` is the sentinel returned for cells that were never
/// generated and for chunks that failed to load.
#[derive(Debug, Clone)]
pub struct Chunk {
    pos: ChunkPos,
    empty: bool,
    data_version: i32,
    status: String,
    inhabited_time: i64,
    min_section_y: i32,
    sections: Vec<ChunkSection>,
    world_surface: Option<BitPackedArray>,
}

impl Chunk {
    pub fn empty(pos: ChunkPos) -> Self {
        Self {
            pos,
            empty: true,
            data_version: 0,
            status: String::from("empty"),
            inhabited_time: 0,
            min_section_y: 0,
            sections: Vec::new(),
            world_surface: None,
        }
    }

    /// Build a chunk from its NBT compound.
    ///
    /// `pos` wins over the compound's own `xPos`/`zPos`, which some tools omit.
    pub fn from_nbt(pos: ChunkPos, nbt: ChunkNbt) -> Self {
        let mode = if nbt.data_version < ALIGNED_PACKING_DATA_VERSION {
            PackingMode::Continuous
        } else {
            PackingMode::WordAligned
        };

        let mut sections: Vec<ChunkSection> = nbt
            .sections
            .into_iter()
            .map(|section| ChunkSection::from_nbt(section, mode))
            .collect();
        sections.sort_by_key(|section| section.y);

        let min_section_y = nbt
            .y_pos
            .or_else(|| sections.first().map(|s| s.y))
            .unwrap_or(0);

        let world_surface = nbt
            .heightmaps
            .and_then(|maps| maps.world_surface)
            .filter(|data| !data.is_empty())
            .map(|data| packed_from_longs(&data, COLUMN_COUNT, mode));

        Self {
            pos,
            empty: false,
            data_version: nbt.data_version,
            status: nbt.status,
            inhabited_time: nbt.inhabited_time,
            min_section_y,
            sections,
            world_surface,
        }
    }

    /// Encode back into the NBT compound it was read from
    pub fn to_nbt(&self) -> ChunkNbt {
        ChunkNbt {
            data_version: self.data_version,
            x_pos: Some(self.pos.x),
            z_pos: Some(self.pos.z),
            y_pos: Some(self.min_section_y),
            status: self.status.clone(),
            inhabited_time: self.inhabited_time,
            sections: self.sections.iter().map(ChunkSection::to_nbt).collect(),
            heightmaps: self.world_surface.as_ref().map(|surface| HeightmapsNbt {
                world_surface: Some(LongArray::new(surface.words().iter().map(|&w| w as i64).collect())),
            }),
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Whether world generation finished for this chunk
    pub fn is_generated(&self) -> bool {
        !self.empty
            && matches!(
                self.status.as_str(),
                "full" | "minecraft:full" | "postprocessed" | "fullchunk"
            )
    }

    pub fn data_version(&self) -> i32 {
        self.data_version
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn inhabited_time(&self) -> i64 {
        self.inhabited_time
    }

    pub fn sections(&self) -> &[ChunkSection] {
        &self.sections
    }

    /// Lowest block y covered by the chunk's sections
    pub fn min_y(&self) -> i32 {
        self.min_section_y * SECTION_SIZE as i32
    }

    fn section(&self, y: i32) -> Option<&ChunkSection> {
        let section_y = y.div_euclid(SECTION_SIZE as i32);
        let offset = section_y - self.min_section_y;
        // Sections are usually contiguous from min_section_y, fall back to a search otherwise
        match usize::try_from(offset).ok().and_then(|i| self.sections.get(i)) {
            Some(section) if section.y == section_y => Some(section),
            _ => self.sections.iter().find(|s| s.y == section_y),
        }
    }

    /// Block at chunk-local `x`/`z` (0..16) and absolute `y`
    pub fn block_state(&self, x: usize, y: i32, z: usize) -> &BlockState {
        match self.section(y) {
            Some(section) => section.block_state(x, y.rem_euclid(16) as usize, z),
            None => &AIR,
        }
    }

    /// Block light at chunk-local `x`/`z` and absolute `y`
    pub fn block_light(&self, x: usize, y: i32, z: usize) -> u8 {
        self.section(y)
            .map(|section| section.block_light(x, y.rem_euclid(16) as usize, z))
            .unwrap_or(0)
    }

    /// Y of the highest non-air block in the column, if a heightmap is stored
    pub fn world_surface_y(&self, x: usize, z: usize) -> Option<i32> {
        let surface = self.world_surface.as_ref()?;
        let value = surface.get((z & 15) * 16 + (x & 15)) as i32;
        Some(self.min_y() + value - 1)
    }
}
