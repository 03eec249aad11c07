//! Serde schema of the chunk NBT compound
//!
//! Only the tags the mapper reads are modelled; everything else in the
//! compound is ignored on decode. The same structs are used to encode chunks
//! when writing region files.

use std::collections::BTreeMap;

use fastnbt::{ByteArray, LongArray};
use serde::{Deserialize, Serialize};

/// Root compound of a chunk (1.18+ layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkNbt {
    #[serde(rename = "DataVersion", default)]
    pub data_version: i32,

    #[serde(rename = "xPos", default, skip_serializing_if = "Option::is_none")]
    pub x_pos: Option<i32>,

    #[serde(rename = "zPos", default, skip_serializing_if = "Option::is_none")]
    pub z_pos: Option<i32>,

    #[serde(rename = "yPos", default, skip_serializing_if = "Option::is_none")]
    pub y_pos: Option<i32>,

    #[serde(rename = "Status", default)]
    pub status: String,

    #[serde(rename = "InhabitedTime", default)]
    pub inhabited_time: i64,

    #[serde(default)]
    pub sections: Vec<SectionNbt>,

    #[serde(rename = "Heightmaps", default, skip_serializing_if = "Option::is_none")]
    pub heightmaps: Option<HeightmapsNbt>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionNbt {
    #[serde(rename = "Y")]
    pub y: i8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_states: Option<BlockStatesNbt>,

    #[serde(rename = "BlockLight", default, skip_serializing_if = "Option::is_none")]
    pub block_light: Option<ByteArray>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStatesNbt {
    #[serde(default)]
    pub palette: Vec<PaletteEntryNbt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<LongArray>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaletteEntryNbt {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Properties", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeightmapsNbt {
    #[serde(rename = "WORLD_SURFACE", default, skip_serializing_if = "Option::is_none")]
    pub world_surface: Option<LongArray>,
}

impl ChunkNbt {
    pub fn to_bytes(&self) -> fastnbt::error::Result<Vec<u8>> {
        fastnbt::to_bytes(self)
    }

    pub fn from_bytes(data: &[u8]) -> fastnbt::error::Result<Self> {
        fastnbt::from_bytes(data)
    }
}
