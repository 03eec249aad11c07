//! Map tile and metadata storage
//!
//! Every map owns named item slots (settings, textures, markers, ...) and
//! coordinate addressed grids (hires tiles, one grid per lowres level and the
//! render state grids). [`Storage`] is the facade over an interchangeable
//! [`StorageBackend`]: the filesystem layout in [`file`] or the relational
//! schema in [`sql`].
//!
//! Writes go through an [`ItemWriter`] and only become visible on
//! [`ItemWriter::commit`]; a writer dropped without committing leaves the
//! previous content untouched.

pub mod error;
pub mod file;
pub mod sql;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::compression::{Compression, Encoder};

pub use error::{StorageError, StorageResult};
pub use file::FileStorage;
pub use sql::{Dialect, SqlStorage};

/// Page size used for bulk listings
pub const PAGE_SIZE: usize = 1000;

/// A coordinate addressed grid of a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridKind {
    /// Rendered tiles, level 0 holds the hires tiles
    Tiles { lod: u16 },
    /// Render state per tile
    TileState,
    /// Render state per chunk
    ChunkState,
}

impl GridKind {
    pub const HIRES: GridKind = GridKind::Tiles { lod: 0 };

    pub fn lowres(lod: u16) -> Self {
        GridKind::Tiles { lod }
    }

    /// Lowres tiles are PNG images and never compressed a second time
    pub fn is_compressible(self) -> bool {
        !matches!(self, GridKind::Tiles { lod } if lod > 0)
    }
}

impl fmt::Display for GridKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridKind::Tiles { lod: 0 } => write!(f, "hires tiles"),
            GridKind::Tiles { lod } => write!(f, "lowres tiles (lod {})", lod),
            GridKind::TileState => write!(f, "tile state"),
            GridKind::ChunkState => write!(f, "chunk state"),
        }
    }
}

/// A named single-item slot of a map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetaItem {
    Settings,
    Textures,
    Markers,
    Players,
    RenderState,
    /// A caller named asset, the name is sanitized on construction
    Asset(String),
}

impl MetaItem {
    pub fn asset(name: &str) -> StorageResult<Self> {
        Ok(MetaItem::Asset(sanitize_asset_name(name)?))
    }

    /// Storage key, also the path relative to the map root
    pub fn key(&self) -> String {
        match self {
            MetaItem::Settings => "settings.json".to_string(),
            MetaItem::Textures => "textures.json".to_string(),
            MetaItem::Markers => "live/markers.json".to_string(),
            MetaItem::Players => "live/players.json".to_string(),
            MetaItem::RenderState => ".rstate".to_string(),
            MetaItem::Asset(name) => format!("assets/{}", name),
        }
    }

    /// Whether the backend compression applies to this item
    pub fn is_compressible(&self) -> bool {
        matches!(self, MetaItem::Textures | MetaItem::RenderState)
    }
}

/// Make an arbitrary asset name safe to use as a storage key.
///
/// Characters outside `[A-Za-z0-9_.-/]` become `_`, runs of dots collapse to
/// a single dot and surrounding slashes are dropped, so the result can never
/// leave the assets folder. Names that would address the assets folder itself
/// are rejected.
pub fn sanitize_asset_name(name: &str) -> StorageResult<String> {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/') {
            c
        } else {
            '_'
        };
        if c == '.' && out.ends_with('.') {
            continue;
        }
        out.push(c);
    }

    let sanitized = out.trim_matches('/');
    if sanitized.split('/').all(|segment| segment.is_empty() || segment == ".") {
        return Err(error::invalid_name("asset name", name));
    }
    Ok(sanitized.to_string())
}

/// Check that a map id can be used as a single path component
///
/// Empty ids, `.`, `..` and ids containing path separators or NUL are
/// rejected.
pub fn validate_map_id(map_id: &str) -> StorageResult<()> {
    let valid = !map_id.is_empty()
        && map_id != "."
        && map_id != ".."
        && !map_id.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if !valid {
        return Err(error::invalid_name("map id", map_id));
    }
    Ok(())
}

/// The destination of an [`ItemWriter`], made visible by `commit`
pub trait CommitSink: Write + Send {
    fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// Compressing writer for one item or tile
pub struct ItemWriter {
    encoder: Encoder<Box<dyn CommitSink>>,
}

impl ItemWriter {
    pub fn new(sink: Box<dyn CommitSink>, compression: Compression) -> StorageResult<Self> {
        Ok(Self {
            encoder: compression.compress(sink)?,
        })
    }

    /// Finish compression and atomically replace the stored content
    pub fn commit(self) -> StorageResult<()> {
        self.encoder.finish()?.commit()
    }
}

impl Write for ItemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

/// Stored bytes together with the compression they were written with
pub struct CompressedReader {
    source: Box<dyn Read + Send>,
    compression: Compression,
}

impl CompressedReader {
    pub fn new(source: Box<dyn Read + Send>, compression: Compression) -> Self {
        Self { source, compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// The stored bytes as they are, e.g. to serve them with a content encoding
    pub fn into_raw(self) -> Box<dyn Read + Send> {
        self.source
    }

    pub fn decompressed(self) -> StorageResult<Box<dyn Read + Send>> {
        Ok(self.compression.decompress(self.source)?)
    }

    pub fn read_to_vec(self) -> StorageResult<Vec<u8>> {
        let mut data = Vec::new();
        self.decompressed()?.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl fmt::Debug for CompressedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedReader")
            .field("compression", &self.compression)
            .finish()
    }
}

type PageFetch<'a, T> = Box<dyn FnMut(usize, usize) -> StorageResult<Vec<T>> + Send + 'a>;

/// Lazily fetched listing, one page at a time
///
/// An error ends the iteration after being yielded once.
pub struct Paged<'a, T> {
    fetch: PageFetch<'a, T>,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<T>,
    done: bool,
}

impl<'a, T> Paged<'a, T> {
    pub fn new(page_size: usize, fetch: impl FnMut(usize, usize) -> StorageResult<Vec<T>> + Send + 'a) -> Self {
        Self {
            fetch: Box::new(fetch),
            page_size: page_size.max(1),
            offset: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Everything already in memory, served as a single page
    pub fn from_vec(items: Vec<T>) -> Self
    where
        T: Send + 'a,
    {
        let mut items = Some(items);
        Self::new(usize::MAX, move |_, _| Ok(items.take().unwrap_or_default()))
    }

    /// A listing that yields `error` once and ends
    pub fn failed(error: StorageError) -> Self {
        let mut error = Some(error);
        Self::new(1, move |_, _| match error.take() {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        })
    }
}

impl<T> Iterator for Paged<'_, T> {
    type Item = StorageResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            match (self.fetch)(self.offset, self.page_size) {
                Ok(page) => {
                    self.done = page.len() < self.page_size;
                    self.offset += page.len();
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Operations every storage backend provides
///
/// Map ids are opaque strings, item keys come from [`MetaItem::key`].
pub trait StorageBackend: Send + Sync {
    fn write_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<ItemWriter>;

    fn read_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<Option<CompressedReader>>;

    fn delete_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<()>;

    fn tile_exists(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<bool>;

    /// Coordinates of every stored cell of a grid
    fn tiles<'a>(&'a self, map: &str, kind: GridKind) -> Paged<'a, (i32, i32)>;

    fn write_item(&self, map: &str, key: &str, compression: Compression) -> StorageResult<ItemWriter>;

    fn read_item(&self, map: &str, key: &str) -> StorageResult<Option<CompressedReader>>;

    fn delete_item(&self, map: &str, key: &str) -> StorageResult<()>;

    fn item_exists(&self, map: &str, key: &str) -> StorageResult<bool>;

    /// Ids of every map with at least one stored item or tile
    fn map_ids(&self) -> Paged<'_, String>;

    fn map_exists(&self, map: &str) -> StorageResult<bool>;

    /// Remove everything stored for a map.
    ///
    /// `progress` receives the completed fraction after each batch; returning
    /// `false` stops the purge early.
    fn delete_map(&self, map: &str, progress: &mut dyn FnMut(f64) -> bool) -> StorageResult<()>;

    /// Compression used for newly written compressible content
    fn compression(&self) -> Compression;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Entry point: hands out per-map storage views over one backend
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn map(&self, map_id: &str) -> MapStorage {
        MapStorage {
            backend: self.backend.clone(),
            map_id: Arc::from(map_id),
        }
    }

    pub fn map_ids(&self) -> Paged<'_, String> {
        self.backend.map_ids()
    }

    pub fn close(&self) {
        self.backend.close();
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }
}

/// Everything stored for one map
#[derive(Clone)]
pub struct MapStorage {
    backend: Arc<dyn StorageBackend>,
    map_id: Arc<str>,
}

impl MapStorage {
    pub fn id(&self) -> &str {
        &self.map_id
    }

    pub fn grid(&self, kind: GridKind) -> GridStorage {
        GridStorage {
            backend: self.backend.clone(),
            map_id: self.map_id.clone(),
            kind,
        }
    }

    pub fn hires_tiles(&self) -> GridStorage {
        self.grid(GridKind::HIRES)
    }

    /// Tiles of lowres level `lod`, starting at 1
    pub fn lowres_tiles(&self, lod: u16) -> GridStorage {
        self.grid(GridKind::lowres(lod.max(1)))
    }

    pub fn tile_state(&self) -> GridStorage {
        self.grid(GridKind::TileState)
    }

    pub fn chunk_state(&self) -> GridStorage {
        self.grid(GridKind::ChunkState)
    }

    pub fn item(&self, item: MetaItem) -> ItemStorage {
        ItemStorage {
            backend: self.backend.clone(),
            map_id: self.map_id.clone(),
            item,
        }
    }

    pub fn settings(&self) -> ItemStorage {
        self.item(MetaItem::Settings)
    }

    pub fn textures(&self) -> ItemStorage {
        self.item(MetaItem::Textures)
    }

    pub fn markers(&self) -> ItemStorage {
        self.item(MetaItem::Markers)
    }

    pub fn players(&self) -> ItemStorage {
        self.item(MetaItem::Players)
    }

    pub fn render_state(&self) -> ItemStorage {
        self.item(MetaItem::RenderState)
    }

    /// Item for a caller named asset, see [`sanitize_asset_name`]
    pub fn asset(&self, name: &str) -> StorageResult<ItemStorage> {
        Ok(self.item(MetaItem::asset(name)?))
    }

    /// A map exists as soon as anything is stored for it
    pub fn exists(&self) -> StorageResult<bool> {
        self.backend.map_exists(&self.map_id)
    }

    pub fn delete(&self, mut progress: impl FnMut(f64) -> bool) -> StorageResult<()> {
        log::info!("Deleting map '{}'", self.map_id);
        self.backend.delete_map(&self.map_id, &mut progress)
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }
}

impl fmt::Debug for MapStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapStorage").field("map_id", &self.map_id).finish()
    }
}

/// One named slot of a map
#[derive(Clone)]
pub struct ItemStorage {
    backend: Arc<dyn StorageBackend>,
    map_id: Arc<str>,
    item: MetaItem,
}

impl ItemStorage {
    pub fn item(&self) -> &MetaItem {
        &self.item
    }

    /// Replace the content; nothing changes until the writer is committed
    pub fn write(&self) -> StorageResult<ItemWriter> {
        let compression = if self.item.is_compressible() {
            self.backend.compression()
        } else {
            Compression::None
        };
        self.backend.write_item(&self.map_id, &self.item.key(), compression)
    }

    pub fn read(&self) -> StorageResult<Option<CompressedReader>> {
        self.backend.read_item(&self.map_id, &self.item.key())
    }

    pub fn delete(&self) -> StorageResult<()> {
        self.backend.delete_item(&self.map_id, &self.item.key())
    }

    pub fn exists(&self) -> StorageResult<bool> {
        self.backend.item_exists(&self.map_id, &self.item.key())
    }

    /// Write `data` in one go
    pub fn write_bytes(&self, data: &[u8]) -> StorageResult<()> {
        let mut writer = self.write()?;
        writer.write_all(data)?;
        writer.commit()
    }

    /// Decompressed content, `None` if nothing is stored
    pub fn read_bytes(&self) -> StorageResult<Option<Vec<u8>>> {
        self.read()?.map(CompressedReader::read_to_vec).transpose()
    }
}

/// A coordinate addressed grid of a map
#[derive(Clone)]
pub struct GridStorage {
    backend: Arc<dyn StorageBackend>,
    map_id: Arc<str>,
    kind: GridKind,
}

impl GridStorage {
    pub fn kind(&self) -> GridKind {
        self.kind
    }

    pub fn cell(&self, x: i32, z: i32) -> Cell {
        Cell {
            grid: self.clone(),
            x,
            z,
        }
    }

    pub fn write(&self, x: i32, z: i32) -> StorageResult<ItemWriter> {
        self.backend.write_tile(&self.map_id, self.kind, x, z)
    }

    pub fn read(&self, x: i32, z: i32) -> StorageResult<Option<CompressedReader>> {
        self.backend.read_tile(&self.map_id, self.kind, x, z)
    }

    pub fn delete(&self, x: i32, z: i32) -> StorageResult<()> {
        self.backend.delete_tile(&self.map_id, self.kind, x, z)
    }

    pub fn exists(&self, x: i32, z: i32) -> StorageResult<bool> {
        self.backend.tile_exists(&self.map_id, self.kind, x, z)
    }

    /// Every stored cell, fetched lazily page by page
    pub fn cells(&self) -> impl Iterator<Item = StorageResult<Cell>> + '_ {
        self.backend
            .tiles(&self.map_id, self.kind)
            .map(move |pos| pos.map(|(x, z)| self.cell(x, z)))
    }
}

/// Position in a grid plus the operations on it
#[derive(Clone)]
pub struct Cell {
    grid: GridStorage,
    x: i32,
    z: i32,
}

impl Cell {
    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    pub fn write(&self) -> StorageResult<ItemWriter> {
        self.grid.write(self.x, self.z)
    }

    pub fn read(&self) -> StorageResult<Option<CompressedReader>> {
        self.grid.read(self.x, self.z)
    }

    pub fn delete(&self) -> StorageResult<()> {
        self.grid.delete(self.x, self.z)
    }

    pub fn exists(&self) -> StorageResult<bool> {
        self.grid.exists(self.x, self.z)
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("kind", &self.grid.kind)
            .field("x", &self.x)
            .field("z", &self.z)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_asset_name() {
        let sanitize = |name: &str| sanitize_asset_name(name).expect("valid name");
        assert_eq!(sanitize("icons/marker.png"), "icons/marker.png");
        assert_eq!(sanitize("../../etc/passwd"), "././etc/passwd");
        assert_eq!(sanitize("/abs/file"), "abs/file");
        assert_eq!(sanitize("dir/"), "dir");
        assert_eq!(sanitize("a b?c"), "a_b_c");
        assert_eq!(sanitize("über.txt"), "_ber.txt");
        assert!(!sanitize("..../x").contains(".."));
    }

    #[test]
    fn test_names_of_the_assets_folder_itself_are_rejected() {
        for name in ["", "/", "//", ".", "..", "./", "/../."] {
            assert!(
                matches!(sanitize_asset_name(name), Err(StorageError::InvalidName { .. })),
                "{:?} was accepted",
                name
            );
        }
    }

    #[test]
    fn test_validate_map_id() {
        for id in ["world", "world_nether", "my map", "v1.2"] {
            assert!(validate_map_id(id).is_ok(), "{:?} was rejected", id);
        }
        for id in ["", ".", "..", "../x", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(validate_map_id(id), Err(StorageError::InvalidName { .. })),
                "{:?} was accepted",
                id
            );
        }
    }

    #[test]
    fn test_paged_iterates_all_pages() {
        let items: Vec<u32> = (0..2500).collect();
        let mut calls = 0;
        let paged = Paged::new(1000, |offset, limit| {
            calls += 1;
            Ok(items.iter().copied().skip(offset).take(limit).collect())
        });
        let collected: Vec<u32> = paged.collect::<StorageResult<_>>().expect("pages");
        assert_eq!(collected, items);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_paged_stops_after_error() {
        let mut paged: Paged<'_, u32> = Paged::new(10, |_, _| Err(StorageError::Closed));
        assert!(matches!(paged.next(), Some(Err(StorageError::Closed))));
        assert!(paged.next().is_none());
    }

    #[test]
    fn test_only_lowres_tiles_skip_compression() {
        assert!(GridKind::HIRES.is_compressible());
        assert!(GridKind::TileState.is_compressible());
        assert!(!GridKind::lowres(2).is_compressible());
    }
}
