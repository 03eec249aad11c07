//! Filesystem storage backend
//!
//! ```text
//! <root>/<map>/settings.json
//! <root>/<map>/textures.json<compression suffix>
//! <root>/<map>/live/markers.json
//! <root>/<map>/tiles/0/x1/2/z-3/4.prbm<compression suffix>
//! <root>/<map>/tiles/<lod>/x1/2/z-3/4.png
//! <root>/<map>/rstate/tiles/...dat<compression suffix>
//! <root>/<map>/rstate/chunks/...dat<compression suffix>
//! ```
//!
//! Grid coordinates are split into one directory per digit to bound the
//! number of entries per directory. Writes go to a temporary file in the
//! target directory which is renamed over the target on commit.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::NamedTempFile;

use crate::compression::Compression;

use super::{
    validate_map_id, CommitSink, CompressedReader, GridKind, ItemWriter, Paged, StorageBackend, StorageError,
    StorageResult,
};

const DELETE_BATCH: usize = 1000;

pub struct FileStorage {
    root: PathBuf,
    compression: Compression,
    closed: AtomicBool,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            root: root.into(),
            compression,
            closed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Folder of one map; ids that would resolve outside the root are rejected
    fn map_root(&self, map: &str) -> StorageResult<PathBuf> {
        validate_map_id(map)?;
        Ok(self.root.join(map))
    }

    fn tile_compression(&self, kind: GridKind) -> Compression {
        if kind.is_compressible() {
            self.compression
        } else {
            Compression::None
        }
    }

    /// Folder holding a grid and the file extension of its cells
    fn grid_layout(&self, map: &str, kind: GridKind) -> StorageResult<(PathBuf, String)> {
        let map_root = self.map_root(map)?;
        let suffix = self.tile_compression(kind).file_suffix();
        Ok(match kind {
            GridKind::Tiles { lod: 0 } => (map_root.join("tiles").join("0"), format!(".prbm{}", suffix)),
            GridKind::Tiles { lod } => (map_root.join("tiles").join(lod.to_string()), ".png".to_string()),
            GridKind::TileState => (map_root.join("rstate").join("tiles"), format!(".dat{}", suffix)),
            GridKind::ChunkState => (map_root.join("rstate").join("chunks"), format!(".dat{}", suffix)),
        })
    }

    fn tile_path(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<PathBuf> {
        let (folder, extension) = self.grid_layout(map, kind)?;
        Ok(folder.join(format!("{}{}", grid_path(x, z), extension)))
    }

    fn item_path(&self, map: &str, key: &str, compression: Compression) -> StorageResult<PathBuf> {
        Ok(self.map_root(map)?.join(format!("{}{}", key, compression.file_suffix())))
    }

    /// Existing file of an item together with its compression
    fn find_item(&self, map: &str, key: &str) -> StorageResult<Option<(PathBuf, Compression)>> {
        for compression in [self.compression, Compression::None] {
            let path = self.item_path(map, key, compression)?;
            if path.is_file() {
                return Ok(Some((path, compression)));
            }
        }
        Ok(None)
    }

    fn open(path: &Path, compression: Compression) -> StorageResult<Option<CompressedReader>> {
        match File::open(path) {
            Ok(file) => Ok(Some(CompressedReader::new(Box::new(io::BufReader::new(file)), compression))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn writer(&self, path: PathBuf, compression: Compression) -> StorageResult<ItemWriter> {
        let folder = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "storage path has no parent"))?;
        fs::create_dir_all(folder)?;

        let temp = NamedTempFile::new_in(folder)?;
        let sink = FileSink {
            writer: BufWriter::new(temp),
            target: path,
        };
        ItemWriter::new(Box::new(sink), compression)
    }
}

fn remove_if_present(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl StorageBackend for FileStorage {
    fn write_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<ItemWriter> {
        self.ensure_open()?;
        self.writer(self.tile_path(map, kind, x, z)?, self.tile_compression(kind))
    }

    fn read_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<Option<CompressedReader>> {
        self.ensure_open()?;
        Self::open(&self.tile_path(map, kind, x, z)?, self.tile_compression(kind))
    }

    fn delete_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<()> {
        self.ensure_open()?;
        remove_if_present(&self.tile_path(map, kind, x, z)?)
    }

    fn tile_exists(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.tile_path(map, kind, x, z)?.is_file())
    }

    fn tiles<'a>(&'a self, map: &str, kind: GridKind) -> Paged<'a, (i32, i32)> {
        if let Err(e) = self.ensure_open() {
            return Paged::failed(e);
        }

        let (folder, extension) = match self.grid_layout(map, kind) {
            Ok(layout) => layout,
            Err(e) => return Paged::failed(e),
        };
        let mut files = Vec::new();
        if let Err(e) = collect_files(&folder, &mut files) {
            return Paged::failed(e.into());
        }

        let mut cells: Vec<(i32, i32)> = files
            .iter()
            .filter_map(|file| {
                let relative = file.strip_prefix(&folder).ok()?;
                let joined: String = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect();
                parse_grid_path(joined.strip_suffix(extension.as_str())?)
            })
            .collect();
        cells.sort_unstable();
        Paged::from_vec(cells)
    }

    fn write_item(&self, map: &str, key: &str, compression: Compression) -> StorageResult<ItemWriter> {
        self.ensure_open()?;
        self.writer(self.item_path(map, key, compression)?, compression)
    }

    fn read_item(&self, map: &str, key: &str) -> StorageResult<Option<CompressedReader>> {
        self.ensure_open()?;
        match self.find_item(map, key)? {
            Some((path, compression)) => Self::open(&path, compression),
            None => Ok(None),
        }
    }

    fn delete_item(&self, map: &str, key: &str) -> StorageResult<()> {
        self.ensure_open()?;
        remove_if_present(&self.item_path(map, key, self.compression)?)?;
        remove_if_present(&self.item_path(map, key, Compression::None)?)
    }

    fn item_exists(&self, map: &str, key: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.find_item(map, key)?.is_some())
    }

    fn map_ids(&self) -> Paged<'_, String> {
        let list = || -> StorageResult<Vec<String>> {
            self.ensure_open()?;
            let entries = match fs::read_dir(&self.root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut ids = Vec::new();
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(id) = entry.file_name().to_str() {
                    if has_any_file(&entry.path())? {
                        ids.push(id.to_string());
                    }
                }
            }
            ids.sort();
            Ok(ids)
        };

        match list() {
            Ok(ids) => Paged::from_vec(ids),
            Err(e) => Paged::failed(e),
        }
    }

    fn map_exists(&self, map: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(has_any_file(&self.map_root(map)?)?)
    }

    fn delete_map(&self, map: &str, progress: &mut dyn FnMut(f64) -> bool) -> StorageResult<()> {
        self.ensure_open()?;
        let map_root = self.map_root(map)?;

        let mut files = Vec::new();
        collect_files(&map_root, &mut files)?;
        let total = files.len();

        for (batch_index, batch) in files.chunks(DELETE_BATCH).enumerate() {
            for file in batch {
                remove_if_present(file)?;
            }
            let done = (batch_index * DELETE_BATCH + batch.len()) as f64 / total as f64;
            if done < 1.0 && !progress(done) {
                log::info!("Deleting map '{}' aborted at {:.1}%", map, done * 100.0);
                return Ok(());
            }
        }

        match fs::remove_dir_all(&map_root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        progress(1.0);
        Ok(())
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Temp file that replaces `target` on commit and disappears otherwise
struct FileSink {
    writer: BufWriter<NamedTempFile>,
    target: PathBuf,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl CommitSink for FileSink {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let FileSink { writer, target } = *self;
        let temp = writer.into_inner().map_err(|e| e.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }
}

/// `x12z-34` becomes `x1/2/z-3/4`
pub fn grid_path(x: i32, z: i32) -> String {
    let name = format!("x{}z{}", x, z);
    let mut path = String::with_capacity(name.len() * 2);
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        path.push(c);
        if c.is_ascii_digit() && chars.peek().is_some() {
            path.push('/');
        }
    }
    path
}

/// Inverse of [`grid_path`] with the separators already removed
fn parse_grid_path(name: &str) -> Option<(i32, i32)> {
    let (x, z) = name.strip_prefix('x')?.split_once('z')?;
    Some((x.parse().ok()?, z.parse().ok()?))
}

fn collect_files(folder: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

fn has_any_file(folder: &Path) -> io::Result<bool> {
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_file() || (file_type.is_dir() && has_any_file(&entry.path())?) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_path_splits_digits() {
        assert_eq!(grid_path(12, -34), "x1/2/z-3/4");
        assert_eq!(grid_path(0, 0), "x0/z0");
        assert_eq!(parse_grid_path("x12z-34"), Some((12, -34)));
        assert_eq!(parse_grid_path("x12"), None);
    }

    #[test]
    fn test_layout_on_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let storage = FileStorage::new(dir.path(), Compression::Gzip);

        let mut writer = storage.write_tile("world", GridKind::HIRES, 12, -34).expect("writer");
        writer.write_all(b"tile").expect("write");
        writer.commit().expect("commit");

        let mut writer = storage.write_tile("world", GridKind::lowres(2), 1, 1).expect("writer");
        writer.write_all(b"png").expect("write");
        writer.commit().expect("commit");

        assert!(dir.path().join("world/tiles/0/x1/2/z-3/4.prbm.gz").is_file());
        let lowres = dir.path().join("world/tiles/2/x1/z1.png");
        assert_eq!(fs::read(lowres).expect("read"), b"png");
    }

    #[test]
    fn test_closed_storage_rejects_operations() {
        let dir = tempfile::tempdir().expect("temp dir");
        let storage = FileStorage::new(dir.path(), Compression::None);
        storage.close();

        assert!(storage.is_closed());
        assert!(matches!(storage.read_item("world", "settings.json"), Err(StorageError::Closed)));
        assert!(matches!(
            storage.tiles("world", GridKind::HIRES).next(),
            Some(Err(StorageError::Closed))
        ));
    }

    #[test]
    fn test_map_ids_cannot_leave_the_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("maps");
        let storage = FileStorage::new(&root, Compression::None);

        for map in ["../outside", "..", "a/b", ""] {
            assert!(
                matches!(storage.write_item(map, "settings.json", Compression::None), Err(StorageError::InvalidName { .. })),
                "{:?} was accepted",
                map
            );
            assert!(matches!(storage.map_exists(map), Err(StorageError::InvalidName { .. })));
            assert!(matches!(
                storage.tiles(map, GridKind::HIRES).next(),
                Some(Err(StorageError::InvalidName { .. }))
            ));
        }
        assert!(matches!(
            storage.delete_map("..", &mut |_| true),
            Err(StorageError::InvalidName { .. })
        ));
        assert!(!dir.path().join("outside").exists());
        assert!(dir.path().exists());
    }
}
