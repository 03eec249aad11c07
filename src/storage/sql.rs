//! Relational storage backend
//!
//! Tiles live in `map_tile`, items in `map_meta`. Map ids and compression ids
//! are interned into small integer keys. Every unit of work runs in its own
//! pooled connection inside a transaction that is committed explicitly;
//! dropping it uncommitted rolls back.

use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::compression::Compression;

use super::error::config_error;
use super::{
    CommitSink, CompressedReader, GridKind, ItemWriter, Paged, StorageBackend, StorageError, StorageResult, PAGE_SIZE,
};

/// Schema version written to `storage_meta`
pub const SCHEMA_VERSION: i64 = 1;

const DELETE_BATCH: i64 = 1000;
const LOD_TILE_STATE: i64 = -1;
const LOD_CHUNK_STATE: i64 = -2;

/// SQL statements of one database flavour
#[derive(Debug)]
pub struct Dialect {
    pub name: &'static str,
    create_tables: &'static [&'static str],
    read_schema_version: &'static str,
    write_schema_version: &'static str,
    insert_map: &'static str,
    select_map: &'static str,
    insert_compression: &'static str,
    select_compression: &'static str,
    upsert_tile: &'static str,
    read_tile: &'static str,
    delete_tile: &'static str,
    tile_exists: &'static str,
    list_tiles: &'static str,
    upsert_meta: &'static str,
    read_meta: &'static str,
    delete_meta: &'static str,
    meta_exists: &'static str,
    list_maps: &'static str,
    map_has_data: &'static str,
    count_map_tiles: &'static str,
    delete_tile_batch: &'static str,
    delete_map_meta: &'static str,
    delete_map: &'static str,
}

impl Dialect {
    pub const SQLITE: Dialect = Dialect {
        name: "sqlite",
        create_tables: &[
            "CREATE TABLE IF NOT EXISTS storage_meta (
                key TEXT NOT NULL PRIMARY KEY,
                value TEXT
            )",
            "CREATE TABLE IF NOT EXISTS map (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                map_id TEXT NOT NULL UNIQUE
            )",
            "CREATE TABLE IF NOT EXISTS map_tile_compression (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                compression TEXT NOT NULL UNIQUE
            )",
            "CREATE TABLE IF NOT EXISTS map_tile (
                map INTEGER NOT NULL REFERENCES map (id) ON DELETE CASCADE,
                lod INTEGER NOT NULL,
                x INTEGER NOT NULL,
                z INTEGER NOT NULL,
                compression INTEGER NOT NULL REFERENCES map_tile_compression (id),
                changed INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (map, lod, x, z)
            )",
            "CREATE TABLE IF NOT EXISTS map_meta (
                map INTEGER NOT NULL REFERENCES map (id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (map, key)
            )",
        ],
        read_schema_version: "SELECT value FROM storage_meta WHERE key = 'schema_version'",
        write_schema_version: "INSERT INTO storage_meta (key, value) VALUES ('schema_version', ?1)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        insert_map: "INSERT INTO map (map_id) VALUES (?1) ON CONFLICT (map_id) DO NOTHING",
        select_map: "SELECT id FROM map WHERE map_id = ?1",
        insert_compression: "INSERT INTO map_tile_compression (compression) VALUES (?1)
            ON CONFLICT (compression) DO NOTHING",
        select_compression: "SELECT id FROM map_tile_compression WHERE compression = ?1",
        upsert_tile: "INSERT INTO map_tile (map, lod, x, z, compression, changed, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (map, lod, x, z) DO UPDATE SET
                compression = excluded.compression,
                changed = excluded.changed,
                data = excluded.data",
        read_tile: "SELECT c.compression, t.data
            FROM map_tile t
            JOIN map_tile_compression c ON t.compression = c.id
            WHERE t.map = ?1 AND t.lod = ?2 AND t.x = ?3 AND t.z = ?4",
        delete_tile: "DELETE FROM map_tile WHERE map = ?1 AND lod = ?2 AND x = ?3 AND z = ?4",
        tile_exists: "SELECT COUNT(*) FROM map_tile WHERE map = ?1 AND lod = ?2 AND x = ?3 AND z = ?4",
        list_tiles: "SELECT x, z FROM map_tile WHERE map = ?1 AND lod = ?2 ORDER BY x, z LIMIT ?3 OFFSET ?4",
        upsert_meta: "INSERT INTO map_meta (map, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT (map, key) DO UPDATE SET value = excluded.value",
        read_meta: "SELECT value FROM map_meta WHERE map = ?1 AND key = ?2",
        delete_meta: "DELETE FROM map_meta WHERE map = ?1 AND key = ?2",
        meta_exists: "SELECT COUNT(*) FROM map_meta WHERE map = ?1 AND key = ?2",
        list_maps: "SELECT m.map_id FROM map m
            WHERE EXISTS (SELECT 1 FROM map_tile t WHERE t.map = m.id)
               OR EXISTS (SELECT 1 FROM map_meta e WHERE e.map = m.id)
            ORDER BY m.id LIMIT ?1 OFFSET ?2",
        map_has_data: "SELECT EXISTS (SELECT 1 FROM map_tile WHERE map = ?1)
            OR EXISTS (SELECT 1 FROM map_meta WHERE map = ?1)",
        count_map_tiles: "SELECT COUNT(*) FROM map_tile WHERE map = ?1",
        delete_tile_batch: "DELETE FROM map_tile WHERE rowid IN
            (SELECT rowid FROM map_tile WHERE map = ?1 LIMIT ?2)",
        delete_map_meta: "DELETE FROM map_meta WHERE map = ?1",
        delete_map: "DELETE FROM map WHERE id = ?1",
    };

    /// Look a dialect up by name; unknown names are a configuration error
    pub fn for_name(name: &str) -> StorageResult<&'static Dialect> {
        match name.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(&Self::SQLITE),
            _ => Err(StorageError::UnknownDialect(name.to_string())),
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlOptions {
    pub max_connections: u32,
    /// How long to wait for a free pooled connection
    #[serde(with = "crate::config::duration_millis")]
    pub connection_timeout: Duration,
    /// How long SQLite waits on a locked database before failing
    #[serde(with = "crate::config::duration_millis")]
    pub busy_timeout: Duration,
}

impl Default for SqlOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connection_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Run `op`, repeating it once if the first failure is transient
pub fn retry_once<T>(mut op: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
    match op() {
        Err(e) if e.is_transient() => {
            log::warn!("Transient storage failure, retrying once: {}", e);
            op()
        }
        result => result,
    }
}

fn lod_code(kind: GridKind) -> i64 {
    match kind {
        GridKind::Tiles { lod } => lod as i64,
        GridKind::TileState => LOD_TILE_STATE,
        GridKind::ChunkState => LOD_CHUNK_STATE,
    }
}

struct SqlInner {
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
    dialect: &'static Dialect,
    compression: Compression,
    map_keys: DashMap<String, i64>,
    compression_keys: DashMap<Compression, i64>,
    closed: AtomicBool,
}

impl SqlInner {
    fn connection(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.pool.get()?)
    }

    /// Run `op` in a committed transaction, retried once on transient failure
    fn transaction<T>(&self, op: impl Fn(&Transaction<'_>) -> StorageResult<T>) -> StorageResult<T> {
        retry_once(|| {
            let mut connection = self.connection()?;
            let tx = connection.transaction()?;
            let result = op(&tx)?;
            tx.commit()?;
            Ok(result)
        })
    }

    fn initialize(&self) -> StorageResult<()> {
        let dialect = self.dialect;
        self.transaction(|tx| {
            for statement in dialect.create_tables {
                tx.execute(statement, [])?;
            }

            let found: Option<String> = tx
                .prepare_cached(dialect.read_schema_version)?
                .query_row([], |row| row.get(0))
                .optional()?;
            match found.and_then(|v| v.parse::<i64>().ok()) {
                Some(version) if version > SCHEMA_VERSION => Err(StorageError::SchemaVersion {
                    found: version,
                    supported: SCHEMA_VERSION,
                }),
                Some(_) => Ok(()),
                None => {
                    tx.prepare_cached(dialect.write_schema_version)?
                        .execute(params![SCHEMA_VERSION.to_string()])?;
                    Ok(())
                }
            }
        })
    }

    /// Interned key of a map id, created on demand when `create` is set
    fn map_key(&self, map: &str, create: bool) -> StorageResult<Option<i64>> {
        if let Some(key) = self.map_keys.get(map) {
            return Ok(Some(*key));
        }

        let dialect = self.dialect;
        let key = self.transaction(|tx| {
            if create {
                tx.prepare_cached(dialect.insert_map)?.execute(params![map])?;
            }
            Ok(tx
                .prepare_cached(dialect.select_map)?
                .query_row(params![map], |row| row.get::<_, i64>(0))
                .optional()?)
        })?;

        if let Some(key) = key {
            self.map_keys.insert(map.to_string(), key);
        }
        Ok(key)
    }

    fn compression_key(&self, compression: Compression) -> StorageResult<i64> {
        if let Some(key) = self.compression_keys.get(&compression) {
            return Ok(*key);
        }

        let dialect = self.dialect;
        let key = self.transaction(|tx| {
            tx.prepare_cached(dialect.insert_compression)?
                .execute(params![compression.id()])?;
            Ok(tx
                .prepare_cached(dialect.select_compression)?
                .query_row(params![compression.id()], |row| row.get::<_, i64>(0))?)
        })?;

        self.compression_keys.insert(compression, key);
        Ok(key)
    }

    fn store(&self, target: &SqlTarget, data: &[u8]) -> StorageResult<()> {
        let dialect = self.dialect;
        match target {
            SqlTarget::Tile {
                map,
                kind,
                x,
                z,
                compression,
            } => {
                let map_key = self.map_key(map, true)?.ok_or_else(|| missing_map(map))?;
                let compression_key = self.compression_key(*compression)?;
                let changed = chrono::Utc::now().timestamp_millis();
                self.transaction(|tx| {
                    tx.prepare_cached(dialect.upsert_tile)?.execute(params![
                        map_key,
                        lod_code(*kind),
                        x,
                        z,
                        compression_key,
                        changed,
                        data
                    ])?;
                    Ok(())
                })
            }
            SqlTarget::Meta { map, key } => {
                let map_key = self.map_key(map, true)?.ok_or_else(|| missing_map(map))?;
                self.transaction(|tx| {
                    tx.prepare_cached(dialect.upsert_meta)?
                        .execute(params![map_key, key, data])?;
                    Ok(())
                })
            }
        }
    }

    fn read_meta(&self, map_key: i64, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let dialect = self.dialect;
        self.transaction(|tx| {
            Ok(tx
                .prepare_cached(dialect.read_meta)?
                .query_row(params![map_key, key], |row| row.get::<_, Vec<u8>>(0))
                .optional()?)
        })
    }

    fn count(&self, sql: &str, params: impl rusqlite::Params + Clone) -> StorageResult<i64> {
        self.transaction(|tx| Ok(tx.prepare_cached(sql)?.query_row(params.clone(), |row| row.get(0))?))
    }
}

fn missing_map(map: &str) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("map '{}' could not be registered", map),
    ))
}

/// Where a committed [`SqlSink`] lands
enum SqlTarget {
    Tile {
        map: String,
        kind: GridKind,
        x: i32,
        z: i32,
        compression: Compression,
    },
    Meta {
        map: String,
        key: String,
    },
}

/// Buffers a compressed payload and upserts it on commit
struct SqlSink {
    inner: Arc<SqlInner>,
    target: SqlTarget,
    buffer: Vec<u8>,
}

impl Write for SqlSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommitSink for SqlSink {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        self.inner.store(&self.target, &self.buffer)
    }
}

/// SQLite database behind a connection pool
#[derive(Clone)]
pub struct SqlStorage {
    inner: Arc<SqlInner>,
}

impl SqlStorage {
    /// Open (and create if needed) the database at `path`
    pub fn open(
        path: impl AsRef<Path>,
        dialect: &str,
        compression: Compression,
        options: &SqlOptions,
    ) -> StorageResult<Self> {
        let dialect = Dialect::for_name(dialect)?;
        let path = path.as_ref().to_path_buf();
        if options.max_connections == 0 {
            return Err(config_error("max_connections must be at least 1"));
        }

        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(&path).with_init(move |connection| {
            connection.busy_timeout(busy_timeout)?;
            connection.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder()
            .max_size(options.max_connections)
            .connection_timeout(options.connection_timeout)
            .build(manager)?;

        let inner = SqlInner {
            path,
            pool,
            dialect,
            compression,
            map_keys: DashMap::new(),
            compression_keys: DashMap::new(),
            closed: AtomicBool::new(false),
        };
        inner.initialize()?;
        log::info!(
            "Opened {} storage at {} (compression: {})",
            dialect.name,
            inner.path.display(),
            compression
        );

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.inner.dialect
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn writer(&self, target: SqlTarget, compression: Compression) -> StorageResult<ItemWriter> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let sink = SqlSink {
            inner: self.inner.clone(),
            target,
            buffer: Vec::new(),
        };
        ItemWriter::new(Box::new(sink), compression)
    }

    /// Stored meta key and compression of an item, compressed variant first
    fn find_item(&self, map_key: i64, key: &str) -> StorageResult<Option<(Vec<u8>, Compression)>> {
        for compression in [self.inner.compression, Compression::None] {
            let stored_key = format!("{}{}", key, compression.file_suffix());
            if let Some(data) = self.inner.read_meta(map_key, &stored_key)? {
                return Ok(Some((data, compression)));
            }
        }
        Ok(None)
    }
}

impl StorageBackend for SqlStorage {
    fn write_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<ItemWriter> {
        let compression = if kind.is_compressible() {
            self.inner.compression
        } else {
            Compression::None
        };
        let target = SqlTarget::Tile {
            map: map.to_string(),
            kind,
            x,
            z,
            compression,
        };
        self.writer(target, compression)
    }

    fn read_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<Option<CompressedReader>> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(None);
        };

        let dialect = self.inner.dialect;
        let row: Option<(String, Vec<u8>)> = self.inner.transaction(|tx| {
            Ok(tx
                .prepare_cached(dialect.read_tile)?
                .query_row(params![map_key, lod_code(kind), x, z], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?)
        })?;

        match row {
            Some((compression, data)) => {
                let compression = Compression::for_id(&compression)?;
                Ok(Some(CompressedReader::new(Box::new(Cursor::new(data)), compression)))
            }
            None => Ok(None),
        }
    }

    fn delete_tile(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<()> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(());
        };
        let dialect = self.inner.dialect;
        self.inner.transaction(|tx| {
            tx.prepare_cached(dialect.delete_tile)?
                .execute(params![map_key, lod_code(kind), x, z])?;
            Ok(())
        })
    }

    fn tile_exists(&self, map: &str, kind: GridKind, x: i32, z: i32) -> StorageResult<bool> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(false);
        };
        let count = self
            .inner
            .count(self.inner.dialect.tile_exists, (map_key, lod_code(kind), x, z))?;
        Ok(count > 0)
    }

    fn tiles<'a>(&'a self, map: &str, kind: GridKind) -> Paged<'a, (i32, i32)> {
        let map_key = match self.inner.map_key(map, false) {
            Ok(Some(key)) => key,
            Ok(None) => return Paged::from_vec(Vec::new()),
            Err(e) => return Paged::failed(e),
        };

        let inner = &self.inner;
        Paged::new(PAGE_SIZE, move |offset, limit| {
            inner.transaction(|tx| {
                let mut statement = tx.prepare_cached(inner.dialect.list_tiles)?;
                let rows = statement.query_map(
                    params![map_key, lod_code(kind), limit as i64, offset as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(rows.collect::<Result<Vec<(i32, i32)>, _>>()?)
            })
        })
    }

    fn write_item(&self, map: &str, key: &str, compression: Compression) -> StorageResult<ItemWriter> {
        let target = SqlTarget::Meta {
            map: map.to_string(),
            key: format!("{}{}", key, compression.file_suffix()),
        };
        self.writer(target, compression)
    }

    fn read_item(&self, map: &str, key: &str) -> StorageResult<Option<CompressedReader>> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(None);
        };
        Ok(self
            .find_item(map_key, key)?
            .map(|(data, compression)| CompressedReader::new(Box::new(Cursor::new(data)), compression)))
    }

    fn delete_item(&self, map: &str, key: &str) -> StorageResult<()> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(());
        };
        let dialect = self.inner.dialect;
        let keys = [
            format!("{}{}", key, self.inner.compression.file_suffix()),
            key.to_string(),
        ];
        self.inner.transaction(|tx| {
            let mut statement = tx.prepare_cached(dialect.delete_meta)?;
            for stored_key in &keys {
                statement.execute(params![map_key, stored_key])?;
            }
            Ok(())
        })
    }

    fn item_exists(&self, map: &str, key: &str) -> StorageResult<bool> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(false);
        };
        for compression in [self.inner.compression, Compression::None] {
            let stored_key = format!("{}{}", key, compression.file_suffix());
            if self.inner.count(self.inner.dialect.meta_exists, (map_key, stored_key))? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn map_ids(&self) -> Paged<'_, String> {
        let inner = &self.inner;
        Paged::new(PAGE_SIZE, move |offset, limit| {
            inner.transaction(|tx| {
                let mut statement = tx.prepare_cached(inner.dialect.list_maps)?;
                let rows = statement.query_map(params![limit as i64, offset as i64], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
        })
    }

    fn map_exists(&self, map: &str) -> StorageResult<bool> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            return Ok(false);
        };
        let exists = self.inner.count(self.inner.dialect.map_has_data, [map_key])?;
        Ok(exists != 0)
    }

    fn delete_map(&self, map: &str, progress: &mut dyn FnMut(f64) -> bool) -> StorageResult<()> {
        let Some(map_key) = self.inner.map_key(map, false)? else {
            progress(1.0);
            return Ok(());
        };
        let dialect = self.inner.dialect;

        let total = self.inner.count(dialect.count_map_tiles, [map_key])?;
        let mut deleted = 0i64;
        loop {
            let removed = self.inner.transaction(|tx| {
                Ok(tx
                    .prepare_cached(dialect.delete_tile_batch)?
                    .execute(params![map_key, DELETE_BATCH])?)
            })?;
            if removed == 0 {
                break;
            }

            deleted += removed as i64;
            let done = deleted as f64 / total.max(deleted) as f64;
            if done < 1.0 && !progress(done) {
                log::info!("Deleting map '{}' aborted at {:.1}%", map, done * 100.0);
                return Ok(());
            }
        }

        self.inner.transaction(|tx| {
            tx.prepare_cached(dialect.delete_map_meta)?.execute(params![map_key])?;
            tx.prepare_cached(dialect.delete_map)?.execute(params![map_key])?;
            Ok(())
        })?;
        self.inner.map_keys.remove(map);
        progress(1.0);
        Ok(())
    }

    fn compression(&self) -> Compression {
        self.inner.compression
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
