//! redb-backed metadata store
//!
//! Defines the tables holding cellar metadata and maps the scoped
//! transaction contract onto redb read/write transactions.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::{BufferDto, ChunkDto, MetaRead, MetaStore, MetaWrite, Stats};
use crate::error::{CellarError, Result};

/// Name of the metadata database file inside a log folder
pub const META_FILE_NAME: &str = "meta.redb";

// Table definitions
// Key: record name, Value: serialized singleton record (buffer descriptor, stats)
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

// Key: chunk start position, Value: serialized ChunkDto
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");

// Key: checkpoint name, Value: logical position
const CHECKPOINTS: TableDefinition<&str, u64> = TableDefinition::new("checkpoints");

const BUFFER_KEY: &str = "buffer";
const STATS_KEY: &str = "stats";

/// Metadata store persisted in a redb database file.
///
/// The database file stays locked until [`MetaStore::close`] is called or
/// the last handle is dropped.
pub struct RedbMetaStore {
    db: RwLock<Option<Database>>,
    path: PathBuf,
}

impl RedbMetaStore {
    /// Open or create the metadata database inside `folder`
    pub fn open_in(folder: impl AsRef<Path>) -> Result<Self> {
        Self::open(folder.as_ref().join(META_FILE_NAME))
    }

    /// Open or create the database at `path`
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CellarError::io("create metadata folder", e))?;
        }

        let db = Database::create(&path)?;
        info!("Opened metadata database");

        Self::init_tables(&db)?;
        Ok(Self {
            db: RwLock::new(Some(db)),
            path,
        })
    }

    /// Create tables if they don't exist
    fn init_tables(db: &Database) -> Result<()> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(META)?;
        write_txn.open_table(CHUNKS)?;
        write_txn.open_table(CHECKPOINTS)?;
        write_txn.commit()?;

        debug!("Initialized metadata tables");
        Ok(())
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the database is still open
    pub fn is_open(&self) -> bool {
        self.db.read().map(|db| db.is_some()).unwrap_or(false)
    }

    fn with_db<T>(&self, op: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self
            .db
            .read()
            .map_err(|_| CellarError::Poisoned("metadata database"))?;
        match guard.as_ref() {
            Some(db) => op(db),
            None => Err(CellarError::Closed),
        }
    }
}

impl std::fmt::Debug for RedbMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbMetaStore")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MetaStore for RedbMetaStore {
    fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn MetaRead) -> Result<T>,
    {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            op(&RedbRead { txn: &txn })
        })
    }

    fn update<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn MetaWrite) -> Result<T>,
    {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            let outcome = op(&mut RedbWrite { txn: &txn });

            match outcome {
                Ok(value) => {
                    txn.commit()?;
                    Ok(value)
                }
                Err(err) => {
                    if let Err(abort_err) = txn.abort() {
                        warn!(error = %abort_err, "Failed to abort metadata transaction");
                    }
                    Err(err)
                }
            }
        })
    }

    fn close(&self) {
        let db = match self.db.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if db.is_some() {
            drop(db);
            info!(path = %self.path.display(), "Closed metadata database");
        }
    }
}

fn load<T, R>(table: &R, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(postcard::from_bytes(guard.value())?)),
        None => Ok(None),
    }
}

fn load_chunks<R>(table: &R) -> Result<Vec<ChunkDto>>
where
    R: ReadableTable<u64, &'static [u8]>,
{
    let mut chunks = Vec::new();
    for entry in table.iter()? {
        let (_start, value) = entry?;
        chunks.push(postcard::from_bytes(value.value())?);
    }
    Ok(chunks)
}

fn load_checkpoint<R>(table: &R, name: &str) -> Result<Option<u64>>
where
    R: ReadableTable<&'static str, u64>,
{
    Ok(table.get(name)?.map(|guard| guard.value()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| CellarError::Serialization(e.to_string()))
}

/// Read-only transaction handle
struct RedbRead<'a> {
    txn: &'a ReadTransaction,
}

impl MetaRead for RedbRead<'_> {
    fn get_buffer(&self) -> Result<Option<BufferDto>> {
        load(&self.txn.open_table(META)?, BUFFER_KEY)
    }

    fn list_chunks(&self) -> Result<Vec<ChunkDto>> {
        load_chunks(&self.txn.open_table(CHUNKS)?)
    }

    fn get_stats(&self) -> Result<Option<Stats>> {
        load(&self.txn.open_table(META)?, STATS_KEY)
    }

    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>> {
        load_checkpoint(&self.txn.open_table(CHECKPOINTS)?, name)
    }
}

/// Read-write transaction handle
struct RedbWrite<'a> {
    txn: &'a WriteTransaction,
}

impl MetaRead for RedbWrite<'_> {
    fn get_buffer(&self) -> Result<Option<BufferDto>> {
        load(&self.txn.open_table(META)?, BUFFER_KEY)
    }

    fn list_chunks(&self) -> Result<Vec<ChunkDto>> {
        load_chunks(&self.txn.open_table(CHUNKS)?)
    }

    fn get_stats(&self) -> Result<Option<Stats>> {
        load(&self.txn.open_table(META)?, STATS_KEY)
    }

    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>> {
        load_checkpoint(&self.txn.open_table(CHECKPOINTS)?, name)
    }
}

impl MetaWrite for RedbWrite<'_> {
    fn put_buffer(&mut self, dto: &BufferDto) -> Result<()> {
        let value = encode(dto)?;
        let mut table = self.txn.open_table(META)?;
        table.insert(BUFFER_KEY, value.as_slice())?;
        Ok(())
    }

    fn add_chunk(&mut self, start_pos: u64, dto: &ChunkDto) -> Result<()> {
        let value = encode(dto)?;
        let mut table = self.txn.open_table(CHUNKS)?;
        table.insert(start_pos, value.as_slice())?;
        Ok(())
    }

    fn put_stats(&mut self, stats: &Stats) -> Result<()> {
        let value = encode(stats)?;
        let mut table = self.txn.open_table(META)?;
        table.insert(STATS_KEY, value.as_slice())?;
        Ok(())
    }

    fn put_checkpoint(&mut self, name: &str, pos: u64) -> Result<()> {
        let mut table = self.txn.open_table(CHECKPOINTS)?;
        table.insert(name, pos)?;
        Ok(())
    }
}
