//! Transactional metadata store
//!
//! The metadata store is the single source of truth for:
//! - the current buffer descriptor (the recovery anchor)
//! - the chunk index, keyed and ordered by logical start position
//! - named user checkpoints
//! - global size statistics
//!
//! Access goes through scoped transactions: [`MetaStore::read`] hands the
//! caller's closure a read-only handle, [`MetaStore::update`] a read-write
//! one that commits only if the closure returns `Ok`.

mod memory;
mod redb_store;

pub use memory::InMemoryMetaStore;
pub use redb_store::{META_FILE_NAME, RedbMetaStore};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transform::SegmentId;

/// Persisted snapshot of a buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDto {
    /// Logical position of the buffer's first byte
    pub start_pos: u64,
    /// Bytes written, relative to `start_pos`
    pub pos: u64,
    /// Soft capacity
    pub max_bytes: u64,
    /// Number of complete records
    pub records: u64,
    /// Name of the physical file inside the log folder
    pub file_name: String,
    /// Keystream salt for the buffer file's cipher
    pub salt: u64,
}

impl BufferDto {
    /// Descriptor for a brand-new, empty buffer with a fresh salt
    pub fn new(start_pos: u64, max_bytes: u64) -> Self {
        Self {
            start_pos,
            pos: 0,
            max_bytes,
            records: 0,
            file_name: buffer_file_name(start_pos),
            salt: rand::rng().next_u64(),
        }
    }

    /// Keystream identity of the buffer file
    pub fn segment_id(&self) -> SegmentId {
        SegmentId {
            start_pos: self.start_pos,
            salt: self.salt,
        }
    }

    /// Logical end of the data described by this snapshot
    pub fn end_pos(&self) -> u64 {
        self.start_pos + self.pos
    }
}

/// Index entry for a sealed, compressed chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDto {
    /// Name of the compressed artifact inside the log folder
    pub file_name: String,
    /// Logical position of the chunk's first byte
    pub start_pos: u64,
    /// Exact length of the buffer content this chunk replaces
    pub uncompressed_byte_size: u64,
    /// Size of the artifact on disk
    pub compressed_disk_size: u64,
    /// Number of records in the chunk
    pub records: u64,
}

impl ChunkDto {
    /// Logical position right after the chunk
    pub fn end_pos(&self) -> u64 {
        self.start_pos + self.uncompressed_byte_size
    }
}

/// Observed size maxima across all appended records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Largest key size reported by the caller
    pub max_key_size: u64,
    /// Largest payload appended
    pub max_val_size: u64,
}

impl Stats {
    /// Record a payload size
    pub fn observe_val(&mut self, size: u64) {
        self.max_val_size = self.max_val_size.max(size);
    }

    /// Record a key size
    pub fn observe_key(&mut self, size: u64) {
        self.max_key_size = self.max_key_size.max(size);
    }
}

/// File name of the buffer starting at `start_pos`
pub fn buffer_file_name(start_pos: u64) -> String {
    format!("{:012}", start_pos)
}

/// File name of the chunk artifact starting at `start_pos`
pub fn chunk_file_name(start_pos: u64) -> String {
    format!("{:012}.chunk", start_pos)
}

/// Read operations available inside any transaction
pub trait MetaRead {
    /// Current buffer descriptor, if one was ever persisted
    fn get_buffer(&self) -> Result<Option<BufferDto>>;

    /// All chunks, ordered by start position
    fn list_chunks(&self) -> Result<Vec<ChunkDto>>;

    /// Persisted statistics, if any
    fn get_stats(&self) -> Result<Option<Stats>>;

    /// Position stored under a user checkpoint name
    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>>;
}

/// Write operations available inside an update transaction
pub trait MetaWrite: MetaRead {
    /// Replace the current buffer descriptor
    fn put_buffer(&mut self, dto: &BufferDto) -> Result<()>;

    /// Insert a chunk into the index under `start_pos`
    fn add_chunk(&mut self, start_pos: u64, dto: &ChunkDto) -> Result<()>;

    /// Replace the persisted statistics
    fn put_stats(&mut self, stats: &Stats) -> Result<()>;

    /// Store a user checkpoint
    fn put_checkpoint(&mut self, name: &str, pos: u64) -> Result<()>;
}

/// Storage backend for cellar metadata.
///
/// Implementations must make `update` atomic and durable: either every
/// mutation made by the closure becomes visible, or none does.
pub trait MetaStore: Send + Sync + 'static {
    /// Run `op` in a read-only transaction
    fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn MetaRead) -> Result<T>;

    /// Run `op` in a read-write transaction, committing on `Ok`
    fn update<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn MetaWrite) -> Result<T>;

    /// Release the underlying storage.
    ///
    /// Waits for running transactions; every later `read` or `update`
    /// fails with [`CellarError::Closed`](crate::error::CellarError::Closed).
    fn close(&self);
}
