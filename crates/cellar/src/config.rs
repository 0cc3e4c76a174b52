//! Cellar configuration

use std::path::PathBuf;
use std::sync::Arc;

use crate::transform::{ByteTransform, Cipher, Identity, Lz4};

/// Configuration for a cellar instance
#[derive(Debug, Clone)]
pub struct CellarConfig {
    /// Folder holding buffer files, chunk artifacts and the metadata database
    pub folder: PathBuf,
    /// Soft capacity of a buffer before it is sealed into a chunk
    pub max_buffer_size: u64,
    /// Whether `flush` forces data to stable storage (fsync) or only to the OS
    pub sync_on_flush: bool,
    /// Transform applied to whole segment contents when sealing
    pub compressor: Arc<dyn ByteTransform>,
    /// Cipher applied to live buffer writes and to the compressed chunk artifact
    pub cipher: Arc<dyn Cipher>,
}

impl Default for CellarConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("./data/cellar"),
            max_buffer_size: 64 * 1024 * 1024, // 64MB
            sync_on_flush: true,
            compressor: Arc::new(Lz4),
            cipher: Arc::new(Identity),
        }
    }
}

impl CellarConfig {
    /// Configuration for a log stored in `folder`, other settings default
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            ..Default::default()
        }
    }

    /// Set the buffer capacity
    pub fn with_max_buffer_size(mut self, max_buffer_size: u64) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Set whether flushes fsync
    pub fn with_sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    /// Set the chunk compressor
    pub fn with_compressor(mut self, compressor: impl ByteTransform + 'static) -> Self {
        self.compressor = Arc::new(compressor);
        self
    }

    /// Set the chunk cipher
    pub fn with_cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.cipher = Arc::new(cipher);
        self
    }
}
