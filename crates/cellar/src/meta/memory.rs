//! In-memory metadata store
//!
//! Suitable for tests and simulations. Updates run against a private copy
//! of the state that replaces the shared state only when the unit of work
//! succeeds, which gives the same all-or-nothing behaviour as a real
//! transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use super::{BufferDto, ChunkDto, MetaRead, MetaStore, MetaWrite, Stats};
use crate::error::{CellarError, Result};

#[derive(Debug, Clone, Default)]
struct MetaState {
    buffer: Option<BufferDto>,
    chunks: BTreeMap<u64, ChunkDto>,
    stats: Option<Stats>,
    checkpoints: HashMap<String, u64>,
}

impl MetaRead for MetaState {
    fn get_buffer(&self) -> Result<Option<BufferDto>> {
        Ok(self.buffer.clone())
    }

    fn list_chunks(&self) -> Result<Vec<ChunkDto>> {
        Ok(self.chunks.values().cloned().collect())
    }

    fn get_stats(&self) -> Result<Option<Stats>> {
        Ok(self.stats)
    }

    fn get_checkpoint(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.checkpoints.get(name).copied())
    }
}

impl MetaWrite for MetaState {
    fn put_buffer(&mut self, dto: &BufferDto) -> Result<()> {
        self.buffer = Some(dto.clone());
        Ok(())
    }

    fn add_chunk(&mut self, start_pos: u64, dto: &ChunkDto) -> Result<()> {
        self.chunks.insert(start_pos, dto.clone());
        Ok(())
    }

    fn put_stats(&mut self, stats: &Stats) -> Result<()> {
        self.stats = Some(*stats);
        Ok(())
    }

    fn put_checkpoint(&mut self, name: &str, pos: u64) -> Result<()> {
        self.checkpoints.insert(name.to_string(), pos);
        Ok(())
    }
}

/// Metadata store held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryMetaStore {
    state: Mutex<MetaState>,
    fail_commits: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryMetaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `update` fail at commit time (fault injection)
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of indexed chunks
    pub fn chunk_count(&self) -> usize {
        self.state.lock().map(|s| s.chunks.len()).unwrap_or(0)
    }
}

impl MetaStore for InMemoryMetaStore {
    fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn MetaRead) -> Result<T>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CellarError::Closed);
        }
        let state = self
            .state
            .lock()
            .map_err(|_| CellarError::Poisoned("metadata state"))?;
        op(&*state)
    }

    fn update<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn MetaWrite) -> Result<T>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CellarError::Closed);
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| CellarError::Poisoned("metadata state"))?;

        let mut draft = state.clone();
        let value = op(&mut draft)?;

        if self.fail_commits.load(Ordering::SeqCst) {
            trace!("Injected commit failure");
            return Err(CellarError::Database("injected commit failure".into()));
        }

        *state = draft;
        Ok(value)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
