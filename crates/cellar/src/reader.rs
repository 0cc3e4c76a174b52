//! Reading the logical stream
//!
//! A scan walks every sealed chunk in logical order and then the live
//! buffer. Chunks are immutable once indexed, so they are read without any
//! coordination. The live buffer is read up to a watermark the writer
//! publishes after each complete record.
//!
//! ## Racing a seal
//!
//! The watermark is taken before the chunk index is listed. If the writer
//! seals the live buffer in between, the listing already contains the chunk
//! that replaced it and the scan reads that chunk instead, bounded by the
//! watermark. If the seal lands after listing and the buffer file is gone
//! by the time it is opened, the index is consulted again.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chunk;
use crate::error::{CellarError, Result};
use crate::meta::{ChunkDto, MetaStore, RedbMetaStore, buffer_file_name};
use crate::record::{Record, SegmentCursor};
use crate::transform::{ByteTransform, Cipher, SegmentId};

/// Readable extent of the live buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSnapshot {
    /// Logical start of the live buffer
    pub start_pos: u64,
    /// Bytes of complete records written to it
    pub pos: u64,
    /// Keystream salt of the live buffer file
    pub salt: u64,
}

impl LiveSnapshot {
    /// Logical end of the readable data
    pub fn end_pos(&self) -> u64 {
        self.start_pos + self.pos
    }

    fn segment_id(&self) -> SegmentId {
        SegmentId {
            start_pos: self.start_pos,
            salt: self.salt,
        }
    }
}

/// Watermark shared between the writer and its readers
#[derive(Debug, Default)]
pub(crate) struct LiveMark {
    inner: RwLock<LiveSnapshot>,
}

impl LiveMark {
    pub(crate) fn new(snapshot: LiveSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub(crate) fn publish(&self, snapshot: LiveSnapshot) {
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    pub(crate) fn snapshot(&self) -> Result<LiveSnapshot> {
        self.inner
            .read()
            .map(|guard| *guard)
            .map_err(|_| CellarError::Poisoned("live watermark"))
    }
}

#[derive(Debug, Clone)]
enum Source {
    Chunk(ChunkDto),
    Live(LiveSnapshot),
}

#[derive(Debug)]
struct ScanPlan {
    from_pos: u64,
    end_pos: u64,
    sources: VecDeque<Source>,
}

/// Read access to a cellar.
///
/// Cheap to clone; any number of readers may run alongside the writer.
pub struct Reader<M: MetaStore = RedbMetaStore> {
    folder: PathBuf,
    meta: Arc<M>,
    compressor: Arc<dyn ByteTransform>,
    cipher: Arc<dyn Cipher>,
    live: Arc<LiveMark>,
}

impl<M: MetaStore> Clone for Reader<M> {
    fn clone(&self) -> Self {
        Self {
            folder: self.folder.clone(),
            meta: self.meta.clone(),
            compressor: self.compressor.clone(),
            cipher: self.cipher.clone(),
            live: self.live.clone(),
        }
    }
}

impl<M: MetaStore> Reader<M> {
    pub(crate) fn new(
        folder: PathBuf,
        meta: Arc<M>,
        compressor: Arc<dyn ByteTransform>,
        cipher: Arc<dyn Cipher>,
        live: Arc<LiveMark>,
    ) -> Self {
        Self {
            folder,
            meta,
            compressor,
            cipher,
            live,
        }
    }

    /// The chunk index, ordered by start position
    pub fn chunks(&self) -> Result<Vec<ChunkDto>> {
        self.meta.read(|tx| tx.list_chunks())
    }

    /// Logical end of everything currently readable
    pub fn end_pos(&self) -> Result<u64> {
        Ok(self.live.snapshot()?.end_pos())
    }

    /// Scan records starting at `from_pos`.
    ///
    /// `from_pos` must be 0 or a position previously returned by the writer
    /// or by a record's `next_pos`. The scan ends at the log end observed
    /// now; records appended later are not included.
    pub fn scan(&self, from_pos: u64) -> Result<Scan<M>> {
        let plan = self.plan(from_pos)?;
        debug!(
            from_pos,
            end_pos = plan.end_pos,
            segments = plan.sources.len(),
            "Starting scan"
        );
        Ok(Scan {
            reader: self.clone(),
            plan,
            cursor: None,
            failed: false,
        })
    }

    /// Scan the whole log on a background task.
    ///
    /// See [`Reader::scan_async_from`].
    pub fn scan_async(&self, token: CancellationToken, buffer_depth: usize) -> AsyncScan {
        self.scan_async_from(0, token, buffer_depth)
    }

    /// Scan from `from_pos` on a background task.
    ///
    /// Records are delivered through a bounded queue of `buffer_depth`
    /// entries. Cancelling `token`, calling [`AsyncScan::cancel`] or dropping
    /// the returned handle stops delivery and ends the task. Must be called
    /// from within a tokio runtime.
    pub fn scan_async_from(
        &self,
        from_pos: u64,
        token: CancellationToken,
        buffer_depth: usize,
    ) -> AsyncScan {
        let (records_tx, records_rx) = mpsc::channel(buffer_depth.max(1));
        let (error_tx, error_rx) = oneshot::channel();
        let token = token.child_token();

        let reader = self.clone();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = reader.stream(from_pos, records_tx, task_token).await {
                debug!(error = %e, "Async scan failed");
                let _ = error_tx.send(e);
            }
        });

        AsyncScan {
            records: records_rx,
            errors: error_rx,
            token,
            task,
            done: false,
        }
    }

    async fn stream(
        self,
        from_pos: u64,
        records: mpsc::Sender<Record>,
        token: CancellationToken,
    ) -> Result<()> {
        let planner = self.clone();
        let mut plan = blocking(move || planner.plan(from_pos)).await?;
        let end_pos = plan.end_pos;

        while let Some(source) = plan.sources.pop_front() {
            if token.is_cancelled() {
                break;
            }

            let loader = self.clone();
            let cursor = blocking(move || loader.open_source(&source, from_pos, end_pos)).await?;

            for item in cursor {
                let record = item?;
                if record.start_pos < from_pos {
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        trace!("Async scan cancelled");
                        return Ok(());
                    }
                    sent = records.send(record) => {
                        if sent.is_err() {
                            trace!("Async scan receiver dropped");
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn plan(&self, from_pos: u64) -> Result<ScanPlan> {
        // Watermark first: every chunk below it is already indexed.
        let live = self.live.snapshot()?;
        let end_pos = live.end_pos();

        let mut sources: VecDeque<Source> = self
            .chunks()?
            .into_iter()
            .filter(|c| c.end_pos() > from_pos && c.start_pos < end_pos)
            .map(Source::Chunk)
            .collect();

        let sealed_since = matches!(
            sources.back(),
            Some(Source::Chunk(c)) if c.start_pos == live.start_pos
        );
        if !sealed_since && end_pos > from_pos && live.pos > 0 {
            sources.push_back(Source::Live(live));
        }

        Ok(ScanPlan {
            from_pos,
            end_pos,
            sources,
        })
    }

    fn open_source(&self, source: &Source, from_pos: u64, end_pos: u64) -> Result<SegmentCursor> {
        match source {
            Source::Chunk(dto) => self.open_chunk(dto, end_pos),
            Source::Live(live) => match self.open_live(live, from_pos) {
                Err(e) if e.is_not_found() => {
                    // Sealed after planning; its chunk holds the same bytes.
                    let dto = self
                        .chunks()?
                        .into_iter()
                        .find(|c| c.start_pos == live.start_pos)
                        .ok_or(e)?;
                    trace!(start_pos = dto.start_pos, "Live buffer sealed during scan");
                    self.open_chunk(&dto, end_pos)
                }
                other => other,
            },
        }
    }

    fn open_chunk(&self, dto: &ChunkDto, end_pos: u64) -> Result<SegmentCursor> {
        let content = chunk::load(
            &self.folder,
            dto,
            self.compressor.as_ref(),
            self.cipher.as_ref(),
        )?;

        let limit = end_pos.min(dto.end_pos()) - dto.start_pos;
        let truncated = limit < dto.uncompressed_byte_size;
        let data = content.slice(..limit as usize);

        Ok(SegmentCursor::new(
            dto.file_name.clone(),
            dto.start_pos,
            dto.start_pos,
            data,
            truncated,
        ))
    }

    fn open_live(&self, live: &LiveSnapshot, from_pos: u64) -> Result<SegmentCursor> {
        let file_name = buffer_file_name(live.start_pos);
        let offset = from_pos.saturating_sub(live.start_pos).min(live.pos);

        let mut file = File::open(self.folder.join(&file_name))
            .map_err(|e| CellarError::io("open live buffer", e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CellarError::io("seek live buffer", e))?;

        let mut data = Vec::with_capacity((live.pos - offset) as usize);
        file.take(live.pos - offset)
            .read_to_end(&mut data)
            .map_err(|e| CellarError::io("read live buffer", e))?;
        self.cipher.decode_at(live.segment_id(), offset, &mut data)?;

        Ok(SegmentCursor::new(
            file_name,
            live.start_pos,
            live.start_pos + offset,
            Bytes::from(data),
            true,
        ))
    }
}

async fn blocking<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op).await?
}

/// Lazy, synchronous scan over the log
pub struct Scan<M: MetaStore = RedbMetaStore> {
    reader: Reader<M>,
    plan: ScanPlan,
    cursor: Option<SegmentCursor>,
    failed: bool,
}

impl<M: MetaStore> Scan<M> {
    /// Logical end this scan stops at
    pub fn end_pos(&self) -> u64 {
        self.plan.end_pos
    }
}

impl<M: MetaStore> Iterator for Scan<M> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }

            if let Some(cursor) = self.cursor.as_mut() {
                match cursor.next() {
                    Some(Ok(record)) if record.start_pos < self.plan.from_pos => continue,
                    Some(Ok(record)) => return Some(Ok(record)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.cursor = None,
                }
            }

            let source = self.plan.sources.pop_front()?;
            match self
                .reader
                .open_source(&source, self.plan.from_pos, self.plan.end_pos)
            {
                Ok(cursor) => self.cursor = Some(cursor),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Handle to a background scan
///
/// Records arrive in logical order through [`AsyncScan::recv`]; a failure
/// on the producing task is reported once, after the last record it
/// delivered.
pub struct AsyncScan {
    records: mpsc::Receiver<Record>,
    errors: oneshot::Receiver<CellarError>,
    token: CancellationToken,
    task: JoinHandle<()>,
    done: bool,
}

impl AsyncScan {
    /// Next record, an error from the producer, or `None` once the scan is
    /// exhausted or cancelled
    pub async fn recv(&mut self) -> Option<Result<Record>> {
        if self.done || self.token.is_cancelled() {
            self.stop();
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            record = self.records.recv() => Some(record),
        };

        match next {
            None => {
                self.stop();
                None
            }
            Some(Some(record)) => Some(Ok(record)),
            Some(None) => {
                self.done = true;
                (&mut self.errors).await.ok().map(Err)
            }
        }
    }

    /// Stop delivery; no record is returned by `recv` afterwards
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the producing task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop receiving, wait for the producer to exit and report its error
    pub async fn finish(mut self) -> Result<()> {
        self.records.close();
        (&mut self.task).await?;
        match self.errors.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.done = true;
        self.records.close();
    }
}

impl Drop for AsyncScan {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
