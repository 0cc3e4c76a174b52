//! The single writer of a cellar
//!
//! The writer owns the live buffer and is the only component that mutates
//! the log. Appends go straight to the buffer file; when a record does not
//! fit, the buffer is sealed into a chunk and a fresh buffer takes over at
//! the next logical position.
//!
//! ## Durability
//!
//! Nothing written since the last [`Writer::checkpoint`] survives a restart:
//! reopening truncates the buffer file back to the persisted descriptor.
//! [`Writer::close`] does not checkpoint either; callers that want their
//! tail kept must checkpoint before closing.
//!
//! With a cipher configured, buffer files hold only ciphertext; each file
//! gets its own keystream, identified by its start position and a random
//! salt stored in the buffer descriptor.

use std::fs;
use std::mem;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::buffer::Buffer;
use crate::config::CellarConfig;
use crate::error::{CellarError, Result};
use crate::meta::{BufferDto, MetaStore, RedbMetaStore, Stats};
use crate::reader::{LiveMark, LiveSnapshot, Reader};
use crate::record::{MAX_VARINT_LEN, encode_varint};

/// Appends records to a cellar.
///
/// Not safe for concurrent callers; every mutating operation takes
/// `&mut self`. Use [`Writer::reader`] for concurrent reads.
pub struct Writer<M: MetaStore = RedbMetaStore> {
    config: CellarConfig,
    meta: Arc<M>,
    buffer: Buffer,
    stats: Stats,
    live: Arc<LiveMark>,
    encoding_buf: Vec<u8>,
}

impl Writer<RedbMetaStore> {
    /// Open the cellar in `config.folder`, creating it if needed
    #[instrument(skip_all, fields(folder = %config.folder.display()))]
    pub fn open(config: CellarConfig) -> Result<Self> {
        fs::create_dir_all(&config.folder)
            .map_err(|e| CellarError::io("create cellar folder", e))?;
        let meta = RedbMetaStore::open_in(&config.folder)?;
        Self::with_meta_store(config, Arc::new(meta))
    }
}

impl<M: MetaStore> Writer<M> {
    /// Open a cellar whose metadata lives in `meta`.
    ///
    /// Resumes from the persisted buffer descriptor, or starts an empty log
    /// at position 0 when there is none.
    pub fn with_meta_store(config: CellarConfig, meta: Arc<M>) -> Result<Self> {
        let (buffer, stats) = meta.update(|tx| {
            let stats = tx.get_stats()?.unwrap_or_default();
            let buffer = match tx.get_buffer()? {
                Some(dto) => Buffer::open(&dto, &config)?,
                None => {
                    let buffer = Buffer::create(0, &config)?;
                    tx.put_buffer(&buffer.state())?;
                    buffer
                }
            };
            Ok((buffer, stats))
        })?;

        info!(
            start_pos = buffer.start_pos(),
            pos = buffer.pos(),
            records = buffer.records(),
            "Cellar opened"
        );

        let live = Arc::new(LiveMark::new(snapshot_of(&buffer)));

        Ok(Self {
            config,
            meta,
            buffer,
            stats,
            live,
            encoding_buf: Vec::with_capacity(MAX_VARINT_LEN),
        })
    }

    /// Append one record, returning the logical end after it.
    ///
    /// On error the log is left as it was before the call.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        self.encoding_buf.clear();
        encode_varint(&mut self.encoding_buf, data.len() as i64);
        let size = (self.encoding_buf.len() + data.len()) as u64;

        if !self.buffer.fits(size) {
            self.seal_and_rotate()?;
        }

        let mark = self.buffer.pos();
        self.buffer
            .write_bytes(&self.encoding_buf, "write len prefix")?;
        if let Err(e) = self.buffer.write_bytes(data, "write body") {
            self.buffer.rewind_to(mark);
            return Err(e);
        }
        self.buffer.end_record();
        self.stats.observe_val(data.len() as u64);

        self.live.publish(snapshot_of(&self.buffer));
        Ok(self.buffer.end_pos())
    }

    /// Logical end of everything appended, checkpointed or not
    pub fn volatile_pos(&self) -> u64 {
        self.buffer.end_pos()
    }

    /// Make everything appended so far durable.
    ///
    /// Flushes the buffer, then persists its descriptor together with the
    /// stats in one transaction. Returns the durable logical end.
    pub fn checkpoint(&mut self) -> Result<u64> {
        self.buffer.flush()?;
        let state = self.buffer.state();
        let stats = self.stats;
        self.meta.update(|tx| {
            tx.put_buffer(&state)?;
            tx.put_stats(&stats)
        })?;

        debug!(pos = state.end_pos(), records = state.records, "Checkpoint");
        Ok(state.end_pos())
    }

    /// Record a consumer position under `name`
    pub fn put_user_checkpoint(&self, name: &str, pos: u64) -> Result<()> {
        self.meta.update(|tx| tx.put_checkpoint(name, pos))
    }

    /// Position last recorded under `name`, if any
    pub fn get_user_checkpoint(&self, name: &str) -> Result<Option<u64>> {
        self.meta.read(|tx| tx.get_checkpoint(name))
    }

    /// Track the size of a caller-side key
    pub fn observe_key_size(&mut self, size: u64) {
        self.stats.observe_key(size);
    }

    /// Observed record size maxima
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Descriptor of the live buffer as it stands in memory
    pub fn buffer_state(&self) -> BufferDto {
        self.buffer.state()
    }

    /// A reader over this cellar
    pub fn reader(&self) -> Reader<M> {
        Reader::new(
            self.config.folder.clone(),
            self.meta.clone(),
            self.config.compressor.clone(),
            self.config.cipher.clone(),
            self.live.clone(),
        )
    }

    /// The metadata store, for caller transactions
    pub fn meta(&self) -> &Arc<M> {
        &self.meta
    }

    /// Seal the live buffer into a chunk now.
    ///
    /// Does nothing when the buffer is empty.
    pub fn seal(&mut self) -> Result<()> {
        if self.buffer.pos() == 0 {
            return Ok(());
        }
        self.seal_and_rotate()
    }

    /// Release the metadata store and the buffer file.
    ///
    /// Does not flush or checkpoint: appends since the last checkpoint are
    /// dropped when the cellar is reopened. Readers obtained from this
    /// writer fail with [`CellarError::Closed`] afterwards, and the folder
    /// can be reopened while they are still alive.
    pub fn close(self) {
        self.meta.close();
        info!(volatile_pos = self.buffer.end_pos(), "Cellar closed");
    }

    #[instrument(skip_all, fields(start_pos = self.buffer.start_pos()))]
    fn seal_and_rotate(&mut self) -> Result<()> {
        self.buffer.flush()?;
        let chunk = self.buffer.compress()?;

        let next = Buffer::create(chunk.end_pos(), &self.config)?;
        let next_state = next.state();
        self.meta.update(|tx| {
            tx.add_chunk(chunk.start_pos, &chunk)?;
            tx.put_buffer(&next_state)
        })?;

        let old = mem::replace(&mut self.buffer, next);
        self.live.publish(snapshot_of(&self.buffer));

        let old_path = old.path().to_path_buf();
        drop(old);
        if let Err(e) = fs::remove_file(&old_path) {
            warn!(path = %old_path.display(), error = %e, "Failed to delete sealed buffer file");
        }

        info!(
            chunk = %chunk.file_name,
            uncompressed = chunk.uncompressed_byte_size,
            compressed = chunk.compressed_disk_size,
            records = chunk.records,
            next_start = self.buffer.start_pos(),
            "Sealed buffer into chunk"
        );
        Ok(())
    }
}

fn snapshot_of(buffer: &Buffer) -> LiveSnapshot {
    LiveSnapshot {
        start_pos: buffer.start_pos(),
        pos: buffer.pos(),
        salt: buffer.segment_id().salt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{InMemoryMetaStore, buffer_file_name};
    use crate::record::varint_len;
    use crate::transform::{ChaChaCipher, Identity, Lz4};
    use tempfile::TempDir;

    fn test_config(temp: &TempDir, max: u64) -> CellarConfig {
        CellarConfig::new(temp.path())
            .with_max_buffer_size(max)
            .with_sync_on_flush(false)
    }

    fn read_all<M: MetaStore>(writer: &Writer<M>, from: u64) -> Vec<Vec<u8>> {
        writer
            .reader()
            .scan(from)
            .unwrap()
            .map(|r| r.unwrap().data.to_vec())
            .collect()
    }

    #[test]
    fn test_basic_append_and_read() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024 * 1024)).unwrap();

        let p1 = writer.append(b"hello").unwrap();
        let p2 = writer.append(b"world").unwrap();
        assert_eq!(p1, 6);
        assert!(p2 > p1);
        assert_eq!(writer.volatile_pos(), p2);

        assert_eq!(read_all(&writer, 0), vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(read_all(&writer, p1), vec![b"world".to_vec()]);
        assert!(read_all(&writer, p2).is_empty());
    }

    #[test]
    fn test_forced_seal() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 16)).unwrap();

        let first = writer.append(&[0xAB; 20]).unwrap();
        assert_eq!(first, 21);
        assert!(writer.reader().chunks().unwrap().is_empty());

        writer.append(b"x").unwrap();
        let chunks = writer.reader().chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_pos, 0);
        assert_eq!(chunks[0].uncompressed_byte_size, 20 + varint_len(20) as u64);
        assert_eq!(writer.buffer_state().start_pos, 21);

        let records = read_all(&writer, 0);
        assert_eq!(records, vec![vec![0xAB; 20], b"x".to_vec()]);
    }

    #[test]
    fn test_seal_removes_old_buffer_file() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();

        writer.append(b"payload").unwrap();
        assert!(temp.path().join(buffer_file_name(0)).exists());

        writer.seal().unwrap();
        assert!(!temp.path().join(buffer_file_name(0)).exists());
        assert!(temp.path().join(buffer_file_name(8)).exists());
        assert_eq!(writer.reader().chunks().unwrap().len(), 1);

        // Empty buffer is left alone
        writer.seal().unwrap();
        assert_eq!(writer.reader().chunks().unwrap().len(), 1);
    }

    #[test]
    fn test_chunks_partition_the_log() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 64)).unwrap();

        let mut last = 0;
        for i in 0..200u32 {
            let pos = writer.append(format!("record-{}", i).as_bytes()).unwrap();
            assert!(pos > last);
            last = pos;
        }

        let chunks = writer.reader().chunks().unwrap();
        assert!(chunks.len() > 10);
        let mut expected_start = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start_pos, expected_start);
            expected_start = chunk.end_pos();
        }
        assert_eq!(writer.buffer_state().start_pos, expected_start);
        assert_eq!(writer.volatile_pos(), last);

        let records = read_all(&writer, 0);
        assert_eq!(records.len(), 200);
        assert_eq!(records[199], b"record-199".to_vec());
    }

    #[test]
    fn test_scan_resumes_from_record_positions() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 32)).unwrap();
        for i in 0..20u8 {
            writer.append(&[i; 9]).unwrap();
        }

        let reader = writer.reader();
        let all: Vec<_> = reader.scan(0).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 20);

        for (i, record) in all.iter().enumerate() {
            let rest: Vec<_> = reader
                .scan(record.start_pos)
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            assert_eq!(rest.len(), 20 - i);
            assert_eq!(rest[0], *record);
        }
        for pair in all.windows(2) {
            assert_eq!(pair[0].next_pos, pair[1].start_pos);
        }
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 64)).unwrap();

        let mut last = writer.checkpoint().unwrap();
        assert_eq!(last, 0);
        for i in 0..50u8 {
            writer.append(&[i; 7]).unwrap();
            let pos = writer.checkpoint().unwrap();
            assert!(pos > last);
            assert_eq!(pos, writer.volatile_pos());
            last = pos;
        }
    }

    #[test]
    fn test_user_checkpoint_survives_restart() {
        let temp = TempDir::new().unwrap();
        {
            let writer = Writer::open(test_config(&temp, 1024)).unwrap();
            assert_eq!(writer.get_user_checkpoint("consumerA").unwrap(), None);
            writer.put_user_checkpoint("consumerA", 123).unwrap();
            writer.close();
        }

        let writer = Writer::open(test_config(&temp, 1024)).unwrap();
        assert_eq!(writer.get_user_checkpoint("consumerA").unwrap(), Some(123));
        assert_eq!(writer.get_user_checkpoint("consumerB").unwrap(), None);
    }

    #[test]
    fn test_reopen_drops_uncheckpointed_tail() {
        let temp = TempDir::new().unwrap();
        let durable = {
            let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
            writer.append(b"kept").unwrap();
            writer.observe_key_size(12);
            let durable = writer.checkpoint().unwrap();
            writer.append(b"lost").unwrap();
            writer.close();
            durable
        };

        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
        assert_eq!(writer.volatile_pos(), durable);
        assert_eq!(writer.stats().max_key_size, 12);
        assert_eq!(writer.stats().max_val_size, 4);

        writer.append(b"next").unwrap();
        assert_eq!(read_all(&writer, 0), vec![b"kept".to_vec(), b"next".to_vec()]);
    }

    #[test]
    fn test_reopen_after_seal() {
        let temp = TempDir::new().unwrap();
        {
            let mut writer = Writer::open(test_config(&temp, 16)).unwrap();
            for i in 0..10u8 {
                writer.append(&[i; 10]).unwrap();
            }
            writer.checkpoint().unwrap();
        }

        let writer = Writer::open(test_config(&temp, 16)).unwrap();
        let records = read_all(&writer, 0);
        assert_eq!(records.len(), 10);
        assert_eq!(records[9], vec![9u8; 10]);
    }

    #[test]
    fn test_encrypted_compressed_chunks_read_back() {
        let temp = TempDir::new().unwrap();
        let key = [42u8; 32];
        let config = || {
            test_config(&temp, 128)
                .with_compressor(Lz4)
                .with_cipher(ChaChaCipher::new(key))
        };

        {
            let mut writer = Writer::open(config()).unwrap();
            for i in 0..40u32 {
                writer.append(format!("secret record {:04}", i).as_bytes()).unwrap();
            }
            writer.checkpoint().unwrap();
            assert!(!writer.reader().chunks().unwrap().is_empty());
        }

        let writer = Writer::open(config()).unwrap();
        let records = read_all(&writer, 0);
        assert_eq!(records.len(), 40);
        assert_eq!(records[17], b"secret record 0017".to_vec());

        // Chunk artifacts are not plain text on disk
        let chunk = &writer.reader().chunks().unwrap()[0];
        let raw = fs::read(temp.path().join(&chunk.file_name)).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_wrong_key_fails_chunk_read() {
        let temp = TempDir::new().unwrap();
        {
            let mut writer =
                Writer::open(test_config(&temp, 16).with_cipher(ChaChaCipher::new([1u8; 32])))
                    .unwrap();
            writer.append(&[5u8; 20]).unwrap();
            writer.seal().unwrap();
            writer.checkpoint().unwrap();
        }

        let writer =
            Writer::open(test_config(&temp, 16).with_cipher(ChaChaCipher::new([2u8; 32]))).unwrap();
        let mut scan = writer.reader().scan(0).unwrap();
        assert!(matches!(scan.next(), Some(Err(CellarError::Transform(_)))));
        assert!(scan.next().is_none());
    }

    #[test]
    fn test_failed_seal_keeps_old_buffer() {
        let temp = TempDir::new().unwrap();
        let meta = Arc::new(InMemoryMetaStore::new());
        let config = test_config(&temp, 16).with_compressor(Identity);
        let mut writer = Writer::with_meta_store(config, meta.clone()).unwrap();

        writer.append(&[1u8; 20]).unwrap();
        let before = writer.volatile_pos();

        meta.fail_commits(true);
        assert!(writer.append(b"second").is_err());
        assert_eq!(writer.volatile_pos(), before);
        assert_eq!(writer.buffer_state().start_pos, 0);
        assert_eq!(meta.chunk_count(), 0);
        assert_eq!(read_all(&writer, 0), vec![vec![1u8; 20]]);

        meta.fail_commits(false);
        writer.append(b"second").unwrap();
        assert_eq!(meta.chunk_count(), 1);
        assert_eq!(
            read_all(&writer, 0),
            vec![vec![1u8; 20], b"second".to_vec()]
        );
    }

    #[test]
    fn test_stats_track_maxima() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
        writer.append(&[0u8; 30]).unwrap();
        writer.append(&[0u8; 10]).unwrap();
        writer.observe_key_size(8);
        writer.observe_key_size(3);

        let stats = writer.stats();
        assert_eq!(stats.max_val_size, 30);
        assert_eq!(stats.max_key_size, 8);
    }

    #[test]
    fn test_meta_access_for_caller_transactions() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
        writer.append(b"abc").unwrap();
        writer.checkpoint().unwrap();

        let persisted = writer.meta().read(|tx| tx.get_buffer()).unwrap().unwrap();
        assert_eq!(persisted, writer.buffer_state());
    }

    #[test]
    fn test_buffer_file_holds_no_plaintext() {
        let temp = TempDir::new().unwrap();
        let config = || test_config(&temp, 1024).with_cipher(ChaChaCipher::new([7u8; 32]));

        {
            let mut writer = Writer::open(config()).unwrap();
            writer.append(b"TOP-SECRET-PAYLOAD").unwrap();
            writer.checkpoint().unwrap();

            let raw = fs::read(temp.path().join(buffer_file_name(0))).unwrap();
            assert_eq!(raw.len(), 19);
            assert!(!raw.windows(6).any(|w| w == b"SECRET"));
            assert_eq!(read_all(&writer, 0), vec![b"TOP-SECRET-PAYLOAD".to_vec()]);
            writer.close();
        }

        // The keystream salt is recovered from the descriptor
        let mut writer = Writer::open(config()).unwrap();
        writer.append(b"more").unwrap();
        assert_eq!(
            read_all(&writer, 0),
            vec![b"TOP-SECRET-PAYLOAD".to_vec(), b"more".to_vec()]
        );

        writer.seal().unwrap();
        assert_eq!(
            read_all(&writer, 0),
            vec![b"TOP-SECRET-PAYLOAD".to_vec(), b"more".to_vec()]
        );
    }

    #[test]
    fn test_close_releases_store_with_live_readers() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
        writer.append(b"abc").unwrap();
        writer.checkpoint().unwrap();
        writer.put_user_checkpoint("consumerA", 123).unwrap();

        let reader = writer.reader();
        writer.close();

        assert!(matches!(reader.chunks(), Err(CellarError::Closed)));
        assert!(reader.scan(0).is_err());

        let reopened = Writer::open(test_config(&temp, 1024)).unwrap();
        assert_eq!(reopened.get_user_checkpoint("consumerA").unwrap(), Some(123));
        assert_eq!(read_all(&reopened, 0), vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_failed_body_write_rolls_back_prefix() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
        writer.append(b"first").unwrap();
        let before = writer.volatile_pos();
        let path = temp.path().join(buffer_file_name(0));

        // Length prefix succeeds, body fails
        writer.buffer.fail_writes_after(1);
        let result = writer.append(b"second");
        assert!(matches!(result, Err(CellarError::Io { op: "write body", .. })));
        assert_eq!(writer.volatile_pos(), before);
        assert_eq!(writer.buffer_state().records, 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
        assert_eq!(read_all(&writer, 0), vec![b"first".to_vec()]);

        // Prefix fails
        writer.buffer.fail_writes_after(0);
        assert!(writer.append(b"second").is_err());
        assert_eq!(writer.volatile_pos(), before);

        writer.buffer.fail_writes_after(u32::MAX);
        writer.append(b"second").unwrap();
        assert_eq!(
            read_all(&writer, 0),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn test_seal_survives_failed_delete() {
        let temp = TempDir::new().unwrap();
        let mut writer = Writer::open(test_config(&temp, 1024)).unwrap();
        writer.append(b"orphan").unwrap();

        // Deleting after the seal then fails with NotFound
        fs::remove_file(temp.path().join(buffer_file_name(0))).unwrap();
        writer.seal().unwrap();

        let chunks = writer.reader().chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].uncompressed_byte_size, 7);
        assert_eq!(writer.buffer_state().start_pos, 7);
        assert_eq!(read_all(&writer, 0), vec![b"orphan".to_vec()]);
    }
}
