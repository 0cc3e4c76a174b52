//! The active, appendable segment
//!
//! A buffer owns one physical file named after its logical start position.
//! Every write passes through the configured cipher's keystream at its
//! byte offset, so the file is exactly as long as the records it holds.
//! When the buffer is sealed its full content is read back, decrypted,
//! transformed and persisted as a chunk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::chunk;
use crate::config::CellarConfig;
use crate::error::{CellarError, Result};
use crate::meta::{BufferDto, ChunkDto, chunk_file_name};
use crate::transform::{ByteTransform, Cipher, SegmentId};

/// Mutable segment that accepts appends
#[derive(Debug)]
pub struct Buffer {
    start_pos: u64,
    pos: u64,
    max_bytes: u64,
    records: u64,
    salt: u64,
    file_name: String,
    folder: PathBuf,
    path: PathBuf,
    file: File,
    sync_on_flush: bool,
    compressor: Arc<dyn ByteTransform>,
    cipher: Arc<dyn Cipher>,
    scratch: Vec<u8>,
    #[cfg(test)]
    fail_writes_after: Option<u32>,
}

impl Buffer {
    /// Create an empty buffer starting at `start_pos`
    pub fn create(start_pos: u64, config: &CellarConfig) -> Result<Self> {
        Self::open(&BufferDto::new(start_pos, config.max_buffer_size), config)
    }

    /// Open the buffer described by `dto`.
    ///
    /// Bytes in the file beyond `dto.pos` were never covered by a persisted
    /// descriptor and are cut off, so appends continue at the recovered end.
    pub fn open(dto: &BufferDto, config: &CellarConfig) -> Result<Self> {
        let path = config.folder.join(&dto.file_name);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CellarError::io("open buffer", e))?;

        let file_len = file
            .metadata()
            .map_err(|e| CellarError::io("stat buffer", e))?
            .len();

        if file_len < dto.pos {
            return Err(CellarError::corrupt(
                dto.file_name.clone(),
                format!(
                    "file holds {} bytes, descriptor expects {}",
                    file_len, dto.pos
                ),
            ));
        }

        if file_len > dto.pos {
            warn!(
                file = %dto.file_name,
                persisted = dto.pos,
                on_disk = file_len,
                "Discarding buffer bytes written after the last checkpoint"
            );
            file.set_len(dto.pos)
                .map_err(|e| CellarError::io("truncate buffer", e))?;
        }

        file.seek(SeekFrom::Start(dto.pos))
            .map_err(|e| CellarError::io("seek buffer", e))?;

        debug!(
            file = %dto.file_name,
            start_pos = dto.start_pos,
            pos = dto.pos,
            records = dto.records,
            "Buffer opened"
        );

        Ok(Self {
            start_pos: dto.start_pos,
            pos: dto.pos,
            max_bytes: dto.max_bytes,
            records: dto.records,
            salt: dto.salt,
            file_name: dto.file_name.clone(),
            folder: config.folder.clone(),
            path,
            file,
            sync_on_flush: config.sync_on_flush,
            compressor: config.compressor.clone(),
            cipher: config.cipher.clone(),
            scratch: Vec::new(),
            #[cfg(test)]
            fail_writes_after: None,
        })
    }

    /// Whether `n` more bytes can be written.
    ///
    /// The first write is always admitted, whatever its size.
    pub fn fits(&self, n: u64) -> bool {
        self.pos == 0 || self.pos + n <= self.max_bytes
    }

    /// Append bytes through the cipher; `pos` advances only if the whole
    /// write succeeds
    pub fn write_bytes(&mut self, bytes: &[u8], op: &'static str) -> Result<()> {
        #[cfg(test)]
        if let Some(remaining) = self.fail_writes_after.as_mut() {
            if *remaining == 0 {
                return Err(CellarError::io(op, std::io::Error::other("injected write failure")));
            }
            *remaining -= 1;
        }

        let segment = self.segment_id();
        self.scratch.clear();
        self.scratch.extend_from_slice(bytes);
        self.cipher.encode_at(segment, self.pos, &mut self.scratch)?;

        if let Err(e) = self.file.write_all(&self.scratch) {
            self.rewind_to(self.pos);
            return Err(CellarError::io(op, e));
        }
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// Cut the buffer back to `pos`, dropping a partially written record.
    ///
    /// Failures are logged; the next write reports them if the file is
    /// really unusable.
    pub(crate) fn rewind_to(&mut self, pos: u64) {
        self.pos = pos.min(self.pos);
        let pos = self.pos;
        let result = self
            .file
            .set_len(pos)
            .and_then(|_| self.file.seek(SeekFrom::Start(pos)).map(|_| ()));
        if let Err(e) = result {
            warn!(file = %self.file_name, pos, error = %e, "Failed to rewind buffer after write error");
        }
    }

    /// Count one complete record
    pub fn end_record(&mut self) {
        self.records += 1;
    }

    /// Force written bytes to stable storage
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| CellarError::io("flush buffer", e))?;
        if self.sync_on_flush {
            self.file
                .sync_data()
                .map_err(|e| CellarError::io("sync buffer", e))?;
        }
        Ok(())
    }

    /// Seal the content into a chunk artifact and describe it.
    ///
    /// Reads through the open handle, so it works even if the file was
    /// unlinked. Leaves the buffer untouched; the caller discards it once
    /// the chunk is indexed.
    pub fn compress(&self) -> Result<ChunkDto> {
        let content = self.read_plain()?;

        let compressed = self.compressor.encode(&content)?;
        let sealed = self.cipher.encode(&compressed)?;

        let file_name = chunk_file_name(self.start_pos);
        let compressed_disk_size =
            chunk::persist(&self.folder, &file_name, &sealed, self.sync_on_flush)?;

        debug!(
            file = %file_name,
            uncompressed = self.pos,
            compressed = compressed_disk_size,
            records = self.records,
            "Compressed buffer"
        );

        Ok(ChunkDto {
            file_name,
            start_pos: self.start_pos,
            uncompressed_byte_size: self.pos,
            compressed_disk_size,
            records: self.records,
        })
    }

    fn read_plain(&self) -> Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| CellarError::io("seek buffer", e))?;

        let mut content = Vec::with_capacity(self.pos as usize);
        let read = file.take(self.pos).read_to_end(&mut content);
        let restored = file.seek(SeekFrom::Start(self.pos));
        read.map_err(|e| CellarError::io("read buffer", e))?;
        restored.map_err(|e| CellarError::io("seek buffer", e))?;

        if content.len() as u64 != self.pos {
            return Err(CellarError::corrupt(
                self.file_name.clone(),
                format!("read {} bytes, expected {}", content.len(), self.pos),
            ));
        }

        self.cipher.decode_at(self.segment_id(), 0, &mut content)?;
        Ok(content)
    }

    /// Persistable snapshot of the buffer
    pub fn state(&self) -> BufferDto {
        BufferDto {
            start_pos: self.start_pos,
            pos: self.pos,
            max_bytes: self.max_bytes,
            records: self.records,
            file_name: self.file_name.clone(),
            salt: self.salt,
        }
    }

    /// Keystream identity of the buffer file
    pub fn segment_id(&self) -> SegmentId {
        SegmentId {
            start_pos: self.start_pos,
            salt: self.salt,
        }
    }

    /// Logical position of the first byte
    pub fn start_pos(&self) -> u64 {
        self.start_pos
    }

    /// Bytes written so far
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Logical end of everything written
    pub fn end_pos(&self) -> u64 {
        self.start_pos + self.pos
    }

    /// Number of complete records
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Path of the physical file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Let the next `n` writes succeed, then fail every write after them
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&mut self, n: u32) {
        self.fail_writes_after = Some(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{ChaChaCipher, Identity};
    use tempfile::TempDir;

    fn test_config(temp: &TempDir, max: u64) -> CellarConfig {
        CellarConfig::new(temp.path())
            .with_max_buffer_size(max)
            .with_compressor(Identity)
    }

    #[test]
    fn test_first_write_always_fits() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(0, &test_config(&temp, 16)).unwrap();

        assert!(buffer.fits(1000));
        buffer.write_bytes(&[7u8; 20], "write body").unwrap();
        buffer.end_record();

        assert_eq!(buffer.pos(), 20);
        assert!(!buffer.fits(1));
    }

    #[test]
    fn test_capacity_boundary() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(0, &test_config(&temp, 16)).unwrap();

        buffer.write_bytes(&[1u8; 10], "write body").unwrap();
        assert!(buffer.fits(6));
        assert!(!buffer.fits(7));
    }

    #[test]
    fn test_state_snapshot() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(500, &test_config(&temp, 64)).unwrap();
        buffer.write_bytes(b"abc", "write body").unwrap();
        buffer.end_record();

        let state = buffer.state();
        assert_eq!(state.start_pos, 500);
        assert_eq!(state.pos, 3);
        assert_eq!(state.records, 1);
        assert_eq!(state.max_bytes, 64);
        assert_eq!(state.file_name, "000000000500");
        assert_eq!(buffer.end_pos(), 503);
        assert!(buffer.path().ends_with("000000000500"));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(0, &test_config(&temp, 64)).unwrap();
        buffer.flush().unwrap();
        buffer.write_bytes(b"x", "write body").unwrap();
        buffer.flush().unwrap();
        buffer.flush().unwrap();
    }

    #[test]
    fn test_compress_does_not_mutate() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 64);
        let mut buffer = Buffer::create(32, &config).unwrap();
        buffer.write_bytes(b"hello", "write body").unwrap();
        buffer.end_record();
        buffer.flush().unwrap();

        let chunk = buffer.compress().unwrap();
        assert_eq!(chunk.start_pos, 32);
        assert_eq!(chunk.uncompressed_byte_size, 5);
        assert_eq!(chunk.records, 1);
        assert_eq!(chunk.file_name, "000000000032.chunk");
        assert_eq!(buffer.state().pos, 5);
        assert!(buffer.path().exists());

        let content = chunk::load(temp.path(), &chunk, &Identity, &Identity).unwrap();
        assert_eq!(&content[..], b"hello");
    }

    #[test]
    fn test_reopen_truncates_unpersisted_tail() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 64);

        let persisted = {
            let mut buffer = Buffer::create(0, &config).unwrap();
            buffer.write_bytes(b"kept", "write body").unwrap();
            buffer.end_record();
            let state = buffer.state();
            buffer.write_bytes(b"lost", "write body").unwrap();
            buffer.flush().unwrap();
            state
        };

        let mut buffer = Buffer::open(&persisted, &config).unwrap();
        assert_eq!(buffer.pos(), 4);
        assert_eq!(std::fs::metadata(buffer.path()).unwrap().len(), 4);

        buffer.write_bytes(b"next", "write body").unwrap();
        assert_eq!(std::fs::read(buffer.path()).unwrap(), b"keptnext");
    }

    #[test]
    fn test_reopen_short_file_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 64);
        let mut dto = BufferDto::new(0, 64);
        dto.pos = 10;

        let result = Buffer::open(&dto, &config);
        assert!(matches!(result, Err(CellarError::Corrupt { .. })));
    }

    #[test]
    fn test_failed_write_leaves_buffer_unchanged() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(0, &test_config(&temp, 64)).unwrap();
        buffer.write_bytes(b"before", "write body").unwrap();
        buffer.end_record();

        // A read-only handle rejects every write
        buffer.file = File::open(buffer.path()).unwrap();
        let result = buffer.write_bytes(b"after", "write body");

        assert!(matches!(result, Err(CellarError::Io { op: "write body", .. })));
        assert_eq!(buffer.pos(), 6);
        assert_eq!(buffer.records(), 1);
        assert_eq!(std::fs::metadata(buffer.path()).unwrap().len(), 6);
    }

    #[test]
    fn test_injected_write_failure() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(0, &test_config(&temp, 64)).unwrap();
        buffer.fail_writes_after(1);

        buffer.write_bytes(b"one", "write len prefix").unwrap();
        assert!(buffer.write_bytes(b"two", "write body").is_err());
        assert_eq!(buffer.pos(), 3);
    }

    #[test]
    fn test_encrypted_buffer_holds_no_plaintext() {
        let temp = TempDir::new().unwrap();
        let cipher = ChaChaCipher::new([7u8; 32]);
        let config = test_config(&temp, 1024).with_cipher(cipher.clone());

        let mut buffer = Buffer::create(0, &config).unwrap();
        buffer.write_bytes(b"TOP-SECRET", "write len prefix").unwrap();
        buffer.write_bytes(b"-PAYLOAD", "write body").unwrap();
        buffer.end_record();
        buffer.flush().unwrap();

        let on_disk = std::fs::read(buffer.path()).unwrap();
        assert_eq!(on_disk.len(), 18);
        assert!(!on_disk.windows(6).any(|w| w == b"SECRET"));

        let chunk = buffer.compress().unwrap();
        let content = chunk::load(temp.path(), &chunk, &Identity, &cipher).unwrap();
        assert_eq!(&content[..], b"TOP-SECRET-PAYLOAD");
    }

    #[test]
    fn test_compress_reads_unlinked_file() {
        let temp = TempDir::new().unwrap();
        let mut buffer = Buffer::create(0, &test_config(&temp, 64)).unwrap();
        buffer.write_bytes(b"survivor", "write body").unwrap();
        buffer.end_record();
        std::fs::remove_file(buffer.path()).unwrap();

        let chunk = buffer.compress().unwrap();
        let content = chunk::load(temp.path(), &chunk, &Identity, &Identity).unwrap();
        assert_eq!(&content[..], b"survivor");

        // The write cursor is back at the end
        buffer.write_bytes(b"!", "write body").unwrap();
        assert_eq!(buffer.pos(), 9);
    }
}
