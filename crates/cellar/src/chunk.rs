//! Chunk artifacts
//!
//! A chunk is the immutable, compressed (and optionally encrypted) copy of
//! a sealed buffer. Its [`ChunkDto`] index entry records where it sits in
//! the logical stream; the artifact itself is a single file in the log
//! folder, written once through a temp file and never modified.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use crate::error::{CellarError, Result};
use crate::meta::ChunkDto;
use crate::transform::{ByteTransform, Cipher};

/// Write an artifact atomically (temp file, then rename), returning its size
pub(crate) fn persist(folder: &Path, file_name: &str, artifact: &[u8], sync: bool) -> Result<u64> {
    let path = folder.join(file_name);
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path).map_err(|e| CellarError::io("create chunk", e))?;
    file.write_all(artifact)
        .map_err(|e| CellarError::io("write chunk", e))?;
    if sync {
        file.sync_all()
            .map_err(|e| CellarError::io("sync chunk", e))?;
    }
    drop(file);

    fs::rename(&temp_path, &path).map_err(|e| CellarError::io("rename chunk", e))?;

    debug!(file = file_name, size = artifact.len(), "Persisted chunk artifact");
    Ok(artifact.len() as u64)
}

/// Read a chunk back to its plain segment content.
///
/// The decoded content must be exactly `uncompressed_byte_size` bytes long;
/// anything else means the artifact does not belong to this index entry.
pub fn load(
    folder: &Path,
    dto: &ChunkDto,
    compressor: &dyn ByteTransform,
    cipher: &dyn Cipher,
) -> Result<Bytes> {
    let artifact =
        fs::read(folder.join(&dto.file_name)).map_err(|e| CellarError::io("read chunk", e))?;

    let compressed = cipher.decode(&artifact)?;
    let content = compressor.decode(&compressed)?;

    if content.len() as u64 != dto.uncompressed_byte_size {
        return Err(CellarError::corrupt(
            dto.file_name.clone(),
            format!(
                "decoded {} bytes, index expects {}",
                content.len(),
                dto.uncompressed_byte_size
            ),
        ));
    }

    Ok(Bytes::from(content))
}
