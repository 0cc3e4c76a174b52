//! Pluggable byte transforms
//!
//! A cellar applies two transforms when a buffer is sealed into a chunk: a
//! compressor over the whole segment content, then a cipher over the
//! compressed artifact. Both are [`ByteTransform`] trait objects, so the
//! writer and buffer never depend on a concrete algorithm.
//!
//! The cipher also covers every physical write to a live buffer. Those
//! writes go through [`Cipher::encode_at`], which must preserve length and
//! be addressable by byte offset so readers can decrypt any record in
//! place.
//!
//! ## Bundled transforms
//!
//! - [`Identity`]: passes bytes through unchanged
//! - [`Lz4`]: LZ4 block compression with a size prefix
//! - [`ChaChaCipher`]: ChaCha20-Poly1305 AEAD for chunks, nonce prefixed to
//!   the output; XChaCha20 keystream for live buffers

use std::fmt;

use chacha20::{Key, XChaCha20, XNonce};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;

use crate::error::{CellarError, Result};

/// Size of the ChaCha20-Poly1305 nonce prepended to encrypted chunks.
pub const NONCE_SIZE: usize = 12;

/// Size of a cipher key (256 bits).
pub const KEY_SIZE: usize = 32;

const LIVE_NONCE_SIZE: usize = 24;
const LIVE_NONCE_TAG: &[u8; 8] = b"cellarbf";

/// A reversible transform applied to whole segment contents.
///
/// `decode(encode(x))` must return `x`, and neither call may have side
/// effects beyond the returned bytes.
pub trait ByteTransform: fmt::Debug + Send + Sync {
    /// Transform plain bytes into their stored form
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Recover plain bytes from their stored form
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identifies the keystream of one live buffer file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId {
    /// Logical start of the buffer
    pub start_pos: u64,
    /// Random value chosen when the buffer was created
    pub salt: u64,
}

/// A [`ByteTransform`] that can also encrypt live buffer bytes in place.
///
/// `encode_at`/`decode_at` transform `data` as if it sat at `offset` in the
/// buffer identified by `segment`. Output length equals input length, and
/// transforming a range in pieces gives the same bytes as doing it at once.
pub trait Cipher: ByteTransform {
    /// Encrypt `data` in place
    fn encode_at(&self, segment: SegmentId, offset: u64, data: &mut [u8]) -> Result<()>;

    /// Decrypt `data` in place
    fn decode_at(&self, segment: SegmentId, offset: u64, data: &mut [u8]) -> Result<()>;
}

/// No-op transform
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ByteTransform for Identity {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl Cipher for Identity {
    fn encode_at(&self, _segment: SegmentId, _offset: u64, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn decode_at(&self, _segment: SegmentId, _offset: u64, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

/// LZ4 block compression.
///
/// The uncompressed length is prepended so decoding can size its output
/// without trusting external metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4;

impl ByteTransform for Lz4 {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CellarError::transform(format!("lz4 decompress: {}", e)))
    }
}

/// ChaCha20-Poly1305 authenticated encryption.
///
/// Output layout is `nonce || ciphertext`, with a fresh random nonce per
/// encoded artifact. Live buffer bytes are XORed with an XChaCha20
/// keystream whose nonce is derived from the buffer's [`SegmentId`].
#[derive(Clone)]
pub struct ChaChaCipher {
    key: [u8; KEY_SIZE],
}

impl ChaChaCipher {
    /// Create a cipher from a 256-bit key
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Generate a cipher with a random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    fn aead(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| CellarError::transform(format!("invalid key: {}", e)))
    }
}

impl ChaChaCipher {
    fn apply_keystream(&self, segment: SegmentId, offset: u64, data: &mut [u8]) -> Result<()> {
        let mut nonce = [0u8; LIVE_NONCE_SIZE];
        nonce[..8].copy_from_slice(LIVE_NONCE_TAG);
        nonce[8..16].copy_from_slice(&segment.start_pos.to_le_bytes());
        nonce[16..].copy_from_slice(&segment.salt.to_le_bytes());

        let mut stream = XChaCha20::new(Key::from_slice(&self.key), XNonce::from_slice(&nonce));
        stream
            .try_seek(offset)
            .map_err(|e| CellarError::transform(format!("keystream seek: {}", e)))?;
        stream
            .try_apply_keystream(data)
            .map_err(|e| CellarError::transform(format!("keystream: {}", e)))
    }
}

// Never print key material.
impl fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaCipher").finish_non_exhaustive()
    }
}

impl ByteTransform for ChaChaCipher {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead()?
            .encrypt(nonce, data)
            .map_err(|e| CellarError::transform(format!("encrypt: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(CellarError::transform("data too short for nonce"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.aead()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CellarError::transform(format!("decrypt: {}", e)))
    }
}

impl Cipher for ChaChaCipher {
    fn encode_at(&self, segment: SegmentId, offset: u64, data: &mut [u8]) -> Result<()> {
        self.apply_keystream(segment, offset, data)
    }

    fn decode_at(&self, segment: SegmentId, offset: u64, data: &mut [u8]) -> Result<()> {
        self.apply_keystream(segment, offset, data)
    }
}
