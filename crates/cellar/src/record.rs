//! Record wire encoding
//!
//! Each record is a signed (zig-zag) varint length followed by the raw
//! payload:
//!
//! ```text
//! [varint: len][len bytes: payload][varint: len][...]
//! ```
//!
//! There is no checksum or magic number at this level; integrity belongs to
//! the transform layer that seals chunks.

use bytes::Bytes;

use crate::error::{CellarError, Result};

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// A record as delivered by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The payload
    pub data: Bytes,
    /// Logical start of the segment (chunk or buffer) the record was read from
    pub chunk_pos: u64,
    /// Logical position of the record's length prefix
    pub start_pos: u64,
    /// Logical position right after the payload
    pub next_pos: u64,
}

/// Appends `value` as a zig-zag varint to `buf`, returning the encoded length.
pub fn encode_varint(buf: &mut Vec<u8>, value: i64) -> usize {
    let mut zz = ((value << 1) ^ (value >> 63)) as u64;
    let start = buf.len();
    while zz >= 0x80 {
        buf.push((zz as u8) | 0x80);
        zz >>= 7;
    }
    buf.push(zz as u8);
    buf.len() - start
}

/// Number of bytes `value` occupies as a zig-zag varint.
pub fn varint_len(value: i64) -> usize {
    let mut zz = ((value << 1) ^ (value >> 63)) as u64;
    let mut n = 1;
    while zz >= 0x80 {
        zz >>= 7;
        n += 1;
    }
    n
}

/// Decodes a zig-zag varint from the front of `data`.
///
/// Returns `Ok(None)` when `data` ends before the varint does, which is how a
/// torn trailing write looks to a reader.
pub fn decode_varint(data: &[u8]) -> std::result::Result<Option<(i64, usize)>, &'static str> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if i == MAX_VARINT_LEN || (i == MAX_VARINT_LEN - 1 && byte > 1) {
            return Err("varint overflow");
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            let value = ((result >> 1) as i64) ^ -((result & 1) as i64);
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }

    Ok(None)
}

/// Encodes a full record (prefix + payload) into `buf`.
pub fn encode_record(buf: &mut Vec<u8>, payload: &[u8]) {
    encode_varint(buf, payload.len() as i64);
    buf.extend_from_slice(payload);
}

/// Sequential decoder over the plain content of one segment.
///
/// `base` is the logical position of `data[0]`. In `tolerate_torn` mode a
/// record cut short by the end of `data` ends the stream quietly; otherwise
/// it is reported as corruption.
#[derive(Debug)]
pub(crate) struct SegmentCursor {
    segment: String,
    chunk_pos: u64,
    base: u64,
    data: Bytes,
    offset: usize,
    tolerate_torn: bool,
    finished: bool,
}

impl SegmentCursor {
    pub(crate) fn new(
        segment: impl Into<String>,
        chunk_pos: u64,
        base: u64,
        data: Bytes,
        tolerate_torn: bool,
    ) -> Self {
        Self {
            segment: segment.into(),
            chunk_pos,
            base,
            data,
            offset: 0,
            tolerate_torn,
            finished: false,
        }
    }

    /// Logical position of the next undecoded byte.
    pub(crate) fn logical_pos(&self) -> u64 {
        self.base + self.offset as u64
    }

    fn torn(&mut self, what: &str) -> Option<Result<Record>> {
        self.finished = true;
        if self.tolerate_torn {
            None
        } else {
            Some(Err(CellarError::corrupt(
                self.segment.clone(),
                format!("{} at position {}", what, self.logical_pos()),
            )))
        }
    }
}

impl Iterator for SegmentCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.offset >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.offset..];
        let (len, prefix) = match decode_varint(rest) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return self.torn("truncated length prefix"),
            Err(reason) => {
                self.finished = true;
                return Some(Err(CellarError::corrupt(self.segment.clone(), reason)));
            }
        };

        if len < 0 {
            self.finished = true;
            return Some(Err(CellarError::corrupt(
                self.segment.clone(),
                format!("negative record length {} at position {}", len, self.logical_pos()),
            )));
        }

        let len = len as usize;
        if rest.len() - prefix < len {
            return self.torn("truncated payload");
        }

        let start_pos = self.logical_pos();
        let body_start = self.offset + prefix;
        let data = self.data.slice(body_start..body_start + len);
        self.offset = body_start + len;

        Some(Ok(Record {
            data,
            chunk_pos: self.chunk_pos,
            start_pos,
            next_pos: self.logical_pos(),
        }))
    }
}
