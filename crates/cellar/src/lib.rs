//! # Cellar
//!
//! Embedded, single-writer, append-only record log.
//!
//! Records are appended to a live buffer file. When the buffer reaches its
//! capacity it is sealed: flushed, compressed (and optionally encrypted)
//! into an immutable chunk, indexed in the metadata store and replaced by a
//! fresh buffer starting where it ended. Chunks plus the live buffer cover
//! the logical byte range `[0, end)` with no gap or overlap.
//!
//! ## Features
//!
//! - **Writer**: appends, checkpoints, named consumer checkpoints, sealing
//! - **Reader**: synchronous and cancellable asynchronous scans that run
//!   alongside the writer
//! - **MetaStore trait**: scoped metadata transactions, backed by redb
//!   ([`RedbMetaStore`]) or memory ([`InMemoryMetaStore`])
//! - **ByteTransform and Cipher traits**: pluggable compression ([`Lz4`]) of
//!   chunk artifacts and encryption ([`ChaChaCipher`]) of both chunks and
//!   live buffer files
//!
//! ## Example
//!
//! ```rust,no_run
//! use cellar::{CellarConfig, Writer};
//!
//! fn main() -> cellar::Result<()> {
//!     let mut writer = Writer::open(CellarConfig::new("./data/cellar"))?;
//!
//!     writer.append(b"hello")?;
//!     let pos = writer.append(b"world")?;
//!     writer.checkpoint()?;
//!     writer.put_user_checkpoint("consumerA", pos)?;
//!
//!     for record in writer.reader().scan(0)? {
//!         let record = record?;
//!         println!("{} -> {:?}", record.start_pos, record.data);
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod meta;
pub mod reader;
pub mod record;
pub mod transform;
pub mod writer;

// Re-exports
pub use config::CellarConfig;
pub use error::{CellarError, Result};
pub use meta::{
    BufferDto, ChunkDto, InMemoryMetaStore, MetaRead, MetaStore, MetaWrite, RedbMetaStore, Stats,
};
pub use reader::{AsyncScan, LiveSnapshot, Reader, Scan};
pub use record::Record;
pub use transform::{ByteTransform, ChaChaCipher, Cipher, Identity, Lz4, SegmentId};
pub use writer::Writer;
