//! Core types for the baler record container format.
//!
//! A baler container is a sequence of *chunks*, each holding a batch of
//! variable-length records (opaque byte strings, typically serialized
//! structured messages). This crate provides the primitives shared by the
//! chunk codecs in `baler-chunk`:
//!
//! - [`Chain`]: a rope of reference-counted byte blocks used for payloads
//! - [`ChunkHeader`] / [`Chunk`]: the chunk data model and on-wire tags
//! - varint helpers for the length-prefixed framing
//! - wire-format helpers for records that are protobuf-style messages
//! - [`ParseRecord`]: the seam through which decoded record bytes are
//!   handed to the caller

pub mod chain;
pub mod chunk;
pub mod error;
pub mod record;
pub mod varint;
pub mod wire;

pub use chain::{Chain, ChainBackwardWriter, ChainReader};
pub use chunk::{Chunk, ChunkHeader, ChunkType};
pub use error::{Error, Result};
pub use record::{ParseRecord, WireRecord};
