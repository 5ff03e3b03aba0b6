//! Error Types for Baler
//!
//! This module defines the error type shared by all baler crates.
//!
//! ## Error Categories
//!
//! ### Structural Errors
//! - `InvalidChunk`: malformed chunk payload (bad section, bad counts,
//!   truncation, trailing bytes)
//! - `UnknownChunkType`: a chunk carries records but an unrecognized tag
//! - `TooManyRecords` / `ChunkTooLarge`: header exceeds the decoder caps
//! - `InvalidVarint` / `UnexpectedEof` / `TrailingData`: low-level framing
//!
//! ### Compression Errors
//! - `InvalidCompression`: unknown compression-kind byte
//! - `Compression` / `Decompression`: codec failure (likely corruption)
//!
//! ### Record Errors
//! - `InvalidRecord`: a single record's payload failed the injected
//!   parser. This is the only *recoverable* kind: the chunk decoder can
//!   skip the record and continue.
//!
//! ### Arithmetic
//! - `Overflow`: a size accumulation exceeded `u64`
//!
//! ## Usage
//! All fallible functions return `Result<T>`, aliased to
//! `Result<T, Error>`, so `?` propagation works throughout.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Unknown chunk type: {0:#04x}")]
    UnknownChunkType(u8),

    #[error("Too many records: {0}")]
    TooManyRecords(u64),

    #[error("Chunk too large: decoded data size {0}")]
    ChunkTooLarge(u64),

    #[error("Invalid compression type: {0:#04x}")]
    InvalidCompression(u8),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid varint: {0}")]
    InvalidVarint(&'static str),

    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: u64, remaining: u64 },

    #[error("Trailing data: {0} bytes left after decoding")]
    TrailingData(u64),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),
}

impl Error {
    /// Whether this error is local to a single record.
    ///
    /// Record-local errors leave the chunk decoder in a recoverable state;
    /// everything else poisons it until the next reset.
    pub fn is_record_local(&self) -> bool {
        matches!(self, Error::InvalidRecord(_))
    }
}
