//! Baler Chunk Codecs
//!
//! This crate implements the chunk layer of the baler record container
//! format: encoding batches of records into chunks and decoding chunks
//! back into records.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐
//! │     Records      │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────────────────┐
//! │ SimpleEncoder /              │
//! │ TransposeEncoder             │
//! │ - length-prefixed or         │
//! │   columnar layout            │
//! │ - per-chunk compression      │
//! └────────┬─────────────────────┘
//!          │ Chunk { header, data }
//!          ▼
//! ┌──────────────────────────────┐
//! │ Container (out of scope:     │
//! │ framing, checksums, I/O)     │
//! └────────┬─────────────────────┘
//!          │ Chunk { header, data }
//!          ▼
//! ┌──────────────────────────────┐
//! │ ChunkDecoder                 │
//! │ - tag dispatch + validation  │
//! │ - field projection           │
//! │ - per-record framing         │
//! │ - record-local recovery      │
//! └────────┬─────────────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Records      │
//! └──────────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`ChunkDecoder`]: decodes any chunk kind, serves records by index,
//!   and separates record-local failures (skippable via `recover()`)
//!   from structural ones (chunk rejected)
//! - [`SimpleEncoder`]: compact length-prefixed layout
//! - [`TransposeEncoder`]: columnar layout for wire-format message
//!   records, enabling better compression and [`FieldProjection`]-based
//!   selective decoding
//! - [`compression`]: the closed per-chunk codec set (None, Brotli,
//!   Zstd, Snappy)

pub mod compression;
mod config;
mod decoder;
mod projection;
mod simple;
mod transpose;

pub use compression::CompressionKind;
pub use config::EncoderOptions;
pub use decoder::ChunkDecoder;
pub use projection::{FieldPath, FieldProjection};
pub use simple::SimpleEncoder;
pub use transpose::TransposeEncoder;

pub use baler_core::chunk::{Chunk, ChunkHeader, ChunkType};
pub use baler_core::{Chain, Error, ParseRecord, Result, WireRecord};
