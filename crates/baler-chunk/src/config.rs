//! Encoder Configuration
//!
//! Controls how chunks are built:
//!
//! - **compression**: codec applied to the payload (simple chunks) or to
//!   each bucket and the transitions stream (transposed chunks)
//! - **bucket_size**: target decoded size per bucket in transposed
//!   chunks. Buffers are packed into buckets in order until a bucket
//!   reaches this size; a projecting reader then only decompresses the
//!   buckets whose buffers it actually touches.
//!
//! ## Usage
//! ```ignore
//! use baler_chunk::{CompressionKind, EncoderOptions, TransposeEncoder};
//!
//! let encoder = TransposeEncoder::new(EncoderOptions {
//!     compression: CompressionKind::Brotli,
//!     ..Default::default()
//! });
//! ```

use crate::compression::CompressionKind;

#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Compression codec (default: Zstd)
    pub compression: CompressionKind,

    /// Target decoded bucket size in bytes (default: 64 KiB)
    pub bucket_size: usize,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Zstd,
            bucket_size: 64 * 1024,
        }
    }
}
