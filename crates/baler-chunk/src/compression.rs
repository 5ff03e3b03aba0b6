//! Per-Chunk Compression
//!
//! Chunk payloads (and, inside transposed chunks, each bucket and the
//! transitions stream) are compressed independently with one of a closed
//! set of codecs. The kind is a single byte at the front of the payload;
//! the byte values are container-format constants and must match the
//! on-disk assignment of existing containers.
//!
//! Compressed blocks are always paired with their decoded size, either as
//! an explicit varint prefix (simple chunks, transitions) or derived from
//! the surrounding directory (buckets). Decompression verifies the
//! declared size exactly - a mismatch is corruption, and the declared
//! size bounds allocation before any decompression runs.

use bytes::Bytes;

use baler_core::chunk::MAX_DECODED_DATA_SIZE;
use baler_core::{Error, Result};

/// Compression kind byte: no compression.
pub const COMPRESSION_NONE: u8 = 0x00;
/// Compression kind byte: Brotli (`b`).
pub const COMPRESSION_BROTLI: u8 = 0x62;
/// Compression kind byte: Zstandard (`z`).
pub const COMPRESSION_ZSTD: u8 = 0x7a;
/// Compression kind byte: Snappy (`s`).
pub const COMPRESSION_SNAPPY: u8 = 0x73;

/// Compression codec for a chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionKind {
    None,
    Brotli,
    #[default]
    Zstd,
    Snappy,
}

impl CompressionKind {
    pub fn byte(self) -> u8 {
        match self {
            CompressionKind::None => COMPRESSION_NONE,
            CompressionKind::Brotli => COMPRESSION_BROTLI,
            CompressionKind::Zstd => COMPRESSION_ZSTD,
            CompressionKind::Snappy => COMPRESSION_SNAPPY,
        }
    }
}

impl TryFrom<u8> for CompressionKind {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            COMPRESSION_NONE => Ok(CompressionKind::None),
            COMPRESSION_BROTLI => Ok(CompressionKind::Brotli),
            COMPRESSION_ZSTD => Ok(CompressionKind::Zstd),
            COMPRESSION_SNAPPY => Ok(CompressionKind::Snappy),
            other => Err(Error::InvalidCompression(other)),
        }
    }
}

/// Compress `data` with `kind`. `None` is the identity.
pub fn compress(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Zstd => {
            zstd::bulk::compress(data, 0).map_err(|e| Error::Compression(e.to_string()))
        }
        CompressionKind::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Compression(e.to_string())),
        CompressionKind::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut &data[..], &mut out, &params)
                .map_err(|e| Error::Compression(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decompress `data`, verifying the declared decoded size exactly.
pub fn decompress(kind: CompressionKind, data: &[u8], uncompressed_size: u64) -> Result<Bytes> {
    if uncompressed_size > MAX_DECODED_DATA_SIZE {
        return Err(Error::Decompression(format!(
            "declared uncompressed size too large: {}",
            uncompressed_size
        )));
    }
    let expected =
        usize::try_from(uncompressed_size).map_err(|_| Error::Overflow("uncompressed size"))?;

    let decoded = match kind {
        CompressionKind::None => {
            if data.len() != expected {
                return Err(Error::Decompression(format!(
                    "uncompressed block is {} bytes, expected {}",
                    data.len(),
                    expected
                )));
            }
            return Ok(Bytes::copy_from_slice(data));
        }
        CompressionKind::Zstd => zstd::bulk::decompress(data, expected)
            .map_err(|e| Error::Decompression(e.to_string()))?,
        CompressionKind::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Decompression(e.to_string()))?,
        CompressionKind::Brotli => {
            let mut out = Vec::with_capacity(expected);
            brotli::BrotliDecompress(&mut &data[..], &mut out)
                .map_err(|e| Error::Decompression(e.to_string()))?;
            out
        }
    };

    if decoded.len() != expected {
        return Err(Error::Decompression(format!(
            "decompressed to {} bytes, expected {}",
            decoded.len(),
            expected
        )));
    }
    Ok(Bytes::from(decoded))
}
