//! Chunk Data Model
//!
//! This module defines chunks - the framed units a baler container is
//! made of - and their on-wire type tags.
//!
//! ## What is a Chunk?
//! A chunk is a self-contained batch of records plus a fixed header. The
//! surrounding record-reader (out of scope for this library) locates
//! chunks inside a file and checksums them; by the time a [`Chunk`]
//! reaches the decoder its header is trusted to be intact, though its
//! *contents* are still validated defensively.
//!
//! ## Chunk Kinds
//! - **FileSignature**: marker at the start of a container; no payload
//! - **FileMetadata**: container-scoped metadata; no records
//! - **Padding**: alignment filler; no records
//! - **Simple**: length-prefixed records, optionally compressed
//! - **Transposed**: records stored column-wise for better compression
//!   and selective field decoding
//!
//! Unknown nonzero tags are tolerated when they carry no records, so old
//! readers can skip chunks written by newer writers.

use serde::{Deserialize, Serialize};

use crate::chain::Chain;

/// Chunk type tag for a file signature chunk (`s`).
pub const CHUNK_TYPE_FILE_SIGNATURE: u8 = 0x73;
/// Chunk type tag for a file metadata chunk (`m`).
pub const CHUNK_TYPE_FILE_METADATA: u8 = 0x6d;
/// Chunk type tag for a padding chunk (`p`).
pub const CHUNK_TYPE_PADDING: u8 = 0x70;
/// Chunk type tag for a simple chunk (`r`).
pub const CHUNK_TYPE_SIMPLE: u8 = 0x72;
/// Chunk type tag for a transposed chunk (`t`).
pub const CHUNK_TYPE_TRANSPOSED: u8 = 0x74;

/// Maximum number of records a single chunk may declare.
pub const MAX_NUM_RECORDS: u64 = 1 << 48;

/// Maximum decoded data size a single chunk may declare.
pub const MAX_DECODED_DATA_SIZE: u64 = 1 << 48;

/// Chunk type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkType {
    FileSignature,
    FileMetadata,
    Padding,
    Simple,
    Transposed,
    /// Forward-compatible arm for tags this version does not know.
    Other(u8),
}

impl ChunkType {
    /// The on-wire byte for this tag.
    pub fn byte(self) -> u8 {
        match self {
            ChunkType::FileSignature => CHUNK_TYPE_FILE_SIGNATURE,
            ChunkType::FileMetadata => CHUNK_TYPE_FILE_METADATA,
            ChunkType::Padding => CHUNK_TYPE_PADDING,
            ChunkType::Simple => CHUNK_TYPE_SIMPLE,
            ChunkType::Transposed => CHUNK_TYPE_TRANSPOSED,
            ChunkType::Other(byte) => byte,
        }
    }
}

impl From<u8> for ChunkType {
    fn from(byte: u8) -> Self {
        match byte {
            CHUNK_TYPE_FILE_SIGNATURE => ChunkType::FileSignature,
            CHUNK_TYPE_FILE_METADATA => ChunkType::FileMetadata,
            CHUNK_TYPE_PADDING => ChunkType::Padding,
            CHUNK_TYPE_SIMPLE => ChunkType::Simple,
            CHUNK_TYPE_TRANSPOSED => ChunkType::Transposed,
            other => ChunkType::Other(other),
        }
    }
}

/// Fixed chunk header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Chunk type tag
    pub chunk_type: ChunkType,

    /// Number of records in the chunk
    pub num_records: u64,

    /// Total byte length of the decoded record values
    pub decoded_data_size: u64,

    /// Byte length of the (possibly compressed) payload
    pub data_size: u64,
}

/// A chunk: header plus payload.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub data: Chain,
}

impl Chunk {
    pub fn new(chunk_type: ChunkType, num_records: u64, decoded_data_size: u64, data: Chain) -> Self {
        Self {
            header: ChunkHeader {
                chunk_type,
                num_records,
                decoded_data_size,
                data_size: data.len() as u64,
            },
            data,
        }
    }

    /// The marker chunk at the start of every container.
    pub fn file_signature() -> Self {
        Self::new(ChunkType::FileSignature, 0, 0, Chain::new())
    }

    /// An alignment-filler chunk with `len` zero bytes of payload.
    pub fn padding(len: usize) -> Self {
        Self::new(ChunkType::Padding, 0, 0, Chain::from(vec![0u8; len]))
    }
}
