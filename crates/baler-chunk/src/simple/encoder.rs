//! Simple Chunk Encoder
//!
//! Accumulates records and emits a simple chunk: a varint size per
//! record followed by the concatenated record bytes, compressed as one
//! block when a codec is configured.

use bytes::{BufMut, Bytes, BytesMut};

use baler_core::chunk::{Chunk, ChunkType, MAX_DECODED_DATA_SIZE, MAX_NUM_RECORDS};
use baler_core::{varint, Chain, Error, Result};

use crate::compression::{compress, CompressionKind};
use crate::config::EncoderOptions;

/// Builds a simple chunk from a batch of records.
pub struct SimpleEncoder {
    compression: CompressionKind,
    records: Vec<Bytes>,
    decoded_size: u64,
}

impl SimpleEncoder {
    pub fn new(options: EncoderOptions) -> Self {
        Self {
            compression: options.compression,
            records: Vec::new(),
            decoded_size: 0,
        }
    }

    /// Append one record.
    pub fn add_record(&mut self, record: impl Into<Bytes>) -> Result<()> {
        let record = record.into();
        self.decoded_size = self
            .decoded_size
            .checked_add(record.len() as u64)
            .ok_or(Error::Overflow("decoded data size"))?;
        if self.decoded_size > MAX_DECODED_DATA_SIZE {
            return Err(Error::ChunkTooLarge(self.decoded_size));
        }
        if self.records.len() as u64 + 1 > MAX_NUM_RECORDS {
            return Err(Error::TooManyRecords(self.records.len() as u64 + 1));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn num_records(&self) -> u64 {
        self.records.len() as u64
    }

    /// Finish, producing the chunk.
    pub fn encode(self) -> Result<Chunk> {
        let mut inner = BytesMut::with_capacity(
            self.decoded_size as usize + self.records.len() * 2 + 16,
        );
        for record in &self.records {
            varint::encode_varint_u64(&mut inner, record.len() as u64);
        }
        for record in &self.records {
            inner.put_slice(record);
        }

        let mut payload = BytesMut::new();
        payload.put_u8(self.compression.byte());
        if self.compression == CompressionKind::None {
            payload.put_slice(&inner);
        } else {
            varint::encode_varint_u64(&mut payload, inner.len() as u64);
            payload.put_slice(&compress(self.compression, &inner)?);
        }

        Ok(Chunk::new(
            ChunkType::Simple,
            self.records.len() as u64,
            self.decoded_size,
            Chain::from(payload.freeze()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chunk_payload() {
        let encoder = SimpleEncoder::new(EncoderOptions {
            compression: CompressionKind::None,
            ..Default::default()
        });
        let chunk = encoder.encode().unwrap();
        assert_eq!(chunk.header.chunk_type, ChunkType::Simple);
        assert_eq!(chunk.header.num_records, 0);
        assert_eq!(chunk.header.decoded_data_size, 0);
        // Just the compression header byte
        assert_eq!(chunk.data.to_vec(), vec![0x00]);
    }

    #[test]
    fn test_three_record_layout() {
        let mut encoder = SimpleEncoder::new(EncoderOptions {
            compression: CompressionKind::None,
            ..Default::default()
        });
        encoder.add_record(Bytes::from("")).unwrap();
        encoder.add_record(Bytes::from("a")).unwrap();
        encoder.add_record(Bytes::from("bc")).unwrap();
        let chunk = encoder.encode().unwrap();

        assert_eq!(chunk.header.num_records, 3);
        assert_eq!(chunk.header.decoded_data_size, 3);
        // kind, sizes 0,1,2, then "abc"
        assert_eq!(
            chunk.data.to_vec(),
            vec![0x00, 0x00, 0x01, 0x02, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_compressed_payload_has_size_prefix() {
        let mut encoder = SimpleEncoder::new(EncoderOptions {
            compression: CompressionKind::Zstd,
            ..Default::default()
        });
        encoder.add_record(Bytes::from(vec![b'x'; 100])).unwrap();
        let chunk = encoder.encode().unwrap();

        let payload = chunk.data.to_vec();
        assert_eq!(payload[0], b'z');
        // Inner stream: 1 size varint (100 → 2 bytes) + 100 value bytes
        let mut cursor = &payload[1..];
        let inner_size = varint::decode_varint_u64(&mut cursor).unwrap();
        assert_eq!(inner_size, 102);
    }
}
