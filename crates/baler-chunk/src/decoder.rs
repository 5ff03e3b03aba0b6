//! Chunk Decoder Facade
//!
//! This module implements `ChunkDecoder`, the entry point for turning a
//! chunk back into records.
//!
//! ## What Does ChunkDecoder Do?
//!
//! 1. **Dispatches on the chunk-type tag** and validates the header
//!    invariants for each kind (marker chunks must be empty, unknown
//!    tags are tolerated only when they carry no records)
//! 2. **Drives the simple or transposed decoder** over the payload and
//!    requires it to be consumed exactly
//! 3. **Serves records by index** from the decoded value stream, slicing
//!    `values[limits[i-1]..limits[i]]` and handing the bytes to the
//!    injected [`ParseRecord`] implementation
//! 4. **Separates failure domains**: a record that fails its parser can
//!    be skipped with `recover()`; a structural failure poisons the
//!    decoder until the next reset
//!
//! ## State Machine
//!
//! ```text
//!            read_record ok                 read_record: parser error
//!          ┌───────────────┐              ┌──────────────────────────┐
//!          ▼               │              ▼                          │
//!     ┌─────────┐  index+1 │         ┌──────────────┐    recover()   │
//!     │ Healthy ├──────────┘         │ RecordFailed ├────────────────┤
//!     └────┬────┘                    └──────────────┘   index+1      │
//!          │  reset/parse failure                                    │
//!          ▼                                                         │
//!     ┌──────────┐   recover() returns false; only a fresh           │
//!     │ Poisoned │   reset() leaves this state                       │
//!     └──────────┘                                                   ▼
//! ```
//!
//! ## Example Usage
//! ```ignore
//! use baler_chunk::{ChunkDecoder, FieldProjection};
//! use bytes::Bytes;
//!
//! let mut decoder = ChunkDecoder::new(FieldProjection::all());
//! if !decoder.reset(&chunk) {
//!     eprintln!("bad chunk: {}", decoder.message());
//!     return;
//! }
//!
//! let mut record = Bytes::new();
//! while decoder.read_record(&mut record) {
//!     handle(&record);
//! }
//! if !decoder.healthy() {
//!     // A bad record: skip it and keep going, or give up.
//!     if decoder.recover() { /* continue reading */ }
//! }
//! ```
//!
//! ## Thread Safety
//!
//! ChunkDecoder is not safe for concurrent mutation. Independent
//! decoders share no state and may run on independent threads.

use baler_core::chunk::{Chunk, ChunkHeader, ChunkType, MAX_DECODED_DATA_SIZE, MAX_NUM_RECORDS};
use baler_core::{Chain, ChainReader, Error, ParseRecord, Result};

use crate::projection::FieldProjection;
use crate::{simple, transpose};

#[derive(Debug)]
enum State {
    Healthy,
    /// A record failed its parser; `recover()` skips it.
    RecordFailed(String),
    /// Structural failure; only `reset` clears it.
    Poisoned(String),
}

/// Decodes chunks and serves their records by index.
pub struct ChunkDecoder {
    projection: FieldProjection,
    /// Sorted end offset of each record within the value stream.
    limits: Vec<u64>,
    values_reader: ChainReader,
    index: u64,
    state: State,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new(FieldProjection::all())
    }
}

impl ChunkDecoder {
    /// A decoder that keeps the fields covered by `projection`.
    /// Starts healthy with zero records.
    pub fn new(projection: FieldProjection) -> Self {
        Self {
            projection,
            limits: Vec::new(),
            values_reader: ChainReader::new(Chain::new()),
            index: 0,
            state: State::Healthy,
        }
    }

    /// Drop all state: healthy, zero records.
    pub fn clear(&mut self) {
        self.limits.clear();
        self.values_reader = ChainReader::new(Chain::new());
        self.index = 0;
        self.state = State::Healthy;
    }

    /// Replace the contents with `chunk`'s records.
    ///
    /// On failure the decoder is poisoned and holds zero records, so a
    /// caller that ignores the result cannot iterate a half-decoded
    /// chunk.
    pub fn reset(&mut self, chunk: &Chunk) -> bool {
        self.clear();
        let header = &chunk.header;
        if header.num_records > MAX_NUM_RECORDS {
            return self.poison(Error::TooManyRecords(header.num_records).to_string());
        }
        if header.decoded_data_size > MAX_DECODED_DATA_SIZE {
            return self.poison(Error::ChunkTooLarge(header.decoded_data_size).to_string());
        }

        let mut src = ChainReader::new(chunk.data.clone());
        match self.parse(header, &mut src) {
            Ok((limits, values)) => {
                debug_assert_eq!(limits.len() as u64, header.num_records);
                debug_assert_eq!(limits.last().copied().unwrap_or(0), values.len() as u64);
                tracing::debug!(
                    chunk_type = ?header.chunk_type,
                    num_records = header.num_records,
                    decoded_bytes = values.len(),
                    "decoded chunk"
                );
                self.limits = limits;
                self.values_reader = ChainReader::new(values);
                true
            }
            Err(err) => {
                self.limits.clear();
                self.poison(err.to_string())
            }
        }
    }

    fn parse(&self, header: &ChunkHeader, src: &mut ChainReader) -> Result<(Vec<u64>, Chain)> {
        match header.chunk_type {
            ChunkType::FileSignature => {
                if header.data_size != 0 {
                    return Err(Error::InvalidChunk(format!(
                        "file signature chunk: data size is not zero: {}",
                        header.data_size
                    )));
                }
                if header.num_records != 0 {
                    return Err(Error::InvalidChunk(format!(
                        "file signature chunk: number of records is not zero: {}",
                        header.num_records
                    )));
                }
                if header.decoded_data_size != 0 {
                    return Err(Error::InvalidChunk(format!(
                        "file signature chunk: decoded data size is not zero: {}",
                        header.decoded_data_size
                    )));
                }
                Ok((Vec::new(), Chain::new()))
            }
            ChunkType::FileMetadata => {
                if header.num_records != 0 {
                    return Err(Error::InvalidChunk(format!(
                        "file metadata chunk: number of records is not zero: {}",
                        header.num_records
                    )));
                }
                Ok((Vec::new(), Chain::new()))
            }
            ChunkType::Padding => {
                if header.num_records != 0 {
                    return Err(Error::InvalidChunk(format!(
                        "padding chunk: number of records is not zero: {}",
                        header.num_records
                    )));
                }
                if header.decoded_data_size != 0 {
                    return Err(Error::InvalidChunk(format!(
                        "padding chunk: decoded data size is not zero: {}",
                        header.decoded_data_size
                    )));
                }
                Ok((Vec::new(), Chain::new()))
            }
            ChunkType::Simple => {
                let decoded =
                    simple::decode(src, header.num_records, header.decoded_data_size)
                        .map_err(|e| context("invalid simple chunk", e))?;
                src.verify_end()
                    .map_err(|e| context("invalid simple chunk", e))?;
                Ok(decoded)
            }
            ChunkType::Transposed => {
                let decoded = transpose::decode(
                    src,
                    header.num_records,
                    header.decoded_data_size,
                    &self.projection,
                )
                .map_err(|e| context("invalid transposed chunk", e))?;
                src.verify_end()
                    .map_err(|e| context("invalid transposed chunk", e))?;
                Ok(decoded)
            }
            ChunkType::Other(byte) => {
                if header.num_records == 0 {
                    // Forward compatibility: skip recordless chunks even
                    // when the tag is unknown.
                    Ok((Vec::new(), Chain::new()))
                } else {
                    Err(Error::UnknownChunkType(byte))
                }
            }
        }
    }

    pub fn num_records(&self) -> u64 {
        self.limits.len() as u64
    }

    /// Index of the next record `read_record` will return.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Reposition to record `index` (clamped to `num_records`).
    ///
    /// Clears a record-local failure; a poisoned decoder stays poisoned.
    pub fn set_index(&mut self, index: u64) {
        if matches!(self.state, State::Poisoned(_)) {
            return;
        }
        self.state = State::Healthy;
        self.index = index.min(self.limits.len() as u64);
        let position = match self.index {
            0 => 0,
            i => self.limits[i as usize - 1],
        };
        if let Err(err) = self.values_reader.seek(position) {
            self.poison(err.to_string());
        }
    }

    /// Read the next record into `out`.
    ///
    /// Returns `false` at the end of the chunk (decoder stays healthy)
    /// or on failure; `healthy()` distinguishes the two. A parser
    /// failure is record-local: `recover()` skips the record.
    pub fn read_record<R: ParseRecord>(&mut self, out: &mut R) -> bool {
        if self.index as usize == self.limits.len() || !self.healthy() {
            return false;
        }
        let start = self.values_reader.position();
        let limit = self.limits[self.index as usize];
        debug_assert!(start <= limit, "record end positions not sorted");

        let data = match self.values_reader.read_exact((limit - start) as usize) {
            Ok(data) => data,
            Err(err) => {
                // The framing invariants guarantee the slice exists; a
                // failure here means decoder state is corrupt.
                self.poison(err.to_string());
                return false;
            }
        };
        match out.parse_from(data) {
            Ok(()) => {
                self.index += 1;
                true
            }
            Err(err) if err.is_record_local() => {
                // The reader already sits at the record's end offset, so
                // recovery is a pure cursor bump.
                self.state = State::RecordFailed(err.to_string());
                false
            }
            Err(err) => self.poison(err.to_string()),
        }
    }

    /// Skip a record that failed its parser.
    ///
    /// Returns `false` when the decoder is healthy or poisoned.
    pub fn recover(&mut self) -> bool {
        match &self.state {
            State::RecordFailed(message) => {
                tracing::warn!(index = self.index, message = %message, "skipping bad record");
                self.state = State::Healthy;
                self.index += 1;
                true
            }
            _ => false,
        }
    }

    pub fn healthy(&self) -> bool {
        matches!(self.state, State::Healthy)
    }

    /// The diagnostic for the current failure, or `""` when healthy.
    pub fn message(&self) -> &str {
        match &self.state {
            State::Healthy => "",
            State::RecordFailed(message) | State::Poisoned(message) => message,
        }
    }

    fn poison(&mut self, message: String) -> bool {
        tracing::debug!(message = %message, "chunk decoder poisoned");
        self.state = State::Poisoned(message);
        false
    }
}

fn context(what: &str, err: Error) -> Error {
    Error::InvalidChunk(format!("{}: {}", what, err))
}
