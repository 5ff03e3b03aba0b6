//! Simple Chunk Format
//!
//! The compact chunk layout: records stored back-to-back with a
//! length-prefixed directory, optionally compressed as one block.
//!
//! ## Payload Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Compression kind (1 byte)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Decoded size varint (only when compressed)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Inner stream (compressed as one block):                     │
//! │ - num_records varints: record sizes                         │
//! │ - value blob: exactly decoded_data_size bytes               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The record sizes are prefix-summed into the end-offset `limits` the
//! chunk decoder serves random access from; the final sum must equal the
//! header's `decoded_data_size` and the inner stream must be consumed
//! exactly. With compression disabled the value blob is handed out as a
//! zero-copy slice of the payload.

mod decoder;
mod encoder;

pub(crate) use decoder::decode;
pub use encoder::SimpleEncoder;
