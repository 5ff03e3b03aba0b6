//! Transposed Chunk Format
//!
//! The columnar chunk layout: instead of storing records back-to-back,
//! each field's values across all records are stored together in one
//! *buffer*, and a small state machine records how to interleave them
//! back into records. Similar values compress far better side by side,
//! and a reader that only needs some fields can skip whole columns.
//!
//! ## Payload Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Compression kind (1 byte)                                   │
//! │ Bucket count, buffer count, node count (varints)            │
//! │ Transitions mode (1 byte: 0 implicit, 1 explicit)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Buffer sizes: decoded length per buffer (varints)           │
//! │ - buffer 0 is the record-boundary buffer: one varint per    │
//! │   record holding the record's full decoded length           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Bucket directory: per bucket, stored length and number of   │
//! │ member buffers (buckets partition the buffer list in order) │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Node table: per node,                                       │
//! │ - tag (varint wire tag; 0 for NoOp and the raw column)      │
//! │ - subtype (1 byte)                                          │
//! │ - buffer index + 1 (varint, 0 = none)                       │
//! │ - parent index + 1 (varint, 0 = root; parents are the       │
//! │   enclosing sub-message or group nodes, giving each node    │
//! │   its field path for projection)                            │
//! │ - next index + 1 (varint, 0 = computed; explicit mode only) │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Start-node index (varint)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Bucket bodies, concatenated (compressed; decompressed       │
//! │ lazily on first access to a member buffer)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Transitions stream (to end of payload): zigzag deltas       │
//! │ consumed when leaving a computed-successor node; empty in   │
//! │ implicit mode, where every successor is (index + 1) mod n   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Decoding Order
//!
//! Records are reconstructed last-first, and fields within a record
//! last-first, into a backward writer. A nested sub-message's length
//! prefix is only known once its body has been emitted; writing
//! tail-first lets the length land in front of the body without a second
//! pass. Per record the walk starts at the start node and ends when a
//! transition reaches a NoOp node; the record-boundary buffer then
//! yields the expected length, and the reversed per-record lengths
//! prefix-sum into the end-offset `limits`.
//!
//! ## Why This Design?
//!
//! ### One Buffer per Column
//! A field's values compress together and decode with a single cursor;
//! projection can drop a column without touching its bytes.
//!
//! ### Buckets
//! Columns are grouped into independently compressed buckets, so a
//! projecting reader decompresses only the buckets containing columns it
//! actually reads.
//!
//! ### Transition Deltas
//! Most nodes have a single possible successor, stored statically in the
//! node table. Only genuine alternation points (optional fields,
//! repeated fields, records of different shapes) consume a delta from
//! the transitions stream, which itself compresses well.

mod decoder;
mod encoder;

pub(crate) use decoder::decode;
pub use encoder::TransposeEncoder;

use baler_core::{Error, Result};

/// Transitions mode byte: successors are `(index + 1) mod node_count`.
pub(crate) const TRANSITIONS_IMPLICIT: u8 = 0;
/// Transitions mode byte: successors are per-node, static or computed.
pub(crate) const TRANSITIONS_EXPLICIT: u8 = 1;

/// The record-boundary buffer index.
pub(crate) const BOUNDARY_BUFFER: usize = 0;

/// How a state-machine node emits one field occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Subtype {
    /// End-of-record sentinel; emits nothing.
    NoOp,
    /// Copy one varint from the buffer.
    Varint,
    /// Copy 4 bytes.
    Fixed32,
    /// Copy 8 bytes.
    Fixed64,
    /// Read a varint length, copy that many bytes. With tag 0 this is
    /// the raw-record column: the bytes are a whole structureless record.
    LengthDelimited,
    /// Emit only the wire tag; closes the group frame its children open.
    StartGroup,
    /// Emit only the wire tag.
    EndGroup,
    /// Consume the stored sub-message length; emit the tag and the
    /// measured length of the children emitted since the frame opened.
    MessageStart,
    /// Emit nothing, consume nothing.
    Skip,
}

impl Subtype {
    pub(crate) fn byte(self) -> u8 {
        match self {
            Subtype::NoOp => 0,
            Subtype::Varint => 1,
            Subtype::Fixed32 => 2,
            Subtype::Fixed64 => 3,
            Subtype::LengthDelimited => 4,
            Subtype::StartGroup => 5,
            Subtype::EndGroup => 6,
            Subtype::MessageStart => 7,
            Subtype::Skip => 8,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => Subtype::NoOp,
            1 => Subtype::Varint,
            2 => Subtype::Fixed32,
            3 => Subtype::Fixed64,
            4 => Subtype::LengthDelimited,
            5 => Subtype::StartGroup,
            6 => Subtype::EndGroup,
            7 => Subtype::MessageStart,
            8 => Subtype::Skip,
            other => {
                return Err(Error::InvalidChunk(format!(
                    "unknown node subtype: {}",
                    other
                )))
            }
        })
    }

    /// Whether this subtype reads from a value buffer.
    pub(crate) fn uses_buffer(self) -> bool {
        matches!(
            self,
            Subtype::Varint
                | Subtype::Fixed32
                | Subtype::Fixed64
                | Subtype::LengthDelimited
                | Subtype::MessageStart
        )
    }
}
