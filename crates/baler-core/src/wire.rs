//! Wire-Format Helpers
//!
//! Records in a baler container are opaque bytes, but the transposed
//! encoding exploits structure when a record happens to be a
//! protocol-buffer-style wire message: a sequence of tagged fields, each
//! tag a varint of `(field_number << 3) | wire_type`.
//!
//! This module walks that wire format without interpreting values. It is
//! used by the transpose encoder (to discover the field tree) and by
//! [`crate::record::WireRecord`] (to validate records on read). Nothing
//! here allocates; fields are reported as spans into the input.

use crate::error::{Error, Result};
use crate::varint;

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;
pub const WIRE_START_GROUP: u8 = 3;
pub const WIRE_END_GROUP: u8 = 4;
pub const WIRE_FIXED32: u8 = 5;

/// Maximum sub-message / group nesting depth accepted by the walkers.
pub const MAX_NESTING_DEPTH: usize = 100;

/// One field occurrence, as spans into the record bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireField {
    pub field_number: u32,
    pub wire_type: u8,
    /// Offset of the tag varint.
    pub start: usize,
    /// Start of the value: after the tag (and after the length varint
    /// for length-delimited fields; after the start-group tag for groups).
    pub value_start: usize,
    /// End of the value (before the end-group tag for groups).
    pub value_end: usize,
    /// End of the whole field.
    pub end: usize,
    /// For length-delimited fields: whether the length varint used its
    /// minimal encoding. Sub-message recursion requires this, since a
    /// re-framed length is always written canonically.
    pub canonical_len: bool,
}

fn invalid(msg: &str) -> Error {
    Error::InvalidRecord(msg.to_string())
}

/// Decode a varint at `pos`, returning the value and bytes consumed.
fn varint_at(data: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut cursor = &data[pos..];
    let before = cursor.len();
    let value = varint::decode_varint_u64(&mut cursor)
        .map_err(|_| invalid("truncated or over-long varint"))?;
    Ok((value, before - cursor.len()))
}

/// Parse the single field starting at `pos`. End-group tags are rejected
/// here; group bodies consume them internally.
fn parse_field_at(data: &[u8], pos: usize, depth: usize) -> Result<WireField> {
    let (tag, tag_len) = varint_at(data, pos)?;
    let tag = u32::try_from(tag).map_err(|_| invalid("field tag exceeds 32 bits"))?;
    let field_number = tag >> 3;
    let wire_type = (tag & 7) as u8;
    if field_number == 0 {
        return Err(invalid("field number is zero"));
    }
    let value_start = pos + tag_len;

    match wire_type {
        WIRE_VARINT => {
            let (_, len) = varint_at(data, value_start)?;
            Ok(WireField {
                field_number,
                wire_type,
                start: pos,
                value_start,
                value_end: value_start + len,
                end: value_start + len,
                canonical_len: true,
            })
        }
        WIRE_FIXED64 | WIRE_FIXED32 => {
            let len = if wire_type == WIRE_FIXED64 { 8 } else { 4 };
            if data.len() - value_start < len {
                return Err(invalid("truncated fixed-width value"));
            }
            Ok(WireField {
                field_number,
                wire_type,
                start: pos,
                value_start,
                value_end: value_start + len,
                end: value_start + len,
                canonical_len: true,
            })
        }
        WIRE_LEN => {
            let (len, len_len) = varint_at(data, value_start)?;
            let len = usize::try_from(len).map_err(|_| invalid("length exceeds usize"))?;
            let payload_start = value_start + len_len;
            if data.len() - payload_start < len {
                return Err(invalid("length-delimited value past end of record"));
            }
            Ok(WireField {
                field_number,
                wire_type,
                start: pos,
                value_start: payload_start,
                value_end: payload_start + len,
                end: payload_start + len,
                canonical_len: len_len == varint::varint_len_u64(len as u64),
            })
        }
        WIRE_START_GROUP => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(invalid("group nesting too deep"));
            }
            let (content_end, end) = parse_group_body(data, value_start, field_number, depth + 1)?;
            Ok(WireField {
                field_number,
                wire_type,
                start: pos,
                value_start,
                value_end: content_end,
                end,
                canonical_len: true,
            })
        }
        WIRE_END_GROUP => Err(invalid("end-group tag without matching start")),
        _ => Err(invalid("reserved wire type")),
    }
}

/// Walk a group body until the matching end-group tag; returns the
/// content end and the position after the end-group tag.
fn parse_group_body(
    data: &[u8],
    mut pos: usize,
    field_number: u32,
    depth: usize,
) -> Result<(usize, usize)> {
    loop {
        if pos >= data.len() {
            return Err(invalid("unterminated group"));
        }
        let (tag, tag_len) = varint_at(data, pos)?;
        let tag = u32::try_from(tag).map_err(|_| invalid("field tag exceeds 32 bits"))?;
        if (tag & 7) as u8 == WIRE_END_GROUP {
            if tag >> 3 != field_number {
                return Err(invalid("mismatched end-group field number"));
            }
            return Ok((pos, pos + tag_len));
        }
        pos = parse_field_at(data, pos, depth)?.end;
    }
}

/// Iterator over the top-level fields of a wire-format message.
pub struct WireIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// The next field, or `Ok(None)` at a clean end of input.
    pub fn next_field(&mut self) -> Result<Option<WireField>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let field = parse_field_at(self.data, self.pos, 0)?;
        self.pos = field.end;
        Ok(Some(field))
    }
}

/// Validate that `data` is a structurally well-formed wire message.
pub fn validate_message(data: &[u8]) -> Result<()> {
    let mut iter = WireIter::new(data);
    while iter.next_field()?.is_some() {}
    Ok(())
}

/// `validate_message` as a predicate.
pub fn is_valid_message(data: &[u8]) -> bool {
    validate_message(data).is_ok()
}
