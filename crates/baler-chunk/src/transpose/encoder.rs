//! Transposed Chunk Encoder
//!
//! Builds the columnar layout by walking each record's wire-format
//! fields in decode order (records last-first, fields last-first):
//!
//! 1. Each distinct (enclosing node, tag, subtype) becomes one
//!    state-machine node with its own value buffer.
//! 2. Length-delimited fields whose payload is itself a well-formed
//!    message (with a canonical length prefix) recurse: the children
//!    become nodes of their own and the parent stores only the length,
//!    re-framed by the decoder. Groups recurse the same way.
//! 3. Records that are not wire-format messages - and fields whose tag
//!    encoding the re-framing could not reproduce byte-exactly - fall
//!    back to a tagless raw column and pass through whole.
//!
//! After the walk, nodes whose observed successor is unique get a static
//! transition; alternation points consume deltas from the transitions
//! stream. When every record walks the identical straight-line node
//! sequence the transitions collapse to implicit `(i + 1) mod n` mode
//! with no stream at all.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use baler_core::chunk::{Chunk, ChunkType, MAX_DECODED_DATA_SIZE, MAX_NUM_RECORDS};
use baler_core::wire::{
    self, WireField, WIRE_END_GROUP, WIRE_FIXED32, WIRE_FIXED64, WIRE_LEN, WIRE_START_GROUP,
    WIRE_VARINT,
};
use baler_core::{varint, Chain, Error, Result};

use crate::compression::{compress, CompressionKind};
use crate::config::EncoderOptions;

use super::{Subtype, TRANSITIONS_EXPLICIT, TRANSITIONS_IMPLICIT};

/// Builds a transposed chunk from a batch of records.
pub struct TransposeEncoder {
    options: EncoderOptions,
    records: Vec<Bytes>,
    decoded_size: u64,
}

impl TransposeEncoder {
    pub fn new(options: EncoderOptions) -> Self {
        Self {
            options,
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
        let num_records = self.records.len() as u64;

        let mut machine = Machine::new();
        // Decode order: last record first.
        let mut record_visits: Vec<Vec<usize>> = Vec::with_capacity(self.records.len());
        for record in self.records.iter().rev() {
            varint::encode_varint_u64(&mut machine.boundary, record.len() as u64);
            record_visits.push(machine.emit_record(record)?);
        }

        let node_count = machine.nodes.len();

        // Successor analysis: a node whose observed successor is unique
        // gets a static transition.
        let mut successor: Vec<Option<usize>> = vec![None; node_count];
        let mut alternates: Vec<bool> = vec![false; node_count];
        fn note(successor: &mut [Option<usize>], alternates: &mut [bool], from: usize, to: usize) {
            match successor[from] {
                None => successor[from] = Some(to),
                Some(seen) if seen == to => {}
                Some(_) => alternates[from] = true,
            }
        }
        for visits in &record_visits {
            let mut prev = Machine::SENTINEL;
            for &visit in visits {
                note(&mut successor, &mut alternates, prev, visit);
                prev = visit;
            }
            note(&mut successor, &mut alternates, prev, Machine::SENTINEL);
        }

        // Implicit mode: every record walks nodes 1..n in order, so the
        // whole automaton is the sequential cycle through the table.
        let implicit = record_visits
            .iter()
            .all(|visits| visits.len() == node_count - 1 && visits.iter().copied().eq(1..node_count));

        // Buffer assignment: boundary buffer first, then one buffer per
        // value-bearing node in table order.
        let mut buffers: Vec<Bytes> = Vec::new();
        let mut node_buffer: Vec<Option<usize>> = vec![None; node_count];
        if num_records > 0 {
            buffers.push(machine.boundary.freeze());
        }
        for (index, node) in machine.nodes.iter_mut().enumerate() {
            if node.subtype.uses_buffer() {
                node_buffer[index] = Some(buffers.len());
                buffers.push(std::mem::take(&mut node.data).freeze());
            }
        }

        // Greedy bucket packing by decoded size.
        let mut buckets: Vec<(usize, usize)> = Vec::new(); // (buffer count, decoded size)
        for buffer in &buffers {
            match buckets.last_mut() {
                Some((count, size)) if *size < self.options.bucket_size => {
                    *count += 1;
                    *size += buffer.len();
                }
                _ => buckets.push((1, buffer.len())),
            }
        }

        let kind = self.options.compression;
        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(buckets.len());
        let mut next_buffer = 0usize;
        for &(count, size) in &buckets {
            let mut body = Vec::with_capacity(size);
            for buffer in &buffers[next_buffer..next_buffer + count] {
                body.extend_from_slice(buffer);
            }
            next_buffer += count;
            bodies.push(if kind == CompressionKind::None {
                body
            } else {
                compress(kind, &body)?
            });
        }

        // Serialize the payload.
        let mut payload = BytesMut::new();
        payload.put_u8(kind.byte());
        varint::encode_varint_u64(&mut payload, buckets.len() as u64);
        varint::encode_varint_u64(&mut payload, buffers.len() as u64);
        varint::encode_varint_u64(&mut payload, node_count as u64);
        payload.put_u8(if implicit {
            TRANSITIONS_IMPLICIT
        } else {
            TRANSITIONS_EXPLICIT
        });
        for buffer in &buffers {
            varint::encode_varint_u64(&mut payload, buffer.len() as u64);
        }
        for (body, &(count, _)) in bodies.iter().zip(&buckets) {
            varint::encode_varint_u64(&mut payload, body.len() as u64);
            varint::encode_varint_u64(&mut payload, count as u64);
        }
        for (index, node) in machine.nodes.iter().enumerate() {
            varint::encode_varint_u64(&mut payload, u64::from(node.tag));
            payload.put_u8(node.subtype.byte());
            varint::encode_varint_u64(
                &mut payload,
                node_buffer[index].map_or(0, |buffer| buffer as u64 + 1),
            );
            varint::encode_varint_u64(
                &mut payload,
                node.parent.map_or(0, |parent| parent as u64 + 1),
            );
            if !implicit {
                let next = match (alternates[index], successor[index]) {
                    (false, Some(next)) => next as u64 + 1,
                    _ => 0, // computed
                };
                varint::encode_varint_u64(&mut payload, next);
            }
        }
        varint::encode_varint_u64(&mut payload, Machine::SENTINEL as u64);
        for body in &bodies {
            payload.put_slice(body);
        }

        if !implicit {
            let mut deltas = BytesMut::new();
            for visits in &record_visits {
                let mut prev = Machine::SENTINEL;
                for &visit in visits {
                    if alternates[prev] {
                        varint::encode_varint_i64(&mut deltas, visit as i64 - prev as i64);
                    }
                    prev = visit;
                }
                if alternates[prev] {
                    varint::encode_varint_i64(&mut deltas, Machine::SENTINEL as i64 - prev as i64);
                }
            }
            if !deltas.is_empty() {
                if kind == CompressionKind::None {
                    payload.put_slice(&deltas);
                } else {
                    varint::encode_varint_u64(&mut payload, deltas.len() as u64);
                    payload.put_slice(&compress(kind, &deltas)?);
                }
            }
        }

        Ok(Chunk::new(
            ChunkType::Transposed,
            num_records,
            self.decoded_size,
            Chain::from(payload.freeze()),
        ))
    }
}

/// One column-to-be: a state-machine node and its accumulated values.
struct NodeBuilder {
    tag: u32,
    subtype: Subtype,
    parent: Option<usize>,
    data: BytesMut,
}

/// The state machine under construction.
struct Machine {
    nodes: Vec<NodeBuilder>,
    interned: HashMap<(Option<usize>, u32, u8), usize>,
    boundary: BytesMut,
}

impl Machine {
    /// The NoOp sentinel is always node 0, which is also the start node:
    /// each record's walk leaves it, and ends by transitioning back into
    /// it.
    const SENTINEL: usize = 0;

    fn new() -> Self {
        Self {
            nodes: vec![NodeBuilder {
                tag: 0,
                subtype: Subtype::NoOp,
                parent: None,
                data: BytesMut::new(),
            }],
            interned: HashMap::new(),
            boundary: BytesMut::new(),
        }
    }

    fn intern(&mut self, parent: Option<usize>, tag: u32, subtype: Subtype) -> usize {
        let key = (parent, tag, subtype.byte());
        if let Some(&index) = self.interned.get(&key) {
            return index;
        }
        self.nodes.push(NodeBuilder {
            tag,
            subtype,
            parent,
            data: BytesMut::new(),
        });
        let index = self.nodes.len() - 1;
        self.interned.insert(key, index);
        index
    }

    /// Emit one record, in reverse field order, returning the node visit
    /// sequence.
    fn emit_record(&mut self, record: &[u8]) -> Result<Vec<usize>> {
        let mut visits = Vec::new();
        match strict_fields(record) {
            Ok(fields) => {
                for field in fields.iter().rev() {
                    self.emit_field(record, field, None, &mut visits, 0)?;
                }
            }
            Err(_) => {
                // Not a representable wire message: store it whole in the
                // tagless raw column.
                let node = self.intern(None, 0, Subtype::LengthDelimited);
                let data = &mut self.nodes[node].data;
                varint::encode_varint_u64(data, record.len() as u64);
                data.put_slice(record);
                visits.push(node);
            }
        }
        Ok(visits)
    }

    fn emit_field(
        &mut self,
        data: &[u8],
        field: &WireField,
        parent: Option<usize>,
        visits: &mut Vec<usize>,
        depth: usize,
    ) -> Result<()> {
        let tag = (field.field_number << 3) | u32::from(field.wire_type);
        match field.wire_type {
            WIRE_VARINT | WIRE_FIXED32 | WIRE_FIXED64 => {
                let subtype = match field.wire_type {
                    WIRE_VARINT => Subtype::Varint,
                    WIRE_FIXED32 => Subtype::Fixed32,
                    _ => Subtype::Fixed64,
                };
                let node = self.intern(parent, tag, subtype);
                self.nodes[node]
                    .data
                    .put_slice(&data[field.value_start..field.value_end]);
                visits.push(node);
            }
            WIRE_LEN => {
                let payload = &data[field.value_start..field.value_end];
                let children = if field.canonical_len
                    && !payload.is_empty()
                    && depth < wire::MAX_NESTING_DEPTH
                {
                    strict_fields(payload).ok()
                } else {
                    None
                };
                match children {
                    Some(children) => {
                        let node = self.intern(parent, tag, Subtype::MessageStart);
                        for child in children.iter().rev() {
                            self.emit_field(payload, child, Some(node), visits, depth + 1)?;
                        }
                        varint::encode_varint_u64(
                            &mut self.nodes[node].data,
                            payload.len() as u64,
                        );
                        visits.push(node);
                    }
                    None => {
                        let node = self.intern(parent, tag, Subtype::LengthDelimited);
                        // Keep the original length varint bytes, which may
                        // be non-canonical.
                        let (_, tag_len) = varint_at(data, field.start)?;
                        self.nodes[node]
                            .data
                            .put_slice(&data[field.start + tag_len..field.value_end]);
                        visits.push(node);
                    }
                }
            }
            WIRE_START_GROUP => {
                let start = self.intern(parent, tag, Subtype::StartGroup);
                let end = self.intern(
                    parent,
                    (field.field_number << 3) | u32::from(WIRE_END_GROUP),
                    Subtype::EndGroup,
                );
                // Reverse order: the end tag is emitted first, the start
                // tag last, so the forward bytes read start..end.
                visits.push(end);
                let content = &data[field.value_start..field.value_end];
                for child in strict_fields(content)?.iter().rev() {
                    self.emit_field(content, child, Some(start), visits, depth + 1)?;
                }
                visits.push(start);
            }
            other => {
                return Err(Error::InvalidRecord(format!(
                    "unexpected wire type {} in validated record",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn varint_at(data: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut cursor = &data[pos..];
    let before = cursor.len();
    let value = varint::decode_varint_u64(&mut cursor)?;
    Ok((value, before - cursor.len()))
}

/// Top-level fields of a representable wire message: structurally valid,
/// every tag canonically encoded (re-framing re-encodes tags, so a
/// non-canonical tag could not round-trip), group contents checked
/// recursively since their fields become nodes whenever the group does.
fn strict_fields(data: &[u8]) -> Result<Vec<WireField>> {
    let mut fields = Vec::new();
    let mut iter = wire::WireIter::new(data);
    while let Some(field) = iter.next_field()? {
        let (tag, tag_len) = varint_at(data, field.start)?;
        if tag_len != varint::varint_len_u64(tag) {
            return Err(Error::InvalidRecord("non-canonical tag encoding".to_string()));
        }
        if field.wire_type == WIRE_START_GROUP {
            strict_fields(&data[field.value_start..field.value_end])?;
        }
        fields.push(field);
    }
    Ok(fields)
}
