//! Transposed Chunk Decoder
//!
//! Reverses the columnar layout: parse the directory sections, mark each
//! state-machine node against the field projection, then walk the
//! automaton once per record (records last-first), copying values out of
//! the column buffers into a backward writer. Buckets decompress lazily,
//! so projected-away columns are never inflated.
//!
//! Everything here is structural: any inconsistency - an index out of
//! range, a transition past the end of the stream, a buffer that ends
//! early or late, a sub-message length that disagrees with what was
//! emitted - rejects the whole chunk. Per-record recovery happens a
//! layer up, where records are distinguishable after framing.

use bytes::Bytes;

use baler_core::varint;
use baler_core::wire::MAX_NESTING_DEPTH;
use baler_core::{Chain, ChainBackwardWriter, ChainReader, Error, Result};

use crate::compression::{decompress, CompressionKind};
use crate::projection::FieldProjection;

use super::{Subtype, BOUNDARY_BUFFER, TRANSITIONS_EXPLICIT, TRANSITIONS_IMPLICIT};

/// Values at or above this size are prepended as shared blocks instead
/// of being copied into the writer's scratch.
const ZERO_COPY_THRESHOLD: usize = 512;

/// Decode a transposed chunk payload into `(limits, values)`.
///
/// `src` must be positioned at the start of the payload and is consumed
/// to its end on success.
pub(crate) fn decode(
    src: &mut ChainReader,
    num_records: u64,
    decoded_data_size: u64,
    projection: &FieldProjection,
) -> Result<(Vec<u64>, Chain)> {
    let parsed = parse_sections(src, num_records)?;
    let num_records = usize::try_from(num_records).map_err(|_| Error::TooManyRecords(num_records))?;

    let mut walker = Walker::new(parsed, projection, decoded_data_size)?;
    let mut reversed_lengths = Vec::with_capacity(num_records);
    for _ in 0..num_records {
        reversed_lengths.push(walker.decode_record()?);
    }
    walker.finish()?;

    reversed_lengths.reverse();
    let mut limits = Vec::with_capacity(num_records);
    let mut total: u64 = 0;
    for length in reversed_lengths {
        total = total
            .checked_add(length)
            .ok_or(Error::Overflow("record end offsets"))?;
        limits.push(total);
    }

    let values = walker.writer.into_chain();
    debug_assert_eq!(total, values.len() as u64);
    if projection.includes_all() {
        if values.len() as u64 != decoded_data_size {
            return Err(Error::InvalidChunk(format!(
                "decoded {} bytes, header says {}",
                values.len(),
                decoded_data_size
            )));
        }
    } else if values.len() as u64 > decoded_data_size {
        return Err(Error::InvalidChunk(format!(
            "projected decode produced {} bytes, more than the declared {}",
            values.len(),
            decoded_data_size
        )));
    }

    Ok((limits, values))
}

/// Transition behavior of one node.
#[derive(Debug, Clone, Copy)]
enum Next {
    /// `(index + 1) mod node_count`.
    Implicit,
    Static(usize),
    /// Consume a delta from the transitions stream.
    Computed,
}

/// Projection-resolved behavior of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeMode {
    Emit,
    /// Excluded, but its buffer is shared with an emitting consumer:
    /// advance through the bytes without emitting.
    Consume,
    /// Excluded with a private buffer: touch nothing.
    Elide,
}

struct Node {
    subtype: Subtype,
    field_number: u32,
    /// Pre-encoded wire tag varint.
    tag_bytes: [u8; 5],
    tag_len: u8,
    buffer: Option<usize>,
    parent: Option<usize>,
    next: Next,
    /// Enclosing sub-message/group nodes, outermost first.
    ancestors: Vec<usize>,
    mode: NodeMode,
}

struct BufferSpec {
    bucket: usize,
    offset: usize,
    size: usize,
}

struct Bucket {
    stored: Bytes,
    decoded_size: usize,
    decoded: Option<Bytes>,
}

/// The value columns, with lazy per-bucket decompression.
struct BufferSet {
    kind: CompressionKind,
    specs: Vec<BufferSpec>,
    buckets: Vec<Bucket>,
    views: Vec<Option<Bytes>>,
    cursors: Vec<usize>,
}

impl BufferSet {
    fn view(&mut self, index: usize) -> Result<Bytes> {
        if let Some(view) = &self.views[index] {
            return Ok(view.clone());
        }
        let spec = &self.specs[index];
        let bucket = &mut self.buckets[spec.bucket];
        if bucket.decoded.is_none() {
            let decoded = if self.kind == CompressionKind::None {
                if bucket.stored.len() != bucket.decoded_size {
                    return Err(Error::InvalidChunk(format!(
                        "bucket holds {} bytes, its buffers declare {}",
                        bucket.stored.len(),
                        bucket.decoded_size
                    )));
                }
                bucket.stored.clone()
            } else {
                decompress(self.kind, &bucket.stored, bucket.decoded_size as u64)?
            };
            bucket.decoded = Some(decoded);
        }
        let view = match &bucket.decoded {
            Some(decoded) => decoded.slice(spec.offset..spec.offset + spec.size),
            None => return Err(Error::InvalidChunk("bucket failed to materialize".to_string())),
        };
        self.views[index] = Some(view.clone());
        Ok(view)
    }

    /// Copy `n` bytes out of buffer `index`, advancing its cursor.
    fn read_bytes(&mut self, index: usize, n: usize) -> Result<Bytes> {
        let view = self.view(index)?;
        let cursor = self.cursors[index];
        if n > view.len() - cursor {
            return Err(Error::InvalidChunk(format!(
                "value buffer {} exhausted: wanted {} bytes, {} left",
                index,
                n,
                view.len() - cursor
            )));
        }
        self.cursors[index] = cursor + n;
        Ok(view.slice(cursor..cursor + n))
    }

    /// Read one varint out of buffer `index`, returning its value and
    /// its raw bytes (preserved as stored).
    fn read_varint(&mut self, index: usize) -> Result<(u64, Bytes)> {
        let view = self.view(index)?;
        let cursor = self.cursors[index];
        let mut slice = &view[cursor..];
        let before = slice.len();
        let value = varint::decode_varint_u64(&mut slice).map_err(|_| {
            Error::InvalidChunk(format!("bad varint in value buffer {}", index))
        })?;
        let consumed = before - slice.len();
        self.cursors[index] = cursor + consumed;
        Ok((value, view.slice(cursor..cursor + consumed)))
    }
}

/// Cursor over the decompressed transition-delta stream.
struct Transitions {
    data: Bytes,
    pos: usize,
}

impl Transitions {
    fn next(&mut self, current: usize, node_count: usize) -> Result<usize> {
        let mut slice = &self.data[self.pos..];
        let before = slice.len();
        let delta = varint::decode_varint_i64(&mut slice)
            .map_err(|_| Error::InvalidChunk("transition past end of stream".to_string()))?;
        self.pos += before - slice.len();
        let target = (current as i64)
            .checked_add(delta)
            .ok_or(Error::Overflow("transition target"))?;
        if target < 0 || target >= node_count as i64 {
            return Err(Error::InvalidChunk(format!(
                "transition target {} out of range",
                target
            )));
        }
        Ok(target as usize)
    }

    fn finished(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Everything read out of the payload sections.
struct Sections {
    nodes: Vec<Node>,
    start: usize,
    buffers: BufferSet,
    transitions: Transitions,
    total_buffer_bytes: u64,
    num_records: u64,
}

fn read_count(src: &mut ChainReader, what: &str) -> Result<usize> {
    let count = src.read_varint()?;
    // Every directory entry takes at least one payload byte, which
    // bounds allocations against a lying count.
    if count > src.remaining() as u64 {
        return Err(Error::InvalidChunk(format!(
            "{} {} cannot fit in {} payload bytes",
            count,
            what,
            src.remaining()
        )));
    }
    Ok(count as usize)
}

fn parse_sections(src: &mut ChainReader, num_records: u64) -> Result<Sections> {
    let kind = CompressionKind::try_from(src.read_u8()?)?;
    let num_buckets = read_count(src, "buckets")?;
    let num_buffers = read_count(src, "buffers")?;
    let num_nodes = read_count(src, "nodes")?;
    let mode = src.read_u8()?;
    if mode != TRANSITIONS_IMPLICIT && mode != TRANSITIONS_EXPLICIT {
        return Err(Error::InvalidChunk(format!(
            "unknown transitions mode: {}",
            mode
        )));
    }
    let explicit = mode == TRANSITIONS_EXPLICIT;

    // Buffer sizes
    let mut buffer_sizes = Vec::with_capacity(num_buffers);
    let mut total_buffer_bytes: u64 = 0;
    for _ in 0..num_buffers {
        let size = src.read_varint()?;
        total_buffer_bytes = total_buffer_bytes
            .checked_add(size)
            .ok_or(Error::Overflow("buffer sizes"))?;
        buffer_sizes.push(usize::try_from(size).map_err(|_| Error::Overflow("buffer size"))?);
    }

    // Bucket directory
    let mut directory = Vec::with_capacity(num_buckets);
    let mut directory_buffers = 0usize;
    for _ in 0..num_buckets {
        let stored_len = src.read_varint()?;
        let stored_len =
            usize::try_from(stored_len).map_err(|_| Error::Overflow("bucket length"))?;
        let count = src.read_varint()?;
        let count = usize::try_from(count).map_err(|_| Error::Overflow("bucket buffer count"))?;
        directory_buffers = directory_buffers
            .checked_add(count)
            .ok_or(Error::Overflow("bucket buffer count"))?;
        directory.push((stored_len, count));
    }
    if directory_buffers != num_buffers {
        return Err(Error::InvalidChunk(format!(
            "buckets claim {} buffers, header says {}",
            directory_buffers, num_buffers
        )));
    }

    // Node table
    let mut nodes = Vec::with_capacity(num_nodes);
    for _ in 0..num_nodes {
        let tag = src.read_varint()?;
        let tag = u32::try_from(tag)
            .map_err(|_| Error::InvalidChunk("node tag exceeds 32 bits".to_string()))?;
        let subtype = Subtype::from_byte(src.read_u8()?)?;
        let buffer = match src.read_varint()? {
            0 => None,
            biased => {
                let index = usize::try_from(biased - 1).map_err(|_| Error::Overflow("buffer index"))?;
                if index >= num_buffers {
                    return Err(Error::InvalidChunk(format!(
                        "buffer index {} out of range",
                        index
                    )));
                }
                Some(index)
            }
        };
        let parent = match src.read_varint()? {
            0 => None,
            biased => {
                let index = usize::try_from(biased - 1).map_err(|_| Error::Overflow("parent index"))?;
                if index >= num_nodes {
                    return Err(Error::InvalidChunk(format!(
                        "parent index {} out of range",
                        index
                    )));
                }
                Some(index)
            }
        };
        let next = if explicit {
            match src.read_varint()? {
                0 => Next::Computed,
                biased => {
                    let index = usize::try_from(biased - 1).map_err(|_| Error::Overflow("next index"))?;
                    if index >= num_nodes {
                        return Err(Error::InvalidChunk(format!(
                            "next index {} out of range",
                            index
                        )));
                    }
                    Next::Static(index)
                }
            }
        } else {
            Next::Implicit
        };
        if subtype.uses_buffer() != buffer.is_some() {
            return Err(Error::InvalidChunk(format!(
                "node subtype {:?} disagrees with its buffer reference",
                subtype
            )));
        }

        let mut tag_bytes = [0u8; 5];
        let mut tag_cursor = &mut tag_bytes[..];
        varint::encode_varint_u64(&mut tag_cursor, u64::from(tag));
        let tag_len = (5 - tag_cursor.len()) as u8;

        nodes.push(Node {
            subtype,
            field_number: tag >> 3,
            tag_bytes,
            tag_len,
            buffer,
            parent,
            next,
            ancestors: Vec::new(),
            mode: NodeMode::Emit,
        });
    }

    // Parents must be nesting nodes, and parent chains must terminate.
    for index in 0..nodes.len() {
        if let Some(parent) = nodes[index].parent {
            if !matches!(
                nodes[parent].subtype,
                Subtype::MessageStart | Subtype::StartGroup
            ) {
                return Err(Error::InvalidChunk(format!(
                    "parent node {} is not a sub-message or group",
                    parent
                )));
            }
        }
        let mut ancestors = Vec::new();
        let mut cursor = nodes[index].parent;
        while let Some(parent) = cursor {
            ancestors.push(parent);
            if ancestors.len() > MAX_NESTING_DEPTH {
                return Err(Error::InvalidChunk(
                    "field nesting too deep or cyclic".to_string(),
                ));
            }
            cursor = nodes[parent].parent;
        }
        ancestors.reverse();
        nodes[index].ancestors = ancestors;
    }

    let start = src.read_varint()?;
    let start = usize::try_from(start).map_err(|_| Error::Overflow("start node"))?;
    if num_nodes == 0 {
        if num_records != 0 {
            return Err(Error::InvalidChunk(
                "records declared but the state machine is empty".to_string(),
            ));
        }
    } else if start >= num_nodes {
        return Err(Error::InvalidChunk(format!(
            "start node {} out of range",
            start
        )));
    }

    // Bucket bodies; buffers are sliced out lazily.
    let mut specs = Vec::with_capacity(num_buffers);
    let mut buckets = Vec::with_capacity(num_buckets);
    let mut next_buffer = 0usize;
    for (bucket_index, &(stored_len, count)) in directory.iter().enumerate() {
        let stored = src.read_exact(stored_len)?.to_bytes();
        let mut offset = 0usize;
        for _ in 0..count {
            let size = buffer_sizes[next_buffer];
            specs.push(BufferSpec {
                bucket: bucket_index,
                offset,
                size,
            });
            offset = offset
                .checked_add(size)
                .ok_or(Error::Overflow("bucket decoded size"))?;
            next_buffer += 1;
        }
        buckets.push(Bucket {
            stored,
            decoded_size: offset,
            decoded: None,
        });
    }

    // Transitions stream: the rest of the payload.
    let transitions_data = if !explicit {
        if src.remaining() > 0 {
            return Err(Error::InvalidChunk(
                "transitions stream present in implicit mode".to_string(),
            ));
        }
        Bytes::new()
    } else if src.remaining() == 0 {
        Bytes::new()
    } else if kind == CompressionKind::None {
        src.read_exact(src.remaining())?.to_bytes()
    } else {
        let decoded_len = src.read_varint()?;
        let body = src.read_exact(src.remaining())?;
        decompress(kind, &body.to_bytes(), decoded_len)?
    };

    // The boundary buffer must hold at least one varint per record.
    if num_records > 0 {
        if num_buffers == 0 {
            return Err(Error::InvalidChunk(
                "missing record-boundary buffer".to_string(),
            ));
        }
        if num_records > buffer_sizes[BOUNDARY_BUFFER] as u64 {
            return Err(Error::InvalidChunk(format!(
                "{} records cannot fit in a {}-byte boundary buffer",
                num_records, buffer_sizes[BOUNDARY_BUFFER]
            )));
        }
    }

    Ok(Sections {
        nodes,
        start,
        buffers: BufferSet {
            kind,
            specs,
            buckets,
            views: vec![None; num_buffers],
            cursors: vec![0; num_buffers],
        },
        transitions: Transitions {
            data: transitions_data,
            pos: 0,
        },
        total_buffer_bytes,
        num_records,
    })
}

/// The automaton walk.
struct Walker {
    nodes: Vec<Node>,
    start: usize,
    buffers: BufferSet,
    transitions: Transitions,
    writer: ChainBackwardWriter,
    /// Open sub-message/group frames: (node, writer position at open).
    frames: Vec<(usize, u64)>,
    includes_all: bool,
    decoded_data_size: u64,
    steps: u64,
    step_cap: u64,
}

impl Walker {
    fn new(
        mut sections: Sections,
        projection: &FieldProjection,
        decoded_data_size: u64,
    ) -> Result<Self> {
        if !projection.includes_all() {
            mark_projection(&mut sections.nodes, projection);
        }

        // Every legitimate visit either consumes a buffer byte, emits an
        // output byte, or consumes a transition byte, so this cap is
        // unreachable except through a non-terminating automaton.
        let step_cap = (sections.nodes.len() as u64)
            .saturating_add(sections.total_buffer_bytes)
            .saturating_add(decoded_data_size)
            .saturating_add(sections.num_records)
            .saturating_add(sections.transitions.data.len() as u64)
            .saturating_add(1024);

        let size_hint = if projection.includes_all() {
            usize::try_from(decoded_data_size).map_err(|_| Error::Overflow("size hint"))?
        } else {
            0
        };

        Ok(Self {
            nodes: sections.nodes,
            start: sections.start,
            buffers: sections.buffers,
            transitions: sections.transitions,
            writer: ChainBackwardWriter::with_size_hint(size_hint),
            frames: Vec::new(),
            includes_all: projection.includes_all(),
            decoded_data_size,
            steps: 0,
            step_cap,
        })
    }

    fn next_node(&mut self, current: usize) -> Result<usize> {
        match self.nodes[current].next {
            Next::Implicit => Ok((current + 1) % self.nodes.len()),
            Next::Static(next) => Ok(next),
            Next::Computed => self.transitions.next(current, self.nodes.len()),
        }
    }

    /// Decode one record (the walk emits records last-first), returning
    /// its emitted length.
    fn decode_record(&mut self) -> Result<u64> {
        let record_start = self.writer.position();
        let mut current = self.start;
        loop {
            current = self.next_node(current)?;
            if self.nodes[current].subtype == Subtype::NoOp {
                break;
            }
            self.steps += 1;
            if self.steps > self.step_cap {
                return Err(Error::InvalidChunk(
                    "state machine did not terminate".to_string(),
                ));
            }
            self.visit(current)?;
            if self.writer.position() > self.decoded_data_size {
                return Err(Error::InvalidChunk(
                    "decoded data exceeds declared size".to_string(),
                ));
            }
        }
        if !self.frames.is_empty() {
            return Err(Error::InvalidChunk(
                "record ended inside a sub-message".to_string(),
            ));
        }

        let emitted = self.writer.position() - record_start;
        let (stored, _) = self.buffers.read_varint(BOUNDARY_BUFFER)?;
        if self.includes_all && stored != emitted {
            return Err(Error::InvalidChunk(format!(
                "record decoded to {} bytes, boundary buffer says {}",
                emitted, stored
            )));
        }
        Ok(emitted)
    }

    fn visit(&mut self, index: usize) -> Result<()> {
        let node = &self.nodes[index];
        if node.subtype == Subtype::Skip {
            return Ok(());
        }
        match node.mode {
            NodeMode::Elide => Ok(()),
            NodeMode::Consume => self.consume(index),
            NodeMode::Emit => self.emit(index),
        }
    }

    /// Advance through an excluded field's bytes without emitting.
    fn consume(&mut self, index: usize) -> Result<()> {
        let subtype = self.nodes[index].subtype;
        let buffer = self.nodes[index].buffer;
        match (subtype, buffer) {
            (Subtype::Varint, Some(buffer)) => {
                self.buffers.read_varint(buffer)?;
            }
            (Subtype::Fixed32, Some(buffer)) => {
                self.buffers.read_bytes(buffer, 4)?;
            }
            (Subtype::Fixed64, Some(buffer)) => {
                self.buffers.read_bytes(buffer, 8)?;
            }
            (Subtype::LengthDelimited, Some(buffer)) => {
                let (length, _) = self.buffers.read_varint(buffer)?;
                let length = usize::try_from(length).map_err(|_| Error::Overflow("value length"))?;
                self.buffers.read_bytes(buffer, length)?;
            }
            (Subtype::MessageStart, Some(buffer)) => {
                self.buffers.read_varint(buffer)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Open any frames this node's ancestors need, verifying the open
    /// frames form a prefix of its ancestor chain. For sub-message and
    /// group nodes, close their own frame instead and return the byte
    /// count their children emitted.
    fn maintain_frames(&mut self, index: usize) -> Result<u64> {
        let closer = matches!(
            self.nodes[index].subtype,
            Subtype::MessageStart | Subtype::StartGroup
        );
        if closer {
            if let Some(&(frame_node, frame_position)) = self.frames.last() {
                if frame_node == index {
                    self.frames.pop();
                    return Ok(self.writer.position() - frame_position);
                }
            }
        }
        for (depth, &(frame_node, _)) in self.frames.iter().enumerate() {
            if self.nodes[index].ancestors.get(depth) != Some(&frame_node) {
                return Err(Error::InvalidChunk(
                    "interleaved sub-message frames".to_string(),
                ));
            }
        }
        if self.frames.len() > self.nodes[index].ancestors.len() {
            return Err(Error::InvalidChunk(
                "interleaved sub-message frames".to_string(),
            ));
        }
        let position = self.writer.position();
        for depth in self.frames.len()..self.nodes[index].ancestors.len() {
            self.frames.push((self.nodes[index].ancestors[depth], position));
        }
        Ok(0)
    }

    fn emit(&mut self, index: usize) -> Result<()> {
        let measured = self.maintain_frames(index)?;
        let subtype = self.nodes[index].subtype;
        let buffer = self.nodes[index].buffer;
        match subtype {
            Subtype::Varint => {
                let buffer = require_buffer(buffer)?;
                let (_, bytes) = self.buffers.read_varint(buffer)?;
                self.push_value(bytes);
                self.push_tag(index);
            }
            Subtype::Fixed32 | Subtype::Fixed64 => {
                let buffer = require_buffer(buffer)?;
                let width = if subtype == Subtype::Fixed32 { 4 } else { 8 };
                let bytes = self.buffers.read_bytes(buffer, width)?;
                self.push_value(bytes);
                self.push_tag(index);
            }
            Subtype::LengthDelimited => {
                let buffer = require_buffer(buffer)?;
                let (length, length_bytes) = self.buffers.read_varint(buffer)?;
                let length = usize::try_from(length).map_err(|_| Error::Overflow("value length"))?;
                let bytes = self.buffers.read_bytes(buffer, length)?;
                self.push_value(bytes);
                if self.nodes[index].tag_is_zero() {
                    // Raw-record column: the bytes are the whole record.
                } else {
                    self.writer.push(&length_bytes);
                    self.push_tag(index);
                }
            }
            Subtype::StartGroup | Subtype::EndGroup => {
                self.push_tag(index);
            }
            Subtype::MessageStart => {
                let buffer = require_buffer(buffer)?;
                let (stored, _) = self.buffers.read_varint(buffer)?;
                if self.includes_all && stored != measured {
                    return Err(Error::InvalidChunk(format!(
                        "sub-message emitted {} bytes, its column says {}",
                        measured, stored
                    )));
                }
                let mut length_bytes = [0u8; varint::MAX_VARINT64_LEN];
                let mut cursor = &mut length_bytes[..];
                varint::encode_varint_u64(&mut cursor, measured);
                let written = varint::MAX_VARINT64_LEN - cursor.len();
                self.writer.push(&length_bytes[..written]);
                self.push_tag(index);
            }
            Subtype::NoOp | Subtype::Skip => {}
        }
        Ok(())
    }

    fn push_value(&mut self, bytes: Bytes) {
        if bytes.len() >= ZERO_COPY_THRESHOLD {
            self.writer.push_bytes(bytes);
        } else {
            self.writer.push(&bytes);
        }
    }

    fn push_tag(&mut self, index: usize) {
        let node = &self.nodes[index];
        let tag = node.tag_bytes;
        let len = node.tag_len as usize;
        self.writer.push(&tag[..len]);
    }

    /// Post-walk consistency: the transitions stream and every touched
    /// buffer must be exactly consumed; with full projection, every
    /// buffer must have been consumed.
    fn finish(&mut self) -> Result<()> {
        if !self.transitions.finished() {
            return Err(Error::InvalidChunk(format!(
                "{} unconsumed transition bytes",
                self.transitions.data.len() - self.transitions.pos
            )));
        }
        for index in 0..self.buffers.cursors.len() {
            let consumed = self.buffers.cursors[index];
            let size = self.buffers.specs[index].size;
            if consumed != size && (self.includes_all || consumed > 0) {
                return Err(Error::InvalidChunk(format!(
                    "value buffer {} consumed {} of {} bytes",
                    index, consumed, size
                )));
            }
        }
        Ok(())
    }
}

impl Node {
    fn tag_is_zero(&self) -> bool {
        self.tag_len == 1 && self.tag_bytes[0] == 0
    }
}

fn require_buffer(buffer: Option<usize>) -> Result<usize> {
    buffer.ok_or_else(|| Error::InvalidChunk("value node without a buffer".to_string()))
}

/// Mark each node Emit, Consume, or Elide against the projection.
fn mark_projection(nodes: &mut [Node], projection: &FieldProjection) {
    let mut paths: Vec<Vec<u32>> = Vec::with_capacity(nodes.len());
    for node in nodes.iter() {
        let mut path: Vec<u32> = node
            .ancestors
            .iter()
            .map(|&ancestor| nodes[ancestor].field_number)
            .collect();
        if node.field_number > 0 {
            path.push(node.field_number);
        }
        paths.push(path);
    }

    let mut used_buffers: Vec<bool> = Vec::new();
    for (node, path) in nodes.iter_mut().zip(&paths) {
        let included = match node.subtype {
            Subtype::NoOp => true,
            Subtype::Skip => false,
            _ => projection.covers(path),
        };
        node.mode = if included { NodeMode::Emit } else { NodeMode::Elide };
    }
    for node in nodes.iter() {
        if let Some(buffer) = node.buffer {
            if used_buffers.len() <= buffer {
                used_buffers.resize(buffer + 1, false);
            }
            if node.mode == NodeMode::Emit {
                used_buffers[buffer] = true;
            }
        }
    }
    if used_buffers.len() <= BOUNDARY_BUFFER {
        used_buffers.resize(BOUNDARY_BUFFER + 1, true);
    }
    used_buffers[BOUNDARY_BUFFER] = true;
    for node in nodes.iter_mut() {
        if node.mode == NodeMode::Elide {
            if let Some(buffer) = node.buffer {
                if used_buffers[buffer] {
                    node.mode = NodeMode::Consume;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::compress;
    use crate::config::EncoderOptions;
    use crate::projection::FieldPath;
    use crate::transpose::TransposeEncoder;
    use baler_core::chunk::Chunk;
    use bytes::{BufMut, BytesMut};

    fn encode(records: &[&[u8]], kind: CompressionKind) -> Chunk {
        let mut encoder = TransposeEncoder::new(EncoderOptions {
            compression: kind,
            ..Default::default()
        });
        for record in records {
            encoder
                .add_record(Bytes::copy_from_slice(record))
                .unwrap();
        }
        encoder.encode().unwrap()
    }

    fn decode_chunk(chunk: &Chunk, projection: &FieldProjection) -> Result<(Vec<u64>, Chain)> {
        let mut src = ChainReader::new(chunk.data.clone());
        let out = decode(
            &mut src,
            chunk.header.num_records,
            chunk.header.decoded_data_size,
            projection,
        )?;
        src.verify_end()?;
        Ok(out)
    }

    fn split_records(limits: &[u64], values: &Chain) -> Vec<Vec<u8>> {
        let blob = values.to_vec();
        let mut out = Vec::new();
        let mut start = 0usize;
        for &limit in limits {
            out.push(blob[start..limit as usize].to_vec());
            start = limit as usize;
        }
        out
    }

    fn assert_roundtrip(records: &[&[u8]], kind: CompressionKind) {
        let chunk = encode(records, kind);
        let (limits, values) = decode_chunk(&chunk, &FieldProjection::all()).unwrap();
        assert_eq!(limits.len(), records.len());
        assert_eq!(
            limits.last().copied().unwrap_or(0),
            chunk.header.decoded_data_size
        );
        let decoded = split_records(&limits, &values);
        for (got, want) in decoded.iter().zip(records) {
            assert_eq!(got.as_slice(), *want);
        }
    }

    // ---------------------------------------------------------------
    // Round-trips
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_empty_chunk() {
        assert_roundtrip(&[], CompressionKind::None);
    }

    #[test]
    fn test_roundtrip_uniform_records() {
        assert_roundtrip(
            &[b"\x08\x01\x12\x02hi", b"\x08\x07\x12\x02yo", b"\x08\x00\x12\x02ok"],
            CompressionKind::None,
        );
    }

    #[test]
    fn test_roundtrip_scalar_wire_types() {
        // varint, fixed32, fixed64 in one record
        let record: &[u8] = &[
            0x08, 0x01, // field 1 varint 1
            0x15, 0xDE, 0xAD, 0xBE, 0xEF, // field 2 fixed32
            0x19, 1, 2, 3, 4, 5, 6, 7, 8, // field 3 fixed64
        ];
        assert_roundtrip(&[record, record], CompressionKind::None);
    }

    #[test]
    fn test_roundtrip_mixed_shapes() {
        assert_roundtrip(
            &[b"\x08\x01", b"\x10\x02", b"\x08\x03\x10\x04", b""],
            CompressionKind::None,
        );
    }

    #[test]
    fn test_roundtrip_repeated_fields() {
        assert_roundtrip(
            &[b"\x08\x01\x08\x02\x08\x03", b"\x08\x04"],
            CompressionKind::None,
        );
    }

    #[test]
    fn test_roundtrip_nested_message() {
        // field 1 sub-message { field 2 varint 5 }, plus a sibling
        assert_roundtrip(
            &[b"\x0A\x02\x10\x05\x18\x01", b"\x0A\x02\x10\x06\x18\x02"],
            CompressionKind::None,
        );
    }

    #[test]
    fn test_roundtrip_doubly_nested_message() {
        // field 1 { field 2 { field 3 varint 9 } }
        assert_roundtrip(&[b"\x0A\x04\x12\x02\x18\x09"], CompressionKind::None);
    }

    #[test]
    fn test_roundtrip_groups() {
        // field 1 group { field 2 varint 5 }
        assert_roundtrip(
            &[b"\x0B\x10\x05\x0C", b"\x0B\x10\x06\x0C"],
            CompressionKind::None,
        );
    }

    #[test]
    fn test_roundtrip_raw_records() {
        assert_roundtrip(
            &[b"not a message \xFF\xFF", b"a", b""],
            CompressionKind::None,
        );
    }

    #[test]
    fn test_roundtrip_mixed_raw_and_structured() {
        assert_roundtrip(&[b"\x08\x01", b"\xFF\xFF\xFF"], CompressionKind::None);
    }

    #[test]
    fn test_roundtrip_empty_records() {
        assert_roundtrip(&[b"", b"", b""], CompressionKind::None);
    }

    #[test]
    fn test_roundtrip_non_canonical_length_preserved() {
        // field 2, length 3 encoded in two bytes; must survive unchanged
        assert_roundtrip(&[b"\x12\x83\x00abc"], CompressionKind::None);
    }

    #[test]
    fn test_roundtrip_all_compression_kinds() {
        let records: Vec<Vec<u8>> = (0..40u8)
            .map(|i| {
                let mut record = BytesMut::new();
                record.put_u8(0x08);
                record.put_u8(i);
                record.put_u8(0x12);
                record.put_u8(5);
                record.put_slice(format!("v{:04}", i).as_bytes());
                record.to_vec()
            })
            .collect();
        let refs: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();
        for kind in [
            CompressionKind::None,
            CompressionKind::Brotli,
            CompressionKind::Zstd,
            CompressionKind::Snappy,
        ] {
            assert_roundtrip(&refs, kind);
        }
    }

    #[test]
    fn test_roundtrip_large_values_cross_zero_copy_threshold() {
        // field 2, 1000-byte string (length 1000 = varint [0xE8, 0x07])
        let mut record = vec![0x12, 0xE8, 0x07];
        record.extend(std::iter::repeat(b'x').take(1000));
        assert_roundtrip(&[&record, &record], CompressionKind::Zstd);
    }

    // ---------------------------------------------------------------
    // Projection
    // ---------------------------------------------------------------

    #[test]
    fn test_projection_keeps_selected_field() {
        // Records with fields {1: int, 2: string, 3: int}
        let records: &[&[u8]] = &[
            b"\x08\x01\x12\x03abc\x18\x07",
            b"\x08\x02\x12\x03def\x18\x08",
        ];
        let chunk = encode(records, CompressionKind::None);
        let projection = FieldProjection::new([FieldPath::from([1])]);
        let (limits, values) = decode_chunk(&chunk, &projection).unwrap();

        assert_eq!(limits.len(), 2);
        assert!((values.len() as u64) < chunk.header.decoded_data_size);
        let decoded = split_records(&limits, &values);
        assert_eq!(decoded[0], vec![0x08, 0x01]);
        assert_eq!(decoded[1], vec![0x08, 0x02]);
    }

    #[test]
    fn test_projection_superset_keeps_more_fields() {
        let records: &[&[u8]] = &[b"\x08\x01\x12\x03abc\x18\x07"];
        let chunk = encode(records, CompressionKind::None);
        let projection = FieldProjection::new([FieldPath::from([1]), FieldPath::from([3])]);
        let (limits, values) = decode_chunk(&chunk, &projection).unwrap();
        let decoded = split_records(&limits, &values);
        assert_eq!(decoded[0], vec![0x08, 0x01, 0x18, 0x07]);
    }

    #[test]
    fn test_projection_into_nested_message() {
        // field 1 { field 2 varint, field 3 varint }; keep only [1, 2]
        let records: &[&[u8]] = &[b"\x0A\x04\x10\x05\x18\x06", b"\x0A\x04\x10\x07\x18\x08"];
        let chunk = encode(records, CompressionKind::None);
        let projection = FieldProjection::new([FieldPath::from([1, 2])]);
        let (limits, values) = decode_chunk(&chunk, &projection).unwrap();
        let decoded = split_records(&limits, &values);
        // The sub-message is re-framed with its reduced length
        assert_eq!(decoded[0], vec![0x0A, 0x02, 0x10, 0x05]);
        assert_eq!(decoded[1], vec![0x0A, 0x02, 0x10, 0x07]);
    }

    #[test]
    fn test_projection_excluding_whole_message() {
        let records: &[&[u8]] = &[b"\x0A\x02\x10\x05\x18\x01"];
        let chunk = encode(records, CompressionKind::None);
        let projection = FieldProjection::new([FieldPath::from([3])]);
        let (limits, values) = decode_chunk(&chunk, &projection).unwrap();
        let decoded = split_records(&limits, &values);
        assert_eq!(decoded[0], vec![0x18, 0x01]);
    }

    #[test]
    fn test_projection_passes_raw_records_whole() {
        let records: &[&[u8]] = &[b"\xFF not a message"];
        let chunk = encode(records, CompressionKind::None);
        let projection = FieldProjection::new([FieldPath::from([1])]);
        let (limits, values) = decode_chunk(&chunk, &projection).unwrap();
        let decoded = split_records(&limits, &values);
        assert_eq!(decoded[0].as_slice(), b"\xFF not a message");
    }

    #[test]
    fn test_projection_skips_unused_buckets() {
        // Tiny bucket size forces each column into its own bucket; an
        // excluded column's bucket is then never decompressed, so
        // corrupting it goes unnoticed under projection but not under a
        // full decode.
        let mut encoder = TransposeEncoder::new(EncoderOptions {
            compression: CompressionKind::Zstd,
            bucket_size: 1,
        });
        for _ in 0..4 {
            encoder
                .add_record(Bytes::from_static(b"\x08\x01\x12\x04long"))
                .unwrap();
        }
        let chunk = encoder.encode().unwrap();

        // Find the string column's bytes in the payload and corrupt them:
        // the compressed bucket containing "longlonglonglong".
        let payload = chunk.data.to_vec();
        let compressed_column = compress(CompressionKind::Zstd, b"\x04long\x04long\x04long\x04long")
            .unwrap();
        let position = payload
            .windows(compressed_column.len())
            .position(|window| window == compressed_column.as_slice())
            .expect("column bucket not found in payload");
        let mut corrupted = payload.clone();
        corrupted[position..position + compressed_column.len()].fill(0xAA);
        let corrupted_chunk = Chunk {
            header: chunk.header.clone(),
            data: Chain::from(corrupted),
        };

        // Projection {1} never touches the corrupted bucket
        let projection = FieldProjection::new([FieldPath::from([1])]);
        let (limits, values) = decode_chunk(&corrupted_chunk, &projection).unwrap();
        assert_eq!(limits.len(), 4);
        let decoded = split_records(&limits, &values);
        assert_eq!(decoded[0], vec![0x08, 0x01]);

        // A full decode must hit the corruption
        assert!(decode_chunk(&corrupted_chunk, &FieldProjection::all()).is_err());
    }

    // ---------------------------------------------------------------
    // Hostile payloads
    // ---------------------------------------------------------------

    struct NodeSpec {
        tag: u64,
        subtype: u8,
        buffer_plus_1: u64,
        parent_plus_1: u64,
        next_plus_1: u64,
    }

    fn node(tag: u64, subtype: u8, buffer_plus_1: u64, parent_plus_1: u64, next_plus_1: u64) -> NodeSpec {
        NodeSpec {
            tag,
            subtype,
            buffer_plus_1,
            parent_plus_1,
            next_plus_1,
        }
    }

    /// Hand-assemble an uncompressed payload with one bucket.
    fn build_payload(
        explicit: bool,
        buffers: &[&[u8]],
        nodes: &[NodeSpec],
        start: u64,
        transitions: &[u8],
    ) -> Chain {
        let mut payload = BytesMut::new();
        payload.put_u8(0x00); // CompressionKind::None
        let bucket_count: u64 = if buffers.is_empty() { 0 } else { 1 };
        varint::encode_varint_u64(&mut payload, bucket_count);
        varint::encode_varint_u64(&mut payload, buffers.len() as u64);
        varint::encode_varint_u64(&mut payload, nodes.len() as u64);
        payload.put_u8(u8::from(explicit));
        for buffer in buffers {
            varint::encode_varint_u64(&mut payload, buffer.len() as u64);
        }
        if bucket_count == 1 {
            let total: usize = buffers.iter().map(|b| b.len()).sum();
            varint::encode_varint_u64(&mut payload, total as u64);
            varint::encode_varint_u64(&mut payload, buffers.len() as u64);
        }
        for spec in nodes {
            varint::encode_varint_u64(&mut payload, spec.tag);
            payload.put_u8(spec.subtype);
            varint::encode_varint_u64(&mut payload, spec.buffer_plus_1);
            varint::encode_varint_u64(&mut payload, spec.parent_plus_1);
            if explicit {
                varint::encode_varint_u64(&mut payload, spec.next_plus_1);
            }
        }
        varint::encode_varint_u64(&mut payload, start);
        for buffer in buffers {
            payload.put_slice(buffer);
        }
        payload.put_slice(transitions);
        Chain::from(payload.freeze())
    }

    fn decode_payload(
        payload: Chain,
        num_records: u64,
        decoded_data_size: u64,
    ) -> Result<(Vec<u64>, Chain)> {
        let mut src = ChainReader::new(payload);
        let out = decode(
            &mut src,
            num_records,
            decoded_data_size,
            &FieldProjection::all(),
        )?;
        src.verify_end()?;
        Ok(out)
    }

    #[test]
    fn test_minimal_sentinel_machine() {
        // One NoOp node, implicit mode: every record decodes empty.
        let payload = build_payload(false, &[b"\x00\x00"], &[node(0, 0, 0, 0, 0)], 0, &[]);
        let (limits, values) = decode_payload(payload, 2, 0).unwrap();
        assert_eq!(limits, vec![0, 0]);
        assert!(values.is_empty());
    }

    #[test]
    fn test_unknown_subtype_rejected() {
        let payload = build_payload(false, &[b"\x00"], &[node(0, 9, 0, 0, 0)], 0, &[]);
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("unknown node subtype"));
    }

    #[test]
    fn test_buffer_index_out_of_range() {
        let payload = build_payload(
            false,
            &[b"\x00"],
            &[node(0, 0, 0, 0, 0), node(8, 1, 6, 0, 0)],
            0,
            &[],
        );
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("buffer index 5 out of range"));
    }

    #[test]
    fn test_parent_index_out_of_range() {
        let payload = build_payload(
            false,
            &[b"\x00"],
            &[node(0, 0, 0, 9, 0)],
            0,
            &[],
        );
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("parent index 8 out of range"));
    }

    #[test]
    fn test_parent_must_be_nesting_node() {
        // Node 1's parent is the NoOp sentinel
        let payload = build_payload(
            false,
            &[b"\x01", b"\x05"],
            &[node(0, 0, 0, 0, 0), node(8, 1, 2, 1, 0)],
            0,
            &[],
        );
        let err = decode_payload(payload, 1, 2).unwrap_err();
        assert!(err.to_string().contains("not a sub-message or group"));
    }

    #[test]
    fn test_transition_past_end_of_stream() {
        let payload = build_payload(true, &[b"\x00"], &[node(0, 0, 0, 0, 0)], 0, &[]);
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("transition past end of stream"));
    }

    #[test]
    fn test_transition_target_out_of_range() {
        // Delta +5 from node 0 with one node
        let mut transitions = BytesMut::new();
        varint::encode_varint_i64(&mut transitions, 5);
        let payload = build_payload(true, &[b"\x00"], &[node(0, 0, 0, 0, 0)], 0, &transitions);
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_non_terminating_machine_hits_step_cap() {
        // start → node 1 (Skip), which self-loops statically
        let payload = build_payload(
            true,
            &[b"\x00"],
            &[node(0, 0, 0, 0, 2), node(0, 8, 0, 0, 2)],
            0,
            &[],
        );
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("did not terminate"));
    }

    #[test]
    fn test_boundary_length_mismatch() {
        // Machine emits nothing but the boundary buffer claims 1 byte
        let payload = build_payload(false, &[b"\x01"], &[node(0, 0, 0, 0, 0)], 0, &[]);
        let err = decode_payload(payload, 1, 1).unwrap_err();
        assert!(err.to_string().contains("boundary buffer"));
    }

    #[test]
    fn test_unconsumed_transitions_rejected() {
        // All transitions static, but a stray delta byte trails
        let payload = build_payload(true, &[b"\x00"], &[node(0, 0, 0, 0, 1)], 0, &[0x02]);
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("unconsumed transition"));
    }

    #[test]
    fn test_transitions_in_implicit_mode_rejected() {
        let payload = build_payload(false, &[b"\x00"], &[node(0, 0, 0, 0, 0)], 0, &[0x02]);
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("implicit mode"));
    }

    #[test]
    fn test_record_ending_inside_submessage() {
        // Child (parent = node 2) transitions straight back to NoOp
        // without its MessageStart ever being visited.
        let payload = build_payload(
            true,
            &[b"\x02", b"\x05", b"\x00"],
            &[
                node(0, 0, 0, 0, 2),
                node(8, 1, 2, 3, 1),
                node(10, 7, 3, 0, 1),
            ],
            0,
            &[],
        );
        let err = decode_payload(payload, 1, 2).unwrap_err();
        assert!(err.to_string().contains("inside a sub-message"));
    }

    #[test]
    fn test_value_buffer_exhausted() {
        // Varint node reads twice from a one-value buffer
        let payload = build_payload(
            true,
            &[b"\x02\x02", b"\x07"],
            &[node(0, 0, 0, 0, 2), node(8, 1, 2, 0, 1)],
            0,
            &[],
        );
        let err = decode_payload(payload, 2, 4).unwrap_err();
        assert!(err.to_string().contains("exhausted") || err.to_string().contains("bad varint"));
    }

    #[test]
    fn test_records_without_state_machine_rejected() {
        let payload = build_payload(false, &[b"\x00"], &[], 0, &[]);
        let err = decode_payload(payload, 1, 0).unwrap_err();
        assert!(err.to_string().contains("state machine is empty"));
    }

    #[test]
    fn test_boundary_buffer_too_small_for_records() {
        let payload = build_payload(false, &[b"\x00"], &[node(0, 0, 0, 0, 0)], 0, &[]);
        let err = decode_payload(payload, 5, 0).unwrap_err();
        assert!(err.to_string().contains("boundary buffer"));
    }

    #[test]
    fn test_bucket_directory_count_mismatch() {
        // Hand-rolled: header says 2 buffers, directory claims 1
        let mut payload = BytesMut::new();
        payload.put_u8(0x00);
        varint::encode_varint_u64(&mut payload, 1); // buckets
        varint::encode_varint_u64(&mut payload, 2); // buffers
        varint::encode_varint_u64(&mut payload, 1); // nodes
        payload.put_u8(0); // implicit
        varint::encode_varint_u64(&mut payload, 1); // buffer 0 size
        varint::encode_varint_u64(&mut payload, 1); // buffer 1 size
        varint::encode_varint_u64(&mut payload, 2); // bucket stored len
        varint::encode_varint_u64(&mut payload, 1); // bucket buffer count (wrong)
        payload.put_slice(&[0, 0, 0, 0]); // node: tag, subtype, buffer, parent
        varint::encode_varint_u64(&mut payload, 0); // start
        payload.put_slice(&[0x00, 0x00]); // bucket body
        let err = decode_payload(Chain::from(payload.freeze()), 0, 0).unwrap_err();
        assert!(err.to_string().contains("buckets claim"));
    }

    #[test]
    fn test_bucket_body_size_mismatch() {
        // Buffer declares 2 bytes but the uncompressed bucket holds 1
        let mut payload = BytesMut::new();
        payload.put_u8(0x00);
        varint::encode_varint_u64(&mut payload, 1); // buckets
        varint::encode_varint_u64(&mut payload, 1); // buffers
        varint::encode_varint_u64(&mut payload, 1); // nodes
        payload.put_u8(0);
        varint::encode_varint_u64(&mut payload, 2); // buffer 0 size: 2
        varint::encode_varint_u64(&mut payload, 1); // bucket stored len: 1
        varint::encode_varint_u64(&mut payload, 1); // bucket buffer count
        payload.put_slice(&[0, 0, 0, 0]); // NoOp node
        varint::encode_varint_u64(&mut payload, 0); // start
        payload.put_u8(0x00); // bucket body: 1 byte
        let err = decode_payload(Chain::from(payload.freeze()), 1, 0).unwrap_err();
        assert!(err.to_string().contains("its buffers declare"));
    }

    #[test]
    fn test_truncated_payload() {
        let chunk = encode(&[b"\x08\x01"], CompressionKind::None);
        for cut in 1..chunk.data.len() {
            let truncated = chunk.data.slice(0..cut);
            let mut src = ChainReader::new(truncated);
            let result = decode(&mut src, 1, 2, &FieldProjection::all())
                .and_then(|out| src.verify_end().map(|_| out));
            assert!(result.is_err(), "truncation at {} was accepted", cut);
        }
    }
}
