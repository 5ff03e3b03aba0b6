//! Simple Chunk Decoder
//!
//! Reverses the simple layout: decompress the inner stream, convert the
//! record-size varints into sorted end offsets, and hand the value blob
//! out as a zero-copy slice. Every inconsistency - bad varint, size
//! overflow, a blob that is short or long, trailing bytes - rejects the
//! chunk; there is nothing record-local here.

use baler_core::{Chain, ChainReader, Error, Result};

use crate::compression::{decompress, CompressionKind};

/// Decode a simple chunk payload into `(limits, values)`.
///
/// `src` must be positioned at the start of the payload and is consumed
/// to its end on success.
pub(crate) fn decode(
    src: &mut ChainReader,
    num_records: u64,
    decoded_data_size: u64,
) -> Result<(Vec<u64>, Chain)> {
    let kind = CompressionKind::try_from(src.read_u8()?)?;

    let inner = if kind == CompressionKind::None {
        src.read_exact(src.remaining())?
    } else {
        let inner_size = src.read_varint()?;
        let body = src.read_exact(src.remaining())?;
        Chain::from(decompress(kind, &body.to_bytes(), inner_size)?)
    };
    let mut inner = ChainReader::new(inner);

    let num_records =
        usize::try_from(num_records).map_err(|_| Error::TooManyRecords(num_records))?;
    // Each size varint takes at least one byte, which bounds the
    // allocation below against a lying header.
    if num_records > inner.remaining() {
        return Err(Error::InvalidChunk(format!(
            "{} record sizes cannot fit in {} payload bytes",
            num_records,
            inner.remaining()
        )));
    }

    let mut limits = Vec::with_capacity(num_records);
    let mut total: u64 = 0;
    for _ in 0..num_records {
        let size = inner.read_varint()?;
        total = total
            .checked_add(size)
            .ok_or(Error::Overflow("record end offsets"))?;
        limits.push(total);
    }

    if total != decoded_data_size {
        return Err(Error::InvalidChunk(format!(
            "record sizes sum to {}, header says {}",
            total, decoded_data_size
        )));
    }

    let values = inner.read_exact(decoded_data_size as usize)?;
    inner.verify_end()?;

    Ok((limits, values))
}
