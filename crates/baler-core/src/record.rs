//! Record Parsing Seam
//!
//! The chunk decoder does not interpret record payloads; it slices the
//! decoded value stream and hands each record's bytes to an injected
//! parser. [`ParseRecord`] is that seam.
//!
//! ## Implementations
//! - `Chain` / `Bytes` / `Vec<u8>`: identity parsers for callers that
//!   want raw bytes. `Chain` and `Bytes` stay zero-copy where the
//!   decoded values allow it.
//! - [`WireRecord`]: validates that the record is a structurally
//!   well-formed wire-format message before accepting it. A record that
//!   fails validation produces a record-local error, which the chunk
//!   decoder can `recover()` past.

use bytes::Bytes;

use crate::chain::Chain;
use crate::error::Result;
use crate::wire;

/// A destination that a decoded record's bytes are parsed into.
///
/// Implementations must either fully accept `data` or fail without
/// retaining it. Failures should be [`crate::Error::InvalidRecord`] so
/// the chunk decoder treats them as recoverable.
pub trait ParseRecord {
    fn parse_from(&mut self, data: Chain) -> Result<()>;
}

impl ParseRecord for Chain {
    fn parse_from(&mut self, data: Chain) -> Result<()> {
        *self = data;
        Ok(())
    }
}

impl ParseRecord for Bytes {
    fn parse_from(&mut self, data: Chain) -> Result<()> {
        *self = data.to_bytes();
        Ok(())
    }
}

impl ParseRecord for Vec<u8> {
    fn parse_from(&mut self, data: Chain) -> Result<()> {
        self.clear();
        for block in data.blocks() {
            self.extend_from_slice(block);
        }
        Ok(())
    }
}

/// A record validated to be a well-formed wire-format message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireRecord {
    bytes: Bytes,
}

impl WireRecord {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl ParseRecord for WireRecord {
    fn parse_from(&mut self, data: Chain) -> Result<()> {
        let bytes = data.to_bytes();
        wire::validate_message(&bytes)?;
        self.bytes = bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_chain_parser_identity() {
        let mut out = Chain::new();
        out.parse_from(Chain::from(Bytes::from("abc"))).unwrap();
        assert_eq!(out, b"abc".as_slice());
    }

    #[test]
    fn test_bytes_parser() {
        let mut out = Bytes::new();
        out.parse_from(Chain::from(Bytes::from("payload"))).unwrap();
        assert_eq!(out, Bytes::from("payload"));
    }

    #[test]
    fn test_vec_parser_replaces_contents() {
        let mut out = vec![9u8; 4];
        out.parse_from(Chain::from(Bytes::from("xy"))).unwrap();
        assert_eq!(out, b"xy");
    }

    #[test]
    fn test_wire_record_accepts_valid() {
        // field 1 varint 42, field 2 "hi"
        let data = Bytes::from(vec![0x08, 0x2A, 0x12, 0x02, b'h', b'i']);
        let mut out = WireRecord::default();
        out.parse_from(Chain::from(data.clone())).unwrap();
        assert_eq!(out.bytes(), &data);
    }

    #[test]
    fn test_wire_record_accepts_empty() {
        let mut out = WireRecord::default();
        out.parse_from(Chain::new()).unwrap();
        assert!(out.bytes().is_empty());
    }

    #[test]
    fn test_wire_record_rejects_invalid() {
        let mut out = WireRecord::default();
        let err = out
            .parse_from(Chain::from(Bytes::from_static(b"a")))
            .unwrap_err();
        assert!(err.is_record_local());
        assert!(matches!(err, Error::InvalidRecord(_)));
        // Rejected data is not retained
        assert!(out.bytes().is_empty());
    }
}
