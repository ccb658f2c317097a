//! Framing: 14-byte big-endian header, optional fixed-size metadata, body.
//!
//! ```text
//! 0        4         8         12       14              offset        offset+length
//! | type   | length  | sender  | offset | metadata ...  | body ...    |
//! ```
//!
//! `offset` covers header plus metadata, `length` covers the body only. A
//! datagram is valid only when `offset + length` equals its physical size.

use std::borrow::Cow;
use std::io::{self, Read};

use crate::identity::HostIdentity;

/// Size of the packed header.
pub const HEADER_LEN: usize = 14;

/// Largest datagram either role sends or accepts.
pub const MAX_DATAGRAM_LEN: usize = 4096;

/// A value with a fixed big-endian layout, usable as metadata or as an array
/// record in a message body.
pub trait FixedLayout: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the encoded form to `out`.
    fn write_to(&self, out: &mut Vec<u8>);

    /// Decode from exactly `SIZE` bytes. Callers check the length first.
    fn read_from(bytes: &[u8]) -> Self;
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u32,
    pub length: u32,
    pub sender: u32,
    pub offset: u16,
}

impl Header {
    /// Datagram size this header declares.
    pub fn expected_len(&self) -> usize {
        self.offset as usize + self.length as usize
    }

    fn write_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.tag.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sender.to_be_bytes());
        buf[12..14].copy_from_slice(&self.offset.to_be_bytes());
    }

    /// Read a header from the front of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Result<Header, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::Truncated {
                needed: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let word = |at: usize| {
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Ok(Header {
            tag: word(0),
            length: word(4),
            sender: word(8),
            offset: u16::from_be_bytes([bytes[12], bytes[13]]),
        })
    }
}

/// One framed datagram, inbound or outbound.
///
/// Outbound datagrams keep the header `length` field in step with the body as
/// it is appended, so `offset + length == len()` holds at every point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    header: Header,
    bytes: Vec<u8>,
}

impl Datagram {
    /// Header-only datagram.
    pub fn header_only(tag: u32, sender: HostIdentity) -> Self {
        Self::with_metadata_bytes(tag, sender, &[])
    }

    /// Datagram carrying typed metadata and, for now, no body.
    pub fn with_metadata<M: FixedLayout>(tag: u32, sender: HostIdentity, metadata: &M) -> Self {
        let mut encoded = Vec::with_capacity(M::SIZE);
        metadata.write_to(&mut encoded);
        Self::with_metadata_bytes(tag, sender, &encoded)
    }

    fn with_metadata_bytes(tag: u32, sender: HostIdentity, metadata: &[u8]) -> Self {
        let offset = HEADER_LEN + metadata.len();
        let header = Header {
            tag,
            length: 0,
            sender: sender.id(),
            offset: offset as u16,
        };
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes.reserve(metadata.len());
        bytes.extend_from_slice(metadata);
        header.write_into(&mut bytes[..HEADER_LEN]);
        Self { header, bytes }
    }

    /// Append raw bytes to the body.
    pub fn push_body(&mut self, body: &[u8]) -> Result<(), FramingError> {
        if self.bytes.len() + body.len() > MAX_DATAGRAM_LEN {
            return Err(FramingError::BodyTooLarge {
                limit: MAX_DATAGRAM_LEN,
                actual: self.bytes.len() + body.len(),
            });
        }
        self.bytes.extend_from_slice(body);
        self.sync_length();
        Ok(())
    }

    /// Append text to the body.
    pub fn push_text(&mut self, text: &str) -> Result<(), FramingError> {
        self.push_body(text.as_bytes())
    }

    /// Append fixed-size records to the body.
    pub fn push_records<T: FixedLayout>(&mut self, records: &[T]) -> Result<(), FramingError> {
        let mut encoded = Vec::with_capacity(records.len() * T::SIZE);
        for record in records {
            record.write_to(&mut encoded);
        }
        self.push_body(&encoded)
    }

    /// Stream up to `limit` bytes from `reader` straight into the body.
    /// Stops early at end of input; returns the number of bytes read.
    pub fn fill_body_from<R: Read>(&mut self, reader: &mut R, limit: usize) -> io::Result<usize> {
        let room = MAX_DATAGRAM_LEN.saturating_sub(self.bytes.len());
        let n = reader
            .take(limit.min(room) as u64)
            .read_to_end(&mut self.bytes)?;
        self.sync_length();
        Ok(n)
    }

    fn sync_length(&mut self) {
        self.header.length = (self.bytes.len() - self.header.offset as usize) as u32;
        self.bytes[4..8].copy_from_slice(&self.header.length.to_be_bytes());
    }

    /// Validate a received buffer. The declared size must match the
    /// physical size exactly.
    pub fn parse(bytes: Vec<u8>) -> Result<Datagram, FramingError> {
        let header = Header::read_from(&bytes)?;
        if (header.offset as usize) < HEADER_LEN {
            return Err(FramingError::MetadataSize {
                expected: HEADER_LEN,
                actual: header.offset as usize,
            });
        }
        if header.expected_len() != bytes.len() {
            return Err(FramingError::LengthMismatch {
                expected: header.expected_len(),
                actual: bytes.len(),
            });
        }
        Ok(Self { header, bytes })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn tag(&self) -> u32 {
        self.header.tag
    }

    pub fn sender(&self) -> HostIdentity {
        HostIdentity::new(self.header.sender)
    }

    pub fn body_length(&self) -> usize {
        self.header.length as usize
    }

    /// Total encoded size; always `offset + length`.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header.offset as usize..]
    }

    /// Body as text. Invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.body())
    }

    /// Metadata decoded as `M`. Fails unless the header size recorded in the
    /// datagram is exactly the size `M` requires.
    pub fn metadata<M: FixedLayout>(&self) -> Result<M, FramingError> {
        let expected = HEADER_LEN + M::SIZE;
        let actual = self.header.offset as usize;
        if actual != expected {
            return Err(FramingError::MetadataSize { expected, actual });
        }
        Ok(M::read_from(&self.bytes[HEADER_LEN..expected]))
    }

    /// Body decoded as a sequence of `T` records.
    pub fn records<T: FixedLayout>(&self) -> Result<Vec<T>, FramingError> {
        let body = self.body();
        if body.len() % T::SIZE != 0 {
            return Err(FramingError::ArrayLength {
                length: body.len(),
                record: T::SIZE,
            });
        }
        Ok(body.chunks_exact(T::SIZE).map(T::read_from).collect())
    }
}

/// Datagram layout violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("truncated datagram: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("datagram length mismatch: header declares {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("metadata size mismatch: expected header size {expected}, datagram has {actual}")]
    MetadataSize { expected: usize, actual: usize },
    #[error("body of {length} bytes is not a whole number of {record}-byte records")]
    ArrayLength { length: usize, record: usize },
    #[error("datagram too large: {actual} bytes exceeds {limit}")]
    BodyTooLarge { limit: usize, actual: usize },
}
