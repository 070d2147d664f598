//! Frame layout within a term.
//!
//! Every frame starts on a 32-byte boundary with a 32-byte header, followed by
//! the payload. All fields are little-endian.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +---------------------------------------------------------------+
//! |                         Frame Length                          |  0
//! +---------------+---------------+-------------------------------+
//! |    Version    |     Flags     |             Type              |  4
//! +---------------+---------------+-------------------------------+
//! |                          Term Offset                          |  8
//! +---------------------------------------------------------------+
//! |                          Session ID                           | 12
//! +---------------------------------------------------------------+
//! |                           Stream ID                           | 16
//! +---------------------------------------------------------------+
//! |                            Term ID                            | 20
//! +---------------------------------------------------------------+
//! |                        Reserved Value                         | 24
//! |                                                               |
//! +---------------------------------------------------------------+
//! |                        Payload ...                            | 32
//! ```
//!
//! # Publication protocol
//!
//! The writer stores the negated frame length first, then the other header
//! fields and the payload, and finally the positive frame length with a
//! release store. A reader that acquire-loads a positive length sees the
//! whole frame; zero or a negative length means "not yet".

use crate::buffer::AtomicBuffer;

pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_VALUE_OFFSET: usize = 24;

/// Length of the data frame header.
pub const HEADER_LENGTH: usize = 32;

/// Frames start on multiples of this.
pub const FRAME_ALIGNMENT: usize = 32;

pub const CURRENT_VERSION: u8 = 0;

/// Padding frame type. Readers skip it.
pub const HDR_TYPE_PAD: u16 = 0x00;
/// Data frame type.
pub const HDR_TYPE_DATA: u16 = 0x01;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline(always)]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl DataHeader {
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[FRAME_LENGTH_OFFSET..4].copy_from_slice(&self.frame_length.to_le_bytes());
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..8].copy_from_slice(&self.frame_type.to_le_bytes());
        buf[TERM_OFFSET_OFFSET..12].copy_from_slice(&self.term_offset.to_le_bytes());
        buf[SESSION_ID_OFFSET..16].copy_from_slice(&self.session_id.to_le_bytes());
        buf[STREAM_ID_OFFSET..20].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[TERM_ID_OFFSET..24].copy_from_slice(&self.term_id.to_le_bytes());
        buf[RESERVED_VALUE_OFFSET..32].copy_from_slice(&self.reserved_value.to_le_bytes());
        buf
    }

    /// Returns `None` when `buf` is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; HEADER_LENGTH] = buf.get(..HEADER_LENGTH)?.try_into().ok()?;
        let i32_at = |offset: usize| {
            i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        };
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[RESERVED_VALUE_OFFSET..]);
        Some(Self {
            frame_length: i32_at(FRAME_LENGTH_OFFSET),
            version: buf[VERSION_OFFSET],
            flags: buf[FLAGS_OFFSET],
            frame_type: u16::from_le_bytes([buf[TYPE_OFFSET], buf[TYPE_OFFSET + 1]]),
            term_offset: i32_at(TERM_OFFSET_OFFSET),
            session_id: i32_at(SESSION_ID_OFFSET),
            stream_id: i32_at(STREAM_ID_OFFSET),
            term_id: i32_at(TERM_ID_OFFSET),
            reserved_value: i64::from_le_bytes(reserved),
        })
    }

    /// Reads the header at `offset` with an acquire load of the length.
    pub fn read(buffer: &AtomicBuffer<'_>, offset: usize) -> Self {
        let frame_length = buffer.get_i32_volatile(offset + FRAME_LENGTH_OFFSET);
        Self {
            frame_length,
            version: buffer.get_u8(offset + VERSION_OFFSET),
            flags: buffer.get_u8(offset + FLAGS_OFFSET),
            frame_type: buffer.get_u16(offset + TYPE_OFFSET),
            term_offset: buffer.get_i32(offset + TERM_OFFSET_OFFSET),
            session_id: buffer.get_i32(offset + SESSION_ID_OFFSET),
            stream_id: buffer.get_i32(offset + STREAM_ID_OFFSET),
            term_id: buffer.get_i32(offset + TERM_ID_OFFSET),
            reserved_value: buffer.get_i64(offset + RESERVED_VALUE_OFFSET),
        }
    }

    pub fn is_padding(&self) -> bool {
        self.frame_type == HDR_TYPE_PAD
    }
}

/// Writes headers for one session/stream pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderWriter {
    session_id: i32,
    stream_id: i32,
}

impl HeaderWriter {
    pub fn new(session_id: i32, stream_id: i32) -> Self {
        Self {
            session_id,
            stream_id,
        }
    }

    /// Builds the writer from a default header template.
    pub fn from_default_header(header: &DataHeader) -> Self {
        Self::new(header.session_id, header.stream_id)
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Writes an unpublished header: the negated length goes first, so the
    /// frame stays invisible until [`publish_frame_length`] runs.
    #[inline(always)]
    pub fn write(
        &self,
        buffer: &AtomicBuffer<'_>,
        offset: usize,
        frame_length: usize,
        flags: u8,
        frame_type: u16,
        term_id: i32,
    ) {
        buffer.put_i32_ordered(offset + FRAME_LENGTH_OFFSET, -(frame_length as i32));
        buffer.put_u8(offset + VERSION_OFFSET, CURRENT_VERSION);
        buffer.put_u8(offset + FLAGS_OFFSET, flags);
        buffer.put_u16(offset + TYPE_OFFSET, frame_type);
        buffer.put_i32(offset + TERM_OFFSET_OFFSET, offset as i32);
        buffer.put_i32(offset + SESSION_ID_OFFSET, self.session_id);
        buffer.put_i32(offset + STREAM_ID_OFFSET, self.stream_id);
        buffer.put_i32(offset + TERM_ID_OFFSET, term_id);
        buffer.put_i64(offset + RESERVED_VALUE_OFFSET, 0);
    }
}

/// Release-stores the frame length, making the frame visible to readers.
#[inline(always)]
pub fn publish_frame_length(buffer: &AtomicBuffer<'_>, offset: usize, frame_length: usize) {
    buffer.put_i32_ordered(offset + FRAME_LENGTH_OFFSET, frame_length as i32);
}

/// Walks the committed frames of one term, from offset 0 up to `limit`.
///
/// Stops early at the first frame whose length is not yet published.
#[derive(Debug)]
pub struct FrameIter<'a> {
    term: AtomicBuffer<'a>,
    offset: usize,
    limit: usize,
}

impl<'a> FrameIter<'a> {
    pub fn new(term: AtomicBuffer<'a>, limit: usize) -> Self {
        Self {
            term,
            offset: 0,
            limit: limit.min(term.capacity()),
        }
    }

    /// Offset the next frame would start at.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for FrameIter<'_> {
    type Item = DataHeader;

    fn next(&mut self) -> Option<DataHeader> {
        if self.offset + HEADER_LENGTH > self.limit {
            return None;
        }
        let header = DataHeader::read(&self.term, self.offset);
        if header.frame_length <= 0 {
            return None;
        }
        self.offset += align(header.frame_length as usize, FRAME_ALIGNMENT);
        Some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn term(words: &mut [u64]) -> AtomicBuffer<'_> {
        let ptr = NonNull::new(words.as_mut_ptr() as *mut u8).unwrap();
        unsafe { AtomicBuffer::new(ptr, words.len() * 8) }
    }

    #[test]
    fn align_rounds_up() {
        assert_eq!(align(0, FRAME_ALIGNMENT), 0);
        assert_eq!(align(1, FRAME_ALIGNMENT), 32);
        assert_eq!(align(32, FRAME_ALIGNMENT), 32);
        assert_eq!(align(1032, FRAME_ALIGNMENT), 1056);
    }

    #[test]
    fn header_encoding_matches_field_offsets() {
        let header = DataHeader {
            frame_length: 1032,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset: 1056,
            session_id: -9,
            stream_id: 1001,
            term_id: 7,
            reserved_value: i64::MIN,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &1032i32.to_le_bytes());
        assert_eq!(bytes[5], 0xC0);
        assert_eq!(&bytes[6..8], &[1, 0]);
        assert_eq!(&bytes[20..24], &7i32.to_le_bytes());
        assert_eq!(DataHeader::decode(&bytes), Some(header));
        assert_eq!(DataHeader::decode(&bytes[..31]), None);
    }

    #[test]
    fn written_header_is_unpublished_until_length_store() {
        let mut words = vec![0u64; 16];
        let buffer = term(&mut words);
        let writer = HeaderWriter::new(5, 6);

        writer.write(&buffer, 32, 40, UNFRAGMENTED, HDR_TYPE_DATA, 3);
        let header = DataHeader::read(&buffer, 32);
        assert_eq!(header.frame_length, -40);
        assert_eq!(header.term_offset, 32);
        assert_eq!(header.session_id, 5);
        assert_eq!(header.stream_id, 6);
        assert_eq!(header.term_id, 3);

        publish_frame_length(&buffer, 32, 40);
        assert_eq!(DataHeader::read(&buffer, 32).frame_length, 40);
    }

    #[test]
    fn frame_iter_stops_at_unpublished_frame() {
        let mut words = vec![0u64; 32];
        let buffer = term(&mut words);
        let writer = HeaderWriter::new(1, 2);

        writer.write(&buffer, 0, 40, UNFRAGMENTED, HDR_TYPE_DATA, 0);
        publish_frame_length(&buffer, 0, 40);
        writer.write(&buffer, 64, 64, 0, HDR_TYPE_PAD, 0);
        publish_frame_length(&buffer, 64, 64);
        writer.write(&buffer, 128, 33, UNFRAGMENTED, HDR_TYPE_DATA, 0);

        let mut frames = FrameIter::new(buffer, buffer.capacity());
        let first = frames.next().unwrap();
        assert_eq!(first.frame_length, 40);
        assert!(!first.is_padding());
        let second = frames.next().unwrap();
        assert!(second.is_padding());
        assert_eq!(second.term_offset, 64);
        assert_eq!(frames.next(), None);
        assert_eq!(frames.offset(), 128);
    }

    #[test]
    fn frame_iter_respects_limit() {
        let mut words = vec![0u64; 16];
        let buffer = term(&mut words);
        let writer = HeaderWriter::new(1, 2);
        writer.write(&buffer, 0, 32, UNFRAGMENTED, HDR_TYPE_DATA, 0);
        publish_frame_length(&buffer, 0, 32);
        writer.write(&buffer, 32, 32, UNFRAGMENTED, HDR_TYPE_DATA, 0);
        publish_frame_length(&buffer, 32, 32);

        assert_eq!(FrameIter::new(buffer, 32).count(), 1);
        assert_eq!(FrameIter::new(buffer, 64).count(), 2);
    }
}
