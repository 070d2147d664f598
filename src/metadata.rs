//! Log buffer metadata region.
//!
//! The metadata sits after the three terms and is shared by the publisher,
//! readers and the log's creator. Counters that change while the log is live
//! are accessed atomically; the descriptor fields are written once when the
//! log is created and read once when it is mapped.
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------------
//!      0     8  term tail counter [0]   (term_id << 32 | offset)
//!      8     8  term tail counter [1]
//!     16     8  term tail counter [2]
//!     24     4  active term count
//!    128     8  end of stream position
//!    136     4  is connected
//!    140     4  active transport count
//!    192     8  position limit
//!    256     8  correlation id
//!    264     4  initial term id
//!    268     4  default frame header length
//!    272     4  mtu length
//!    276     4  term length
//!    280     4  page size
//!    320    32  default frame header
//! ```
//!
//! The groups are spread over separate cache lines so the producer's tail
//! writes do not false-share with the connection flags, the position limit
//! the consumers drive, or the descriptor.

use crate::buffer::AtomicBuffer;
use crate::config::{PARTITION_COUNT, check_mtu_length, check_page_size, check_term_length};
use crate::error::{PublicationError, Result};
use crate::frame::{CURRENT_VERSION, DataHeader, HDR_TYPE_DATA, HEADER_LENGTH, UNFRAGMENTED};

pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0;
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: usize = TERM_TAIL_COUNTERS_OFFSET + PARTITION_COUNT * 8;
pub const LOG_END_OF_STREAM_POSITION_OFFSET: usize = 128;
pub const LOG_IS_CONNECTED_OFFSET: usize = LOG_END_OF_STREAM_POSITION_OFFSET + 8;
pub const LOG_ACTIVE_TRANSPORT_COUNT_OFFSET: usize = LOG_IS_CONNECTED_OFFSET + 4;
pub const LOG_POSITION_LIMIT_OFFSET: usize = 192;
pub const LOG_CORRELATION_ID_OFFSET: usize = 256;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = LOG_CORRELATION_ID_OFFSET + 8;
pub const LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET: usize = LOG_INITIAL_TERM_ID_OFFSET + 4;
pub const LOG_MTU_LENGTH_OFFSET: usize = LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET + 4;
pub const LOG_TERM_LENGTH_OFFSET: usize = LOG_MTU_LENGTH_OFFSET + 4;
pub const LOG_PAGE_SIZE_OFFSET: usize = LOG_TERM_LENGTH_OFFSET + 4;
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: usize = 320;
pub const LOG_DEFAULT_FRAME_HEADER_MAX_LENGTH: usize = 128;

/// Total metadata length, one page.
pub const LOG_META_DATA_LENGTH: usize = 4096;

/// Write-once fields of the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDescriptor {
    pub correlation_id: i64,
    pub initial_term_id: i32,
    pub mtu_length: usize,
    pub term_length: usize,
    pub page_size: usize,
    pub default_frame_header: DataHeader,
}

impl LogDescriptor {
    /// Default header template for a session/stream: an unfragmented data
    /// frame with all positional fields zero.
    pub fn default_frame_header(session_id: i32, stream_id: i32) -> DataHeader {
        DataHeader {
            frame_length: 0,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset: 0,
            session_id,
            stream_id,
            term_id: 0,
            reserved_value: 0,
        }
    }

    pub fn encode(&self, metadata: &AtomicBuffer<'_>) {
        metadata.put_i64(LOG_CORRELATION_ID_OFFSET, self.correlation_id);
        metadata.put_i32(LOG_INITIAL_TERM_ID_OFFSET, self.initial_term_id);
        metadata.put_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET, HEADER_LENGTH as i32);
        metadata.put_i32(LOG_MTU_LENGTH_OFFSET, self.mtu_length as i32);
        metadata.put_i32(LOG_TERM_LENGTH_OFFSET, self.term_length as i32);
        metadata.put_i32(LOG_PAGE_SIZE_OFFSET, self.page_size as i32);
        metadata.put_bytes(
            LOG_DEFAULT_FRAME_HEADER_OFFSET,
            &self.default_frame_header.encode(),
        );
    }

    /// Reads and validates the descriptor. Fails on any field a publication
    /// cannot work with.
    pub fn decode(metadata: &AtomicBuffer<'_>) -> Result<Self> {
        let term_length = non_negative(metadata.get_i32(LOG_TERM_LENGTH_OFFSET), "term length")?;
        let page_size = non_negative(metadata.get_i32(LOG_PAGE_SIZE_OFFSET), "page size")?;
        let mtu_length = non_negative(metadata.get_i32(LOG_MTU_LENGTH_OFFSET), "mtu length")?;
        let header_length = metadata.get_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET);

        invalid_layout(check_term_length(term_length))?;
        invalid_layout(check_page_size(page_size))?;
        invalid_layout(check_mtu_length(mtu_length, term_length))?;
        if header_length != HEADER_LENGTH as i32 {
            return Err(PublicationError::InvalidLogBuffer(format!(
                "default frame header length {header_length}, expected {HEADER_LENGTH}"
            )));
        }

        let mut header = [0u8; HEADER_LENGTH];
        metadata.get_bytes(LOG_DEFAULT_FRAME_HEADER_OFFSET, &mut header);
        let default_frame_header = DataHeader::decode(&header).ok_or_else(|| {
            PublicationError::InvalidLogBuffer("default frame header truncated".into())
        })?;

        Ok(Self {
            correlation_id: metadata.get_i64(LOG_CORRELATION_ID_OFFSET),
            initial_term_id: metadata.get_i32(LOG_INITIAL_TERM_ID_OFFSET),
            mtu_length,
            term_length,
            page_size,
            default_frame_header,
        })
    }
}

fn non_negative(value: i32, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| PublicationError::InvalidLogBuffer(format!("negative {field}: {value}")))
}

fn invalid_layout(result: Result<()>) -> Result<()> {
    result.map_err(|err| match err {
        PublicationError::InvalidConfig(msg) => PublicationError::InvalidLogBuffer(msg),
        other => other,
    })
}

/// Live counters of the metadata region.
#[derive(Debug, Clone, Copy)]
pub struct LogMetadata<'a> {
    buffer: AtomicBuffer<'a>,
}

impl<'a> LogMetadata<'a> {
    pub fn new(buffer: AtomicBuffer<'a>) -> Self {
        debug_assert!(buffer.capacity() >= LOG_META_DATA_LENGTH);
        Self { buffer }
    }

    pub fn buffer(&self) -> AtomicBuffer<'a> {
        self.buffer
    }

    #[inline(always)]
    pub fn tail_counter_offset(index: usize) -> usize {
        debug_assert!(index < PARTITION_COUNT);
        TERM_TAIL_COUNTERS_OFFSET + index * 8
    }

    #[inline(always)]
    pub fn raw_tail_volatile(&self, index: usize) -> i64 {
        self.buffer
            .get_i64_volatile(Self::tail_counter_offset(index))
    }

    #[inline(always)]
    pub fn set_raw_tail_ordered(&self, index: usize, raw_tail: i64) {
        self.buffer
            .put_i64_ordered(Self::tail_counter_offset(index), raw_tail)
    }

    #[inline(always)]
    pub fn cas_raw_tail(&self, index: usize, expected: i64, update: i64) -> bool {
        self.buffer
            .compare_and_set_i64(Self::tail_counter_offset(index), expected, update)
    }

    #[inline(always)]
    pub fn active_term_count(&self) -> i32 {
        self.buffer.get_i32_volatile(LOG_ACTIVE_TERM_COUNT_OFFSET)
    }

    pub fn set_active_term_count_ordered(&self, term_count: i32) {
        self.buffer
            .put_i32_ordered(LOG_ACTIVE_TERM_COUNT_OFFSET, term_count)
    }

    #[inline(always)]
    pub fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.buffer
            .compare_and_set_i32(LOG_ACTIVE_TERM_COUNT_OFFSET, expected, update)
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.buffer.get_i32_volatile(LOG_IS_CONNECTED_OFFSET) == 1
    }

    pub fn set_is_connected(&self, connected: bool) {
        self.buffer
            .put_i32_ordered(LOG_IS_CONNECTED_OFFSET, connected as i32)
    }

    pub fn active_transport_count(&self) -> i32 {
        self.buffer
            .get_i32_volatile(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET)
    }

    pub fn set_active_transport_count(&self, count: i32) {
        self.buffer
            .put_i32_ordered(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET, count)
    }

    pub fn end_of_stream_position(&self) -> i64 {
        self.buffer
            .get_i64_volatile(LOG_END_OF_STREAM_POSITION_OFFSET)
    }

    pub fn set_end_of_stream_position(&self, position: i64) {
        self.buffer
            .put_i64_ordered(LOG_END_OF_STREAM_POSITION_OFFSET, position)
    }

    /// Flow-control limit: the publisher never appends past this position.
    /// Written by whoever tracks the consumers, from any mapping of the log.
    #[inline(always)]
    pub fn position_limit(&self) -> i64 {
        self.buffer.get_i64_volatile(LOG_POSITION_LIMIT_OFFSET)
    }

    pub fn set_position_limit(&self, position: i64) {
        self.buffer
            .put_i64_ordered(LOG_POSITION_LIMIT_OFFSET, position)
    }

    /// Raises the limit to `position` unless it is already higher.
    pub fn propose_max_position_limit(&self, position: i64) -> bool {
        let mut current = self.position_limit();
        while current < position {
            if self
                .buffer
                .compare_and_set_i64(LOG_POSITION_LIMIT_OFFSET, current, position)
            {
                return true;
            }
            current = self.position_limit();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TERM_MIN_LENGTH;
    use std::ptr::NonNull;

    fn region(words: &mut [u64]) -> AtomicBuffer<'_> {
        let ptr = NonNull::new(words.as_mut_ptr() as *mut u8).unwrap();
        unsafe { AtomicBuffer::new(ptr, words.len() * 8) }
    }

    fn descriptor() -> LogDescriptor {
        LogDescriptor {
            correlation_id: 77,
            initial_term_id: 7,
            mtu_length: 1408,
            term_length: TERM_MIN_LENGTH,
            page_size: 4096,
            default_frame_header: LogDescriptor::default_frame_header(11, 1001),
        }
    }

    #[test]
    fn counter_groups_do_not_share_cache_lines() {
        assert!(LOG_ACTIVE_TERM_COUNT_OFFSET + 4 <= 64);
        assert_eq!(LOG_END_OF_STREAM_POSITION_OFFSET % 64, 0);
        assert_eq!(LOG_POSITION_LIMIT_OFFSET % 64, 0);
        assert!(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET + 4 <= LOG_POSITION_LIMIT_OFFSET);
        assert!(LOG_POSITION_LIMIT_OFFSET + 8 <= LOG_CORRELATION_ID_OFFSET);
        assert_eq!(LOG_CORRELATION_ID_OFFSET % 64, 0);
        assert_eq!(LOG_DEFAULT_FRAME_HEADER_OFFSET % 64, 0);
        assert!(
            LOG_DEFAULT_FRAME_HEADER_OFFSET + LOG_DEFAULT_FRAME_HEADER_MAX_LENGTH
                <= LOG_META_DATA_LENGTH
        );
    }

    #[test]
    fn descriptor_survives_encode_decode() {
        let mut words = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let buffer = region(&mut words);
        let expected = descriptor();
        expected.encode(&buffer);
        assert_eq!(buffer.get_i32(LOG_TERM_LENGTH_OFFSET), TERM_MIN_LENGTH as i32);
        assert_eq!(LogDescriptor::decode(&buffer).unwrap(), expected);
    }

    #[test]
    fn decode_rejects_bad_term_length() {
        let mut words = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let buffer = region(&mut words);
        descriptor().encode(&buffer);
        buffer.put_i32(LOG_TERM_LENGTH_OFFSET, TERM_MIN_LENGTH as i32 + 32);
        let err = LogDescriptor::decode(&buffer).unwrap_err();
        assert!(matches!(err, PublicationError::InvalidLogBuffer(_)), "{err}");
    }

    #[test]
    fn decode_rejects_zeroed_metadata() {
        let mut words = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let buffer = region(&mut words);
        assert!(matches!(
            LogDescriptor::decode(&buffer),
            Err(PublicationError::InvalidLogBuffer(_))
        ));
    }

    #[test]
    fn decode_rejects_wrong_header_length() {
        let mut words = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let buffer = region(&mut words);
        descriptor().encode(&buffer);
        buffer.put_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET, 24);
        assert!(LogDescriptor::decode(&buffer).is_err());
    }

    #[test]
    fn live_counters() {
        let mut words = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let metadata = LogMetadata::new(region(&mut words));

        metadata.set_raw_tail_ordered(2, 5 << 32);
        assert_eq!(metadata.raw_tail_volatile(2), 5 << 32);
        assert!(metadata.cas_raw_tail(2, 5 << 32, 6 << 32));
        assert!(!metadata.cas_raw_tail(2, 5 << 32, 7 << 32));

        assert!(metadata.cas_active_term_count(0, 1));
        assert_eq!(metadata.active_term_count(), 1);

        assert!(!metadata.is_connected());
        metadata.set_is_connected(true);
        assert!(metadata.is_connected());

        metadata.set_end_of_stream_position(4096);
        assert_eq!(metadata.end_of_stream_position(), 4096);
        metadata.set_active_transport_count(2);
        assert_eq!(metadata.active_transport_count(), 2);
    }

    #[test]
    fn position_limit_lives_in_the_page() {
        let mut words = vec![0u64; LOG_META_DATA_LENGTH / 8];
        let buffer = region(&mut words);
        let metadata = LogMetadata::new(buffer);
        assert_eq!(metadata.position_limit(), 0);

        metadata.set_position_limit(0x1234_5678_9abc);
        assert_eq!(buffer.get_i64(LOG_POSITION_LIMIT_OFFSET), 0x1234_5678_9abc);

        assert!(metadata.propose_max_position_limit(0x1234_5678_9abd));
        assert!(!metadata.propose_max_position_limit(64));
        assert_eq!(metadata.position_limit(), 0x1234_5678_9abd);
    }
}
