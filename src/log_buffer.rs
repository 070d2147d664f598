use tracing::{debug, trace};

use crate::buffer::AtomicBuffer;
use crate::config::{LogBufferConfig, PARTITION_COUNT, compute_max_message_length};
use crate::error::{PublicationError, Result};
use crate::frame::HeaderWriter;
use crate::metadata::{LOG_META_DATA_LENGTH, LogDescriptor, LogMetadata};
use crate::position::{self, PositionCodec, index_by_term_count, pack_tail};
use crate::raw_log::{HeapRawLog, RawLog};
use crate::term_appender::TermAppender;

/// Which term is active, derived from the metadata.
///
/// `term_count` is the number of rotations since the log was created. It only
/// grows; the partition index and term id follow from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTerm {
    pub term_count: i32,
    pub partition_index: usize,
    pub term_id: i32,
    pub term_offset: i32,
}

/// Three terms plus the metadata region, over some backing memory.
///
/// ```text
/// +----------+----------+----------+----- ... -----+----------+
/// |  term 0  |  term 1  |  term 2  |  page padding | metadata |
/// +----------+----------+----------+----- ... -----+----------+
/// ```
///
/// The metadata occupies the last [`LOG_META_DATA_LENGTH`] bytes of the log.
/// The descriptor is validated once in [`LogBuffer::new`]; afterwards the
/// term length and initial term id are trusted.
#[derive(Debug)]
pub struct LogBuffer {
    raw: Box<dyn RawLog>,
    descriptor: LogDescriptor,
    codec: PositionCodec,
    metadata_offset: usize,
}

impl LogBuffer {
    /// Binds to a log whose metadata has already been initialised.
    pub fn new(raw: Box<dyn RawLog>) -> Result<Self> {
        if raw.len() < LOG_META_DATA_LENGTH {
            return Err(PublicationError::InvalidLogBuffer(format!(
                "log length {} shorter than metadata length {LOG_META_DATA_LENGTH}",
                raw.len()
            )));
        }
        if raw.as_ptr().as_ptr() as usize % 8 != 0 {
            return Err(PublicationError::InvalidLogBuffer(
                "log is not 8-byte aligned".into(),
            ));
        }

        let metadata_offset = raw.len() - LOG_META_DATA_LENGTH;
        let metadata = unsafe { AtomicBuffer::new(raw.as_ptr(), raw.len()) }
            .view(metadata_offset, LOG_META_DATA_LENGTH);
        let descriptor = LogDescriptor::decode(&metadata)?;

        let terms_length = PARTITION_COUNT * descriptor.term_length;
        if terms_length > metadata_offset {
            return Err(PublicationError::InvalidLogBuffer(format!(
                "log length {} too short for {PARTITION_COUNT} terms of {}",
                raw.len(),
                descriptor.term_length
            )));
        }

        let codec = PositionCodec::new(descriptor.term_length, descriptor.initial_term_id);
        Ok(Self {
            raw,
            descriptor,
            codec,
            metadata_offset,
        })
    }

    /// Writes fresh metadata into `raw` and binds to it.
    ///
    /// This is the log creator's side: the first term starts at
    /// `initial_term_id`, and the other two carry term ids one full cycle
    /// behind so that rotation recognises them as stale.
    pub fn initialise(
        raw: Box<dyn RawLog>,
        config: &LogBufferConfig,
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
    ) -> Result<Self> {
        config.validate()?;
        if raw.len() < config.log_length() {
            return Err(PublicationError::InvalidLogBuffer(format!(
                "log length {} shorter than required {}",
                raw.len(),
                config.log_length()
            )));
        }

        {
            let metadata = unsafe { AtomicBuffer::new(raw.as_ptr(), raw.len()) }
                .view(raw.len() - LOG_META_DATA_LENGTH, LOG_META_DATA_LENGTH);
            LogDescriptor {
                correlation_id,
                initial_term_id: config.initial_term_id,
                mtu_length: config.mtu_length,
                term_length: config.term_length,
                page_size: config.page_size,
                default_frame_header: LogDescriptor::default_frame_header(session_id, stream_id),
            }
            .encode(&metadata);

            let metadata = LogMetadata::new(metadata);
            metadata.set_raw_tail_ordered(0, pack_tail(config.initial_term_id, 0));
            for index in 1..PARTITION_COUNT {
                let expected_term_id = config
                    .initial_term_id
                    .wrapping_add(index as i32)
                    .wrapping_sub(PARTITION_COUNT as i32);
                metadata.set_raw_tail_ordered(index, pack_tail(expected_term_id, 0));
            }
            metadata.set_active_term_count_ordered(0);
        }

        debug!(
            correlation_id,
            session_id,
            stream_id,
            term_length = config.term_length,
            initial_term_id = config.initial_term_id,
            "initialised log buffer"
        );
        Self::new(raw)
    }

    /// An initialised log on the heap, for single-process use.
    pub fn heap(
        config: &LogBufferConfig,
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
    ) -> Result<Self> {
        let raw = HeapRawLog::new(config.log_length());
        Self::initialise(Box::new(raw), config, correlation_id, session_id, stream_id)
    }

    pub fn descriptor(&self) -> &LogDescriptor {
        &self.descriptor
    }

    pub fn codec(&self) -> &PositionCodec {
        &self.codec
    }

    pub fn term_length(&self) -> usize {
        self.descriptor.term_length
    }

    pub fn initial_term_id(&self) -> i32 {
        self.descriptor.initial_term_id
    }

    pub fn mtu_length(&self) -> usize {
        self.descriptor.mtu_length
    }

    pub fn max_message_length(&self) -> usize {
        compute_max_message_length(self.descriptor.term_length)
    }

    pub fn log_length(&self) -> usize {
        self.raw.len()
    }

    /// Header writer for the session/stream recorded in the metadata.
    pub fn header_writer(&self) -> HeaderWriter {
        HeaderWriter::from_default_header(&self.descriptor.default_frame_header)
    }

    fn whole(&self) -> AtomicBuffer<'_> {
        unsafe { AtomicBuffer::new(self.raw.as_ptr(), self.raw.len()) }
    }

    pub fn term_buffer(&self, index: usize) -> AtomicBuffer<'_> {
        assert!(index < PARTITION_COUNT, "partition index {index}");
        let term_length = self.descriptor.term_length;
        self.whole().view(index * term_length, term_length)
    }

    pub fn metadata(&self) -> LogMetadata<'_> {
        LogMetadata::new(self.whole().view(self.metadata_offset, LOG_META_DATA_LENGTH))
    }

    pub fn term_appender(&self, index: usize) -> TermAppender<'_> {
        TermAppender::new(self.term_buffer(index), self.metadata(), index)
    }

    /// Reads the active term from the rotation count and that term's tail.
    pub fn active_term(&self) -> ActiveTerm {
        let metadata = self.metadata();
        let term_count = metadata.active_term_count();
        let partition_index = index_by_term_count(term_count);
        let raw_tail = metadata.raw_tail_volatile(partition_index);
        ActiveTerm {
            term_count,
            partition_index,
            term_id: position::term_id(raw_tail),
            term_offset: position::term_offset(raw_tail, self.descriptor.term_length),
        }
    }

    /// Stream position of the active term's tail.
    pub fn tail_position(&self) -> i64 {
        let active = self.active_term();
        self.codec.position_of(active.term_id, active.term_offset)
    }

    /// Moves the log from term `term_id` (rotation `term_count`) to the next.
    ///
    /// The next partition's tail is reset to offset 0 under `term_id + 1`
    /// first, then the rotation count is advanced, so anyone who sees the new
    /// count also sees the reset tail. The tail is only replaced while it still
    /// carries the id from one full cycle ago, which makes a repeated rotation
    /// a no-op. Returns `true` if this call advanced the rotation count.
    pub fn rotate(&self, term_count: i32, term_id: i32) -> bool {
        let metadata = self.metadata();
        let next_term_id = term_id.wrapping_add(1);
        let next_term_count = term_count.wrapping_add(1);
        let next_index = index_by_term_count(next_term_count);
        let expected_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);

        loop {
            let raw_tail = metadata.raw_tail_volatile(next_index);
            if position::term_id(raw_tail) != expected_term_id {
                break;
            }
            if metadata.cas_raw_tail(next_index, raw_tail, pack_tail(next_term_id, 0)) {
                break;
            }
        }

        let rotated = metadata.cas_active_term_count(term_count, next_term_count);
        trace!(
            term_id,
            next_term_id,
            next_term_count,
            rotated,
            "rotated log buffer"
        );
        rotated
    }

    pub fn is_connected(&self) -> bool {
        self.metadata().is_connected()
    }

    /// Set by whoever tracks subscribers; the publication only reads it.
    pub fn set_is_connected(&self, connected: bool) {
        self.metadata().set_is_connected(connected)
    }

    /// Position the publisher may append up to, read from the metadata.
    pub fn position_limit(&self) -> i64 {
        self.metadata().position_limit()
    }

    /// Set by whoever tracks consumer progress. Any mapping of the log sees
    /// the new limit.
    pub fn set_position_limit(&self, position: i64) {
        self.metadata().set_position_limit(position)
    }

    pub fn correlation_id(&self) -> i64 {
        self.descriptor.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TERM_MIN_LENGTH;
    use crate::position::term_id;

    fn config(initial_term_id: i32) -> LogBufferConfig {
        LogBufferConfig::default()
            .with_term_length(TERM_MIN_LENGTH)
            .with_initial_term_id(initial_term_id)
    }

    #[test]
    fn initialise_sets_up_first_term() {
        let log = LogBuffer::heap(&config(7), 42, 11, 1001).unwrap();
        assert_eq!(log.term_length(), TERM_MIN_LENGTH);
        assert_eq!(log.initial_term_id(), 7);
        assert_eq!(log.correlation_id(), 42);
        assert_eq!(log.log_length(), 3 * TERM_MIN_LENGTH + LOG_META_DATA_LENGTH);
        assert_eq!(log.header_writer(), HeaderWriter::new(11, 1001));

        let active = log.active_term();
        assert_eq!(
            active,
            ActiveTerm {
                term_count: 0,
                partition_index: 0,
                term_id: 7,
                term_offset: 0
            }
        );
        assert_eq!(term_id(log.metadata().raw_tail_volatile(1)), 5);
        assert_eq!(term_id(log.metadata().raw_tail_volatile(2)), 6);
        assert_eq!(log.tail_position(), 0);
    }

    #[test]
    fn rotation_moves_forward_through_partitions() {
        let log = LogBuffer::heap(&config(7), 0, 1, 2).unwrap();
        for step in 0..7 {
            let active = log.active_term();
            assert_eq!(active.term_count, step);
            assert_eq!(active.partition_index, step as usize % 3);
            assert_eq!(active.term_id, 7 + step);
            assert_eq!(active.term_offset, 0);
            assert!(log.rotate(active.term_count, active.term_id));
        }
        assert_eq!(log.tail_position(), 7 * TERM_MIN_LENGTH as i64);
    }

    #[test]
    fn repeated_rotation_is_noop() {
        let log = LogBuffer::heap(&config(0), 0, 1, 2).unwrap();
        assert!(log.rotate(0, 0));
        assert!(!log.rotate(0, 0));
        let active = log.active_term();
        assert_eq!(active.term_count, 1);
        assert_eq!(active.term_id, 1);
    }

    #[test]
    fn rotation_leaves_old_tail_for_readers() {
        let log = LogBuffer::heap(&config(7), 0, 1, 2).unwrap();
        let header = log.header_writer();
        let appender = log.term_appender(0);
        appender.append_padding(&header, 7, 1000);
        let before = log.metadata().raw_tail_volatile(0);

        log.rotate(0, 7);
        assert_eq!(log.metadata().raw_tail_volatile(0), before);
        assert_eq!(log.metadata().raw_tail_volatile(1), pack_tail(8, 0));
    }

    #[test]
    fn rejects_uninitialised_memory() {
        let raw = HeapRawLog::new(3 * TERM_MIN_LENGTH + LOG_META_DATA_LENGTH);
        let err = LogBuffer::new(Box::new(raw)).unwrap_err();
        assert!(matches!(err, PublicationError::InvalidLogBuffer(_)), "{err}");
    }

    #[test]
    fn rejects_log_shorter_than_metadata() {
        let raw = HeapRawLog::new(1024);
        assert!(matches!(
            LogBuffer::new(Box::new(raw)),
            Err(PublicationError::InvalidLogBuffer(_))
        ));
    }

    #[test]
    fn rejects_log_too_short_for_terms() {
        let raw = HeapRawLog::new(2 * TERM_MIN_LENGTH + LOG_META_DATA_LENGTH);
        let err = LogBuffer::initialise(Box::new(raw), &config(0), 0, 1, 2).unwrap_err();
        assert!(matches!(err, PublicationError::InvalidLogBuffer(_)));
    }

    #[test]
    fn initialise_validates_config() {
        let raw = HeapRawLog::new(4 * 1024 * 1024);
        let bad = config(0).with_term_length(TERM_MIN_LENGTH + 1);
        assert!(matches!(
            LogBuffer::initialise(Box::new(raw), &bad, 0, 1, 2),
            Err(PublicationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn connection_flag_round_trips_through_metadata() {
        let log = LogBuffer::heap(&config(0), 0, 1, 2).unwrap();
        assert!(!log.is_connected());
        log.set_is_connected(true);
        assert!(log.is_connected());
    }

    #[test]
    fn fresh_log_has_zero_position_limit() {
        let log = LogBuffer::heap(&config(0), 0, 1, 2).unwrap();
        assert_eq!(log.position_limit(), 0);
        log.set_position_limit(1 << 20);
        assert_eq!(log.position_limit(), 1 << 20);
        assert_eq!(log.metadata().position_limit(), 1 << 20);
    }
}
