use std::path::Path;
use std::sync::Arc;
use std::thread;

use hft_publication::config::{LogBufferConfig, TERM_MIN_LENGTH};
use hft_publication::frame::{FRAME_ALIGNMENT, HEADER_LENGTH, align};
use hft_publication::metadata::{LOG_META_DATA_LENGTH, LOG_POSITION_LIMIT_OFFSET};
use hft_publication::{
    ConductorCommand, DataHeader, ExclusivePublication, FrameIter, LogBuffer, MappedRawLog,
    PublicationError, PublicationParams, PublicationState, RawLog, conductor_channel,
};

const SESSION_ID: i32 = 0x5EED;
const STREAM_ID: i32 = 10;
const INITIAL_TERM_ID: i32 = -3;

fn config() -> LogBufferConfig {
    LogBufferConfig::default()
        .with_term_length(TERM_MIN_LENGTH)
        .with_initial_term_id(INITIAL_TERM_ID)
}

/// Creates and initialises a log file the way a driver would.
fn create_log_file(path: &Path) {
    let config = config();
    let raw = MappedRawLog::create(path, config.log_length()).unwrap();
    let log = LogBuffer::initialise(Box::new(raw), &config, 77, SESSION_ID, STREAM_ID).unwrap();
    log.set_is_connected(true);
}

fn open_log(path: &Path) -> LogBuffer {
    LogBuffer::new(Box::new(MappedRawLog::map_existing(path, false).unwrap())).unwrap()
}

fn params() -> PublicationParams {
    PublicationParams {
        channel: "aeron:ipc?term-length=64k".to_string(),
        stream_id: STREAM_ID,
        session_id: SESSION_ID,
        registration_id: 1,
        original_registration_id: 1,
        position_limit_id: 1,
        channel_status: None,
    }
}

fn message(index: usize) -> Vec<u8> {
    let length = 16 + index % 200;
    (0..length).map(|i| (index + i) as u8).collect()
}

/// Follows the stream from position 0, publishing its progress as the
/// publisher's limit through its own mapping, until `count` messages are
/// read.
fn consume(log: &LogBuffer, window: i64, count: usize) -> Vec<Vec<u8>> {
    let codec = *log.codec();
    let mut position = 0i64;
    let mut messages = Vec::with_capacity(count);
    log.set_position_limit(position + window);

    while messages.len() < count {
        let (term_id, term_offset) = codec.term_offset_of(position);
        let term = log.term_buffer(codec.index_of_term(term_id));
        let header = DataHeader::read(&term, term_offset as usize);
        if header.frame_length <= 0 {
            std::hint::spin_loop();
            continue;
        }
        assert_eq!(header.term_id, term_id);
        assert_eq!(header.term_offset, term_offset);

        if !header.is_padding() {
            let mut payload = vec![0u8; header.frame_length as usize - HEADER_LENGTH];
            term.get_bytes(term_offset as usize + HEADER_LENGTH, &mut payload);
            messages.push(payload);
        }
        position += align(header.frame_length as usize, FRAME_ALIGNMENT) as i64;
        log.set_position_limit(position + window);
    }
    messages
}

#[test]
fn reader_on_second_mapping_sees_every_message_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exclusive.logbuffer");
    create_log_file(&path);

    let (conductor, queue) = conductor_channel();
    let mut publication = ExclusivePublication::create(conductor, params(), &path, true).unwrap();
    assert_eq!(publication.initial_term_id(), INITIAL_TERM_ID);
    assert!(publication.is_connected());

    // Enough to rotate twice without reusing a term.
    let count = 1000;
    let reader_log = open_log(&path);
    let received = thread::scope(|scope| {
        let reader = scope.spawn(|| consume(&reader_log, 8 * 1024, count));

        for index in 0..count {
            let payload = message(index);
            loop {
                match publication.offer(&payload) {
                    Ok(_) => break,
                    Err(err) if err.is_transient() => thread::yield_now(),
                    Err(err) => panic!("offer failed: {err}"),
                }
            }
        }
        reader.join().unwrap()
    });

    assert_eq!(received.len(), count);
    for (index, payload) in received.iter().enumerate() {
        assert_eq!(payload, &message(index), "message {index}");
    }
    assert!(publication.term_id() >= INITIAL_TERM_ID + 2);
    assert_eq!(reader_log.tail_position(), publication.position());

    publication.close();
    assert!(matches!(
        publication.offer(b"late"),
        Err(PublicationError::Closed)
    ));
    drop(publication);
    let Some(ConductorCommand::CloseExclusivePublication(request)) = queue.try_next() else {
        panic!("expected close command");
    };
    assert_eq!(request.log_buffer().tail_position(), reader_log.tail_position());
    request.complete();
}

#[test]
fn limit_set_through_another_mapping_gates_offers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("limit.logbuffer");
    create_log_file(&path);

    let (conductor, _queue) = conductor_channel();
    let mut publication = ExclusivePublication::create(conductor, params(), &path, false).unwrap();
    let consumer_log = open_log(&path);
    let consumer_raw = MappedRawLog::map_existing(&path, false).unwrap();
    let metadata_offset = consumer_raw.len() - LOG_META_DATA_LENGTH;
    let limit_word = unsafe {
        consumer_raw
            .as_ptr()
            .as_ptr()
            .add(metadata_offset + LOG_POSITION_LIMIT_OFFSET) as *const i64
    };

    // A fresh log has a zero limit: nothing can be appended yet.
    assert_eq!(publication.position_limit(), 0);
    assert!(matches!(
        publication.offer(b"early"),
        Err(PublicationError::BackPressured)
    ));
    assert_eq!(publication.position(), 0);

    consumer_log.set_position_limit(0x1234_5678_9abc);
    assert_eq!(publication.position_limit(), 0x1234_5678_9abc);
    assert_eq!(unsafe { limit_word.read_volatile() }, 0x1234_5678_9abc);

    consumer_log.set_position_limit(64);
    assert_eq!(publication.offer(b"first").unwrap(), 64);
    assert!(matches!(
        publication.offer(b"second"),
        Err(PublicationError::BackPressured)
    ));
    assert_eq!(publication.available_window(), 0);

    consumer_log.set_position_limit(128);
    assert_eq!(publication.offer(b"second").unwrap(), 128);
    assert_eq!(consumer_log.tail_position(), 128);
}

#[test]
fn claims_are_visible_through_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("claims.logbuffer");
    create_log_file(&path);

    open_log(&path).set_position_limit(i64::MAX);
    let (conductor, _queue) = conductor_channel();
    let mut publication = ExclusivePublication::create(conductor, params(), &path, false).unwrap();

    let mut claim = publication.try_claim(12).unwrap();
    claim.buffer().copy_from_slice(b"hello, world");
    claim.set_reserved_value(99);
    claim.commit();
    drop(publication.try_claim(100).unwrap());
    publication.offer(b"tail").unwrap();

    let reader_log = open_log(&path);
    let frames: Vec<_> = FrameIter::new(reader_log.term_buffer(0), TERM_MIN_LENGTH).collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].reserved_value, 99);
    assert_eq!(frames[0].session_id, SESSION_ID);
    assert!(frames[1].is_padding());
    assert!(!frames[2].is_padding());
    assert_eq!(reader_log.tail_position(), publication.position());
}

#[test]
fn mapping_failure_reports_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let (conductor, _queue) = conductor_channel();
    let missing = dir.path().join("missing.logbuffer");
    let err = ExclusivePublication::create(conductor, params(), missing, false).unwrap_err();
    assert!(matches!(err, PublicationError::Io(_)), "{err}");
}

#[test]
fn uninitialised_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blank.logbuffer");
    drop(MappedRawLog::create(&path, config().log_length()).unwrap());

    let (conductor, _queue) = conductor_channel();
    let err = ExclusivePublication::create(conductor, params(), &path, false).unwrap_err();
    assert!(matches!(err, PublicationError::InvalidLogBuffer(_)), "{err}");
}

#[test]
fn conductor_thread_completes_close() {
    let log = Arc::new(LogBuffer::heap(&config(), 5, SESSION_ID, STREAM_ID).unwrap());
    log.set_position_limit(i64::MAX);
    let (conductor, queue) = conductor_channel();
    let mut publication =
        ExclusivePublication::with_log_buffer(conductor, params(), Arc::clone(&log)).unwrap();
    publication.offer(b"only").unwrap();

    let weak = Arc::downgrade(&log);
    drop(log);

    let conductor_thread = thread::spawn(move || {
        let Some(ConductorCommand::CloseExclusivePublication(request)) =
            queue.next_timeout(std::time::Duration::from_secs(5))
        else {
            panic!("no close command");
        };
        request.complete();
    });

    publication.close();
    conductor_thread.join().unwrap();
    assert_eq!(publication.state(), PublicationState::Closed);
    assert!(weak.upgrade().is_some());
    drop(publication);
    assert!(weak.upgrade().is_none());
}
