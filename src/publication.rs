use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::claim::BufferClaim;
use crate::conductor::{CloseRequest, ConductorHandle, Lifecycle, PublicationState};
use crate::counters::Counter;
use crate::error::{PublicationError, Result};
use crate::frame::{FRAME_ALIGNMENT, HEADER_LENGTH, HeaderWriter, align};
use crate::log_buffer::LogBuffer;
use crate::position::index_by_term_count;
use crate::raw_log::MappedRawLog;
use crate::term_appender::{
    AppendOutcome, ReservedValueSupplier, TermAppender, compute_fragmented_length,
};

/// Identity and shared counters of a publication, as handed out by the
/// conductor when the publication is registered.
#[derive(Debug, Clone)]
pub struct PublicationParams {
    pub channel: String,
    pub stream_id: i32,
    pub session_id: i32,
    pub registration_id: i64,
    pub original_registration_id: i64,
    /// Id under which the stream owner registered the position limit. The
    /// limit itself lives in the log metadata, where consumers in any process
    /// can move it.
    pub position_limit_id: i32,
    pub channel_status: Option<Counter>,
}

/// Where an append landed.
#[derive(Debug, Clone, Copy)]
struct Landed {
    position: i64,
    term_offset: usize,
    partition_index: usize,
}

/// Single-producer publication over a three-term log buffer.
///
/// Appends take `&mut self`, so exactly one thread appends at a time and no
/// producer-side synchronisation is needed. The producer keeps the active
/// term's coordinates locally and advances them on each append and rotation;
/// the log metadata is updated alongside for readers.
///
/// Every append first checks the position limit held in the log metadata. If
/// the frame would pass it, nothing is written and a transient error is
/// returned: the caller decides how to back off.
///
/// Closing is asynchronous. [`close`](Self::close) fails all further appends
/// at once and hands the log to the conductor, which releases it when done.
/// Dropping an open publication closes it.
pub struct ExclusivePublication {
    conductor: ConductorHandle,
    log: Arc<LogBuffer>,
    lifecycle: Arc<Lifecycle>,
    position_limit_id: i32,
    channel_status: Option<Counter>,
    channel: String,
    stream_id: i32,
    session_id: i32,
    registration_id: i64,
    original_registration_id: i64,
    header: HeaderWriter,
    max_payload_length: usize,
    max_message_length: usize,
    max_possible_position: i64,
    term_count: i32,
    partition_index: usize,
    term_id: i32,
    term_offset: i32,
    term_begin_position: i64,
}

impl ExclusivePublication {
    /// Maps the log file created for this publication and binds to it.
    ///
    /// If mapping or layout validation fails, nothing stays allocated or
    /// mapped.
    pub fn create(
        conductor: ConductorHandle,
        params: PublicationParams,
        log_file: impl AsRef<Path>,
        pre_touch: bool,
    ) -> Result<Self> {
        let log_file = log_file.as_ref();
        let raw = MappedRawLog::map_existing(log_file, pre_touch).inspect_err(|err| {
            warn!(
                registration_id = params.registration_id,
                log_file = %log_file.display(),
                %err,
                "failed to map publication log"
            );
        })?;
        let log = LogBuffer::new(Box::new(raw))?;
        Self::with_log_buffer(conductor, params, Arc::new(log))
    }

    /// Binds to an already-mapped log buffer.
    pub fn with_log_buffer(
        conductor: ConductorHandle,
        params: PublicationParams,
        log: Arc<LogBuffer>,
    ) -> Result<Self> {
        let header = log.header_writer();
        if header.session_id() != params.session_id || header.stream_id() != params.stream_id {
            return Err(PublicationError::InvalidLogBuffer(format!(
                "log belongs to session {} stream {}, expected session {} stream {}",
                header.session_id(),
                header.stream_id(),
                params.session_id,
                params.stream_id
            )));
        }

        let active = log.active_term();
        let codec = *log.codec();
        let publication = Self {
            conductor,
            lifecycle: Arc::new(Lifecycle::default()),
            position_limit_id: params.position_limit_id,
            channel_status: params.channel_status,
            channel: params.channel,
            stream_id: params.stream_id,
            session_id: params.session_id,
            registration_id: params.registration_id,
            original_registration_id: params.original_registration_id,
            header,
            max_payload_length: log.mtu_length() - HEADER_LENGTH,
            max_message_length: log.max_message_length(),
            max_possible_position: codec.max_possible_position(),
            term_count: active.term_count,
            partition_index: active.partition_index,
            term_id: active.term_id,
            term_offset: active.term_offset,
            term_begin_position: codec.term_begin_position(active.term_id),
            log,
        };

        debug!(
            registration_id = publication.registration_id,
            channel = %publication.channel,
            stream_id = publication.stream_id,
            session_id = publication.session_id,
            term_id = publication.term_id,
            position = publication.position(),
            "exclusive publication created"
        );
        Ok(publication)
    }

    /// Appends `payload` as one message.
    ///
    /// Returns the stream position just past the message. Messages longer
    /// than [`max_payload_length`](Self::max_payload_length) are fragmented.
    pub fn offer(&mut self, payload: &[u8]) -> Result<i64> {
        self.offer_internal(&[payload], None)
    }

    /// Appends the concatenation of `parts` as one message.
    pub fn offer_parts(&mut self, parts: &[&[u8]]) -> Result<i64> {
        self.offer_internal(parts, None)
    }

    /// Like [`offer_parts`](Self::offer_parts), with the reserved value of
    /// each frame computed by `reserved_value_supplier` from the frame bytes.
    pub fn offer_with(
        &mut self,
        parts: &[&[u8]],
        reserved_value_supplier: &mut ReservedValueSupplier<'_>,
    ) -> Result<i64> {
        self.offer_internal(parts, Some(reserved_value_supplier))
    }

    fn offer_internal(
        &mut self,
        parts: &[&[u8]],
        mut reserved_value_supplier: Option<&mut ReservedValueSupplier<'_>>,
    ) -> Result<i64> {
        if !self.lifecycle.is_open() {
            return Err(PublicationError::Closed);
        }
        let length: usize = parts.iter().map(|part| part.len()).sum();
        if length > self.max_message_length {
            return Err(PublicationError::MessageTooLong {
                length,
                max: self.max_message_length,
            });
        }

        let max_payload_length = self.max_payload_length;
        let landed = if length <= max_payload_length {
            let required = align(length + HEADER_LENGTH, FRAME_ALIGNMENT);
            self.append(required, |appender, header, term_id| {
                appender.append_unfragmented(
                    header,
                    term_id,
                    parts,
                    length,
                    reserved_value_supplier.as_deref_mut(),
                )
            })
        } else {
            let required = compute_fragmented_length(length, max_payload_length);
            self.append(required, |appender, header, term_id| {
                appender.append_fragmented(
                    header,
                    term_id,
                    parts,
                    length,
                    max_payload_length,
                    reserved_value_supplier.as_deref_mut(),
                )
            })
        }?;
        Ok(landed.position)
    }

    /// Reserves a single frame of `length` payload bytes to be written in
    /// place.
    ///
    /// The frame becomes visible on [`BufferClaim::commit`]. A claim that is
    /// aborted or dropped is published as padding.
    pub fn try_claim(&mut self, length: usize) -> Result<BufferClaim<'_>> {
        if !self.lifecycle.is_open() {
            return Err(PublicationError::Closed);
        }
        if length > self.max_payload_length {
            return Err(PublicationError::MessageTooLong {
                length,
                max: self.max_payload_length,
            });
        }

        let required = align(length + HEADER_LENGTH, FRAME_ALIGNMENT);
        let landed = self.append(required, |appender, header, term_id| {
            appender.claim(header, term_id, length)
        })?;
        Ok(BufferClaim::new(
            self.log.term_buffer(landed.partition_index),
            landed.term_offset,
            length + HEADER_LENGTH,
            landed.position,
        ))
    }

    /// Appends a padding frame with `length` bytes of body, moving the stream
    /// forward without delivering a message.
    pub fn append_padding(&mut self, length: usize) -> Result<i64> {
        if !self.lifecycle.is_open() {
            return Err(PublicationError::Closed);
        }
        if length > self.max_message_length {
            return Err(PublicationError::MessageTooLong {
                length,
                max: self.max_message_length,
            });
        }

        let required = align(length + HEADER_LENGTH, FRAME_ALIGNMENT);
        self.append(required, |appender, header, term_id| {
            appender.append_padding(header, term_id, length)
        })
        .map(|landed| landed.position)
    }

    /// Runs `op` against the active term, rotating and retrying once if the
    /// term is exhausted.
    ///
    /// The limit is checked before each attempt. The first refusal reports
    /// the flow-control state; a refusal after rotation reports
    /// [`PublicationError::AdminAction`] since the padding written by the
    /// rotation has already moved the stream.
    fn append<F>(&mut self, required: usize, mut op: F) -> Result<Landed>
    where
        F: FnMut(&TermAppender<'_>, &HeaderWriter, i32) -> AppendOutcome,
    {
        let limit = self.log.position_limit();
        for attempt in 0..2 {
            let position = self.term_begin_position + self.term_offset as i64;
            if position + required as i64 > self.max_possible_position {
                return Err(PublicationError::MaxPositionExceeded);
            }
            if position + required as i64 > limit {
                return Err(if attempt == 0 {
                    self.back_pressure_status()
                } else {
                    PublicationError::AdminAction
                });
            }

            let appender = self.log.term_appender(self.partition_index);
            match op(&appender, &self.header, self.term_id) {
                AppendOutcome::Appended {
                    term_offset,
                    resulting_offset,
                } => {
                    self.term_offset = resulting_offset;
                    return Ok(Landed {
                        position: self.term_begin_position + resulting_offset as i64,
                        term_offset: term_offset as usize,
                        partition_index: self.partition_index,
                    });
                }
                AppendOutcome::Tripped | AppendOutcome::Failed { .. } => self.rotate_term(),
            }
        }
        Err(PublicationError::AdminAction)
    }

    fn back_pressure_status(&self) -> PublicationError {
        if self.log.is_connected() {
            PublicationError::BackPressured
        } else {
            PublicationError::NotConnected
        }
    }

    fn rotate_term(&mut self) {
        self.log.rotate(self.term_count, self.term_id);
        self.term_count = self.term_count.wrapping_add(1);
        self.partition_index = index_by_term_count(self.term_count);
        self.term_id = self.term_id.wrapping_add(1);
        self.term_offset = 0;
        self.term_begin_position += self.log.term_length() as i64;
    }

    /// Starts closing the publication. Later calls do nothing.
    ///
    /// Appends fail with [`PublicationError::Closed`] from this point on. The
    /// log stays mapped until the conductor completes the close and this
    /// handle is dropped.
    pub fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        debug!(
            registration_id = self.registration_id,
            stream_id = self.stream_id,
            session_id = self.session_id,
            position = self.position(),
            "closing exclusive publication"
        );
        let request = CloseRequest::new(
            self.registration_id,
            self.stream_id,
            self.session_id,
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.log),
        );
        if let Err(request) = self.conductor.async_close_exclusive_publication(request) {
            warn!(
                registration_id = self.registration_id,
                "conductor unavailable, completing close locally"
            );
            request.complete();
        }
    }

    pub fn state(&self) -> PublicationState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        !self.lifecycle.is_open()
    }

    /// Stream position the next frame starts at.
    pub fn position(&self) -> i64 {
        self.term_begin_position + self.term_offset as i64
    }

    /// Current flow-control limit from the log metadata.
    pub fn position_limit(&self) -> i64 {
        self.log.position_limit()
    }

    pub fn position_limit_id(&self) -> i32 {
        self.position_limit_id
    }

    /// Bytes that can be appended before hitting the position limit.
    pub fn available_window(&self) -> i64 {
        self.position_limit() - self.position()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_open() && self.log.is_connected()
    }

    /// Status counter of the channel, if one was assigned.
    pub fn channel_status(&self) -> Option<i64> {
        self.channel_status.as_ref().map(Counter::get)
    }

    pub fn channel_status_id(&self) -> Option<i32> {
        self.channel_status.as_ref().map(Counter::id)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn original_registration_id(&self) -> i64 {
        self.original_registration_id
    }

    /// Largest payload that fits in one frame.
    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    pub fn max_possible_position(&self) -> i64 {
        self.max_possible_position
    }

    pub fn term_buffer_length(&self) -> usize {
        self.log.term_length()
    }

    pub fn initial_term_id(&self) -> i32 {
        self.log.initial_term_id()
    }

    pub fn term_id(&self) -> i32 {
        self.term_id
    }

    pub fn term_offset(&self) -> i32 {
        self.term_offset
    }

    /// The underlying log, for inspection.
    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log
    }
}

impl Drop for ExclusivePublication {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for ExclusivePublication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivePublication")
            .field("channel", &self.channel)
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("registration_id", &self.registration_id)
            .field("state", &self.lifecycle.state())
            .field("term_id", &self.term_id)
            .field("term_offset", &self.term_offset)
            .finish()
    }
}
