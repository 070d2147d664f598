use std::fmt::Debug;
use tracing::trace;

use crate::buffer::AtomicBuffer;
use crate::frame::{
    FLAGS_OFFSET, HDR_TYPE_PAD, HEADER_LENGTH, RESERVED_VALUE_OFFSET, TYPE_OFFSET,
    publish_frame_length,
};

/// A frame reserved in the term by
/// [`ExclusivePublication::try_claim`](crate::ExclusivePublication::try_claim),
/// written in place and then published.
///
/// Readers do not see the frame until [`commit`](Self::commit). If the claim
/// is [aborted](Self::abort), or dropped without being committed, the frame
/// is turned into padding and published, so readers skip the span instead of
/// stalling on it.
///
/// The claim borrows the publication mutably: no other append can happen
/// while it is outstanding.
pub struct BufferClaim<'a> {
    term: AtomicBuffer<'a>,
    offset: usize,
    frame_length: usize,
    position: i64,
    done: bool,
}

impl<'a> BufferClaim<'a> {
    pub(crate) fn new(
        term: AtomicBuffer<'a>,
        offset: usize,
        frame_length: usize,
        position: i64,
    ) -> Self {
        Self {
            term,
            offset,
            frame_length,
            position,
            done: false,
        }
    }

    /// Stream position just past this frame once committed.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Offset of the frame header within its term.
    pub fn term_offset(&self) -> usize {
        self.offset
    }

    /// Payload length.
    pub fn length(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    /// The payload region to write into.
    pub fn buffer(&mut self) -> &mut [u8] {
        // The region lies beyond the published tail of readers and is
        // exclusively ours until commit or abort.
        unsafe {
            self.term
                .slice_mut(self.offset + HEADER_LENGTH, self.length())
        }
    }

    /// Copies `src` into the payload at `offset`.
    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.length(),
            "write of {} at {offset} exceeds claim of {}",
            src.len(),
            self.length()
        );
        self.term
            .put_bytes(self.offset + HEADER_LENGTH + offset, src);
    }

    pub fn reserved_value(&self) -> i64 {
        self.term.get_i64(self.offset + RESERVED_VALUE_OFFSET)
    }

    pub fn set_reserved_value(&mut self, value: i64) {
        self.term
            .put_i64(self.offset + RESERVED_VALUE_OFFSET, value);
    }

    pub fn flags(&self) -> u8 {
        self.term.get_u8(self.offset + FLAGS_OFFSET)
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.term.put_u8(self.offset + FLAGS_OFFSET, flags);
    }

    pub fn set_header_type(&mut self, frame_type: u16) {
        self.term.put_u16(self.offset + TYPE_OFFSET, frame_type);
    }

    /// Publishes the frame to readers.
    pub fn commit(mut self) {
        publish_frame_length(&self.term, self.offset, self.frame_length);
        self.done = true;
    }

    /// Publishes the frame as padding.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        self.term.put_u16(self.offset + TYPE_OFFSET, HDR_TYPE_PAD);
        publish_frame_length(&self.term, self.offset, self.frame_length);
        self.done = true;
    }
}

impl Drop for BufferClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            trace!(
                term_offset = self.offset,
                frame_length = self.frame_length,
                "uncommitted claim dropped, publishing as padding"
            );
            self.abort_in_place();
        }
    }
}

impl Debug for BufferClaim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferClaim")
            .field("term_offset", &self.offset)
            .field("frame_length", &self.frame_length)
            .field("position", &self.position)
            .finish()
    }
}
