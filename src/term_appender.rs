use crate::buffer::AtomicBuffer;
use crate::frame::{
    BEGIN_FRAG_FLAG, END_FRAG_FLAG, FRAME_ALIGNMENT, HDR_TYPE_DATA, HDR_TYPE_PAD, HEADER_LENGTH,
    HeaderWriter, RESERVED_VALUE_OFFSET, UNFRAGMENTED, align, publish_frame_length,
};
use crate::metadata::LogMetadata;
use crate::position;

/// Computes the reserved value of a frame from its bytes (header included)
/// just before the frame is published.
pub type ReservedValueSupplier<'s> = dyn FnMut(&[u8]) -> i64 + 's;

/// Result of an append or claim against one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The frames were written starting at `term_offset`; the tail now sits at
    /// `resulting_offset`.
    Appended { term_offset: i32, resulting_offset: i32 },
    /// The tail was already at or past the end of the term. Nothing written.
    Tripped,
    /// The frames did not fit. A padding frame of `padding_length` bytes now
    /// fills the rest of the term.
    Failed { padding_length: i32 },
}

impl AppendOutcome {
    /// `true` when the caller has to rotate to the next term.
    pub fn requires_rotation(&self) -> bool {
        !matches!(self, Self::Appended { .. })
    }
}

/// Single-writer appender for one term.
///
/// Space is reserved by adding the aligned length to the term's tail counter
/// in the metadata. The prior tail decides the outcome:
///
/// - prior offset at or past the term end: [`AppendOutcome::Tripped`],
/// - prior offset plus the length past the term end: the rest of the term is
///   padded, [`AppendOutcome::Failed`],
/// - otherwise the frame is written at the prior offset.
///
/// Because a failed reservation still advances the tail beyond the term end,
/// any later claim on the same term trips instead of padding twice.
///
/// The tail advance reserves space; visibility of each frame is governed by
/// its length field, which is release-stored after the header and payload.
#[derive(Debug, Clone, Copy)]
pub struct TermAppender<'a> {
    term: AtomicBuffer<'a>,
    metadata: LogMetadata<'a>,
    partition_index: usize,
}

enum Reservation {
    At(usize),
    Tripped,
    Padded(usize),
}

impl<'a> TermAppender<'a> {
    pub fn new(term: AtomicBuffer<'a>, metadata: LogMetadata<'a>, partition_index: usize) -> Self {
        Self {
            term,
            metadata,
            partition_index,
        }
    }

    pub fn term(&self) -> AtomicBuffer<'a> {
        self.term
    }

    pub fn partition_index(&self) -> usize {
        self.partition_index
    }

    #[inline(always)]
    pub fn raw_tail(&self) -> i64 {
        self.metadata.raw_tail_volatile(self.partition_index)
    }

    /// Reserves `length` bytes of payload as one unfragmented frame and writes
    /// its header unpublished. The caller fills the payload at
    /// `term_offset + HEADER_LENGTH` and then publishes the frame length.
    pub fn claim(&self, header: &HeaderWriter, term_id: i32, length: usize) -> AppendOutcome {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        match self.reserve(header, term_id, aligned_length) {
            Reservation::At(offset) => {
                header.write(
                    &self.term,
                    offset,
                    frame_length,
                    UNFRAGMENTED,
                    HDR_TYPE_DATA,
                    term_id,
                );
                appended(offset, aligned_length)
            }
            Reservation::Tripped => AppendOutcome::Tripped,
            Reservation::Padded(padding) => failed(padding),
        }
    }

    /// Appends a message that fits in a single frame.
    pub fn append_unfragmented(
        &self,
        header: &HeaderWriter,
        term_id: i32,
        parts: &[&[u8]],
        length: usize,
        reserved_value_supplier: Option<&mut ReservedValueSupplier<'_>>,
    ) -> AppendOutcome {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        match self.reserve(header, term_id, aligned_length) {
            Reservation::At(offset) => {
                header.write(
                    &self.term,
                    offset,
                    frame_length,
                    UNFRAGMENTED,
                    HDR_TYPE_DATA,
                    term_id,
                );
                Gather::new(parts).copy_to(&self.term, offset + HEADER_LENGTH, length);
                if let Some(supplier) = reserved_value_supplier {
                    self.put_reserved_value(offset, frame_length, supplier);
                }
                publish_frame_length(&self.term, offset, frame_length);
                appended(offset, aligned_length)
            }
            Reservation::Tripped => AppendOutcome::Tripped,
            Reservation::Padded(padding) => failed(padding),
        }
    }

    /// Appends a message as a run of frames of at most `max_payload_length`
    /// payload bytes each. The first is flagged BEGIN, the last END.
    ///
    /// The whole run is reserved with one tail advance, so it lands in a
    /// single term or not at all.
    pub fn append_fragmented(
        &self,
        header: &HeaderWriter,
        term_id: i32,
        parts: &[&[u8]],
        length: usize,
        max_payload_length: usize,
        mut reserved_value_supplier: Option<&mut ReservedValueSupplier<'_>>,
    ) -> AppendOutcome {
        let required_length = compute_fragmented_length(length, max_payload_length);
        let offset = match self.reserve(header, term_id, required_length) {
            Reservation::At(offset) => offset,
            Reservation::Tripped => return AppendOutcome::Tripped,
            Reservation::Padded(padding) => return failed(padding),
        };

        let mut gather = Gather::new(parts);
        let mut frame_offset = offset;
        let mut remaining = length;
        let mut flags = BEGIN_FRAG_FLAG;
        loop {
            let bytes_to_write = remaining.min(max_payload_length);
            let frame_length = bytes_to_write + HEADER_LENGTH;
            remaining -= bytes_to_write;
            if remaining == 0 {
                flags |= END_FRAG_FLAG;
            }

            header.write(
                &self.term,
                frame_offset,
                frame_length,
                flags,
                HDR_TYPE_DATA,
                term_id,
            );
            gather.copy_to(&self.term, frame_offset + HEADER_LENGTH, bytes_to_write);
            if let Some(supplier) = reserved_value_supplier.as_deref_mut() {
                self.put_reserved_value(frame_offset, frame_length, supplier);
            }
            publish_frame_length(&self.term, frame_offset, frame_length);

            frame_offset += align(frame_length, FRAME_ALIGNMENT);
            if remaining == 0 {
                break;
            }
            flags = 0;
        }

        appended(offset, required_length)
    }

    /// Appends a padding frame carrying `length` bytes of body.
    pub fn append_padding(
        &self,
        header: &HeaderWriter,
        term_id: i32,
        length: usize,
    ) -> AppendOutcome {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        match self.reserve(header, term_id, aligned_length) {
            Reservation::At(offset) => {
                header.write(
                    &self.term,
                    offset,
                    frame_length,
                    UNFRAGMENTED,
                    HDR_TYPE_PAD,
                    term_id,
                );
                publish_frame_length(&self.term, offset, frame_length);
                appended(offset, aligned_length)
            }
            Reservation::Tripped => AppendOutcome::Tripped,
            Reservation::Padded(padding) => failed(padding),
        }
    }

    fn reserve(&self, header: &HeaderWriter, term_id: i32, aligned_length: usize) -> Reservation {
        let tail_offset = LogMetadata::tail_counter_offset(self.partition_index);
        let raw_tail = self
            .metadata
            .buffer()
            .get_and_add_i64(tail_offset, aligned_length as i64);
        debug_assert_eq!(
            position::term_id(raw_tail),
            term_id,
            "term tail belongs to another term"
        );

        let term_length = self.term.capacity();
        let term_offset = (raw_tail & 0xFFFF_FFFF) as usize;
        if term_offset >= term_length {
            return Reservation::Tripped;
        }
        if term_offset + aligned_length > term_length {
            let padding_length = term_length - term_offset;
            header.write(
                &self.term,
                term_offset,
                padding_length,
                UNFRAGMENTED,
                HDR_TYPE_PAD,
                term_id,
            );
            publish_frame_length(&self.term, term_offset, padding_length);
            return Reservation::Padded(padding_length);
        }
        Reservation::At(term_offset)
    }

    fn put_reserved_value(
        &self,
        offset: usize,
        frame_length: usize,
        supplier: &mut ReservedValueSupplier<'_>,
    ) {
        // The frame is unpublished, so only this writer touches it.
        let frame = unsafe { self.term.slice(offset, frame_length) };
        let value = supplier(frame);
        self.term.put_i64(offset + RESERVED_VALUE_OFFSET, value);
    }
}

/// Bytes a fragmented message occupies in a term, headers and alignment
/// included.
pub fn compute_fragmented_length(length: usize, max_payload_length: usize) -> usize {
    let num_max_payloads = length / max_payload_length;
    let remaining_payload = length % max_payload_length;
    let last_frame_length = if remaining_payload > 0 {
        align(remaining_payload + HEADER_LENGTH, FRAME_ALIGNMENT)
    } else {
        0
    };
    num_max_payloads * (max_payload_length + HEADER_LENGTH) + last_frame_length
}

fn appended(offset: usize, length: usize) -> AppendOutcome {
    AppendOutcome::Appended {
        term_offset: offset as i32,
        resulting_offset: (offset + length) as i32,
    }
}

fn failed(padding_length: usize) -> AppendOutcome {
    AppendOutcome::Failed {
        padding_length: padding_length as i32,
    }
}

/// Copies consecutive ranges out of a list of slices as if they were one.
struct Gather<'p> {
    parts: &'p [&'p [u8]],
    part: usize,
    offset: usize,
}

impl<'p> Gather<'p> {
    fn new(parts: &'p [&'p [u8]]) -> Self {
        Self {
            parts,
            part: 0,
            offset: 0,
        }
    }

    fn copy_to(&mut self, term: &AtomicBuffer<'_>, mut dst: usize, mut len: usize) {
        while len > 0 {
            let Some(part) = self.parts.get(self.part) else {
                debug_assert!(false, "gather ran out of input");
                return;
            };
            let available = part.len() - self.offset;
            if available == 0 {
                self.part += 1;
                self.offset = 0;
                continue;
            }
            let n = available.min(len);
            term.put_bytes(dst, &part[self.offset..self.offset + n]);
            self.offset += n;
            dst += n;
            len -= n;
        }
    }
}
