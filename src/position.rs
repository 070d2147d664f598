//! Stream position arithmetic.
//!
//! A position is a byte offset into the unbounded stream. With a power-of-two
//! term length it splits into a term id (high bits, offset by the initial
//! term id) and a term offset (low bits):
//!
//! ```text
//! position = (term_id - initial_term_id) << shift | term_offset
//! shift    = log2(term_length)
//! ```
//!
//! Term ids wrap as `i32`, so all term id differences use wrapping
//! arithmetic.
//!
//! Each term's tail counter packs the term id and the offset into one `i64`:
//!
//! ```text
//! [ term_id (32 bits, high) | term_offset (32 bits, low) ]
//! ```
//!
//! The offset half may run past the term length once a claim trips the end of
//! the term; readers clamp it with [`term_offset`].

use crate::config::PARTITION_COUNT;

/// Number of bits to shift a position right by to get the term count.
#[inline(always)]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    debug_assert!(term_length.is_power_of_two());
    term_length.trailing_zeros()
}

#[inline(always)]
pub fn compute_position(
    active_term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = active_term_id.wrapping_sub(initial_term_id) as i64;
    (term_count << position_bits_to_shift) + term_offset as i64
}

#[inline(always)]
pub fn compute_term_begin_position(
    active_term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = active_term_id.wrapping_sub(initial_term_id) as i64;
    term_count << position_bits_to_shift
}

#[inline(always)]
pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

#[inline(always)]
pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    let mask = (1i64 << position_bits_to_shift) - 1;
    (position & mask) as i32
}

/// Last position a stream with this term length can reach.
#[inline(always)]
pub fn compute_max_possible_position(term_length: usize) -> i64 {
    (term_length as i64) << 31
}

#[inline(always)]
pub fn index_by_term(initial_term_id: i32, active_term_id: i32) -> usize {
    (active_term_id.wrapping_sub(initial_term_id) as u32 as usize) % PARTITION_COUNT
}

#[inline(always)]
pub fn index_by_term_count(term_count: i32) -> usize {
    (term_count as u32 as usize) % PARTITION_COUNT
}

#[inline(always)]
pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) as usize) % PARTITION_COUNT
}

/// Packs a term id and offset into a raw tail value.
#[inline(always)]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

#[inline(always)]
pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Offset half of a raw tail, clamped to the term length.
#[inline(always)]
pub fn term_offset(raw_tail: i64, term_length: usize) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length as i64) as i32
}

/// Position arithmetic for one log, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionCodec {
    term_length: usize,
    position_bits_to_shift: u32,
    initial_term_id: i32,
}

impl PositionCodec {
    /// `term_length` must be a power of two; it is validated where the log is
    /// bound, not here.
    pub fn new(term_length: usize, initial_term_id: i32) -> Self {
        Self {
            term_length,
            position_bits_to_shift: position_bits_to_shift(term_length),
            initial_term_id,
        }
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    #[inline(always)]
    pub fn position_of(&self, term_id: i32, term_offset: i32) -> i64 {
        compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    /// Inverse of [`position_of`](Self::position_of).
    #[inline(always)]
    pub fn term_offset_of(&self, position: i64) -> (i32, i32) {
        (
            compute_term_id_from_position(
                position,
                self.position_bits_to_shift,
                self.initial_term_id,
            ),
            compute_term_offset_from_position(position, self.position_bits_to_shift),
        )
    }

    #[inline(always)]
    pub fn term_begin_position(&self, term_id: i32) -> i64 {
        compute_term_begin_position(term_id, self.position_bits_to_shift, self.initial_term_id)
    }

    #[inline(always)]
    pub fn index_of_term(&self, term_id: i32) -> usize {
        index_by_term(self.initial_term_id, term_id)
    }

    pub fn max_possible_position(&self) -> i64 {
        compute_max_possible_position(self.term_length)
    }
}
