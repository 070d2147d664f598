//! Log buffer configuration.
//!
//! Sizes and limits shared by the log creator and the publication that maps
//! the log. Everything is validated once, before a log is created or bound.

use crate::error::{PublicationError, Result};
use crate::frame::{FRAME_ALIGNMENT, HEADER_LENGTH, align};
use crate::metadata::LOG_META_DATA_LENGTH;

/// Number of terms in a log buffer.
pub const PARTITION_COUNT: usize = 3;

/// Minimum term length (64 KiB).
pub const TERM_MIN_LENGTH: usize = 64 * 1024;

/// Maximum term length (1 GiB).
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Default term length (16 MiB).
pub const DEFAULT_TERM_LENGTH: usize = 16 * 1024 * 1024;

/// Minimum page size the log length is aligned to.
pub const PAGE_MIN_SIZE: usize = 4 * 1024;

/// Maximum page size the log length is aligned to.
pub const PAGE_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Default MTU: frame header plus payload of a single fragment.
pub const DEFAULT_MTU_LENGTH: usize = 1408;

/// Largest MTU a transport below the log buffer can carry.
pub const MAX_MTU_LENGTH: usize = 65504;

/// Upper bound on a single message regardless of term length (16 MiB).
pub const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Shape of a log buffer: term length, page alignment, MTU and the term id
/// the stream starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBufferConfig {
    /// Length of each of the three terms. Power of two.
    pub term_length: usize,
    /// Page size the total log length is rounded up to. Power of two.
    pub page_size: usize,
    /// Maximum frame length, header included. Multiple of the frame alignment.
    pub mtu_length: usize,
    /// Term id of the first term in the stream.
    pub initial_term_id: i32,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            term_length: DEFAULT_TERM_LENGTH,
            page_size: DEFAULT_PAGE_SIZE,
            mtu_length: DEFAULT_MTU_LENGTH,
            initial_term_id: 0,
        }
    }
}

impl LogBufferConfig {
    #[must_use]
    pub fn with_term_length(mut self, term_length: usize) -> Self {
        self.term_length = term_length;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_mtu_length(mut self, mtu_length: usize) -> Self {
        self.mtu_length = mtu_length;
        self
    }

    #[must_use]
    pub fn with_initial_term_id(mut self, initial_term_id: i32) -> Self {
        self.initial_term_id = initial_term_id;
        self
    }

    /// Checks every field against its bounds.
    pub fn validate(&self) -> Result<()> {
        check_term_length(self.term_length)?;
        check_page_size(self.page_size)?;
        check_mtu_length(self.mtu_length, self.term_length)
    }

    /// Total bytes the log occupies: three terms plus metadata, page aligned.
    pub fn log_length(&self) -> usize {
        compute_log_length(self.term_length, self.page_size)
    }
}

pub fn check_term_length(term_length: usize) -> Result<()> {
    if term_length < TERM_MIN_LENGTH {
        return Err(PublicationError::InvalidConfig(format!(
            "term length less than min length of {TERM_MIN_LENGTH}: length={term_length}"
        )));
    }
    if term_length > TERM_MAX_LENGTH {
        return Err(PublicationError::InvalidConfig(format!(
            "term length more than max length of {TERM_MAX_LENGTH}: length={term_length}"
        )));
    }
    if !term_length.is_power_of_two() {
        return Err(PublicationError::InvalidConfig(format!(
            "term length not a power of 2: length={term_length}"
        )));
    }
    Ok(())
}

pub fn check_page_size(page_size: usize) -> Result<()> {
    if !(PAGE_MIN_SIZE..=PAGE_MAX_SIZE).contains(&page_size) {
        return Err(PublicationError::InvalidConfig(format!(
            "page size outside [{PAGE_MIN_SIZE}, {PAGE_MAX_SIZE}]: size={page_size}"
        )));
    }
    if !page_size.is_power_of_two() {
        return Err(PublicationError::InvalidConfig(format!(
            "page size not a power of 2: size={page_size}"
        )));
    }
    Ok(())
}

pub fn check_mtu_length(mtu_length: usize, term_length: usize) -> Result<()> {
    if mtu_length <= HEADER_LENGTH || mtu_length > MAX_MTU_LENGTH {
        return Err(PublicationError::InvalidConfig(format!(
            "mtu length outside ({HEADER_LENGTH}, {MAX_MTU_LENGTH}]: length={mtu_length}"
        )));
    }
    if mtu_length % FRAME_ALIGNMENT != 0 {
        return Err(PublicationError::InvalidConfig(format!(
            "mtu length not a multiple of {FRAME_ALIGNMENT}: length={mtu_length}"
        )));
    }
    if mtu_length > term_length / 8 {
        return Err(PublicationError::InvalidConfig(format!(
            "mtu length more than term length / 8: mtu={mtu_length} term={term_length}"
        )));
    }
    Ok(())
}

pub const fn compute_log_length(term_length: usize, page_size: usize) -> usize {
    align(
        PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH,
        page_size,
    )
}

/// Largest message a log with this term length accepts.
pub const fn compute_max_message_length(term_length: usize) -> usize {
    let eighth = term_length / 8;
    if eighth < MAX_MESSAGE_LENGTH {
        eighth
    } else {
        MAX_MESSAGE_LENGTH
    }
}
