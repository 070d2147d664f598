//! # Exclusive Publication
//!
//! A single-writer publication that appends framed messages to a three-term
//! log buffer, designed for low-latency messaging where one thread owns the
//! outgoing stream.
//!
//! The log is a contiguous region (heap memory, or a memory-mapped file for
//! **inter-process communication**) holding three equally sized terms and a
//! metadata page. The publication appends frames to the active term; when it
//! fills, the rest is padded and the next term becomes active. Readers follow
//! the frames in place and never take locks.
//!
//! ## Publication Protocol
//!
//! Every frame starts with a 32-byte little-endian header. Its length field is
//! written last with release ordering: a reader that observes a positive
//! length also observes the header and payload. Frames are 32-byte aligned, so
//! the stream position advances by the aligned frame length.
//!
//! Appends are **flow-controlled** by a position limit counter kept in the log
//! metadata, where consumers on any mapping can raise it. An append that
//! would pass the limit writes nothing and returns a transient error:
//!
//! - [`PublicationError::BackPressured`]: subscribers are behind.
//! - [`PublicationError::NotConnected`]: no subscriber is attached.
//! - [`PublicationError::AdminAction`]: the term rotated; retry.
//!
//! The caller owns the retry policy. Nothing in this crate spins or blocks.
//!
//! ## Modules
//!
//! - [`publication`]: [`ExclusivePublication`], the writer's handle.
//! - [`claim`]: [`BufferClaim`] for writing a frame in place.
//! - [`log_buffer`]: Layout of the terms and metadata, and term rotation.
//! - [`term_appender`]: Space reservation and frame writing within one term.
//! - [`frame`]: Frame header layout and a scanner for readers.
//! - [`conductor`]: Asynchronous close handshake with the owning conductor.
//! - [`raw_log`]: Heap and memory-mapped backing for the log.
//!
//! ## License
//!
//! Copyright © 2005–2025
//! IKH Software, Inc.
//!
//! Licensed under the terms of the **GNU Lesser General Public License**,
//! version 3.0, or (at your option) any later version.
//!
//! See <https://www.gnu.org/licenses/lgpl-3.0.html> for details.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

#[cfg(target_endian = "big")]
compile_error!("The log buffer layout is little-endian only.");

pub mod buffer;
pub mod claim;
pub mod conductor;
pub mod config;
pub mod counters;
pub mod error;
pub mod frame;
pub mod log_buffer;
pub mod metadata;
pub mod position;
pub mod publication;
pub mod raw_log;
pub mod term_appender;

pub use buffer::AtomicBuffer;
pub use claim::BufferClaim;
pub use conductor::{
    CloseRequest, ConductorCommand, ConductorHandle, ConductorQueue, PublicationState,
    conductor_channel,
};
pub use config::LogBufferConfig;
pub use counters::{Counter, CountersBuffer};
pub use error::{PublicationError, Result};
pub use frame::{DataHeader, FrameIter};
pub use log_buffer::LogBuffer;
pub use publication::{ExclusivePublication, PublicationParams};
pub use raw_log::{HeapRawLog, MappedRawLog, RawLog};
pub use term_appender::ReservedValueSupplier;
