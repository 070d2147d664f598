//! Boundary to the conductor that owns publication registration and teardown.
//!
//! The publication never waits on the conductor. Closing sends a
//! [`CloseRequest`] over an unbounded channel and returns at once; the
//! conductor later confirms with [`CloseRequest::complete`].
//!
//! Lifecycle of a publication:
//!
//! ```text
//!   Open ──close()──▶ Closing ──CloseRequest::complete()──▶ Closed
//! ```
//!
//! Appends fail from the moment the state leaves `Open`. The log mapping is
//! released when the last reference to it goes away. The close request holds
//! one, so the mapping outlives the handle until the conductor is done.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::log_buffer::LogBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PublicationState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// Shared lifecycle cell of one publication.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Self(AtomicU8::new(PublicationState::Open as u8))
    }
}

impl Lifecycle {
    pub fn state(&self) -> PublicationState {
        match self.0.load(Ordering::Acquire) {
            0 => PublicationState::Open,
            1 => PublicationState::Closing,
            _ => PublicationState::Closed,
        }
    }

    #[inline(always)]
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire) == PublicationState::Open as u8
    }

    /// Moves `Open` to `Closing`. Returns `false` if the publication was
    /// already closing or closed.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                PublicationState::Open as u8,
                PublicationState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.0
            .store(PublicationState::Closed as u8, Ordering::Release)
    }
}

/// Commands the publication sends to the conductor.
#[derive(Debug)]
pub enum ConductorCommand {
    CloseExclusivePublication(CloseRequest),
}

/// Close of one exclusive publication, awaiting the conductor's confirmation.
///
/// Holds a reference to the publication's log so the mapping stays valid
/// until the conductor has finished its bookkeeping.
pub struct CloseRequest {
    registration_id: i64,
    stream_id: i32,
    session_id: i32,
    lifecycle: Arc<Lifecycle>,
    log: Arc<LogBuffer>,
}

impl CloseRequest {
    pub(crate) fn new(
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        lifecycle: Arc<Lifecycle>,
        log: Arc<LogBuffer>,
    ) -> Self {
        Self {
            registration_id,
            stream_id,
            session_id,
            lifecycle,
            log,
        }
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// The log being closed, still mapped.
    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log
    }

    /// Confirms the close: the publication becomes `Closed` and this request
    /// drops its reference to the log.
    pub fn complete(self) {
        self.lifecycle.mark_closed();
        debug!(
            registration_id = self.registration_id,
            stream_id = self.stream_id,
            session_id = self.session_id,
            "exclusive publication close completed"
        );
    }
}

impl Debug for CloseRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseRequest")
            .field("registration_id", &self.registration_id)
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

/// Sending side of the conductor's command queue. Cheap to clone; does not
/// keep the conductor alive.
#[derive(Debug, Clone)]
pub struct ConductorHandle {
    commands: Sender<ConductorCommand>,
}

impl ConductorHandle {
    /// Queues the close without waiting. If the conductor is gone the request
    /// is handed back.
    pub fn async_close_exclusive_publication(
        &self,
        request: CloseRequest,
    ) -> Result<(), CloseRequest> {
        self.commands
            .send(ConductorCommand::CloseExclusivePublication(request))
            .map_err(|err| match err.into_inner() {
                ConductorCommand::CloseExclusivePublication(request) => request,
            })
    }
}

/// Receiving side of the command queue, polled by the conductor's own thread.
#[derive(Debug)]
pub struct ConductorQueue {
    commands: Receiver<ConductorCommand>,
}

impl ConductorQueue {
    /// Next command if one is queued.
    pub fn try_next(&self) -> Option<ConductorCommand> {
        match self.commands.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next command.
    pub fn next_timeout(&self, timeout: Duration) -> Option<ConductorCommand> {
        self.commands.recv_timeout(timeout).ok()
    }

    /// All commands queued right now.
    pub fn drain(&self) -> impl Iterator<Item = ConductorCommand> + '_ {
        self.commands.try_iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Creates the command queue between publications and a conductor.
pub fn conductor_channel() -> (ConductorHandle, ConductorQueue) {
    let (commands, inbox) = unbounded();
    (
        ConductorHandle { commands },
        ConductorQueue { commands: inbox },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogBufferConfig, TERM_MIN_LENGTH};

    fn log() -> Arc<LogBuffer> {
        let config = LogBufferConfig::default().with_term_length(TERM_MIN_LENGTH);
        Arc::new(LogBuffer::heap(&config, 1, 2, 3).unwrap())
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.state(), PublicationState::Open);
        assert!(lifecycle.is_open());
        assert!(lifecycle.begin_close());
        assert_eq!(lifecycle.state(), PublicationState::Closing);
        assert!(!lifecycle.begin_close());
        lifecycle.mark_closed();
        assert_eq!(lifecycle.state(), PublicationState::Closed);
        assert!(!lifecycle.begin_close());
    }

    #[test]
    fn close_request_reaches_conductor_and_completes() {
        let (handle, queue) = conductor_channel();
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.begin_close();
        let log = log();

        handle
            .async_close_exclusive_publication(CloseRequest::new(
                9,
                1001,
                11,
                Arc::clone(&lifecycle),
                Arc::clone(&log),
            ))
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(Arc::strong_count(&log), 2);

        let Some(ConductorCommand::CloseExclusivePublication(request)) = queue.try_next() else {
            panic!("expected close command");
        };
        assert_eq!(request.registration_id(), 9);
        assert_eq!(request.stream_id(), 1001);
        assert_eq!(request.session_id(), 11);
        assert_eq!(request.log_buffer().term_length(), TERM_MIN_LENGTH);
        assert_eq!(lifecycle.state(), PublicationState::Closing);

        request.complete();
        assert_eq!(lifecycle.state(), PublicationState::Closed);
        assert_eq!(Arc::strong_count(&log), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn send_to_dropped_conductor_returns_request() {
        let (handle, queue) = conductor_channel();
        drop(queue);
        let request = CloseRequest::new(1, 2, 3, Arc::new(Lifecycle::default()), log());
        let returned = handle.async_close_exclusive_publication(request).unwrap_err();
        assert_eq!(returned.registration_id(), 1);
    }

    #[test]
    fn next_timeout_returns_none_when_idle() {
        let (_handle, queue) = conductor_channel();
        assert!(queue.next_timeout(Duration::from_millis(1)).is_none());
        assert_eq!(queue.drain().count(), 0);
    }
}
