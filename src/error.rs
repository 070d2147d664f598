/// Errors returned by publication, log buffer and mapping operations.
///
/// The flow-control variants ([`BackPressured`](Self::BackPressured),
/// [`NotConnected`](Self::NotConnected), [`AdminAction`](Self::AdminAction))
/// are transient: the caller retries with its own backoff. Everything else is
/// fatal to the call that produced it.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PublicationError {
    /// The publication has been closed, or a close is in progress.
    #[error("publication is closed")]
    Closed,
    /// The position limit does not leave room for the frame.
    #[error("publication is back pressured")]
    BackPressured,
    /// The position limit is exhausted and no subscriber is connected.
    #[error("publication is not connected")]
    NotConnected,
    /// The log rotated and the frame could not be placed in the new term.
    #[error("administrative action in progress, retry")]
    AdminAction,
    /// The append would move the stream past the maximum possible position.
    #[error("maximum stream position exceeded")]
    MaxPositionExceeded,
    /// A message or claim is longer than the publication can carry.
    #[error("message length {length} exceeds maximum {max}")]
    MessageTooLong { length: usize, max: usize },
    /// A mapped log failed layout validation.
    #[error("invalid log buffer: {0}")]
    InvalidLogBuffer(String),
    /// A configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Allocation, mapping or file-system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PublicationError {
    /// Returns `true` for flow-control conditions that clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackPressured | Self::NotConnected | Self::AdminAction
        )
    }
}

pub type Result<T> = std::result::Result<T, PublicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_errors_are_transient() {
        assert!(PublicationError::BackPressured.is_transient());
        assert!(PublicationError::NotConnected.is_transient());
        assert!(PublicationError::AdminAction.is_transient());
        assert!(!PublicationError::Closed.is_transient());
        assert!(!PublicationError::MaxPositionExceeded.is_transient());
        assert!(
            !PublicationError::MessageTooLong {
                length: 10,
                max: 5
            }
            .is_transient()
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: PublicationError = std::io::Error::from_raw_os_error(libc::ENOENT).into();
        assert!(matches!(err, PublicationError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
