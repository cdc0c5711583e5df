//! Error types for streams, cancellation and the orchestration components.

use std::fmt;
use std::sync::Arc;

/// The main error type for the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A send or close was attempted on a stream that is already closed
    #[error("Stream is closed")]
    Closed,

    /// An operation was abandoned because its cancellation token fired
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// A deadline elapsed before the operation completed
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A stream was closed by two different closers
    #[error("Stream was closed twice; it has more than one closer")]
    DuplicateClose,

    /// A user supplied transform failed
    #[error("Transform error: {0}")]
    Transform(Arc<dyn std::error::Error + Send + Sync>),

    /// A concurrent unit panicked
    #[error("Unit panicked: {0}")]
    Panicked(String),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a cancellation error carrying `reason`
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Error::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Error::Timeout { duration_ms }
    }

    /// Create a transform error from any error type
    pub fn transform<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Transform(Arc::new(error))
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// True for `Cancelled` and its deadline flavour `Timeout`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::Timeout { .. })
    }

    /// True if this error came from a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::cancelled("unit aborted")
        } else {
            Error::Panicked(err.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Returned by [`Sender::send`](crate::stream::Sender::send) when the stream
/// is closed. Hands the rejected value back.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed stream")
    }
}

impl<T> std::error::Error for SendError<T> {}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Error::Closed
    }
}

/// Non-blocking send failure.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    /// The stream has no free capacity (or no receiver waiting, for a
    /// rendezvous stream)
    Full(T),
    /// The stream is closed
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(value) | TrySendError::Closed(value) => value,
        }
    }

    /// True if the send would have blocked
    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "Full(..)"),
            TrySendError::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "no available capacity"),
            TrySendError::Closed(_) => write!(f, "sending on a closed stream"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

impl<T> From<TrySendError<T>> for Error {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Error::custom("stream is full"),
            TrySendError::Closed(_) => Error::Closed,
        }
    }
}

/// Non-blocking receive failure.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum TryRecvError {
    /// Nothing buffered right now, but the stream is still open
    #[error("stream is empty")]
    Empty,
    /// The stream is closed and drained
    #[error("stream is closed and drained")]
    Closed,
}

impl From<TryRecvError> for Error {
    fn from(err: TryRecvError) -> Self {
        match err {
            TryRecvError::Empty => Error::custom("stream is empty"),
            TryRecvError::Closed => Error::Closed,
        }
    }
}

/// Helper trait for wrapping foreign errors as transform failures
pub trait IntoError<T> {
    fn into_transform_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transform_error(self) -> Result<T> {
        self.map_err(Error::transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_a_cancellation() {
        assert!(Error::timeout(300).is_cancellation());
        assert!(Error::timeout(300).is_timeout());
        assert!(Error::cancelled("stop").is_cancellation());
        assert!(!Error::cancelled("stop").is_timeout());
        assert!(!Error::Closed.is_cancellation());
    }

    #[test]
    fn display_carries_reason() {
        assert_eq!(
            Error::cancelled("user abort").to_string(),
            "Operation cancelled: user abort"
        );
        assert_eq!(Error::timeout(50).to_string(), "Operation timed out after 50ms");
    }

    #[test]
    fn try_send_error_returns_value() {
        let err = TrySendError::Full(7);
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 7);
        assert!(matches!(Error::from(TrySendError::Closed(1)), Error::Closed));
    }
}
