use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::client::pool::TargetError;
use crate::message::{FramingError, RequestError};

/// Client error type.
///
/// Errors are cheap to clone, so that one connection failure can be delivered to every
/// request it affects.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The server sent bytes which are not a valid HTTP/1.1 message.
    #[error("protocol: {0}")]
    Protocol(#[from] FramingError),

    /// The underlying stream failed, timed out, or closed unexpectedly.
    #[error("transport: {0}")]
    Transport(#[source] Arc<io::Error>),

    /// The request cannot be sent as given.
    #[error("request: {0}")]
    Request(#[from] RequestError),

    /// The request body source or the response body sink failed.
    #[error("body: {0}")]
    Body(#[source] Arc<io::Error>),

    /// The request URI does not name a server this client can reach.
    #[error("target: {0}")]
    Target(#[from] TargetError),

    /// No connection became available in time.
    #[error("connection pool busy")]
    Busy,

    /// The client was shut down, or the connection carrying the request was killed.
    #[error("client closed")]
    Closed,
}

impl Error {
    pub(crate) fn transport(error: io::Error) -> Self {
        Error::Transport(Arc::new(error))
    }

    /// The stream ended before the response was complete.
    pub(crate) fn eof() -> Self {
        Error::transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before message completed",
        ))
    }

    pub(crate) fn timed_out() -> Self {
        Error::transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection timed out",
        ))
    }

    /// The status reported for a request which ended in this error. Always 0.
    pub fn status(&self) -> u16 {
        0
    }

    /// Whether the error came from the connection rather than the request itself.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Transport(_))
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::transport(error)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Clone, Send, Sync, std::error::Error);

    #[test]
    fn status_is_zero() {
        assert_eq!(Error::Busy.status(), 0);
        assert!(Error::eof().is_connection());
        assert!(!Error::Closed.is_connection());
        assert_eq!(
            Error::Protocol(FramingError::ChunkSize).to_string(),
            "protocol: invalid chunk size"
        );
    }
}
