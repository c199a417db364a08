//! Non-blocking byte streams.
//!
//! A connection never blocks on its socket. Every read and write is attempted
//! once, and a stream which cannot make progress reports which readiness it is
//! waiting for. The pump then parks on [`ByteStream::poll_ready`] for every
//! connection in the execution context at once.

use std::io;
use std::ops::BitOr;
use std::task::{Context, Poll};

#[cfg(any(test, feature = "mocks"))]
pub mod mock;

/// Readiness a connection is waiting on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Waiting until the stream is readable.
    pub read: bool,

    /// Waiting until the stream is writable.
    pub write: bool,
}

impl Interest {
    /// Not waiting on the stream.
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };

    /// Waiting for readability.
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    /// Waiting for writability.
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    /// Waiting for either direction.
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    /// True when neither direction is of interest.
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        Interest {
            read: self.read || rhs.read,
            write: self.write || rhs.write,
        }
    }
}

/// Outcome of a single non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Bytes were transferred. Zero bytes means the peer has closed.
    Ready(usize),

    /// Nothing could be transferred until the stream is ready again.
    ///
    /// A TLS stream may report that a write is blocked on reading, so the
    /// interest is not necessarily the direction of the operation.
    Blocked(Interest),
}

/// A bidirectional byte stream which never blocks.
pub trait ByteStream: Send + 'static {
    /// Read whatever is available into `buf`.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Progress>;

    /// Write as much of `buf` as the stream will accept right now.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<Progress>;

    /// Resolve once the stream is ready for one of the directions in `interest`.
    ///
    /// Errors resolve the poll as well, so that the next operation surfaces them.
    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Shut the stream down in both directions.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl<S> ByteStream for Box<S>
where
    S: ByteStream + ?Sized,
{
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        (**self).try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Progress> {
        (**self).try_write(buf)
    }

    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_ready(interest, cx)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }
}
