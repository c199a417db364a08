//! In-memory byte streams for testing.
//!
//! A [`MockStream`] is the client half of a scripted socket. The matching
//! [`MockPeer`] plays the server: it injects response bytes, inspects what the
//! client wrote, and can close or break the wire at any point.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use super::{ByteStream, Interest, Progress};

static IDENT: AtomicU16 = AtomicU16::new(1);

/// A unique identifier for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamID(u16);

impl StreamID {
    /// Create a new unique stream identifier.
    pub fn new() -> Self {
        Self(IDENT.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for StreamID {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Wire {
    inbound: BytesMut,
    outbound: BytesMut,
    eof: bool,
    broken: bool,
    shutdown: bool,
    write_budget: Option<usize>,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

impl Wire {
    fn wake(&mut self) {
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
        if let Some(waker) = self.writer.take() {
            waker.wake();
        }
    }

    fn readable(&self) -> bool {
        !self.inbound.is_empty() || self.eof || self.shutdown || self.broken
    }

    fn writable(&self) -> bool {
        self.write_budget != Some(0) || self.shutdown || self.broken
    }
}

/// The client half of an in-memory connection.
pub struct MockStream {
    id: StreamID,
    wire: Arc<Mutex<Wire>>,
}

impl fmt::Debug for MockStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockStream").field("id", &self.id).finish()
    }
}

impl MockStream {
    /// Create a connected stream and the peer which drives it.
    pub fn pair() -> (MockStream, MockPeer) {
        let id = StreamID::new();
        let wire = Arc::new(Mutex::new(Wire::default()));
        trace!(%id, "creating mock stream");
        (
            MockStream {
                id,
                wire: wire.clone(),
            },
            MockPeer { id, wire },
        )
    }

    /// Get the unique ID for this stream.
    pub fn id(&self) -> StreamID {
        self.id
    }
}

impl ByteStream for MockStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        let mut wire = self.wire.lock();
        if wire.broken {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if wire.shutdown {
            return Ok(Progress::Ready(0));
        }
        if wire.inbound.is_empty() {
            return if wire.eof {
                Ok(Progress::Ready(0))
            } else {
                Ok(Progress::Blocked(Interest::READ))
            };
        }
        let n = buf.len().min(wire.inbound.len());
        let data = wire.inbound.split_to(n);
        buf[..n].copy_from_slice(&data);
        Ok(Progress::Ready(n))
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Progress> {
        let mut wire = self.wire.lock();
        if wire.broken || wire.shutdown {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match wire.write_budget {
            Some(0) => return Ok(Progress::Blocked(Interest::WRITE)),
            Some(budget) => {
                let n = budget.min(buf.len());
                wire.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };
        wire.outbound.extend_from_slice(&buf[..n]);
        Ok(Progress::Ready(n))
    }

    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut wire = self.wire.lock();
        if (interest.read && wire.readable()) || (interest.write && wire.writable()) {
            return Poll::Ready(Ok(()));
        }
        if interest.read {
            wire.reader = Some(cx.waker().clone());
        }
        if interest.write {
            wire.writer = Some(cx.waker().clone());
        }
        Poll::Pending
    }

    fn shutdown(&mut self) -> io::Result<()> {
        let mut wire = self.wire.lock();
        trace!(id = %self.id, "mock stream shutdown");
        wire.shutdown = true;
        wire.wake();
        Ok(())
    }
}

/// The server half of an in-memory connection.
#[derive(Clone)]
pub struct MockPeer {
    id: StreamID,
    wire: Arc<Mutex<Wire>>,
}

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeer").field("id", &self.id).finish()
    }
}

impl MockPeer {
    /// The ID of the stream this peer drives.
    pub fn id(&self) -> StreamID {
        self.id
    }

    /// Queue bytes for the client to read.
    pub fn respond(&self, data: impl AsRef<[u8]>) {
        let mut wire = self.wire.lock();
        wire.inbound.extend_from_slice(data.as_ref());
        wire.wake();
    }

    /// Everything the client has written so far.
    pub fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.wire.lock().outbound)
    }

    /// Take everything the client has written so far.
    pub fn take_written(&self) -> Bytes {
        self.wire.lock().outbound.split().freeze()
    }

    /// Finish the server side of the stream. Reads drain, then see end of stream.
    pub fn close(&self) {
        let mut wire = self.wire.lock();
        wire.eof = true;
        wire.wake();
    }

    /// Break the wire. Every following read or write fails.
    pub fn reset(&self) {
        let mut wire = self.wire.lock();
        wire.broken = true;
        wire.wake();
    }

    /// Limit how many more bytes the client may write before blocking.
    ///
    /// `None` removes the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        let mut wire = self.wire.lock();
        wire.write_budget = budget;
        wire.wake();
    }

    /// Whether the client shut the stream down.
    pub fn is_shutdown(&self) -> bool {
        self.wire.lock().shutdown
    }
}
