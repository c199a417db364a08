//! Entity bodies: sources for outgoing requests and sinks for incoming responses.
//!
//! Both sides are non-blocking. A [`Body`] that has nothing ready yet reports
//! [`Pull::Blocked`] and wakes the pump once more data arrives; a [`BodySink`] that cannot
//! accept more bytes returns [`io::ErrorKind::WouldBlock`] and the unread bytes stay
//! buffered in the connection until the sink drains.

use std::fmt;
use std::io;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// The result of pulling from a body source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    /// The next piece of the body.
    Data(Bytes),

    /// Nothing is available right now.
    Blocked,

    /// The body is complete.
    End,
}

/// A source of body bytes which never blocks.
pub trait BodySource: Send + 'static {
    /// Pull up to `max` bytes.
    fn pull(&mut self, max: usize) -> io::Result<Pull>;

    /// The total length, if it is known ahead of time.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Return to the beginning so the body can be sent again.
    ///
    /// Sources which cannot be replayed return `false`.
    fn rewind(&mut self) -> bool {
        false
    }

    /// Resolve once a blocked source may have more data.
    fn poll_data(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Ready(())
    }
}

enum Kind {
    Empty,
    Full { data: Bytes, position: usize },
    Channel {
        rx: mpsc::UnboundedReceiver<Bytes>,
        next: Option<Bytes>,
        started: bool,
        closed: bool,
    },
    Source(Box<dyn BodySource>),
}

/// The body of an outgoing request.
///
/// Bodies can be created from [`Bytes`], [`String`], [`Vec<u8>`] or `&'static str`.
/// Streaming bodies are created with [`Body::channel`].
pub struct Body {
    kind: Kind,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Empty => "Empty",
            Kind::Full { .. } => "Full",
            Kind::Channel { .. } => "Channel",
            Kind::Source(_) => "Source",
        };
        f.debug_tuple("Body").field(&kind).finish()
    }
}

impl Body {
    /// An empty body with a known length of zero.
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// A body held entirely in memory.
    pub fn full(data: impl Into<Bytes>) -> Self {
        Self {
            kind: Kind::Full {
                data: data.into(),
                position: 0,
            },
        }
    }

    /// A streaming body of unknown length, fed through the returned sender.
    ///
    /// The body ends when the sender is dropped.
    pub fn channel() -> (BodySender, Body) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BodySender { tx },
            Body {
                kind: Kind::Channel {
                    rx,
                    next: None,
                    started: false,
                    closed: false,
                },
            },
        )
    }

    /// Wrap a custom body source.
    pub fn from_source<S: BodySource>(source: S) -> Self {
        Self {
            kind: Kind::Source(Box::new(source)),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Self::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::full(data)
    }
}

impl BodySource for Body {
    fn pull(&mut self, max: usize) -> io::Result<Pull> {
        match &mut self.kind {
            Kind::Empty => Ok(Pull::End),
            Kind::Full { data, position } => {
                if *position >= data.len() {
                    return Ok(Pull::End);
                }
                let end = data.len().min(*position + max.max(1));
                let chunk = data.slice(*position..end);
                *position = end;
                Ok(Pull::Data(chunk))
            }
            Kind::Channel {
                rx,
                next,
                started,
                closed,
            } => {
                let mut data = match next.take() {
                    Some(data) => data,
                    None if *closed => return Ok(Pull::End),
                    None => match rx.try_recv() {
                        Ok(data) => data,
                        Err(mpsc::error::TryRecvError::Empty) => return Ok(Pull::Blocked),
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            *closed = true;
                            return Ok(Pull::End);
                        }
                    },
                };
                *started = true;
                if data.len() > max.max(1) {
                    *next = Some(data.split_off(max.max(1)));
                }
                Ok(Pull::Data(data))
            }
            Kind::Source(source) => source.pull(max),
        }
    }

    fn size_hint(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Full { data, .. } => Some(data.len() as u64),
            Kind::Channel { .. } => None,
            Kind::Source(source) => source.size_hint(),
        }
    }

    fn rewind(&mut self) -> bool {
        match &mut self.kind {
            Kind::Empty => true,
            Kind::Full { position, .. } => {
                *position = 0;
                true
            }
            Kind::Channel { started, .. } => !*started,
            Kind::Source(source) => source.rewind(),
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.kind {
            Kind::Channel {
                rx, next, closed, ..
            } => {
                if next.is_some() || *closed {
                    return Poll::Ready(());
                }
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(data)) => {
                        *next = Some(data);
                        Poll::Ready(())
                    }
                    Poll::Ready(None) => {
                        *closed = true;
                        Poll::Ready(())
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            Kind::Source(source) => source.poll_data(cx),
            _ => Poll::Ready(()),
        }
    }
}

/// The sending half of a [`Body::channel`].
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<Bytes>,
}

/// The body the sender fed has already been dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("body receiver dropped")]
pub struct BodyClosed;

impl BodySender {
    /// Queue more body data.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), BodyClosed> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.tx.send(data).map_err(|_| BodyClosed)
    }
}

/// A destination for response body bytes.
pub trait BodySink: Send + 'static {
    /// Accept a prefix of `data`, returning how many bytes were taken.
    ///
    /// A sink which cannot take anything right now returns [`io::ErrorKind::WouldBlock`].
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Called once the whole body has been written.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Discard everything written so far, because the response is being received again.
    fn reset(&mut self) {}

    /// Resolve once a blocked sink may accept more data.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Ready(())
    }
}

impl BodySink for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(data);
        Ok(data.len())
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Where a response body is delivered.
pub(crate) enum Sink {
    Collect(BytesMut),
    Custom(Box<dyn BodySink>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Collect(buf) => f.debug_tuple("Collect").field(&buf.len()).finish(),
            Sink::Custom(_) => f.debug_tuple("Custom").finish(),
        }
    }
}

impl Default for Sink {
    fn default() -> Self {
        Sink::Collect(BytesMut::new())
    }
}

impl Sink {
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Collect(buf) => {
                buf.extend_from_slice(data);
                Ok(data.len())
            }
            Sink::Custom(sink) => sink.write(data),
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Collect(_) => Ok(()),
            Sink::Custom(sink) => sink.flush(),
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            Sink::Collect(buf) => buf.clear(),
            Sink::Custom(sink) => sink.reset(),
        }
    }

    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self {
            Sink::Collect(_) => Poll::Ready(()),
            Sink::Custom(sink) => sink.poll_ready(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Body: Send, BodySource, fmt::Debug);
    assert_impl_all!(BodySender: Clone, Send, Sync);

    #[test]
    fn full_body_pulls_in_pieces() {
        let mut body = Body::from("hello world");
        assert_eq!(body.size_hint(), Some(11));
        assert_eq!(body.pull(5).unwrap(), Pull::Data(Bytes::from_static(b"hello")));
        assert_eq!(body.pull(100).unwrap(), Pull::Data(Bytes::from_static(b" world")));
        assert_eq!(body.pull(100).unwrap(), Pull::End);

        assert!(body.rewind());
        assert_eq!(body.pull(100).unwrap(), Pull::Data(Bytes::from_static(b"hello world")));
    }

    #[test]
    fn channel_body_blocks_until_data() {
        let (tx, mut body) = Body::channel();
        assert_eq!(body.size_hint(), None);
        assert_eq!(body.pull(10).unwrap(), Pull::Blocked);
        assert!(body.rewind());

        tx.send("abc").unwrap();
        assert_eq!(body.pull(10).unwrap(), Pull::Data(Bytes::from_static(b"abc")));
        assert!(!body.rewind());

        drop(tx);
        assert_eq!(body.pull(10).unwrap(), Pull::End);
    }

    #[tokio::test]
    async fn channel_body_wakes() {
        let (tx, mut body) = Body::channel();
        let task = tokio::spawn(async move {
            std::future::poll_fn(|cx| body.poll_data(cx)).await;
            body.pull(10).unwrap()
        });
        tx.send("late").unwrap();
        assert_eq!(task.await.unwrap(), Pull::Data(Bytes::from_static(b"late")));
    }

    #[test]
    fn sinks() {
        let mut sink = Sink::default();
        assert_eq!(sink.write(b"abc").unwrap(), 3);
        sink.reset();
        assert!(matches!(&sink, Sink::Collect(buf) if buf.is_empty()));

        let mut sink = Sink::Custom(Box::new(Vec::new()));
        assert_eq!(sink.write(b"abc").unwrap(), 3);
        sink.flush().unwrap();
    }
}
