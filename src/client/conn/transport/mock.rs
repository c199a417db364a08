//! A transport which hands out in-memory streams, for testing connection behavior.

use std::future::{ready, Ready};
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tracing::trace;

use super::Endpoint;
use crate::client::conn::stream::mock::{MockPeer, MockStream};
use crate::client::pool::Target;

#[derive(Debug, Default)]
struct Inner {
    peers: Vec<(Target, MockPeer)>,
    refuse: usize,
}

/// A mock transport which creates a fresh [`MockStream`] for every connection.
///
/// The server side of each stream is recorded, in connection order, so that tests can
/// play the part of the server.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    /// Create a new transport with no connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.inner.lock().refuse = count;
    }

    /// The number of streams established so far.
    pub fn connections(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// The server side of the `index`th established stream.
    pub fn peer(&self, index: usize) -> Option<MockPeer> {
        self.inner.lock().peers.get(index).map(|(_, peer)| peer.clone())
    }

    /// The most recently established stream to `target`.
    pub fn latest(&self, target: &Target) -> Option<MockPeer> {
        self.inner
            .lock()
            .peers
            .iter()
            .rev()
            .find(|(t, _)| t == target)
            .map(|(_, peer)| peer.clone())
    }
}

impl tower::Service<Endpoint> for MockTransport {
    type Response = MockStream;
    type Error = io::Error;
    type Future = Ready<io::Result<MockStream>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, endpoint: Endpoint) -> Self::Future {
        let mut inner = self.inner.lock();
        if inner.refuse > 0 {
            inner.refuse -= 1;
            trace!(target = %endpoint.target(), "mock connection refused");
            return ready(Err(io::ErrorKind::ConnectionRefused.into()));
        }

        let (stream, peer) = MockStream::pair();
        trace!(target = %endpoint.target(), id = %stream.id(), "mock connection established");
        inner.peers.push((endpoint.target().clone(), peer));
        ready(Ok(stream))
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;
    use tower::ServiceExt;

    use super::*;
    use crate::client::conn::transport::Transport;
    use crate::client::pool::Scheme;

    assert_impl_all!(MockTransport: Transport, Clone, Send, Sync);

    #[tokio::test]
    async fn records_peers() {
        let transport = MockTransport::new();
        let target = Target::new(Scheme::Http, "10.0.0.1", 80);

        transport.refuse_next(1);
        let endpoint = Endpoint::new(target.clone(), Vec::new());
        assert!(transport.clone().oneshot(endpoint.clone()).await.is_err());

        let stream = transport.clone().oneshot(endpoint).await.unwrap();
        assert_eq!(transport.connections(), 1);
        assert_eq!(transport.latest(&target).unwrap().id(), stream.id());
        assert_eq!(transport.peer(0).unwrap().id(), stream.id());
    }
}
