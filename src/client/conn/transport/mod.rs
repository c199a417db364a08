//! Transports establish byte streams to remote servers.
//!
//! A transport is a [`tower::Service`] which accepts an [`Endpoint`] (a target plus the
//! addresses it resolved to) and returns a connected [`ByteStream`]. Establishing a stream
//! is the one coarse step a pump awaits: name resolution happens before the transport is
//! called, and a TLS transport would perform its handshake inside `call`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tower::util::Oneshot;
use tower::ServiceExt;

use super::stream::ByteStream;
use crate::client::pool::Target;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod tcp;

/// A target together with the socket addresses it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    target: Target,
    addrs: Vec<SocketAddr>,
}

impl Endpoint {
    /// Create an endpoint for a resolved target.
    pub fn new(target: Target, addrs: Vec<SocketAddr>) -> Self {
        Self { target, addrs }
    }

    /// The target being connected to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Addresses to try, in order.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }
}

/// A service which establishes streams to endpoints.
///
/// This trait is implemented for every suitable [`tower::Service`] and should not be
/// implemented directly.
pub trait Transport: Clone + Send + Sync + 'static {
    /// The stream produced by this transport.
    type Stream: ByteStream;

    /// Future which resolves to a connected stream.
    type Future: Future<Output = io::Result<Self::Stream>> + Send + 'static;

    /// Establish a stream to `endpoint`.
    fn connect(&self, endpoint: Endpoint) -> Self::Future;
}

impl<T, S> Transport for T
where
    T: tower::Service<Endpoint, Response = S, Error = io::Error> + Clone + Send + Sync + 'static,
    T::Future: Send + 'static,
    S: ByteStream,
{
    type Stream = S;
    type Future = Oneshot<T, Endpoint>;

    fn connect(&self, endpoint: Endpoint) -> Self::Future {
        self.clone().oneshot(endpoint)
    }
}
