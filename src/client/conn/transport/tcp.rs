//! TCP transport for client connections.
//!
//! [`TcpTransport`] is a [`tower::Service`] which connects to the resolved addresses of an
//! [`Endpoint`] one after another until one accepts. The resulting `tokio::net::TcpStream`
//! is driven without blocking through [`ByteStream`], using the tokio reactor for readiness.
//!
//! The TCP transport only speaks plain text. It refuses `https` targets rather than
//! sending their requests in the clear; plug in a TLS transport to reach them.

use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace, warn, Instrument};

use super::Endpoint;
use crate::client::conn::stream::{ByteStream, Interest, Progress};
use crate::client::pool::Scheme;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpConfig {
    /// The timeout for connecting to a single remote address.
    pub connect_timeout: Option<Duration>,

    /// TCP keep-alive probe interval for established connections.
    pub keep_alive: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive: Some(Duration::from_secs(90)),
            nodelay: true,
        }
    }
}

/// A TCP transport for client connections.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpConfig>,
}

impl TcpTransport {
    /// Create a new `TcpTransport` with the given configuration.
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP transport.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

impl tower::Service<Endpoint> for TcpTransport {
    type Response = TcpStream;
    type Error = io::Error;
    type Future = BoxFuture<'static, TcpStream>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, endpoint: Endpoint) -> Self::Future {
        let config = self.config.clone();
        let span = tracing::trace_span!("tcp", target = %endpoint.target());

        Box::pin(
            async move {
                if endpoint.target().scheme() == Scheme::Https {
                    warn!("refusing to connect to an https target without tls");
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("tls is required for {}", endpoint.target()),
                    ));
                }

                let mut last_error = None;
                for addr in endpoint.addrs() {
                    match connect(*addr, &config).await {
                        Ok(stream) => {
                            trace!(peer.addr = %addr, "tcp connected");
                            return Ok(stream);
                        }
                        Err(error) => {
                            debug!(peer.addr = %addr, "tcp connect failed: {error}");
                            last_error = Some(error);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no addresses for {}", endpoint.target()),
                    )
                }))
            }
            .instrument(span),
        )
    }
}

async fn connect(addr: SocketAddr, config: &TcpConfig) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    if let Some(interval) = config.keep_alive {
        if let Err(error) = socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval)) {
            warn!("tcp set_keepalive error: {}", error);
        }
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    let connecting = socket.connect(addr);
    let stream = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??,
        None => connecting.await?,
    };

    if let Err(error) = stream.set_nodelay(config.nodelay) {
        warn!("tcp set_nodelay error: {}", error);
    }
    Ok(stream)
}

fn progress(result: io::Result<usize>, blocked: Interest) -> io::Result<Progress> {
    match result {
        Ok(n) => Ok(Progress::Ready(n)),
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(Progress::Blocked(blocked)),
        Err(error) => Err(error),
    }
}

impl ByteStream for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        progress(TcpStream::try_read(self, buf), Interest::READ)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Progress> {
        progress(TcpStream::try_write(self, buf), Interest::WRITE)
    }

    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if interest.read {
            if let Poll::Ready(outcome) = self.poll_read_ready(cx) {
                return Poll::Ready(outcome);
            }
        }
        if interest.write {
            if let Poll::Ready(outcome) = self.poll_write_ready(cx) {
                return Poll::Ready(outcome);
            }
        }
        Poll::Pending
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match SockRef::from(&*self).shutdown(Shutdown::Both) {
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            outcome => outcome,
        }
    }
}
