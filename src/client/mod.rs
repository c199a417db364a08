//! An embeddable, pipelining HTTP/1.1 client.
//!
//! The [`Client`] never spawns work of its own. Callers submit requests under an
//! execution context ([`ContextId`]) and then drive that context with [`Client::pump`],
//! which moves bytes on every connection bound to the context and hands out responses as
//! they complete. [`Client::process`] does both for a single request.
//!
//! ```no_run
//! # async fn run() -> Result<(), hyperpipe::client::Error> {
//! use hyperpipe::client::{Client, ContextId};
//! use hyperpipe::message::Request;
//!
//! let client = Client::new();
//! let ctx = ContextId::new();
//! let response = client
//!     .process(ctx, Request::get("http://example.com/".parse().unwrap()))
//!     .await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! There are three levels of API in this module:
//!
//! 1. The [`Client`], which owns a connection pool and applies retries, redirects and
//!    authentication to every request.
//! 2. The [connection][self::conn] API, which exposes the [`ByteStream`][conn::ByteStream] and
//!    [`Transport`] seams used to establish and drive streams.
//! 3. The [`message`][crate::message] types, which frame requests and responses on the
//!    wire.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_util::future::join_all;
use http::header;
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use self::conn::{dns, Endpoint, Tick};
use self::lifecycle::{Disposition, Exchange, Finished, Lifecycle};
use self::pool::{ConnRef, Pool};
use crate::body::BodySource;
use crate::message::{plan_request, Request, Response};

pub mod auth;
mod builder;
pub mod conn;
mod error;
mod lifecycle;
pub mod pool;

pub use self::auth::{BasicCredentials, Challenge, CredentialStore, Credentials};
pub use self::builder::Builder;
pub use self::conn::{TcpConfig, TcpTransport, Transport};
pub use self::error::Error;
pub use self::lifecycle::{Backoff, MAX_REDIRECTS};
pub use self::pool::{Config, ContextId, Target};

/// An HTTP/1.1 client.
///
/// Clones share one connection pool.
pub struct Client<T: Transport = TcpTransport> {
    transport: T,
    pool: Pool<T::Stream>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<T: Transport + fmt::Debug> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// A client with the default configuration, connecting over TCP.
    pub fn new() -> Self {
        Builder::default().build()
    }

    /// Create a builder to configure a client.
    pub fn builder() -> Builder {
        Builder::new()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Client<T>
where
    T: Transport,
{
    pub(crate) fn from_parts(transport: T, pool: Pool<T::Stream>) -> Self {
        Self { transport, pool }
    }

    /// A copy of the configuration this client was built with.
    pub fn config(&self) -> Config {
        self.pool.config()
    }

    /// Queue a request on a connection bound to `ctx`.
    ///
    /// Waits up to `timeout` for the pool to have room: a zero timeout never waits and
    /// `None` waits until a connection is released. Nothing is sent until `ctx` is
    /// pumped.
    ///
    /// Requests which can never be sent fail here with [`Error::Request`] or
    /// [`Error::Target`], and are not retried.
    pub async fn submit(
        &self,
        ctx: ContextId,
        request: impl Into<Request>,
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture, Error> {
        let config = self.pool.config();
        let mut request = request.into();
        let target = Target::try_from(request.uri())?;

        if let Some(user_agent) = config.user_agent {
            if !request.headers().contains_key(header::USER_AGENT) {
                request.headers_mut().insert(header::USER_AGENT, user_agent);
            }
        }

        let mut headers = request.headers().clone();
        plan_request(
            request.method(),
            &mut headers,
            request.body().size_hint(),
            None,
        )?;

        let lifecycle = Lifecycle::new(
            request.retry_limit().unwrap_or(config.max_retries),
            config.min_retry_base,
            request.follows_redirects(),
        );
        let (tx, rx) = oneshot::channel();
        let mut exchange = Exchange::new(request, lifecycle, tx);
        self.pool
            .with_credentials(|store| lifecycle::preemptive_credentials(&mut exchange, store));

        self.pool.enqueue(ctx, target, exchange, timeout).await?;
        Ok(ResponseFuture::new(rx))
    }

    /// Drive every connection bound to `ctx`.
    ///
    /// Returns once at least one response was delivered, once `timeout` elapses, or once
    /// the context has nothing left to do. A zero timeout makes a single pass without
    /// waiting, except for connections being established.
    ///
    /// Returns whether the context still has requests outstanding.
    pub async fn pump(&self, ctx: ContextId, timeout: Option<Duration>) -> bool {
        let give_up = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let released = self.pool.released();
            tokio::pin!(released);
            released.as_mut().enable();

            self.pool.admit_deferred(ctx);

            let now = Instant::now();
            let connections = self.pool.connections(ctx);
            let mut connect = Vec::new();
            let mut idle = Vec::new();
            let mut finished = Vec::new();
            let mut wake_at = give_up;

            for conn in &connections {
                let mut guard = conn.lock();
                let tick = guard.tick(now);
                finished.extend(guard.take_finished());
                drop(guard);

                match tick {
                    Tick::Idle => idle.push(conn.clone()),
                    Tick::Connect => connect.push(conn.clone()),
                    Tick::Wait {
                        deadline: Some(deadline),
                        ..
                    } => wake_at = Some(wake_at.map_or(deadline, |at| at.min(deadline))),
                    Tick::Wait { deadline: None, .. } => {}
                }
            }

            let (delivered, resent) = self.complete(ctx, finished);
            for conn in &idle {
                self.pool.deactivate(ctx, conn);
            }

            if !connect.is_empty() {
                join_all(connect.into_iter().map(|conn| self.establish(conn))).await;
                continue;
            }

            let active = self.pool.has_work(ctx);
            if !active || delivered {
                return active;
            }
            if resent {
                continue;
            }
            if give_up.is_some_and(|at| at <= now) {
                return true;
            }

            let wake = std::future::poll_fn(|cx| {
                for conn in &connections {
                    if conn.lock().poll_wake(cx).is_ready() {
                        return Poll::Ready(());
                    }
                }
                Poll::Pending
            });
            let event = async {
                tokio::select! {
                    _ = wake => trace!(%ctx, "connection ready"),
                    _ = released => trace!(%ctx, "connection released"),
                }
            };

            match wake_at {
                Some(at) => {
                    if tokio::time::timeout_at(at, event).await.is_err() {
                        trace!(%ctx, "pump deadline reached");
                    }
                }
                None => event.await,
            }
        }
    }

    /// Submit a request and pump `ctx` until its response arrives.
    pub async fn process(
        &self,
        ctx: ContextId,
        request: impl Into<Request>,
    ) -> Result<Response, Error> {
        let mut response = self.submit(ctx, request, None).await?;
        loop {
            if let Some(outcome) = response.try_outcome() {
                return outcome;
            }
            if !self.pump(ctx, None).await {
                return response.await;
            }
        }
    }

    /// Stop accepting requests and tear down every connection.
    ///
    /// Requests still outstanding fail with [`Error::Closed`] when their context is next
    /// pumped. Calling this more than once does nothing.
    pub fn shutdown(&self) {
        self.pool.close();
    }

    /// Close idle connections unused for at least `max_inactive`. Returns how many.
    pub fn idle_cleanup(&self, max_inactive: Duration) -> usize {
        self.pool.idle_cleanup(max_inactive)
    }

    /// Kill active connections unused for at least `max_inactive`. Returns how many.
    ///
    /// This reclaims connections whose context stopped pumping.
    pub fn active_cleanup(&self, max_inactive: Duration) -> usize {
        self.pool.active_cleanup(max_inactive)
    }

    /// Forget every resolved address.
    pub fn flush_dns(&self) {
        self.pool.flush_dns()
    }

    /// Connections currently bound to a context.
    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Connections currently bound to `ctx`.
    pub fn context_active_count(&self, ctx: ContextId) -> usize {
        self.pool.context_active_count(ctx)
    }

    /// Open connections waiting to be reused.
    pub fn idle_count(&self) -> usize {
        self.pool.idle_count()
    }

    /// Apply the completion policy. Returns whether anything was delivered and whether
    /// anything was queued again.
    fn complete(&self, ctx: ContextId, finished: Vec<Finished>) -> (bool, bool) {
        let mut delivered = false;
        let mut resent = false;
        for finished in finished {
            match self
                .pool
                .with_credentials(|store| lifecycle::complete(finished, store))
            {
                Disposition::Deliver(exchange, outcome) => {
                    exchange.deliver(outcome);
                    delivered = true;
                }
                Disposition::Resend(exchange) => {
                    let target = match Target::try_from(exchange.request.uri()) {
                        Ok(target) => target,
                        Err(error) => {
                            exchange.fail(error.into());
                            delivered = true;
                            continue;
                        }
                    };
                    match self.pool.try_enqueue(ctx, &target, exchange) {
                        Ok(()) => resent = true,
                        Err((Error::Busy, exchange)) => self.pool.defer(ctx, target, exchange),
                        Err((error, exchange)) => {
                            exchange.fail(error);
                            delivered = true;
                        }
                    }
                }
            }
        }
        (delivered, resent)
    }

    async fn establish(&self, conn: ConnRef<T::Stream>) {
        let target = conn.lock().target().clone();
        let addrs = match self.pool.cached_addrs(&target) {
            Some(addrs) => addrs,
            None => match dns::resolve(&target).await {
                Ok(addrs) if !addrs.is_empty() => {
                    self.pool.cache_addrs(&target, addrs.clone());
                    addrs
                }
                Ok(_) => {
                    let error = std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no addresses found for host",
                    );
                    conn.lock().connect_failed(error.into(), Instant::now());
                    return;
                }
                Err(error) => {
                    conn.lock().connect_failed(error.into(), Instant::now());
                    return;
                }
            },
        };

        trace!(%target, addrs = addrs.len(), "establishing stream");
        match self.transport.connect(Endpoint::new(target, addrs)).await {
            Ok(stream) => conn.lock().attach(stream, Instant::now()),
            Err(error) => {
                debug!(%error, "transport failed");
                conn.lock().connect_failed(error.into(), Instant::now());
            }
        }
    }
}

/// Resolves to the outcome of a submitted request.
///
/// The request is only advanced while its context is pumped. Dropping the future
/// abandons the request; it is skipped if it has not yet been sent.
#[pin_project]
#[derive(Debug)]
pub struct ResponseFuture {
    #[pin]
    rx: oneshot::Receiver<Result<Response, Error>>,
}

impl ResponseFuture {
    fn new(rx: oneshot::Receiver<Result<Response, Error>>) -> Self {
        Self { rx }
    }

    /// The outcome, if it has already been delivered.
    pub fn try_outcome(&mut self) -> Option<Result<Response, Error>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().rx.poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(_) => Poll::Ready(Err(Error::Closed)),
        }
    }
}
