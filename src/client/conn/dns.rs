//! DNS resolution utilities.
//!
//! Names are resolved with `getaddrinfo` on tokio's blocking pool. Results are kept in a
//! [`DnsCache`], which lives inside the connection pool and is guarded by the pool lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::client::pool::Target;

/// Resolve a target to its socket addresses on the blocking pool.
pub(crate) fn resolve(target: &Target) -> JoinHandleFuture<Vec<SocketAddr>> {
    let span = tracing::Span::current();
    let host: Box<str> = target
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .into();
    let port = target.port();
    JoinHandleFuture {
        handle: tokio::task::spawn_blocking(move || {
            tracing::trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
                tracing::trace!("dns resolution starting");
                (host.as_ref(), port)
                    .to_socket_addrs()
                    .map(|addrs| addrs.collect())
            })
        }),
    }
}

/// Future returned by [`resolve`], which aborts the lookup when dropped.
#[pin_project(PinnedDrop)]
pub(crate) struct JoinHandleFuture<Addr> {
    #[pin]
    handle: JoinHandle<Result<Addr, io::Error>>,
}

impl<Addr> fmt::Debug for JoinHandleFuture<Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandleFuture").finish()
    }
}

impl<Addr> Future for JoinHandleFuture<Addr> {
    type Output = Result<Addr, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(Ok(addrs)) => Poll::Ready(Ok(addrs)),
            Ok(Err(error)) => Poll::Ready(Err(error)),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl<Addr> PinnedDrop for JoinHandleFuture<Addr> {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

/// Resolved addresses, keyed by host and port.
#[derive(Debug, Default)]
pub(crate) struct DnsCache {
    entries: HashMap<(Box<str>, u16), Vec<SocketAddr>>,
}

impl DnsCache {
    pub(crate) fn get(&self, target: &Target) -> Option<Vec<SocketAddr>> {
        self.entries
            .get(&(target.host().into(), target.port()))
            .cloned()
    }

    pub(crate) fn insert(&mut self, target: &Target, addrs: Vec<SocketAddr>) {
        if addrs.is_empty() {
            return;
        }
        trace!(%target, count = addrs.len(), "caching resolved addresses");
        self.entries
            .insert((target.host().into(), target.port()), addrs);
    }

    pub(crate) fn flush(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pool::Scheme;

    #[tokio::test]
    async fn resolve_ip_literal() {
        let target = Target::new(Scheme::Http, "127.0.0.1", 8080);
        let addrs = resolve(&target).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);

        let target = Target::new(Scheme::Http, "[::1]", 8080);
        let addrs = resolve(&target).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn cache_round_trip() {
        let mut cache = DnsCache::default();
        let target = Target::new(Scheme::Http, "example.com", 80);
        assert!(cache.get(&target).is_none());

        cache.insert(&target, Vec::new());
        assert_eq!(cache.len(), 0);

        let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
        cache.insert(&target, vec![addr]);
        assert_eq!(cache.get(&target), Some(vec![addr]));
        assert!(cache
            .get(&Target::new(Scheme::Http, "example.com", 8080))
            .is_none());

        cache.flush();
        assert_eq!(cache.len(), 0);
    }
}
