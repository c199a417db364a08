//! Connection Pooling for Clients
//!
//! The pool owns every connection a client has open. Connections are indexed by
//! (execution context, target) while they are active, and by target alone while they sit
//! idle waiting to be reused. The total number of connections, active or idle, never
//! exceeds [`Config::max_connections`].
//!
//! Admission happens in [`Pool::enqueue`]: a request is placed on the connection its
//! context already uses for the target, on an idle connection, or on a new connection if
//! the budget allows. When the pool is full the oldest idle connection is closed to make
//! room, and failing that the caller waits until a connection is released.
//!
//! The pool lock also guards the DNS cache and the credential store. When a connection
//! lock is needed as well, the pool lock is always taken first.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use http::header::HeaderValue;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

mod idle;
mod key;

use self::idle::IdleConnections;
pub use self::key::{ContextId, Scheme, Target, TargetError};

use super::auth::CredentialStore;
use super::conn::dns::DnsCache;
use super::conn::{ByteStream, Connection, Settings};
use super::lifecycle::{self, Exchange};
use super::Error;

/// A connection shared between the pool and the pump of its context.
pub(crate) type ConnRef<S> = Arc<Mutex<Connection<S>>>;

/// Client configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Upper bound on open connections, active and idle together.
    pub max_connections: usize,

    /// A connection with requests outstanding which neither reads nor writes for this
    /// long is considered dead. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Base delay between retries of a failed request.
    pub min_retry_base: Duration,

    /// How often a request is retried after its connection fails.
    pub max_retries: u32,

    /// `User-Agent` added to requests which do not carry one.
    pub user_agent: Option<HeaderValue>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 100,
            timeout: None,
            min_retry_base: Duration::from_secs(5),
            max_retries: 3,
            user_agent: Some(lifecycle::default_user_agent()),
        }
    }
}

struct PoolInner<S> {
    config: Config,
    settings: Settings,
    active: HashMap<(ContextId, Target), ConnRef<S>>,
    idle: HashMap<Target, IdleConnections<ConnRef<S>>>,

    /// Killed connections whose requests have not yet been failed by their context.
    orphans: HashMap<ContextId, Vec<ConnRef<S>>>,

    /// Resubmissions which found the pool full, admitted on the context's next pump.
    deferred: HashMap<ContextId, VecDeque<(Target, Exchange)>>,

    dns: DnsCache,
    credentials: Box<dyn CredentialStore>,
    closing: bool,
}

impl<S> PoolInner<S>
where
    S: ByteStream,
{
    fn total(&self) -> usize {
        self.active.len()
            + self.idle.values().map(IdleConnections::len).sum::<usize>()
            + self.orphans.values().map(Vec::len).sum::<usize>()
    }

    fn checkout(&mut self, ctx: ContextId, target: &Target, now: Instant) -> Option<ConnRef<S>> {
        let key = (ctx, target.clone());
        if let Some(conn) = self.active.get(&key) {
            trace!("reusing active connection");
            return Some(conn.clone());
        }

        if let Some(conn) = self.pop_idle(target) {
            debug!(conn = %conn.lock().id(), "reusing idle connection");
            self.active.insert(key, conn.clone());
            return Some(conn);
        }

        if self.total() >= self.config.max_connections {
            self.evict_oldest_idle(now);
        }

        if self.total() < self.config.max_connections {
            let conn = Arc::new(Mutex::new(Connection::new(
                target.clone(),
                self.settings,
                now,
            )));
            debug!(conn = %conn.lock().id(), "creating connection");
            self.active.insert(key, conn.clone());
            return Some(conn);
        }

        None
    }

    fn pop_idle(&mut self, target: &Target) -> Option<ConnRef<S>> {
        let idle = self.idle.get_mut(target)?;
        let conn = idle.pop(|conn| conn.lock().is_reusable());
        if idle.is_empty() {
            self.idle.remove(target);
        }
        conn
    }

    fn evict_oldest_idle(&mut self, now: Instant) {
        let Some(target) = self
            .idle
            .iter()
            .filter_map(|(target, idle)| idle.oldest().map(|at| (at, target)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, target)| target.clone())
        else {
            return;
        };

        if let Some(idle) = self.idle.get_mut(&target) {
            if let Some(conn) = idle.pop_oldest() {
                let mut conn = conn.lock();
                debug!(conn = %conn.id(), %target, "evicting idle connection");
                conn.close(None, now);
            }
            if idle.is_empty() {
                self.idle.remove(&target);
            }
        }
    }

    fn orphan(&mut self, ctx: ContextId, conn: ConnRef<S>) {
        conn.lock().kill();
        self.orphans.entry(ctx).or_default().push(conn);
    }
}

/// The connection pool of a client.
pub(crate) struct Pool<S> {
    inner: Arc<Mutex<PoolInner<S>>>,
    admission: Arc<Notify>,
    released: Arc<Notify>,
}

impl<S> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            admission: self.admission.clone(),
            released: self.released.clone(),
        }
    }
}

impl<S> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl<S> Pool<S>
where
    S: ByteStream,
{
    pub(crate) fn new(config: Config, credentials: Box<dyn CredentialStore>) -> Self {
        let settings = Settings::new(config.timeout);
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                config,
                settings,
                active: HashMap::new(),
                idle: HashMap::new(),
                orphans: HashMap::new(),
                deferred: HashMap::new(),
                dns: DnsCache::default(),
                credentials,
                closing: false,
            })),
            admission: Arc::new(Notify::new()),
            released: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn config(&self) -> Config {
        self.inner.lock().config.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakPool<S> {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
            admission: self.admission.clone(),
            released: self.released.clone(),
        }
    }

    /// Place a request on a connection, waiting up to `timeout` for one to be released.
    ///
    /// A zero timeout never waits, and `None` waits as long as it takes.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%ctx, %target), level = "debug"))]
    pub(crate) async fn enqueue(
        &self,
        ctx: ContextId,
        target: Target,
        exchange: Exchange,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut exchange = exchange;
        loop {
            let notified = self.admission.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_enqueue(ctx, &target, exchange) {
                Ok(()) => return Ok(()),
                Err((Error::Busy, returned)) => exchange = returned,
                Err((error, _)) => return Err(error),
            }

            if timeout == Some(Duration::ZERO) {
                trace!("pool is full");
                return Err(Error::Busy);
            }

            trace!("waiting for a connection to be released");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!("timed out waiting for a connection");
                        return Err(Error::Busy);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Place a request on a connection without waiting.
    ///
    /// The exchange is handed back when it cannot be admitted.
    pub(crate) fn try_enqueue(
        &self,
        ctx: ContextId,
        target: &Target,
        exchange: Exchange,
    ) -> Result<(), (Error, Exchange)> {
        let mut inner = self.inner.lock();
        if inner.closing {
            return Err((Error::Closed, exchange));
        }
        match inner.checkout(ctx, target, Instant::now()) {
            Some(conn) => {
                conn.lock().enqueue(exchange);
                Ok(())
            }
            None => Err((Error::Busy, exchange)),
        }
    }

    /// Resolves once a connection is released.
    ///
    /// Pumps wait here. Submitters waiting for admission are woken separately, so a pump
    /// never consumes their wakeup.
    pub(crate) fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Hold a resubmission until the context's next pump.
    pub(crate) fn defer(&self, ctx: ContextId, target: Target, exchange: Exchange) {
        let mut inner = self.inner.lock();
        if inner.closing {
            drop(inner);
            exchange.fail(Error::Closed);
            return;
        }
        trace!(%ctx, %target, "deferring resubmission");
        inner
            .deferred
            .entry(ctx)
            .or_default()
            .push_back((target, exchange));
    }

    /// Admit as many deferred resubmissions of `ctx` as the pool has room for.
    pub(crate) fn admit_deferred(&self, ctx: ContextId) {
        let Some(mut deferred) = self.inner.lock().deferred.remove(&ctx) else {
            return;
        };
        while let Some((target, exchange)) = deferred.pop_front() {
            match self.try_enqueue(ctx, &target, exchange) {
                Ok(()) => {}
                Err((Error::Busy, exchange)) => {
                    deferred.push_front((target, exchange));
                    break;
                }
                Err((error, exchange)) => exchange.fail(error),
            }
        }
        if !deferred.is_empty() {
            let mut inner = self.inner.lock();
            let queue = inner.deferred.entry(ctx).or_default();
            for entry in deferred.into_iter().rev() {
                queue.push_front(entry);
            }
        }
    }

    /// Whether `ctx` has any connection or deferred request.
    pub(crate) fn has_work(&self, ctx: ContextId) -> bool {
        let inner = self.inner.lock();
        inner.active.keys().any(|(owner, _)| *owner == ctx)
            || inner.orphans.contains_key(&ctx)
            || inner.deferred.contains_key(&ctx)
    }

    /// Every connection `ctx` must pump.
    pub(crate) fn connections(&self, ctx: ContextId) -> Vec<ConnRef<S>> {
        let inner = self.inner.lock();
        inner
            .active
            .iter()
            .filter(|((owner, _), _)| *owner == ctx)
            .map(|(_, conn)| conn.clone())
            .chain(inner.orphans.get(&ctx).into_iter().flatten().cloned())
            .collect()
    }

    /// Release a connection `ctx` has no more requests for.
    ///
    /// Open connections go back to the idle pool, everything else is dropped. Either way
    /// one waiter is woken.
    pub(crate) fn deactivate(&self, ctx: ContextId, conn: &ConnRef<S>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (target, reusable) = {
            let conn = conn.lock();
            if !conn.is_empty() {
                return;
            }
            (conn.target().clone(), conn.is_reusable())
        };

        let key = (ctx, target);
        if inner.active.get(&key).is_some_and(|active| Arc::ptr_eq(active, conn)) {
            inner.active.remove(&key);
        } else if let Some(orphans) = inner.orphans.get_mut(&ctx) {
            orphans.retain(|orphan| !Arc::ptr_eq(orphan, conn));
            if orphans.is_empty() {
                inner.orphans.remove(&ctx);
            }
        } else {
            return;
        }

        let (_, target) = key;
        if reusable && !inner.closing {
            trace!(conn = %conn.lock().id(), %target, "connection returned to idle pool");
            inner.idle.entry(target).or_default().push(conn.clone(), now);
        } else {
            trace!(conn = %conn.lock().id(), %target, "connection released");
        }
        drop(inner);
        self.wake_released();
    }

    /// Wake one submitter waiting for admission, and every pump.
    fn wake_released(&self) {
        self.admission.notify_one();
        self.released.notify_waiters();
    }

    /// Stop admitting requests, kill active connections and close idle ones.
    pub(crate) fn close(&self) {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.closing {
            return;
        }
        inner.closing = true;
        debug!(
            active = inner.active.len(),
            idle = inner.idle.len(),
            "closing connection pool"
        );

        for ((ctx, _), conn) in std::mem::take(&mut inner.active) {
            inner.orphan(ctx, conn);
        }
        for (_, mut idle) in inner.idle.drain() {
            for conn in idle.drain() {
                conn.lock().close(None, now);
            }
        }
        let deferred = std::mem::take(&mut inner.deferred);
        drop(guard);

        for (_, exchange) in deferred.into_values().flatten() {
            exchange.fail(Error::Closed);
        }
        self.admission.notify_waiters();
        self.released.notify_waiters();
    }

    /// Close idle connections unused for at least `max_inactive`. Returns how many.
    pub(crate) fn idle_cleanup(&self, max_inactive: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut closed = 0;
        for (target, idle) in inner.idle.iter_mut() {
            for conn in idle.expire(now, max_inactive) {
                let mut conn = conn.lock();
                trace!(conn = %conn.id(), %target, "closing inactive idle connection");
                conn.close(None, now);
                closed += 1;
            }
        }
        inner.idle.retain(|_, idle| !idle.is_empty());
        drop(inner);

        if closed > 0 {
            debug!(closed, "idle connections closed");
            self.admission.notify_waiters();
            self.released.notify_waiters();
        }
        closed
    }

    /// Kill active connections unused for at least `max_inactive`. Returns how many.
    pub(crate) fn active_cleanup(&self, max_inactive: Duration) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stale: Vec<(ContextId, Target)> = inner
            .active
            .iter()
            .filter(|(_, conn)| now.saturating_duration_since(conn.lock().last_active()) >= max_inactive)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            if let Some(conn) = inner.active.remove(key) {
                debug!(conn = %conn.lock().id(), ctx = %key.0, target = %key.1, "killing abandoned connection");
                inner.orphan(key.0, conn);
            }
        }
        stale.len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub(crate) fn context_active_count(&self, ctx: ContextId) -> usize {
        self.inner
            .lock()
            .active
            .keys()
            .filter(|(owner, _)| *owner == ctx)
            .count()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.inner
            .lock()
            .idle
            .values()
            .map(IdleConnections::len)
            .sum()
    }

    pub(crate) fn cached_addrs(&self, target: &Target) -> Option<Vec<SocketAddr>> {
        self.inner.lock().dns.get(target)
    }

    pub(crate) fn cache_addrs(&self, target: &Target, addrs: Vec<SocketAddr>) {
        self.inner.lock().dns.insert(target, addrs);
    }

    pub(crate) fn flush_dns(&self) {
        let mut inner = self.inner.lock();
        trace!(entries = inner.dns.len(), "flushing dns cache");
        inner.dns.flush();
    }

    /// Run `f` with the credential store.
    pub(crate) fn with_credentials<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut dyn CredentialStore) -> R,
    {
        f(self.inner.lock().credentials.as_mut())
    }
}

/// A pool reference which does not keep the pool alive.
pub(crate) struct WeakPool<S> {
    inner: Weak<Mutex<PoolInner<S>>>,
    admission: Arc<Notify>,
    released: Arc<Notify>,
}

impl<S> fmt::Debug for WeakPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakPool").finish_non_exhaustive()
    }
}

impl<S> WeakPool<S> {
    pub(crate) fn upgrade(&self) -> Option<Pool<S>> {
        Some(Pool {
            inner: self.inner.upgrade()?,
            admission: self.admission.clone(),
            released: self.released.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use http::Uri;
    use static_assertions::assert_impl_all;
    use tokio::sync::oneshot;

    use super::*;
    use crate::client::auth::BasicCredentials;
    use crate::client::conn::stream::mock::MockStream;
    use crate::client::conn::Tick;
    use crate::client::lifecycle::Lifecycle;
    use crate::message::{Request, Response};

    assert_impl_all!(Pool<MockStream>: Clone, Send, Sync);
    assert_impl_all!(Config: Clone, Send, Sync);

    type Outcome = oneshot::Receiver<Result<Response, Error>>;

    fn pool(max_connections: usize) -> Pool<MockStream> {
        let config = Config {
            max_connections,
            ..Config::default()
        };
        Pool::new(config, Box::new(BasicCredentials::new()))
    }

    fn exchange(uri: &'static str) -> (Target, Exchange, Outcome) {
        let uri = Uri::from_static(uri);
        let target = Target::try_from(&uri).unwrap();
        let (tx, rx) = oneshot::channel();
        let lifecycle = Lifecycle::new(3, Duration::from_secs(5), true);
        (target, Exchange::new(Request::get(uri), lifecycle, tx), rx)
    }

    /// Drain the connection of abandoned requests and give it a stream, so that it can
    /// be returned to the idle pool.
    fn make_idle(pool: &Pool<MockStream>, ctx: ContextId) -> crate::client::conn::stream::mock::MockPeer {
        let conn = pool.connections(ctx).remove(0);
        let peer = {
            let mut conn = conn.lock();
            let now = Instant::now();
            assert_eq!(conn.tick(now), Tick::Idle);
            let (stream, peer) = MockStream::pair();
            conn.attach(stream, now);
            peer
        };
        pool.deactivate(ctx, &conn);
        peer
    }

    #[tokio::test]
    async fn busy_until_released() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = pool(1);
        let (ctx_a, ctx_b) = (ContextId::new(), ContextId::new());

        let (target_a, ex, rx_a) = exchange("http://a.example/");
        pool.enqueue(ctx_a, target_a, ex, Some(Duration::ZERO))
            .await
            .unwrap();

        let (target_b, ex, _rx) = exchange("http://b.example/");
        let busy = pool
            .enqueue(ctx_b, target_b.clone(), ex, Some(Duration::ZERO))
            .await;
        assert!(matches!(busy, Err(Error::Busy)));

        let (_, ex, _rx) = exchange("http://b.example/");
        let busy = pool
            .enqueue(ctx_b, target_b.clone(), ex, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(busy, Err(Error::Busy)));

        let waiter = {
            let pool = pool.clone();
            let (_, ex, rx) = exchange("http://b.example/");
            tokio::spawn(async move {
                pool.enqueue(ctx_b, target_b, ex, None).await.map(|()| rx)
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(rx_a);
        let conn = pool.connections(ctx_a).remove(0);
        assert_eq!(conn.lock().tick(Instant::now()), Tick::Idle);
        pool.deactivate(ctx_a, &conn);

        let _rx = waiter.await.unwrap().unwrap();
        assert_eq!(pool.context_active_count(ctx_a), 0);
        assert_eq!(pool.context_active_count(ctx_b), 1);
    }

    #[tokio::test]
    async fn waiting_pumps_leave_admission_to_submitters() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = pool(2);
        let (ctx_a, ctx_b, ctx_c) = (ContextId::new(), ContextId::new(), ContextId::new());

        let (target_a, ex, rx_a) = exchange("http://a.example/");
        pool.enqueue(ctx_a, target_a, ex, Some(Duration::ZERO))
            .await
            .unwrap();
        let (target_c, ex, _rx_c) = exchange("http://c.example/");
        pool.enqueue(ctx_c, target_c, ex, Some(Duration::ZERO))
            .await
            .unwrap();

        let pumping = {
            let pool = pool.clone();
            tokio::spawn(async move {
                loop {
                    pool.released().await;
                }
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let pool = pool.clone();
            let (target_b, ex, rx) = exchange("http://b.example/");
            tokio::spawn(async move {
                pool.enqueue(ctx_b, target_b, ex, None).await.map(|()| rx)
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(rx_a);
        make_idle(&pool, ctx_a);

        let _rx = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("submitter admitted after release")
            .unwrap()
            .unwrap();
        assert_eq!(pool.context_active_count(ctx_b), 1);
        assert_eq!(pool.context_active_count(ctx_c), 1);
        pumping.abort();
    }

    #[tokio::test]
    async fn same_context_shares_a_connection() {
        let pool = pool(4);
        let ctx = ContextId::new();
        for _ in 0..3 {
            let (target, ex, _rx) = exchange("http://a.example/");
            pool.enqueue(ctx, target, ex, Some(Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(pool.active_count(), 1);

        let other = ContextId::new();
        let (target, ex, _rx) = exchange("http://a.example/");
        pool.enqueue(other, target, ex, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(pool.active_count(), 2, "contexts never share a connection");
    }

    #[tokio::test]
    async fn idle_connection_is_reused() {
        let pool = pool(2);
        let (ctx_a, ctx_b) = (ContextId::new(), ContextId::new());

        let (target, ex, rx) = exchange("http://a.example/");
        pool.enqueue(ctx_a, target.clone(), ex, None).await.unwrap();
        let first = pool.connections(ctx_a).remove(0);
        drop(rx);
        make_idle(&pool, ctx_a);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);

        let (_, ex, _rx) = exchange("http://a.example/other");
        pool.enqueue(ctx_b, target, ex, None).await.unwrap();
        let second = pool.connections(ctx_b).remove(0);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn oldest_idle_connection_is_evicted() {
        let pool = pool(1);
        let ctx = ContextId::new();

        let (target, ex, rx) = exchange("http://a.example/");
        pool.enqueue(ctx, target, ex, None).await.unwrap();
        drop(rx);
        let peer = make_idle(&pool, ctx);

        let (target, ex, _rx) = exchange("http://b.example/");
        pool.enqueue(ctx, target, ex, Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(peer.is_shutdown());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn close_kills_and_refuses() {
        let pool = pool(2);
        let ctx = ContextId::new();
        let (target, ex, rx) = exchange("http://a.example/");
        pool.enqueue(ctx, target.clone(), ex, None).await.unwrap();

        let (_, deferred, deferred_rx) = exchange("http://a.example/again");
        pool.defer(ctx, target.clone(), deferred);

        pool.close();
        pool.close();
        assert!(matches!(deferred_rx.await, Ok(Err(Error::Closed))));
        assert_eq!(pool.active_count(), 0);

        let (_, ex, _rx) = exchange("http://a.example/late");
        let refused = pool.enqueue(ctx, target, ex, None).await;
        assert!(matches!(refused, Err(Error::Closed)));

        let conns = pool.connections(ctx);
        assert_eq!(conns.len(), 1, "killed connection waits for its context");
        let conn = conns[0].clone();
        assert!(conn.lock().is_killed());
        assert_eq!(conn.lock().tick(Instant::now()), Tick::Idle);
        for finished in conn.lock().take_finished() {
            finished.exchange.deliver(finished.outcome);
        }
        assert!(matches!(rx.await, Ok(Err(Error::Closed))));
        pool.deactivate(ctx, &conn);
        assert!(!pool.has_work(ctx));
    }

    #[tokio::test]
    async fn cleanup_sweeps() {
        let pool = pool(4);
        let ctx = ContextId::new();

        let (target, ex, rx) = exchange("http://a.example/");
        pool.enqueue(ctx, target, ex, None).await.unwrap();
        drop(rx);
        let peer = make_idle(&pool, ctx);
        assert_eq!(pool.idle_cleanup(Duration::from_secs(3600)), 0);
        assert_eq!(pool.idle_cleanup(Duration::ZERO), 1);
        assert!(peer.is_shutdown());

        let (target, ex, _rx) = exchange("http://b.example/");
        pool.enqueue(ctx, target.clone(), ex, None).await.unwrap();
        assert_eq!(pool.active_cleanup(Duration::ZERO), 1);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.has_work(ctx), "the orphan still needs a final pump");

        let (_, ex, _rx) = exchange("http://b.example/");
        pool.enqueue(ctx, target, ex, None).await.unwrap();
        assert_eq!(pool.connections(ctx).len(), 2);
    }

    #[tokio::test]
    async fn budget_is_never_exceeded() {
        let pool = pool(3);
        let mut receivers = Vec::new();
        for host in ["a", "b", "c", "d", "e"] {
            let ctx = ContextId::new();
            let uri: &'static str = Box::leak(format!("http://{host}.example/").into_boxed_str());
            let (target, ex, rx) = exchange(uri);
            let admitted = pool.enqueue(ctx, target, ex, Some(Duration::ZERO)).await;
            receivers.push(rx);
            assert_eq!(admitted.is_ok(), receivers.len() <= 3);
            assert!(pool.active_count() + pool.idle_count() <= 3);
        }
    }
}
