//! The HTTP/1.1 connection state machine.
//!
//! A [`Connection`] owns at most one byte stream and every request routed to it. It never
//! performs I/O on its own: the pump calls [`Connection::tick`], which moves as many bytes
//! as the stream accepts without blocking and then reports what it is waiting for.
//!
//! Requests are pipelined. Several may be in flight at once, and their responses are
//! matched to them strictly in the order they were sent. Idempotent requests may be
//! sent ahead of unfinished responses; any other request waits until the connection is
//! completely quiet.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use http::header::{self, HeaderValue};
use http::{StatusCode, Version};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::stream::{ByteStream, Interest, Progress};
use crate::body::{Body, BodySource, Pull};
use crate::client::lifecycle::{Exchange, Finished};
use crate::client::pool::Target;
use crate::client::Error;
use crate::message::{
    headers, plan_request, BodyEncoder, Framing, FramingError, RecvMode, RequestError, SendChunk,
    MAX_CHUNK, MAX_SPOOL,
};

const READ_SIZE: usize = 8192;

/// Largest status line or header block accepted from a server.
const MAX_HEAD: usize = 64 * 1024;

const DEFAULT_CONTINUE_WAIT: Duration = Duration::from_secs(60);

static IDENT: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a connection, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(IDENT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Timing parameters shared by every connection in a pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub(crate) timeout: Option<Duration>,
    pub(crate) continue_wait: Duration,
}

impl Settings {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            continue_wait: timeout.map_or(DEFAULT_CONTINUE_WAIT, |timeout| timeout / 6),
        }
    }
}

/// What a connection needs after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Tick again once the stream is ready for `interest`, a body wakes up, or the
    /// deadline passes.
    Wait {
        interest: Interest,
        deadline: Option<Instant>,
    },

    /// A request is ready to go but there is no stream.
    Connect,

    /// Nothing is queued or in flight.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ready,
    BodyWaiting { since: Instant },
    BodySending,
}

#[derive(Debug, Default)]
struct Wake {
    interest: Interest,
    deadline: Option<Instant>,
}

impl Wake {
    fn until(&mut self, at: Instant) {
        self.deadline = Some(self.deadline.map_or(at, |deadline| deadline.min(at)));
    }

    fn on(&mut self, interest: Interest) {
        self.interest = self.interest | interest;
    }
}

enum Start {
    Started,
    Connect,
    Stalled,
}

enum Fill {
    Read,
    Blocked,
    Eof,
}

/// One HTTP/1.1 connection to a target.
pub(crate) struct Connection<S> {
    id: ConnectionId,
    target: Target,
    settings: Settings,
    stream: Option<S>,

    queue: VecDeque<Exchange>,
    in_flight: VecDeque<Exchange>,
    finished: Vec<Finished>,

    mode: Mode,
    encoder: Option<BodyEncoder>,
    wbuf: BytesMut,
    rbuf: BytesMut,

    /// Bytes appended to the send buffer, and bytes written to the stream, since the
    /// stream was attached.
    queued: u64,
    flushed: u64,

    last_rw: Instant,
    last_active: Instant,
    peer_version: Option<Version>,
    close_wait: bool,
    killed: bool,

    interest: Interest,
    body_blocked: bool,
    sink_blocked: bool,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight.len())
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> Connection<S>
where
    S: ByteStream,
{
    pub(crate) fn new(target: Target, settings: Settings, now: Instant) -> Self {
        let id = ConnectionId::next();
        trace!(conn = %id, %target, "new connection");
        Self {
            id,
            target,
            settings,
            stream: None,
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            finished: Vec::new(),
            mode: Mode::Ready,
            encoder: None,
            wbuf: BytesMut::new(),
            rbuf: BytesMut::new(),
            queued: 0,
            flushed: 0,
            last_rw: now,
            last_active: now,
            peer_version: None,
            close_wait: false,
            killed: false,
            interest: Interest::NONE,
            body_blocked: false,
            sink_blocked: false,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn last_active(&self) -> Instant {
        self.last_active
    }

    #[cfg(test)]
    pub(crate) fn is_killed(&self) -> bool {
        self.killed
    }

    /// Whether the connection holds an open stream and no requests.
    pub(crate) fn is_reusable(&self) -> bool {
        !self.killed && self.stream.is_some() && self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// Whether no request is queued or in flight.
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    pub(crate) fn enqueue(&mut self, exchange: Exchange) {
        trace!(conn = %self.id, uri = %exchange.request.uri(), "request queued");
        self.queue.push_back(exchange);
    }

    /// Exchanges the connection is done with, in completion order.
    pub(crate) fn take_finished(&mut self) -> Vec<Finished> {
        std::mem::take(&mut self.finished)
    }

    /// Hand the connection a freshly established stream.
    pub(crate) fn attach(&mut self, stream: S, now: Instant) {
        debug!(conn = %self.id, target = %self.target, "stream established");
        self.discard_stream();
        self.stream = Some(stream);
        self.last_rw = now;
        self.last_active = now;
    }

    /// Establishing a stream failed. Requests which may not be retried fail with `error`.
    pub(crate) fn connect_failed(&mut self, error: Error, now: Instant) {
        warn!(conn = %self.id, target = %self.target, %error, "connection attempt failed");
        let unsupported =
            matches!(&error, Error::Transport(source) if source.kind() == io::ErrorKind::Unsupported);
        for mut exchange in std::mem::take(&mut self.queue) {
            let idempotent = exchange.request.is_idempotent();
            exchange.lifecycle.disconnect(idempotent, false, now);
            if !unsupported && exchange.lifecycle.can_retry() {
                self.queue.push_back(exchange);
            } else {
                self.fail(exchange, error.clone());
            }
        }
    }

    /// Shut the stream down without touching any request state.
    ///
    /// Remaining requests fail with [`Error::Closed`] on the next tick.
    pub(crate) fn kill(&mut self) {
        debug!(conn = %self.id, target = %self.target, "killing connection");
        self.killed = true;
        if let Some(stream) = self.stream.as_mut() {
            if let Err(error) = stream.shutdown() {
                trace!(conn = %self.id, %error, "shutdown failed");
            }
        }
    }

    /// Tear down the stream, retrying or failing every request in flight.
    ///
    /// Closing an already closed connection does nothing.
    pub(crate) fn close(&mut self, error: Option<Error>, now: Instant) {
        if self.mode != Mode::Ready {
            let flushed = self.flushed;
            if let Some(exchange) = self.in_flight.back_mut() {
                let idempotent = exchange.request.is_idempotent();
                exchange
                    .lifecycle
                    .disconnect(idempotent, flushed > exchange.body_offset, now);
            }
            self.mode = Mode::Ready;
            self.encoder = None;
        }

        let mut retry = Vec::new();
        while let Some(mut exchange) = self.in_flight.pop_front() {
            if exchange.response_complete {
                let uri = exchange.request.uri().clone();
                let response = exchange.decoder.take_response(uri);
                self.finished.push(Finished {
                    exchange,
                    outcome: Ok(response),
                });
            } else if (exchange.decoder.status().is_none() || error.is_some())
                && exchange.lifecycle.can_retry()
                && exchange.rewind()
            {
                debug!(
                    conn = %self.id,
                    uri = %exchange.request.uri(),
                    retries = exchange.lifecycle.retries(),
                    "request will be retried"
                );
                retry.push(exchange);
            } else {
                let error = error.clone().unwrap_or_else(Error::eof);
                debug!(conn = %self.id, uri = %exchange.request.uri(), %error, "request failed");
                self.fail(exchange, error);
            }
        }
        for exchange in retry.into_iter().rev() {
            self.queue.push_front(exchange);
        }

        if self.stream.is_some() {
            trace!(conn = %self.id, "closing stream");
        }
        self.discard_stream();
    }

    /// Advance the connection as far as possible without blocking.
    pub(crate) fn tick(&mut self, now: Instant) -> Tick {
        let tick = match self.step(now) {
            Ok(tick) => tick,
            Err(error) => {
                debug!(conn = %self.id, %error, "connection failed");
                self.close(Some(error), now);
                self.resume(now)
            }
        };
        self.interest = match tick {
            Tick::Wait { interest, .. } => interest,
            _ => Interest::NONE,
        };
        tick
    }

    /// Resolve once the connection should be ticked again.
    ///
    /// Deadlines are not considered here; the pump waits for those itself.
    pub(crate) fn poll_wake(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.killed {
            return Poll::Ready(());
        }

        if self.body_blocked {
            let exchange = if self.mode == Mode::BodySending {
                self.in_flight.back_mut()
            } else {
                self.queue.front_mut()
            };
            if let Some(exchange) = exchange {
                if exchange.request.body_mut().poll_data(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
        }

        if self.sink_blocked {
            if let Some(exchange) = self.in_flight.front_mut() {
                if exchange.decoder.sink_mut().poll_ready(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
        }

        if !self.interest.is_empty() {
            if let Some(stream) = self.stream.as_ref() {
                if stream.poll_ready(self.interest, cx).is_ready() {
                    return Poll::Ready(());
                }
            }
        }

        Poll::Pending
    }

    fn step(&mut self, now: Instant) -> Result<Tick, Error> {
        if self.killed {
            self.fail_all(Error::Closed);
            return Ok(Tick::Idle);
        }

        if let Some(timeout) = self.settings.timeout {
            if !self.in_flight.is_empty() && self.stream.is_some() && now >= self.last_rw + timeout {
                debug!(conn = %self.id, ?timeout, "connection timed out");
                return Err(Error::timed_out());
            }
        }

        loop {
            let before = self.progress();
            let mut wake = Wake::default();
            self.body_blocked = false;
            self.sink_blocked = false;

            if let Some(tick) = self.send(now, &mut wake)? {
                return Ok(tick);
            }
            if let Some(tick) = self.receive(now, &mut wake)? {
                return Ok(tick);
            }

            if before != self.progress() {
                continue;
            }

            if self.queue.is_empty() && self.in_flight.is_empty() {
                return Ok(Tick::Idle);
            }
            if let Some(timeout) = self.settings.timeout {
                if !self.in_flight.is_empty() {
                    wake.until(self.last_rw + timeout);
                }
            }
            return Ok(Tick::Wait {
                interest: wake.interest,
                deadline: wake.deadline,
            });
        }
    }

    fn progress(&self) -> (usize, usize, usize, Mode, bool) {
        (
            self.queue.len(),
            self.in_flight.len(),
            self.finished.len(),
            self.mode,
            self.in_flight.front().is_some_and(|e| e.response_complete),
        )
    }

    /// Where to go after the stream was torn down.
    fn resume(&self, now: Instant) -> Tick {
        match self.queue.front() {
            None => Tick::Idle,
            Some(front) => match front.lifecycle.not_before(now) {
                Some(at) => Tick::Wait {
                    interest: Interest::NONE,
                    deadline: Some(at),
                },
                None => Tick::Connect,
            },
        }
    }

    fn send(&mut self, now: Instant, wake: &mut Wake) -> Result<Option<Tick>, Error> {
        loop {
            if !self.flush(now, wake)? {
                return Ok(None);
            }

            match self.mode {
                Mode::Ready => match self.start_next(now, wake)? {
                    Start::Started => {}
                    Start::Connect => return Ok(Some(Tick::Connect)),
                    Start::Stalled => return Ok(None),
                },
                Mode::BodyWaiting { since } => {
                    let give_up = since + self.settings.continue_wait;
                    if now < give_up {
                        wake.until(give_up);
                        return Ok(None);
                    }
                    trace!(conn = %self.id, "no interim response, sending body anyway");
                    self.mode = Mode::BodySending;
                }
                Mode::BodySending => {
                    let (Some(encoder), Some(exchange)) =
                        (self.encoder.as_mut(), self.in_flight.back_mut())
                    else {
                        self.mode = Mode::Ready;
                        continue;
                    };
                    match encoder.next(exchange.request.body_mut()) {
                        Ok(SendChunk::Data(data)) => {
                            self.queued += data.len() as u64;
                            self.wbuf.extend_from_slice(&data);
                            self.last_rw = now;
                        }
                        Ok(SendChunk::Blocked) => {
                            self.body_blocked = true;
                            return Ok(None);
                        }
                        Ok(SendChunk::Empty) => self.finish_sending(now),
                        Err(error) => {
                            self.abort_sending(error, now);
                            return Ok(Some(self.resume(now)));
                        }
                    }
                }
            }
        }
    }

    /// Write out the send buffer. Returns true once it is empty.
    fn flush(&mut self, now: Instant, wake: &mut Wake) -> Result<bool, Error> {
        while !self.wbuf.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(false);
            };
            match stream.try_write(&self.wbuf)? {
                Progress::Ready(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Progress::Ready(n) => {
                    self.wbuf.advance(n);
                    self.flushed += n as u64;
                    self.last_rw = now;
                }
                Progress::Blocked(interest) => {
                    wake.on(interest);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn start_next(&mut self, now: Instant, wake: &mut Wake) -> Result<Start, Error> {
        while self.queue.front().is_some_and(Exchange::is_abandoned) {
            if let Some(exchange) = self.queue.pop_front() {
                trace!(conn = %self.id, uri = %exchange.request.uri(), "dropping abandoned request");
            }
        }

        let Some(front) = self.queue.front() else {
            return Ok(Start::Stalled);
        };
        if let Some(at) = front.lifecycle.not_before(now) {
            wake.until(at);
            return Ok(Start::Stalled);
        }
        let idempotent = front.request.is_idempotent();

        if self.stream.is_some() && self.in_flight.is_empty() && self.is_stale() {
            self.discard_stream();
        }

        let clear = if idempotent {
            !self.close_wait && self.in_flight.iter().all(|e| e.request.is_idempotent())
        } else {
            self.in_flight.is_empty() && self.wbuf.is_empty() && self.rbuf.is_empty()
        };
        if !clear {
            return Ok(Start::Stalled);
        }

        if self.stream.is_none() {
            return Ok(Start::Connect);
        }
        Ok(self.start(now))
    }

    /// Probe an idle stream for a close the peer sent while it sat in the pool.
    fn is_stale(&mut self) -> bool {
        if !self.rbuf.is_empty() {
            debug!(conn = %self.id, "unsolicited bytes on idle connection");
            return true;
        }
        if self.queued == 0 {
            return false;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut probe = [0u8; 2];
        match stream.try_read(&mut probe) {
            Ok(Progress::Blocked(_)) => false,
            Ok(Progress::Ready(0)) => {
                trace!(conn = %self.id, "peer closed idle connection");
                true
            }
            Ok(Progress::Ready(_)) => {
                debug!(conn = %self.id, "unsolicited bytes on idle connection");
                true
            }
            Err(error) => {
                trace!(conn = %self.id, %error, "idle connection failed");
                true
            }
        }
    }

    fn start(&mut self, now: Instant) -> Start {
        let Some(mut exchange) = self.queue.pop_front() else {
            return Start::Stalled;
        };

        let mut headers = exchange.request.headers().clone();
        let size = exchange.request.body().size_hint();
        let mut plan = match plan_request(
            exchange.request.method(),
            &mut headers,
            size,
            self.peer_version,
        ) {
            Ok(plan) => plan,
            Err(error) => {
                self.fail(exchange, error);
                return Start::Started;
            }
        };

        if plan.spool {
            match spool(&mut exchange) {
                Ok(Some(data)) => {
                    trace!(conn = %self.id, len = data.len(), "spooled request body");
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len()));
                    plan.framing = Framing::Length(data.len() as u64);
                    exchange.request.set_body(Body::full(data));
                }
                Ok(None) => {
                    self.body_blocked = true;
                    self.queue.push_front(exchange);
                    return Start::Stalled;
                }
                Err(error) => {
                    self.fail(exchange, error);
                    return Start::Started;
                }
            }
        }

        if !headers.contains_key(header::HOST) {
            match HeaderValue::from_str(&self.target.authority()) {
                Ok(host) => {
                    headers.insert(header::HOST, host);
                }
                Err(_) => {
                    self.fail(exchange, RequestError::InvalidHeader.into());
                    return Start::Started;
                }
            }
        }
        if headers::connection_has(&headers, "close") {
            self.close_wait = true;
        }

        let before = self.wbuf.len();
        exchange.request.write_head(&headers, &mut self.wbuf);
        self.queued += (self.wbuf.len() - before) as u64;
        exchange.body_offset = self.queued;

        self.mode = if headers::expects_continue(&headers) && !plan.framing.is_empty() {
            Mode::BodyWaiting { since: now }
        } else {
            Mode::BodySending
        };
        self.encoder = Some(BodyEncoder::new(plan.framing, &plan.codings));

        debug!(
            conn = %self.id,
            method = %exchange.request.method(),
            uri = %exchange.request.uri(),
            retries = exchange.lifecycle.retries(),
            pipelined = self.in_flight.len(),
            "sending request"
        );
        self.in_flight.push_back(exchange);
        self.last_rw = now;
        self.last_active = now;
        Start::Started
    }

    /// The body of the request being sent has been produced completely.
    fn finish_sending(&mut self, now: Instant) {
        self.mode = Mode::Ready;
        self.encoder = None;
        let queued = self.queued;
        let Some(exchange) = self.in_flight.back_mut() else {
            return;
        };
        let idempotent = exchange.request.is_idempotent();
        exchange
            .lifecycle
            .disconnect(idempotent, queued > exchange.body_offset, now);
        trace!(conn = %self.id, uri = %exchange.request.uri(), "request sent");
        if exchange.response_complete {
            self.finalize_front(now);
        }
    }

    /// The request being sent cannot continue. It fails, and the stream is closed.
    fn abort_sending(&mut self, error: Error, now: Instant) {
        self.mode = Mode::Ready;
        self.encoder = None;
        if let Some(exchange) = self.in_flight.pop_back() {
            debug!(conn = %self.id, uri = %exchange.request.uri(), %error, "request aborted");
            self.fail(exchange, error);
        }
        self.close(None, now);
    }

    /// The response at the head of the pipeline cannot be received. It fails, and the
    /// stream is closed.
    fn abort_front(&mut self, error: Error, now: Instant) {
        if self.mode != Mode::Ready && self.in_flight.len() == 1 {
            self.mode = Mode::Ready;
            self.encoder = None;
        }
        if let Some(exchange) = self.in_flight.pop_front() {
            debug!(conn = %self.id, uri = %exchange.request.uri(), %error, "response failed");
            self.fail(exchange, error);
        }
        self.close(None, now);
    }

    fn receive(&mut self, now: Instant, wake: &mut Wake) -> Result<Option<Tick>, Error> {
        loop {
            let Some(front) = self.in_flight.front_mut() else {
                return Ok(None);
            };
            if front.response_complete {
                return Ok(None);
            }

            let mode = front.decoder.recv_mode();
            let received = match mode {
                RecvMode::Done => {
                    self.response_done(now);
                    continue;
                }
                RecvMode::Flush => {
                    let flushed = front.decoder.flush();
                    if flushed.is_ok() && front.decoder.recv_mode() == RecvMode::Flush {
                        self.sink_blocked = true;
                        return Ok(None);
                    }
                    self.last_rw = now;
                    flushed
                }
                mode => match take_unit(&mut self.rbuf, mode) {
                    Ok(Some(unit)) => front.decoder.recv(&unit),
                    Ok(None) => match self.fill(now, wake)? {
                        Fill::Read => continue,
                        Fill::Blocked => return Ok(None),
                        Fill::Eof if mode == RecvMode::UntilClose => match self.in_flight.front_mut() {
                            Some(front) => front.decoder.recv_eof(),
                            None => continue,
                        },
                        Fill::Eof => {
                            trace!(conn = %self.id, "peer closed with a response outstanding");
                            self.close(None, now);
                            return Ok(Some(self.resume(now)));
                        }
                    },
                    Err(error) => Err(error.into()),
                },
            };

            if let Err(error) = received {
                self.abort_front(error, now);
                return Ok(Some(self.resume(now)));
            }
        }
    }

    /// Read what the stream has into the receive buffer.
    fn fill(&mut self, now: Instant, wake: &mut Wake) -> Result<Fill, Error> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Fill::Eof);
        };
        let mut buf = [0u8; READ_SIZE];
        match stream.try_read(&mut buf)? {
            Progress::Ready(0) => Ok(Fill::Eof),
            Progress::Ready(n) => {
                self.rbuf.extend_from_slice(&buf[..n]);
                self.last_rw = now;
                Ok(Fill::Read)
            }
            Progress::Blocked(interest) => {
                wake.on(interest);
                Ok(Fill::Blocked)
            }
        }
    }

    /// The decoder at the head of the pipeline has a complete message.
    fn response_done(&mut self, now: Instant) {
        let sending = self.mode != Mode::Ready && self.in_flight.len() == 1;
        let Some(front) = self.in_flight.front_mut() else {
            return;
        };

        if front.decoder.is_interim() {
            trace!(conn = %self.id, status = ?front.decoder.status(), "interim response");
            front.decoder.restart();
            if sending && matches!(self.mode, Mode::BodyWaiting { .. }) {
                self.mode = Mode::BodySending;
            }
            return;
        }

        self.peer_version = Some(front.decoder.version());
        if !sending {
            self.finalize_front(now);
            return;
        }

        // The final response arrived before the request was fully sent.
        front.response_complete = true;
        let status = front.decoder.status().unwrap_or(StatusCode::OK);
        if status.as_u16() < 300 {
            if matches!(self.mode, Mode::BodyWaiting { .. }) {
                self.mode = Mode::BodySending;
            }
            return;
        }

        let remaining = if front.decoder.keep_alive() {
            self.encoder.as_mut().and_then(BodyEncoder::abort)
        } else {
            None
        };
        match remaining {
            Some(remaining) if remaining <= MAX_CHUNK as u64 => {
                trace!(conn = %self.id, %status, remaining, "early response, finishing request body");
                if matches!(self.mode, Mode::BodyWaiting { .. }) {
                    self.mode = Mode::BodySending;
                }
            }
            _ => {
                debug!(conn = %self.id, %status, "early response, abandoning request body");
                self.mode = Mode::Ready;
                self.encoder = None;
                self.finalize_front(now);
                self.close(None, now);
            }
        }
    }

    /// Deliver the response at the head of the pipeline.
    fn finalize_front(&mut self, now: Instant) {
        let Some(mut exchange) = self.in_flight.pop_front() else {
            return;
        };
        let keep_alive = exchange.decoder.keep_alive();
        let uri = exchange.request.uri().clone();
        let response = exchange.decoder.take_response(uri);
        debug!(conn = %self.id, status = %response.status(), uri = %response.uri(), "response complete");
        self.finished.push(Finished {
            exchange,
            outcome: Ok(response),
        });
        self.last_active = now;

        if !keep_alive {
            trace!(conn = %self.id, "connection will not be kept alive");
            self.close(None, now);
        } else if self.close_wait && self.in_flight.is_empty() {
            self.close(None, now);
        }
    }

    fn fail(&mut self, exchange: Exchange, error: Error) {
        self.finished.push(Finished {
            exchange,
            outcome: Err(error),
        });
    }

    fn fail_all(&mut self, error: Error) {
        self.mode = Mode::Ready;
        self.encoder = None;
        for exchange in self.in_flight.drain(..).chain(self.queue.drain(..)) {
            self.finished.push(Finished {
                exchange,
                outcome: Err(error.clone()),
            });
        }
        self.discard_stream();
    }

    fn discard_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(error) = stream.shutdown() {
                trace!(conn = %self.id, %error, "shutdown failed");
            }
        }
        self.wbuf.clear();
        self.rbuf.clear();
        self.queued = 0;
        self.flushed = 0;
        self.close_wait = false;
        self.peer_version = None;
    }
}

/// Collect a body of unknown length so it can be sent with a Content-Length.
///
/// Returns `None` while the source is still producing.
fn spool(exchange: &mut Exchange) -> Result<Option<bytes::Bytes>, Error> {
    loop {
        let pulled = exchange
            .request
            .body_mut()
            .pull(MAX_CHUNK)
            .map_err(|error| Error::Body(std::sync::Arc::new(error)))?;
        match pulled {
            Pull::Data(data) => {
                exchange.spooled.extend_from_slice(&data);
                if exchange.spooled.len() > MAX_SPOOL {
                    return Err(RequestError::LengthRequired.into());
                }
            }
            Pull::Blocked => return Ok(None),
            Pull::End => return Ok(Some(exchange.spooled.split().freeze())),
        }
    }
}

/// Split the unit a decoder asked for off the front of the receive buffer.
fn take_unit(rbuf: &mut BytesMut, mode: RecvMode) -> Result<Option<BytesMut>, FramingError> {
    let head = matches!(mode, RecvMode::Line | RecvMode::HeaderBlock);
    let end = match mode {
        RecvMode::Line => find(rbuf, b"\r\n").map(|at| at + 2),
        RecvMode::HeaderBlock if rbuf.starts_with(b"\r\n") => Some(2),
        RecvMode::HeaderBlock => find(rbuf, b"\r\n\r\n").map(|at| at + 4),
        RecvMode::Bytes(n) => Some(n.min(rbuf.len())),
        RecvMode::UntilClose => Some(rbuf.len()),
        RecvMode::Flush | RecvMode::Done => None,
    };
    match end {
        Some(end) if head && end > MAX_HEAD => Err(FramingError::HeadTooLarge),
        Some(0) => Ok(None),
        Some(end) => Ok(Some(rbuf.split_to(end))),
        None if head && rbuf.len() > MAX_HEAD => Err(FramingError::HeadTooLarge),
        None => Ok(None),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
