//! Retry, redirect and authentication policy for a single request.
//!
//! Every request carries a [`Lifecycle`] from the moment it is submitted. Connections
//! update it when a transmission attempt ends, and [`complete`] consults it once a
//! response has arrived to decide whether the caller sees that response or the request
//! goes around again.

use std::time::Duration;

use bytes::BytesMut;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode, Uri};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::auth::{Challenge, CredentialStore, Credentials};
use super::pool::Target;
use super::Error;
use crate::body::Body;
use crate::message::{headers, Request, Response, ResponseDecoder};

/// Redirects followed for one request before the redirect response is delivered as-is.
pub const MAX_REDIRECTS: u32 = 10;

/// Jittered, Fibonacci-like growth of the delay between retries.
///
/// Each delay is the sum of the two previous bases, scaled by a random factor between
/// 0.5 and 1.25. The first retry happens immediately.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    previous: Duration,
}

impl Backoff {
    /// A backoff whose second delay is around `base`.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: Duration::ZERO,
            previous: base,
        }
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.mul_f64(jitter());
        let next = self.current + self.previous;
        self.previous = self.current;
        self.current = next;
        delay
    }

    fn restart(&self) -> Self {
        Self::new(self.base)
    }
}

/// A random factor between 0.5 and 1.25.
fn jitter() -> f64 {
    match getrandom::u32() {
        Ok(sample) => 0.5 + 0.75 * (f64::from(sample) / f64::from(u32::MAX)),
        Err(_) => 1.0,
    }
}

/// Retry and authentication state of one request.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    retries: u32,
    max_retries: u32,
    limit: u32,
    backoff: Backoff,
    next_attempt: Option<Instant>,
    tried: Vec<Credentials>,
    session: Option<Credentials>,
    auto_redirect: bool,
    redirects: u32,
    expect_retried: bool,
}

impl Lifecycle {
    pub(crate) fn new(max_retries: u32, base: Duration, auto_redirect: bool) -> Self {
        Self {
            retries: 0,
            max_retries,
            limit: max_retries,
            backoff: Backoff::new(base),
            next_attempt: None,
            tried: Vec::new(),
            session: None,
            auto_redirect,
            redirects: 0,
            expect_retried: false,
        }
    }

    /// A transmission attempt ended, either because it was sent completely or because
    /// the connection went away while sending.
    ///
    /// `body_sent` is true once any byte of the body reached the stream.
    pub(crate) fn disconnect(&mut self, idempotent: bool, body_sent: bool, now: Instant) {
        self.retries += 1;
        if idempotent || !body_sent {
            let delay = self.backoff.next_delay();
            self.next_attempt = Some(now + delay);
            trace!(retries = self.retries, ?delay, "request remains retryable");
        } else {
            trace!("request body was partially sent, not retryable");
            self.max_retries = 0;
        }
    }

    pub(crate) fn can_retry(&self) -> bool {
        self.retries <= self.max_retries
    }

    /// When the request may next be sent, if that is later than `now`.
    pub(crate) fn not_before(&self, now: Instant) -> Option<Instant> {
        self.next_attempt.filter(|at| *at > now)
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    fn send_now(&mut self) {
        self.next_attempt = None;
    }

    pub(crate) fn use_credentials(&mut self, credentials: Credentials) {
        self.tried.push(credentials.clone());
        self.session = Some(credentials);
    }

    fn redirected(&self) -> Self {
        let mut fresh = Lifecycle::new(self.limit, self.backoff.base, self.auto_redirect);
        fresh.backoff = self.backoff.restart();
        fresh.redirects = self.redirects + 1;
        fresh
    }
}

/// A request travelling through the pool, with the decoder for its response.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) request: Request,
    pub(crate) decoder: ResponseDecoder,
    pub(crate) lifecycle: Lifecycle,
    tx: Option<oneshot::Sender<Result<Response, Error>>>,

    /// The final response arrived while the request was still being sent.
    pub(crate) response_complete: bool,

    /// Stream offset of the first body byte of this request.
    pub(crate) body_offset: u64,

    /// Body bytes collected so far when the length must be known before sending.
    pub(crate) spooled: BytesMut,
}

impl Exchange {
    pub(crate) fn new(
        mut request: Request,
        lifecycle: Lifecycle,
        tx: oneshot::Sender<Result<Response, Error>>,
    ) -> Self {
        let decoder = ResponseDecoder::new(request.method().clone(), request.take_sink());
        Self {
            request,
            decoder,
            lifecycle,
            tx: Some(tx),
            response_complete: false,
            body_offset: 0,
            spooled: BytesMut::new(),
        }
    }

    /// Whether the caller stopped waiting for the outcome.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    pub(crate) fn deliver(mut self, outcome: Result<Response, Error>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }

    pub(crate) fn fail(self, error: Error) {
        self.deliver(Err(error))
    }

    /// Prepare to send the request again from scratch.
    ///
    /// Fails when the body cannot be replayed.
    pub(crate) fn rewind(&mut self) -> bool {
        if !self.request.rewind() {
            return false;
        }
        self.decoder.reset();
        self.response_complete = false;
        true
    }

    fn resend_after(&mut self, response: &mut Response) {
        self.decoder = ResponseDecoder::new(self.request.method().clone(), response.reclaim_sink());
        self.response_complete = false;
        self.lifecycle.send_now();
    }
}

/// An exchange whose connection is done with it.
#[derive(Debug)]
pub(crate) struct Finished {
    pub(crate) exchange: Exchange,
    pub(crate) outcome: Result<Response, Error>,
}

/// What happens to a finished exchange.
#[derive(Debug)]
pub(crate) enum Disposition {
    /// The caller receives this outcome.
    Deliver(Exchange, Result<Response, Error>),

    /// The request goes around again.
    Resend(Exchange),
}

/// Apply the completion policy to a finished exchange.
pub(crate) fn complete(finished: Finished, store: &mut dyn CredentialStore) -> Disposition {
    let Finished {
        mut exchange,
        outcome,
    } = finished;

    let mut response = match outcome {
        Ok(response) => response,
        Err(error) => {
            debug!(%error, uri = %exchange.request.uri(), "request failed");
            return Disposition::Deliver(exchange, Err(error));
        }
    };
    let status = response.status();

    if let Some(credentials) = exchange.lifecycle.session.take() {
        if status == StatusCode::UNAUTHORIZED {
            debug!(user = credentials.user(), "credentials rejected");
            store.forget(&credentials);
        } else {
            store.success(&credentials, exchange.request.uri());
        }
    }

    if status.is_redirection()
        && exchange.lifecycle.auto_redirect
        && (status != StatusCode::FOUND
            || matches!(*exchange.request.method(), Method::GET | Method::HEAD))
        && redirect(&mut exchange, &response)
    {
        exchange.resend_after(&mut response);
        return Disposition::Resend(exchange);
    }

    if status == StatusCode::UNAUTHORIZED {
        if let Some(credentials) = untried_credentials(&exchange, &response, store) {
            if exchange.request.rewind() {
                debug!(user = credentials.user(), "answering challenge");
                exchange
                    .request
                    .headers_mut()
                    .insert(header::AUTHORIZATION, credentials.authorization());
                exchange.lifecycle.use_credentials(credentials);
                exchange.resend_after(&mut response);
                return Disposition::Resend(exchange);
            }
        }
    }

    if status == StatusCode::EXPECTATION_FAILED
        && headers::expects_continue(exchange.request.headers())
        && !exchange.lifecycle.expect_retried
        && exchange.request.rewind()
    {
        debug!("expectation failed, resending without it");
        exchange.request.headers_mut().remove(header::EXPECT);
        exchange.lifecycle.expect_retried = true;
        exchange.resend_after(&mut response);
        return Disposition::Resend(exchange);
    }

    Disposition::Deliver(exchange, Ok(response))
}

fn untried_credentials(
    exchange: &Exchange,
    response: &Response,
    store: &dyn CredentialStore,
) -> Option<Credentials> {
    let uri = exchange.request.uri();
    Challenge::from_headers(response.headers())
        .iter()
        .flat_map(|challenge| store.find_for_challenge(challenge, uri))
        .find(|credentials| !exchange.lifecycle.tried.contains(credentials))
}

/// Point the request at the redirect location. Returns false to deliver the response.
fn redirect(exchange: &mut Exchange, response: &Response) -> bool {
    if exchange.lifecycle.redirects >= MAX_REDIRECTS {
        debug!("too many redirects");
        return false;
    }

    let Some(location) = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(uri) = resolve(exchange.request.uri(), location) else {
        debug!(location, "unusable redirect location");
        return false;
    };
    let (Ok(from), Ok(to)) = (
        Target::try_from(exchange.request.uri()),
        Target::try_from(&uri),
    ) else {
        return false;
    };

    let request = &mut exchange.request;
    if response.status() == StatusCode::SEE_OTHER && *request.method() != Method::HEAD {
        request.set_method(Method::GET);
        request.set_body(Body::empty());
        let headers = request.headers_mut();
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::EXPECT);
    } else if !request.rewind() {
        return false;
    }

    if from != to {
        request.headers_mut().remove(header::AUTHORIZATION);
    }
    request.headers_mut().remove(header::HOST);

    debug!(status = %response.status(), %uri, "following redirect");
    request.set_uri(uri);
    exchange.lifecycle = exchange.lifecycle.redirected();
    true
}

/// Resolve a `Location` value against the URI of the request which received it.
fn resolve(base: &Uri, location: &str) -> Option<Uri> {
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Some(uri);
        }
    }

    let scheme = base.scheme_str()?;
    let authority = base.authority()?.as_str();
    let absolute = if let Some(rest) = location.strip_prefix("//") {
        format!("{scheme}://{rest}")
    } else if location.starts_with('/') {
        format!("{scheme}://{authority}{location}")
    } else if location.starts_with('?') {
        format!("{scheme}://{authority}{}{location}", base.path())
    } else {
        let path = base.path();
        let directory = &path[..path.rfind('/').map_or(0, |at| at + 1)];
        let directory = if directory.is_empty() { "/" } else { directory };
        format!("{scheme}://{authority}{directory}{location}")
    };
    absolute.parse().ok()
}

/// Attach credentials known for the request URI, unless it already carries some.
pub(crate) fn preemptive_credentials(exchange: &mut Exchange, store: &dyn CredentialStore) {
    if exchange.request.headers().contains_key(header::AUTHORIZATION) {
        return;
    }
    if let Some(credentials) = store.find_for_url(exchange.request.uri()) {
        trace!(user = credentials.user(), "sending credentials preemptively");
        exchange
            .request
            .headers_mut()
            .insert(header::AUTHORIZATION, credentials.authorization());
        exchange.lifecycle.use_credentials(credentials);
    }
}

/// The default `User-Agent` header value.
pub(crate) fn default_user_agent() -> HeaderValue {
    HeaderValue::from_static(concat!("hyperpipe/", env!("CARGO_PKG_VERSION")))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Version};

    use super::*;
    use crate::body::{BodySource, Sink};
    use crate::client::auth::BasicCredentials;

    fn exchange(request: Request) -> (Exchange, oneshot::Receiver<Result<Response, Error>>) {
        let (tx, rx) = oneshot::channel();
        let lifecycle = Lifecycle::new(3, Duration::from_secs(5), true);
        (Exchange::new(request, lifecycle, tx), rx)
    }

    fn response(status: StatusCode, headers: &[(header::HeaderName, &'static str)], uri: &Uri) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name.clone(), HeaderValue::from_static(value));
        }
        Response::new(status, String::new(), Version::HTTP_11, map, Sink::default(), uri.clone())
    }

    #[test]
    fn backoff_grows() {
        let mut backoff = Backoff::new(Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(2500) && second <= Duration::from_millis(6250));
        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(2500) && third <= Duration::from_millis(6250));
        let fourth = backoff.next_delay();
        assert!(fourth >= Duration::from_secs(5) && fourth <= Duration::from_millis(12500));
    }

    #[test]
    fn partially_sent_post_is_not_retryable() {
        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(3, Duration::from_secs(5), true);
        lifecycle.disconnect(false, true, now);
        assert!(!lifecycle.can_retry());
    }

    #[test]
    fn idempotent_retries_until_limit() {
        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(3, Duration::from_secs(5), true);
        for _ in 0..3 {
            lifecycle.disconnect(true, true, now);
            assert!(lifecycle.can_retry());
        }
        lifecycle.disconnect(true, true, now);
        assert!(!lifecycle.can_retry());
        assert_eq!(lifecycle.retries(), 4);
    }

    #[test]
    fn resolve_locations() {
        let base = Uri::from_static("http://example.com/a/b?c");
        assert_eq!(resolve(&base, "https://other.org/x").unwrap(), "https://other.org/x");
        assert_eq!(resolve(&base, "/root").unwrap(), "http://example.com/root");
        assert_eq!(resolve(&base, "sibling").unwrap(), "http://example.com/a/sibling");
        assert_eq!(resolve(&base, "//cdn.example.com/y").unwrap(), "http://cdn.example.com/y");
        assert_eq!(resolve(&base, "?q=1").unwrap(), "http://example.com/a/b?q=1");
    }

    #[test]
    fn see_other_becomes_get() {
        let uri = Uri::from_static("http://example.com/form");
        let request = Request::post(uri.clone(), "data")
            .with_header(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let (exchange, _rx) = exchange(request);
        let finished = Finished {
            exchange,
            outcome: Ok(response(
                StatusCode::SEE_OTHER,
                &[(header::LOCATION, "http://other.example.com/done")],
                &uri,
            )),
        };
        let mut store = BasicCredentials::new();
        match complete(finished, &mut store) {
            Disposition::Resend(exchange) => {
                assert_eq!(exchange.request.method(), Method::GET);
                assert_eq!(exchange.request.uri(), "http://other.example.com/done");
                assert!(!exchange.request.headers().contains_key(header::AUTHORIZATION));
                assert_eq!(exchange.request.body().size_hint(), Some(0));
            }
            other => panic!("expected a resend, got {other:?}"),
        }
    }

    #[test]
    fn found_is_not_followed_for_post() {
        let uri = Uri::from_static("http://example.com/form");
        let (exchange, _rx) = exchange(Request::post(uri.clone(), "data"));
        let finished = Finished {
            exchange,
            outcome: Ok(response(StatusCode::FOUND, &[(header::LOCATION, "/elsewhere")], &uri)),
        };
        let mut store = BasicCredentials::new();
        assert!(matches!(
            complete(finished, &mut store),
            Disposition::Deliver(_, Ok(_))
        ));
    }

    #[test]
    fn unauthorized_tries_each_credential_once() {
        let uri = Uri::from_static("http://example.com/private/");
        let credentials = Credentials::basic("http://example.com".parse().unwrap(), "user", "pass");
        let mut store = BasicCredentials::new().with(credentials.clone());
        let challenge = [(header::WWW_AUTHENTICATE, r#"Basic realm="private""#)];

        let (exchange, _rx) = exchange(Request::get(uri.clone()));
        let finished = Finished {
            exchange,
            outcome: Ok(response(StatusCode::UNAUTHORIZED, &challenge, &uri)),
        };
        let exchange = match complete(finished, &mut store) {
            Disposition::Resend(exchange) => exchange,
            other => panic!("expected a resend, got {other:?}"),
        };
        assert_eq!(
            exchange.request.headers()[header::AUTHORIZATION],
            credentials.authorization()
        );

        let finished = Finished {
            exchange,
            outcome: Ok(response(StatusCode::UNAUTHORIZED, &challenge, &uri)),
        };
        match complete(finished, &mut store) {
            Disposition::Deliver(_, Ok(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected delivery, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn accepted_credentials_report_success() {
        let uri = Uri::from_static("http://example.com/private/page");
        let credentials = Credentials::basic("http://example.com".parse().unwrap(), "user", "pass");
        let mut store = BasicCredentials::new().with(credentials.clone());

        let (mut exchange, _rx) = exchange(Request::get(uri.clone()));
        exchange.lifecycle.use_credentials(credentials.clone());
        let finished = Finished {
            exchange,
            outcome: Ok(response(StatusCode::OK, &[], &uri)),
        };
        assert!(matches!(
            complete(finished, &mut store),
            Disposition::Deliver(_, Ok(_))
        ));

        let (mut exchange, _rx) = self::exchange(Request::get(Uri::from_static(
            "http://example.com/private/other",
        )));
        preemptive_credentials(&mut exchange, &store);
        assert!(exchange.request.headers().contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn expectation_failed_resends_once() {
        let uri = Uri::from_static("http://example.com/upload");
        let request = Request::post(uri.clone(), Bytes::from_static(b"payload")).expect_continue();
        let (exchange, _rx) = exchange(request);
        let finished = Finished {
            exchange,
            outcome: Ok(response(StatusCode::EXPECTATION_FAILED, &[], &uri)),
        };
        let mut store = BasicCredentials::new();
        let exchange = match complete(finished, &mut store) {
            Disposition::Resend(exchange) => exchange,
            other => panic!("expected a resend, got {other:?}"),
        };
        assert!(!exchange.request.headers().contains_key(header::EXPECT));
    }
}
