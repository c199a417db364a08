use bytes::{BufMut, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};

use super::headers;
use crate::body::{Body, BodySink, BodySource, Sink};

/// An HTTP request, together with the options which steer how it is delivered.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    sink: Sink,
    max_retries: Option<u32>,
    auto_redirect: bool,
}

impl Request {
    /// Create a request with an empty body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Body::empty(),
            sink: Sink::default(),
            max_retries: None,
            auto_redirect: true,
        }
    }

    /// A GET request for `uri`.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// A POST request for `uri` carrying `body`.
    pub fn post(uri: Uri, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, uri).with_body(body)
    }

    /// Add a header, keeping any existing values.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Stream the response body into `sink` instead of collecting it in memory.
    pub fn with_sink(mut self, sink: impl BodySink) -> Self {
        self.sink = Sink::Custom(Box::new(sink));
        self
    }

    /// Ask the server for permission before sending the body.
    pub fn expect_continue(self) -> Self {
        self.with_header(header::EXPECT, HeaderValue::from_static("100-continue"))
    }

    /// Override the configured retry limit for this request.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Whether redirects are followed automatically. On by default.
    pub fn auto_redirect(mut self, enabled: bool) -> Self {
        self.auto_redirect = enabled;
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Whether the method may be repeated with the same effect as sending it once.
    ///
    /// Idempotent requests may be pipelined behind unfinished exchanges and may always
    /// be retried.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
        )
    }

    pub(crate) fn retry_limit(&self) -> Option<u32> {
        self.max_retries
    }

    pub(crate) fn follows_redirects(&self) -> bool {
        self.auto_redirect
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub(crate) fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub(crate) fn take_sink(&mut self) -> Sink {
        std::mem::take(&mut self.sink)
    }

    pub(crate) fn rewind(&mut self) -> bool {
        self.body.rewind()
    }

    /// Write the request line and `headers` (the framed copy of this request's headers).
    pub(crate) fn write_head(&self, headers: &HeaderMap, dst: &mut BytesMut) {
        let target = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(target.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(headers::version_str(http::Version::HTTP_11).as_bytes());
        dst.put_slice(b"\r\n");
        headers::write_headers(headers, dst);
        dst.put_slice(b"\r\n");
    }
}

impl<B> From<http::Request<B>> for Request
where
    B: Into<Body>,
{
    fn from(request: http::Request<B>) -> Self {
        let (parts, body) = request.into_parts();
        let mut request = Request::new(parts.method, parts.uri).with_body(body);
        request.headers = parts.headers;
        request
    }
}
