use std::fmt;

use bytes::Bytes;
use http::header::HeaderMap;
use http::{StatusCode, Uri, Version};

use crate::body::{BodySink, Sink};

/// A received response.
///
/// Unless the request supplied its own sink, the body is collected in memory.
pub struct Response {
    status: StatusCode,
    reason: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    sink: Option<Box<dyn BodySink>>,
    uri: Uri,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        reason: String,
        version: Version,
        headers: HeaderMap,
        sink: Sink,
        uri: Uri,
    ) -> Self {
        let (body, sink) = match sink {
            Sink::Collect(buf) => (buf.freeze(), None),
            Sink::Custom(sink) => (Bytes::new(), Some(sink)),
        };
        Self {
            status,
            reason,
            version,
            headers,
            body,
            sink,
            uri,
        }
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase sent by the server.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The protocol version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers, including any trailers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The collected body. Empty when the body went to a custom sink.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The URI this response was received from, after any redirects.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Take back the sink supplied with the request, if there was one.
    pub fn into_sink(self) -> Option<Box<dyn BodySink>> {
        self.sink
    }

    /// Recover the sink for a fresh transmission of the request, discarding the body.
    pub(crate) fn reclaim_sink(&mut self) -> Sink {
        match self.sink.take() {
            Some(mut sink) => {
                sink.reset();
                Sink::Custom(sink)
            }
            None => Sink::default(),
        }
    }
}

impl From<Response> for http::Response<Bytes> {
    fn from(response: Response) -> Self {
        let mut converted = http::Response::new(response.body);
        *converted.status_mut() = response.status;
        *converted.version_mut() = response.version;
        *converted.headers_mut() = response.headers;
        converted
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Response: Send, fmt::Debug);

    #[test]
    fn debug_skips_the_sink() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace", "abc".parse().unwrap());
        let response = Response::new(
            StatusCode::ACCEPTED,
            "Accepted".to_owned(),
            Version::HTTP_11,
            headers,
            Sink::Custom(Box::new(Vec::new())),
            Uri::from_static("http://example.com/queue"),
        );

        let debug = format!("{response:?}");
        assert!(debug.starts_with("Response {"));
        assert!(debug.contains("202"));
        assert!(debug.contains("x-trace"));
        assert!(debug.contains("http://example.com/queue"));
        assert!(!debug.contains("sink"));
        assert!(debug.ends_with(".. }"));
    }
}
