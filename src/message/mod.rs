//! The message transfer engine.
//!
//! Everything here works on bytes and headers only. Nothing touches a socket: the
//! connection feeds received bytes in the units asked for by [`ResponseDecoder::recv_mode`]
//! and pulls outgoing bytes from a [`BodyEncoder`].
//!
//! Transfer lengths are computed exactly once per transmission by [`plan_request`] and
//! once per received message by the decoder, from the Transfer-Encoding and
//! Content-Length headers.

use http::{Method, StatusCode};

mod chunked;
mod coding;
mod decode;
mod encode;
mod framing;
pub(crate) mod headers;
mod request;
mod response;

pub use self::coding::Coding;
pub use self::decode::{RecvMode, ResponseDecoder};
pub use self::encode::{BodyEncoder, SendChunk};
pub use self::framing::{plan_request, Framing, SendPlan};
pub use self::request::Request;
pub use self::response::Response;

/// Largest body spooled in memory to compute a length for an HTTP/1.0 peer.
pub const MAX_SPOOL: usize = 16 * MAX_CHUNK;

/// Most bytes pulled from a body source per chunk.
pub const MAX_CHUNK: usize = 8192;

/// The bytes received from a peer do not form a valid HTTP/1.1 message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FramingError {
    /// The status line is malformed.
    #[error("malformed status line")]
    StatusLine,

    /// The peer speaks a protocol version this client does not.
    #[error("unsupported protocol version")]
    Version,

    /// A header block is malformed.
    #[error("malformed header block")]
    HeaderBlock,

    /// A header block has more fields than this client accepts.
    #[error("too many headers")]
    TooManyHeaders,

    /// A start line or header block is larger than this client accepts.
    #[error("message head too large")]
    HeadTooLarge,

    /// The Content-Length header is malformed or repeated with different values.
    #[error("invalid content-length")]
    ContentLength,

    /// Both Transfer-Encoding and Content-Length were present.
    #[error("both transfer-encoding and content-length present")]
    ConflictingLength,

    /// The message uses a transfer-coding this client does not implement.
    #[error("unsupported transfer-coding: {0}")]
    UnsupportedCoding(String),

    /// A chunk size line is not valid hex.
    #[error("invalid chunk size")]
    ChunkSize,

    /// Chunk data was not followed by CRLF.
    #[error("missing CRLF after chunk data")]
    ChunkTerminator,

    /// A compressed body could not be decoded.
    #[error("body decoding failed: {0}")]
    Coding(String),

    /// The peer switched protocols, which this client does not support.
    #[error("unexpected 101 switching protocols")]
    UnexpectedSwitch,
}

/// A request cannot be sent as given.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The method does not permit a request body.
    #[error("{0} requests must not have a body")]
    BodyNotAllowed(Method),

    /// The body length does not agree with the declared Content-Length.
    #[error("body length {actual} does not match content-length {declared}")]
    LengthMismatch {
        /// The value of the Content-Length header.
        declared: u64,

        /// The number of bytes the body source produced.
        actual: u64,
    },

    /// Transfer-Encoding and Content-Length were both set.
    #[error("content-length set together with transfer-encoding")]
    ContentLengthWithTransferEncoding,

    /// Transfer-Encoding on a request must end in `chunked`.
    #[error("transfer-encoding does not end in chunked")]
    NotChunked,

    /// The Content-Length header is malformed.
    #[error("invalid content-length header")]
    InvalidContentLength,

    /// A transfer-coding was requested that is not implemented.
    #[error("unsupported transfer-coding: {0}")]
    UnsupportedCoding(String),

    /// The body has no known length and is too large to spool for an HTTP/1.0 peer.
    #[error("length required")]
    LengthRequired,

    /// A header could not be represented.
    #[error("invalid header value")]
    InvalidHeader,
}

/// Methods which may never carry a request body.
pub(crate) fn forbids_body(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::DELETE)
}

/// Statuses which never carry a response body.
pub(crate) fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}
