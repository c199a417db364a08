//! Transfer length computation for sent and received messages.

use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};

use super::coding::Coding;
use super::headers;
use super::{forbids_body, status_forbids_body, FramingError, RequestError};
use crate::client::Error;

/// How the end of a message body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Exactly this many bytes follow the header block.
    Length(u64),

    /// The body is a sequence of chunks ending in a zero sized chunk.
    Chunked,

    /// The body ends when the connection closes.
    UntilClose,
}

impl Framing {
    /// True when no body bytes follow the header block.
    pub fn is_empty(&self) -> bool {
        matches!(self, Framing::Length(0))
    }
}

/// The outcome of length computation for an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPlan {
    /// Framing of the body on the wire.
    pub framing: Framing,

    /// Transfer-codings to apply before framing.
    pub codings: Vec<Coding>,

    /// The body has an unknown length and must be spooled to compute Content-Length.
    pub spool: bool,
}

impl SendPlan {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            codings: Vec::new(),
            spool: false,
        }
    }
}

fn request_codings(headers: &HeaderMap) -> Result<Vec<Coding>, RequestError> {
    headers::transfer_codings(headers).map_err(|err| match err {
        FramingError::UnsupportedCoding(token) => RequestError::UnsupportedCoding(token),
        _ => RequestError::InvalidHeader,
    })
}

fn set_length(headers: &mut HeaderMap, length: u64) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
}

/// Compute the framing for a request body and adjust `headers` to match.
///
/// `size` is the length of the body if it is known ahead of time. `peer` is the protocol
/// version of the server, if one has been seen on this connection; servers which have
/// not answered yet are assumed to speak HTTP/1.1.
pub fn plan_request(
    method: &Method,
    headers: &mut HeaderMap,
    size: Option<u64>,
    peer: Option<Version>,
) -> Result<SendPlan, Error> {
    let legacy = peer.is_some_and(|version| version <= Version::HTTP_10);
    let forbidden = forbids_body(method);
    let declared = headers::content_length(headers).map_err(|_| RequestError::InvalidContentLength)?;
    let codings = request_codings(headers)?;

    if !codings.is_empty() {
        if declared.is_some() {
            return Err(RequestError::ContentLengthWithTransferEncoding.into());
        }
        if codings.last() != Some(&Coding::Chunked) {
            return Err(RequestError::NotChunked.into());
        }
        if forbidden {
            return Err(RequestError::BodyNotAllowed(method.clone()).into());
        }
        if legacy {
            headers.remove(header::TRANSFER_ENCODING);
            return Ok(match size {
                Some(length) => {
                    set_length(headers, length);
                    SendPlan::new(Framing::Length(length))
                }
                None => SendPlan {
                    spool: true,
                    ..SendPlan::new(Framing::Length(0))
                },
            });
        }
        return Ok(SendPlan {
            framing: Framing::Chunked,
            codings,
            spool: false,
        });
    }

    if let Some(declared) = declared {
        match size {
            Some(actual) if actual != declared => {
                return Err(RequestError::LengthMismatch { declared, actual }.into())
            }
            _ => {}
        }
        if forbidden && declared > 0 {
            return Err(RequestError::BodyNotAllowed(method.clone()).into());
        }
        return Ok(SendPlan::new(Framing::Length(declared)));
    }

    match size {
        Some(0) => {
            if !forbidden {
                set_length(headers, 0);
            }
            Ok(SendPlan::new(Framing::Length(0)))
        }
        _ if forbidden => Err(RequestError::BodyNotAllowed(method.clone()).into()),
        Some(length) => {
            set_length(headers, length);
            Ok(SendPlan::new(Framing::Length(length)))
        }
        None if legacy => Ok(SendPlan {
            spool: true,
            ..SendPlan::new(Framing::Length(0))
        }),
        None => {
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Ok(SendPlan::new(Framing::Chunked))
        }
    }
}

/// Determine how the body of a received response is framed.
pub(crate) fn recv_response(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<(Framing, Vec<Coding>), FramingError> {
    if status_forbids_body(status) || *method == Method::HEAD {
        return Ok((Framing::Length(0), Vec::new()));
    }

    let codings = headers::transfer_codings(headers)?;
    let declared = headers::content_length(headers)?;

    if !codings.is_empty() {
        if declared.is_some() {
            return Err(FramingError::ConflictingLength);
        }
        let framing = if codings.last() == Some(&Coding::Chunked) {
            Framing::Chunked
        } else {
            Framing::UntilClose
        };
        return Ok((framing, codings));
    }

    Ok(match declared {
        Some(length) => (Framing::Length(length), Vec::new()),
        None => (Framing::UntilClose, Vec::new()),
    })
}
