use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, StatusCode, Uri, Version};
use tracing::trace;

use super::chunked;
use super::coding::{Coding, DecodeChain};
use super::framing::{self, Framing};
use super::headers;
use super::response::Response;
use super::FramingError;
use crate::body::Sink;
use crate::client::Error;

/// The unit of input a decoder needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// A complete header block, through the empty line which ends it.
    /// A bare CRLF is a block with no headers.
    HeaderBlock,

    /// One line, through its CRLF.
    Line,

    /// Up to this many bytes. Fewer may be delivered.
    Bytes(usize),

    /// The body sink is full. Call `flush` once it can accept more.
    Flush,

    /// Everything until the peer closes the stream, then `recv_eof`.
    UntilClose,

    /// The message is complete.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailer,
    UntilClose,
    Done,
}

/// Removes framing and transfer-codings from a received body.
#[derive(Debug)]
pub(crate) struct BodyDecoder {
    state: BodyState,
    chain: Option<DecodeChain>,
    trailers: Option<HeaderMap>,
}

impl BodyDecoder {
    pub(crate) fn new(framing: Framing, codings: &[Coding]) -> Self {
        let state = match framing {
            Framing::Length(0) => BodyState::Done,
            Framing::Length(n) => BodyState::Length(n),
            Framing::Chunked => BodyState::ChunkSize,
            Framing::UntilClose => BodyState::UntilClose,
        };
        Self {
            state,
            chain: DecodeChain::new(codings),
            trailers: None,
        }
    }

    pub(crate) fn mode(&self) -> RecvMode {
        match self.state {
            BodyState::Length(n) | BodyState::ChunkData(n) => {
                RecvMode::Bytes(usize::try_from(n).unwrap_or(usize::MAX))
            }
            BodyState::ChunkSize | BodyState::ChunkEnd => RecvMode::Line,
            BodyState::Trailer => RecvMode::HeaderBlock,
            BodyState::UntilClose => RecvMode::UntilClose,
            BodyState::Done => RecvMode::Done,
        }
    }

    /// Accept one unit of input, returning the decoded body bytes it contained.
    pub(crate) fn recv(&mut self, data: &[u8]) -> Result<Bytes, FramingError> {
        let plain: &[u8] = match self.state {
            BodyState::Length(n) => {
                debug_assert!(data.len() as u64 <= n, "more bytes than the body holds");
                let rest = n.saturating_sub(data.len() as u64);
                self.state = if rest == 0 {
                    BodyState::Done
                } else {
                    BodyState::Length(rest)
                };
                data
            }
            BodyState::ChunkSize => {
                let size = chunked::parse_size(data)?;
                trace!(size, "chunk");
                self.state = if size == 0 {
                    BodyState::Trailer
                } else {
                    BodyState::ChunkData(size)
                };
                &[]
            }
            BodyState::ChunkData(n) => {
                let rest = n.saturating_sub(data.len() as u64);
                self.state = if rest == 0 {
                    BodyState::ChunkEnd
                } else {
                    BodyState::ChunkData(rest)
                };
                data
            }
            BodyState::ChunkEnd => {
                if data != b"\r\n" {
                    return Err(FramingError::ChunkTerminator);
                }
                self.state = BodyState::ChunkSize;
                &[]
            }
            BodyState::Trailer => {
                let trailers = headers::parse_header_block(data)?;
                if !trailers.is_empty() {
                    self.trailers = Some(trailers);
                }
                self.state = BodyState::Done;
                &[]
            }
            BodyState::UntilClose => data,
            BodyState::Done => &[],
        };

        let mut decoded = match &mut self.chain {
            Some(chain) if !plain.is_empty() => chain
                .decode(plain)
                .map_err(|err| FramingError::Coding(err.to_string()))?,
            Some(_) => Bytes::new(),
            None => Bytes::copy_from_slice(plain),
        };

        if self.state == BodyState::Done {
            decoded = self.finish(decoded)?;
        }
        Ok(decoded)
    }

    /// The peer closed the stream. Only a close-delimited body may end this way.
    pub(crate) fn recv_eof(&mut self) -> Result<Bytes, Error> {
        if self.state != BodyState::UntilClose {
            return Err(Error::eof());
        }
        self.state = BodyState::Done;
        Ok(self.finish(Bytes::new())?)
    }

    fn finish(&mut self, decoded: Bytes) -> Result<Bytes, FramingError> {
        match self.chain.take() {
            Some(chain) => {
                let tail = chain
                    .finish()
                    .map_err(|err| FramingError::Coding(err.to_string()))?;
                if decoded.is_empty() {
                    return Ok(tail);
                }
                let mut all = decoded.to_vec();
                all.extend_from_slice(&tail);
                Ok(all.into())
            }
            None => Ok(decoded),
        }
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

#[derive(Debug)]
enum Stage {
    Start,
    Headers,
    Body(BodyDecoder),
    Done,
}

/// Receives one response: status line, headers and body.
///
/// Body bytes go to the sink of the request. Bytes the sink cannot accept yet are held
/// until [`ResponseDecoder::flush`] delivers them.
#[derive(Debug)]
pub struct ResponseDecoder {
    method: Method,
    stage: Stage,
    version: Version,
    status: Option<StatusCode>,
    reason: String,
    headers: HeaderMap,
    keep_alive: bool,
    pending: Bytes,
    sink: Sink,
}

impl ResponseDecoder {
    pub(crate) fn new(method: Method, sink: Sink) -> Self {
        Self {
            method,
            stage: Stage::Start,
            version: Version::HTTP_11,
            status: None,
            reason: String::new(),
            headers: HeaderMap::new(),
            keep_alive: true,
            pending: Bytes::new(),
            sink,
        }
    }

    /// The unit of input needed next.
    pub fn recv_mode(&self) -> RecvMode {
        if !self.pending.is_empty() {
            return RecvMode::Flush;
        }
        match &self.stage {
            Stage::Start => RecvMode::Line,
            Stage::Headers => RecvMode::HeaderBlock,
            Stage::Body(body) => body.mode(),
            Stage::Done => RecvMode::Done,
        }
    }

    /// The status code, once the status line has been received.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The protocol version the server answered with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether the connection may carry another exchange after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether a complete interim (1xx) response has been received.
    pub fn is_interim(&self) -> bool {
        matches!(self.stage, Stage::Done) && self.status.is_some_and(|s| s.is_informational())
    }

    /// Accept exactly the unit requested by [`ResponseDecoder::recv_mode`].
    pub fn recv(&mut self, data: &[u8]) -> Result<(), Error> {
        match &mut self.stage {
            Stage::Start => {
                // an empty line may precede the status line
                if data == b"\r\n" {
                    return Ok(());
                }
                let (version, status, reason) = headers::parse_status_line(data)?;
                trace!(?version, %status, "status line");
                self.version = version;
                self.status = Some(status);
                self.reason = reason;
                self.stage = Stage::Headers;
            }
            Stage::Headers => {
                self.headers = headers::parse_header_block(data)?;
                let status = self.status.unwrap_or(StatusCode::OK);
                if status == StatusCode::SWITCHING_PROTOCOLS {
                    return Err(FramingError::UnexpectedSwitch.into());
                }
                if status.is_informational() {
                    self.stage = Stage::Done;
                    return Ok(());
                }

                let (framing, codings) = framing::recv_response(&self.method, status, &self.headers)?;
                self.keep_alive =
                    headers::keep_alive(self.version, &self.headers) && framing != Framing::UntilClose;
                trace!(?framing, keep_alive = self.keep_alive, "response headers");
                self.stage = Stage::Body(BodyDecoder::new(framing, &codings));
                self.complete_if_done()?;
            }
            Stage::Body(body) => {
                let decoded = body.recv(data)?;
                self.deliver(decoded)?;
                self.complete_if_done()?;
            }
            Stage::Done => {}
        }
        Ok(())
    }

    /// The peer closed the stream while the decoder waited for more input.
    pub fn recv_eof(&mut self) -> Result<(), Error> {
        match &mut self.stage {
            Stage::Body(body) => {
                let decoded = body.recv_eof()?;
                self.deliver(decoded)?;
                self.complete_if_done()
            }
            _ => Err(Error::eof()),
        }
    }

    /// Retry delivering held body bytes to the sink.
    pub fn flush(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending);
        self.deliver(pending)?;
        self.complete_if_done()
    }

    /// Start over after an interim response, keeping the sink.
    pub fn restart(&mut self) {
        self.stage = Stage::Start;
        self.status = None;
        self.reason.clear();
        self.headers.clear();
        self.keep_alive = true;
    }

    /// Start over for a fresh transmission of the request, discarding anything received.
    pub(crate) fn reset(&mut self) {
        self.restart();
        self.pending = Bytes::new();
        self.sink.reset();
    }

    fn deliver(&mut self, mut data: Bytes) -> Result<(), Error> {
        while !data.is_empty() {
            match self.sink.write(&data) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = data.split_to(n.min(data.len()));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(Error::Body(Arc::new(err))),
            }
        }
        self.pending = data;
        Ok(())
    }

    fn complete_if_done(&mut self) -> Result<(), Error> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        let Stage::Body(body) = &mut self.stage else {
            return Ok(());
        };
        if body.mode() != RecvMode::Done {
            return Ok(());
        }
        if let Some(trailers) = body.take_trailers() {
            for (name, value) in trailers {
                if let Some(name) = name {
                    self.headers.append(name, value);
                }
            }
        }
        self.sink
            .flush()
            .map_err(|err| Error::Body(Arc::new(err)))?;
        self.stage = Stage::Done;
        Ok(())
    }

    pub(crate) fn sink_mut(&mut self) -> &mut Sink {
        &mut self.sink
    }

    /// Take the completed response, replacing it with a fresh decoder for `method`.
    pub(crate) fn take_response(&mut self, uri: Uri) -> Response {
        let fresh = ResponseDecoder::new(self.method.clone(), Sink::default());
        let decoder = std::mem::replace(self, fresh);
        Response::new(
            decoder.status.unwrap_or(StatusCode::OK),
            decoder.reason,
            decoder.version,
            decoder.headers,
            decoder.sink,
            uri,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::body::BodySink;

    /// Feed `wire` in the units the decoder asks for, at most `step` raw bytes at a time.
    fn feed(decoder: &mut ResponseDecoder, wire: &[u8], step: usize) -> Result<usize, Error> {
        let mut offset = 0;
        loop {
            let rest = &wire[offset..];
            let take = match decoder.recv_mode() {
                RecvMode::Done | RecvMode::Flush => return Ok(offset),
                RecvMode::Line => match rest.windows(2).position(|w| w == b"\r\n") {
                    Some(at) => at + 2,
                    None => return Ok(offset),
                },
                RecvMode::HeaderBlock if rest.starts_with(b"\r\n") => 2,
                RecvMode::HeaderBlock => match rest.windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(at) => at + 4,
                    None => return Ok(offset),
                },
                RecvMode::Bytes(n) => n.min(step).min(rest.len()),
                RecvMode::UntilClose => rest.len().min(step),
            };
            if take == 0 {
                return Ok(offset);
            }
            decoder.recv(&rest[..take])?;
            offset += take;
        }
    }

    fn body_of(response: Response) -> Bytes {
        response.body().clone()
    }

    #[test]
    fn content_length_any_fragmentation() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789HTTP/1.1 204";
        for step in 1..=11 {
            let mut decoder = ResponseDecoder::new(Method::GET, Sink::default());
            let consumed = feed(&mut decoder, wire, step).unwrap();
            assert_eq!(decoder.recv_mode(), RecvMode::Done);
            assert_eq!(&wire[consumed..], b"HTTP/1.1 204", "excess bytes are left for the next message");
            assert!(decoder.keep_alive());
            let response = decoder.take_response(Uri::from_static("http://example.com/"));
            assert_eq!(body_of(response), Bytes::from_static(b"0123456789"));
        }
    }

    #[test]
    fn chunked_with_trailers() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Checksum: abc\r\n\r\n";
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::default());
        feed(&mut decoder, wire, 4).unwrap();
        assert_eq!(decoder.recv_mode(), RecvMode::Done);
        let response = decoder.take_response(Uri::from_static("http://example.com/"));
        assert_eq!(response.headers()["x-checksum"], "abc");
        assert_eq!(body_of(response), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn missing_chunk_terminator() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhelloXX\r\n";
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::default());
        let err = feed(&mut decoder, wire, 64).unwrap_err();
        assert!(matches!(err, Error::Protocol(FramingError::ChunkTerminator)));
    }

    #[test]
    fn conflicting_lengths_deliver_nothing() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 50\r\n\r\n\
            5\r\nhello\r\n0\r\n\r\n";
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::Custom(Box::new(Vec::new())));
        let err = feed(&mut decoder, wire, 64).unwrap_err();
        assert!(matches!(err, Error::Protocol(FramingError::ConflictingLength)));
        match decoder.sink_mut() {
            Sink::Custom(_) => {}
            other => panic!("unexpected sink {other:?}"),
        }
        let response = decoder.take_response(Uri::from_static("http://example.com/"));
        assert!(response.body().is_empty());
    }

    #[test]
    fn read_until_close() {
        let wire = b"HTTP/1.0 200 OK\r\n\r\nsome bytes";
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::default());
        feed(&mut decoder, wire, 3).unwrap();
        assert_eq!(decoder.recv_mode(), RecvMode::UntilClose);
        assert!(!decoder.keep_alive());
        decoder.recv_eof().unwrap();
        assert_eq!(decoder.recv_mode(), RecvMode::Done);
        assert_eq!(
            body_of(decoder.take_response(Uri::from_static("http://example.com/"))),
            Bytes::from_static(b"some bytes")
        );
    }

    #[test]
    fn truncated_length_is_an_error() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123";
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::default());
        feed(&mut decoder, wire, 64).unwrap();
        assert!(matches!(decoder.recv_eof(), Err(Error::Transport(_))));
    }

    #[test]
    fn interim_responses() {
        let wire = b"HTTP/1.1 100 Continue\r\n\r\n";
        let mut decoder = ResponseDecoder::new(Method::POST, Sink::default());
        feed(&mut decoder, wire, 64).unwrap();
        assert!(decoder.is_interim());
        decoder.restart();
        assert_eq!(decoder.recv_mode(), RecvMode::Line);

        let wire = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::default());
        let err = feed(&mut decoder, wire, 64).unwrap_err();
        assert!(matches!(err, Error::Protocol(FramingError::UnexpectedSwitch)));
    }

    #[test]
    fn head_has_no_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let mut decoder = ResponseDecoder::new(Method::HEAD, Sink::default());
        feed(&mut decoder, wire, 64).unwrap();
        assert_eq!(decoder.recv_mode(), RecvMode::Done);
    }

    /// Accepts a limited number of bytes, then blocks.
    #[derive(Debug, Default)]
    struct Trickle {
        budget: usize,
        data: Vec<u8>,
    }

    impl BodySink for Trickle {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.budget.min(data.len());
            self.budget -= n;
            self.data.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    #[test]
    fn blocked_sink_holds_bytes() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nabcdef";
        let sink = Trickle {
            budget: 2,
            data: Vec::new(),
        };
        let mut decoder = ResponseDecoder::new(Method::GET, Sink::Custom(Box::new(sink)));
        let consumed = feed(&mut decoder, wire, 64).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoder.recv_mode(), RecvMode::Flush);

        decoder.flush().unwrap();
        assert_eq!(decoder.recv_mode(), RecvMode::Flush);
    }
}
