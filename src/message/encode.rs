use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::chunked;
use super::coding::{Coding, EncodeChain};
use super::framing::Framing;
use super::{RequestError, MAX_CHUNK};
use crate::body::{BodySource, Pull};
use crate::client::Error;

/// The next piece of an outgoing body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendChunk {
    /// Bytes ready for the wire, already framed.
    Data(Bytes),

    /// The body source has nothing ready.
    Blocked,

    /// The body has been sent completely.
    Empty,
}

/// Frames an outgoing body for the wire.
#[derive(Debug)]
pub struct BodyEncoder {
    framing: Framing,
    chain: Option<EncodeChain>,
    pulled: u64,
    aborted: bool,
    finished: bool,
}

impl BodyEncoder {
    /// Create an encoder for a body with the given framing and transfer-codings.
    pub fn new(framing: Framing, codings: &[Coding]) -> Self {
        Self {
            framing,
            chain: EncodeChain::new(codings),
            pulled: 0,
            aborted: false,
            finished: false,
        }
    }

    /// Produce the next piece of the body from `source`.
    ///
    /// Chunked bodies yield one chunk per call, reading at most [`MAX_CHUNK`] bytes from
    /// the source.
    pub fn next(&mut self, source: &mut dyn BodySource) -> Result<SendChunk, Error> {
        if self.finished {
            return Ok(SendChunk::Empty);
        }

        match self.framing {
            Framing::Length(declared) => self.next_length(source, declared),
            Framing::Chunked => self.next_chunk(source),
            Framing::UntilClose => self.next_raw(source),
        }
    }

    fn pull(&mut self, source: &mut dyn BodySource, max: usize) -> Result<Pull, Error> {
        let pulled = source.pull(max).map_err(|err| Error::Body(Arc::new(err)))?;
        if let Pull::Data(data) = &pulled {
            self.pulled += data.len() as u64;
        }
        Ok(pulled)
    }

    fn encode(&mut self, data: &[u8]) -> Result<Bytes, Error> {
        match &mut self.chain {
            Some(chain) => chain.encode(data).map_err(|err| Error::Body(Arc::new(err))),
            None => Ok(Bytes::copy_from_slice(data)),
        }
    }

    fn finish_chain(&mut self) -> Result<Bytes, Error> {
        match self.chain.take() {
            Some(chain) => chain.finish().map_err(|err| Error::Body(Arc::new(err))),
            None => Ok(Bytes::new()),
        }
    }

    fn next_length(&mut self, source: &mut dyn BodySource, declared: u64) -> Result<SendChunk, Error> {
        let remaining = declared - self.pulled.min(declared);
        let max = usize::try_from(remaining).unwrap_or(usize::MAX).clamp(1, MAX_CHUNK);

        match self.pull(source, max)? {
            Pull::Data(data) if data.is_empty() => Ok(SendChunk::Blocked),
            Pull::Data(data) => {
                if self.pulled > declared {
                    return Err(RequestError::LengthMismatch {
                        declared,
                        actual: self.pulled,
                    }
                    .into());
                }
                Ok(SendChunk::Data(data))
            }
            Pull::Blocked => Ok(SendChunk::Blocked),
            Pull::End if self.pulled < declared => Err(RequestError::LengthMismatch {
                declared,
                actual: self.pulled,
            }
            .into()),
            Pull::End => {
                self.finished = true;
                Ok(SendChunk::Empty)
            }
        }
    }

    fn next_chunk(&mut self, source: &mut dyn BodySource) -> Result<SendChunk, Error> {
        if self.aborted {
            self.finished = true;
            self.chain = None;
            return Ok(SendChunk::Data(Bytes::from_static(chunked::TERMINATOR)));
        }

        loop {
            match self.pull(source, MAX_CHUNK)? {
                Pull::Data(data) => {
                    let encoded = self.encode(&data)?;
                    // compressors may buffer a whole pull
                    if !encoded.is_empty() {
                        return Ok(SendChunk::Data(chunked::frame(&encoded)));
                    }
                }
                Pull::Blocked => return Ok(SendChunk::Blocked),
                Pull::End => {
                    let tail = self.finish_chain()?;
                    let mut last = BytesMut::with_capacity(tail.len() + 32);
                    if !tail.is_empty() {
                        last.extend_from_slice(&chunked::frame(&tail));
                    }
                    last.extend_from_slice(chunked::TERMINATOR);
                    self.finished = true;
                    return Ok(SendChunk::Data(last.freeze()));
                }
            }
        }
    }

    fn next_raw(&mut self, source: &mut dyn BodySource) -> Result<SendChunk, Error> {
        loop {
            match self.pull(source, MAX_CHUNK)? {
                Pull::Data(data) => {
                    let encoded = self.encode(&data)?;
                    if !encoded.is_empty() {
                        return Ok(SendChunk::Data(encoded));
                    }
                }
                Pull::Blocked => return Ok(SendChunk::Blocked),
                Pull::End => {
                    let tail = self.finish_chain()?;
                    if tail.is_empty() {
                        self.finished = true;
                        return Ok(SendChunk::Empty);
                    }
                    return Ok(SendChunk::Data(tail));
                }
            }
        }
    }

    /// Stop sending the body as soon as the framing allows.
    ///
    /// Returns the number of body bytes which must still be written, or `None` when that
    /// is unknown. A chunked body ends with the next call to [`BodyEncoder::next`]; other
    /// framings cannot be cut short, so the remaining bytes are still produced.
    pub fn abort(&mut self) -> Option<u64> {
        if self.finished {
            return Some(0);
        }
        match self.framing {
            Framing::Chunked => {
                self.aborted = true;
                Some(0)
            }
            Framing::Length(declared) => Some(declared.saturating_sub(self.pulled)),
            Framing::UntilClose => None,
        }
    }
}
