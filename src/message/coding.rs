//! Transfer-codings which transform the body bytes themselves.
//!
//! Compression happens before chunk framing on the way out and after chunk framing is
//! removed on the way in. Every stage writes into a `Vec<u8>` which is drained after each
//! call, so the chain never buffers more than one call's worth of output.

use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;

/// A transfer-coding named in a Transfer-Encoding header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    /// Chunked framing. Only valid as the final coding.
    Chunked,

    /// gzip compression (also spelled `x-gzip`).
    Gzip,

    /// zlib compression.
    Deflate,
}

impl Coding {
    /// Recognize a lower cased coding token.
    pub fn from_token(token: &str) -> Option<Coding> {
        match token {
            "chunked" => Some(Coding::Chunked),
            "gzip" | "x-gzip" => Some(Coding::Gzip),
            "deflate" => Some(Coding::Deflate),
            _ => None,
        }
    }
}

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl Encoder {
    fn write(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Encoder::Gzip(encoder) => {
                encoder.write_all(data)?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            Encoder::Deflate(encoder) => {
                encoder.write_all(data)?;
                Ok(std::mem::take(encoder.get_mut()))
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Encoder::Gzip(encoder) => encoder.finish(),
            Encoder::Deflate(encoder) => encoder.finish(),
        }
    }
}

enum Decoder {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl Decoder {
    fn write(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Decoder::Gzip(decoder) => {
                decoder.write_all(data)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Decoder::Deflate(decoder) => {
                decoder.write_all(data)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Decoder::Gzip(decoder) => decoder.finish(),
            Decoder::Deflate(decoder) => decoder.finish(),
        }
    }
}

/// Compressors applied to an outgoing body, in the order they are listed.
pub(crate) struct EncodeChain {
    stages: Vec<Encoder>,
}

impl std::fmt::Debug for EncodeChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl EncodeChain {
    /// Build a chain from codings, ignoring chunked framing. Returns `None` when empty.
    pub(crate) fn new(codings: &[Coding]) -> Option<Self> {
        let stages: Vec<_> = codings
            .iter()
            .filter_map(|coding| match coding {
                Coding::Chunked => None,
                Coding::Gzip => Some(Encoder::Gzip(GzEncoder::new(Vec::new(), Compression::default()))),
                Coding::Deflate => Some(Encoder::Deflate(ZlibEncoder::new(
                    Vec::new(),
                    Compression::default(),
                ))),
            })
            .collect();
        (!stages.is_empty()).then_some(Self { stages })
    }

    pub(crate) fn encode(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let mut buf = data.to_vec();
        for stage in &mut self.stages {
            buf = stage.write(&buf)?;
        }
        Ok(buf.into())
    }

    pub(crate) fn finish(self) -> io::Result<Bytes> {
        let mut buf: Vec<u8> = Vec::new();
        for mut stage in self.stages {
            let mut out = if buf.is_empty() {
                Vec::new()
            } else {
                stage.write(&buf)?
            };
            out.extend(stage.finish()?);
            buf = out;
        }
        Ok(buf.into())
    }
}

/// Decompressors for an incoming body, applied in reverse of the listed order.
pub(crate) struct DecodeChain {
    stages: Vec<Decoder>,
}

impl std::fmt::Debug for DecodeChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl DecodeChain {
    pub(crate) fn new(codings: &[Coding]) -> Option<Self> {
        let stages: Vec<_> = codings
            .iter()
            .rev()
            .filter_map(|coding| match coding {
                Coding::Chunked => None,
                Coding::Gzip => Some(Decoder::Gzip(GzDecoder::new(Vec::new()))),
                Coding::Deflate => Some(Decoder::Deflate(ZlibDecoder::new(Vec::new()))),
            })
            .collect();
        (!stages.is_empty()).then_some(Self { stages })
    }

    pub(crate) fn decode(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let mut buf = data.to_vec();
        for stage in &mut self.stages {
            buf = stage.write(&buf)?;
        }
        Ok(buf.into())
    }

    pub(crate) fn finish(self) -> io::Result<Bytes> {
        let mut buf: Vec<u8> = Vec::new();
        for mut stage in self.stages {
            let mut out = if buf.is_empty() {
                Vec::new()
            } else {
                stage.write(&buf)?
            };
            out.extend(stage.finish()?);
            buf = out;
        }
        Ok(buf.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_then_deflate_round_trip() {
        let codings = [Coding::Gzip, Coding::Deflate, Coding::Chunked];
        let mut encoder = EncodeChain::new(&codings).unwrap();
        let mut wire = Vec::new();
        for part in [&b"hello "[..], b"compressed ", b"world"] {
            wire.extend_from_slice(&encoder.encode(part).unwrap());
        }
        wire.extend_from_slice(&encoder.finish().unwrap());

        let mut decoder = DecodeChain::new(&codings).unwrap();
        let mut plain = Vec::new();
        for part in wire.chunks(3) {
            plain.extend_from_slice(&decoder.decode(part).unwrap());
        }
        plain.extend_from_slice(&decoder.finish().unwrap());
        assert_eq!(plain, b"hello compressed world");
    }

    #[test]
    fn chunked_alone_is_no_chain() {
        assert!(EncodeChain::new(&[Coding::Chunked]).is_none());
        assert!(DecodeChain::new(&[]).is_none());
    }

    #[test]
    fn garbage_fails_to_decode() {
        let mut decoder = DecodeChain::new(&[Coding::Gzip]).unwrap();
        let outcome = decoder
            .decode(b"definitely not gzip data")
            .and_then(|_| decoder.finish());
        assert!(outcome.is_err());
    }
}
