//! Chunked transfer-coding grammar.

use bytes::{BufMut, Bytes, BytesMut};

use super::FramingError;

/// The zero-size chunk and empty trailer which end a chunked body.
pub(crate) const TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Parse a chunk-size line: hex digits, optional `;` extensions, CRLF.
pub(crate) fn parse_size(line: &[u8]) -> Result<u64, FramingError> {
    let line = line.strip_suffix(b"\r\n").ok_or(FramingError::ChunkSize)?;
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let size = match size.iter().rposition(|b| !matches!(b, b' ' | b'\t')) {
        Some(end) => &size[..=end],
        None => return Err(FramingError::ChunkSize),
    };
    if size.len() > 16 {
        return Err(FramingError::ChunkSize);
    }

    size.iter().try_fold(0u64, |acc, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(FramingError::ChunkSize),
        };
        Ok(acc << 4 | u64::from(digit))
    })
}

/// Frame `data` as a single chunk. Empty data would end the body, so it is not allowed.
pub(crate) fn frame(data: &[u8]) -> Bytes {
    debug_assert!(!data.is_empty(), "an empty chunk terminates the body");
    let mut dst = BytesMut::with_capacity(data.len() + 20);
    dst.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
    dst.freeze()
}
