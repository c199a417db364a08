//! Recognizers and formatters for the handful of header grammars the engine depends on.
//!
//! Everything here is stateless text handling. Header blocks are tokenised by `httparse`;
//! the rest are small parsers for the values which drive framing decisions.

use bytes::{BufMut, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};

use super::coding::Coding;
use super::FramingError;

/// Maximum number of headers accepted in one block.
pub(crate) const MAX_HEADERS: usize = 128;

/// The version token written on the start line.
pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(token: &[u8]) -> Result<Version, FramingError> {
    let digits = token
        .strip_prefix(b"HTTP/")
        .ok_or(FramingError::StatusLine)?;
    match digits {
        [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
            match (major - b'0', minor - b'0') {
                (0, 9) => Ok(Version::HTTP_09),
                (1, 0) => Ok(Version::HTTP_10),
                (1, _) => Ok(Version::HTTP_11),
                _ => Err(FramingError::Version),
            }
        }
        _ => Err(FramingError::StatusLine),
    }
}

/// Parse a status line, with or without its trailing CRLF.
pub(crate) fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String), FramingError> {
    let line = trim_crlf(line);
    let mut parts = line.splitn(3, |b| *b == b' ');
    let version = parse_version(parts.next().ok_or(FramingError::StatusLine)?)?;
    let code = parts.next().ok_or(FramingError::StatusLine)?;
    if code.len() != 3 {
        return Err(FramingError::StatusLine);
    }
    let status = StatusCode::from_bytes(code).map_err(|_| FramingError::StatusLine)?;
    let reason = parts
        .next()
        .map(|reason| String::from_utf8_lossy(reason).trim().to_owned())
        .unwrap_or_default();
    Ok((version, status, reason))
}

/// Parse a header block terminated by an empty line.
///
/// A block consisting of a bare CRLF holds no headers.
pub(crate) fn parse_header_block(block: &[u8]) -> Result<HeaderMap, FramingError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let parsed = match httparse::parse_headers(block, &mut raw) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        Ok(httparse::Status::Partial) => return Err(FramingError::HeaderBlock),
        Err(httparse::Error::TooManyHeaders) => return Err(FramingError::TooManyHeaders),
        Err(_) => return Err(FramingError::HeaderBlock),
    };

    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| FramingError::HeaderBlock)?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| FramingError::HeaderBlock)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Write a header map in wire format, without the terminating empty line.
pub(crate) fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Comma separated tokens over every instance of `name`, lower cased and trimmed.
fn tokens(headers: &HeaderMap, name: &HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| {
            // transfer-coding parameters are not interpreted
            let token = token.split(';').next().unwrap_or_default();
            token.trim().to_ascii_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// The value of Content-Length, if present.
///
/// Repeated values must agree, and the value must be plain decimal digits.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, FramingError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        for part in value.as_bytes().split(|b| *b == b',') {
            let part = trim_ows(part);
            if part.is_empty() || !part.iter().all(u8::is_ascii_digit) {
                return Err(FramingError::ContentLength);
            }
            let n = std::str::from_utf8(part)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(FramingError::ContentLength)?;
            match length {
                Some(previous) if previous != n => return Err(FramingError::ContentLength),
                _ => length = Some(n),
            }
        }
    }
    Ok(length)
}

/// The transfer-codings listed in Transfer-Encoding, in the order they were applied.
///
/// `identity` is dropped. Unknown codings are an error.
pub(crate) fn transfer_codings(headers: &HeaderMap) -> Result<Vec<Coding>, FramingError> {
    tokens(headers, &header::TRANSFER_ENCODING)
        .into_iter()
        .filter(|token| token != "identity")
        .map(|token| Coding::from_token(&token).ok_or(FramingError::UnsupportedCoding(token)))
        .collect()
}

/// Whether the Connection header lists `token`.
pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    tokens(headers, &header::CONNECTION)
        .iter()
        .any(|t| t == token)
}

/// Whether the message asks for `100-continue`.
pub(crate) fn expects_continue(headers: &HeaderMap) -> bool {
    tokens(headers, &header::EXPECT)
        .iter()
        .any(|t| t == "100-continue")
}

/// Whether a connection may be reused after a message with these headers.
pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if version <= Version::HTTP_10 {
        return connection_has(headers, "keep-alive") && !connection_has(headers, "close");
    }
    !connection_has(headers, "close")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        let (version, status, reason) = parse_status_line(b"HTTP/1.1 404 Not Found\r\n").unwrap();
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reason, "Not Found");

        let (version, status, reason) = parse_status_line(b"HTTP/1.0 200").unwrap();
        assert_eq!(version, Version::HTTP_10);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reason, "");

        assert_eq!(
            parse_status_line(b"HTTP/1.1 2000 OK\r\n"),
            Err(FramingError::StatusLine)
        );
        assert_eq!(
            parse_status_line(b"ICY 200 OK\r\n"),
            Err(FramingError::StatusLine)
        );
        assert_eq!(
            parse_status_line(b"HTTP/2.0 200 OK\r\n"),
            Err(FramingError::Version)
        );
    }

    #[test]
    fn header_blocks() {
        let headers = parse_header_block(b"\r\n").unwrap();
        assert!(headers.is_empty());

        let headers =
            parse_header_block(b"Content-Length: 5\r\nSet-Cookie: a\r\nset-cookie: b\r\n\r\n").unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);

        assert_eq!(
            parse_header_block(b"bad header\r\n\r\n"),
            Err(FramingError::HeaderBlock)
        );
    }

    #[test]
    fn content_lengths() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), Ok(None));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Ok(Some(42)));

        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("42, 42"));
        assert_eq!(content_length(&headers), Ok(Some(42)));

        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("41"));
        assert_eq!(content_length(&headers), Err(FramingError::ContentLength));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("+5"));
        assert_eq!(content_length(&headers), Err(FramingError::ContentLength));
    }

    #[test]
    fn codings_and_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("gzip, identity, Chunked"),
        );
        assert_eq!(
            transfer_codings(&headers),
            Ok(vec![Coding::Gzip, Coding::Chunked])
        );

        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(
            transfer_codings(&headers),
            Err(FramingError::UnsupportedCoding("br".into()))
        );

        headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive, Close"));
        assert!(connection_has(&headers, "close"));
        assert!(!keep_alive(Version::HTTP_11, &headers));
        assert!(!keep_alive(Version::HTTP_10, &HeaderMap::new()));
        assert!(!keep_alive(Version::HTTP_10, &headers));
        let mut persistent = HeaderMap::new();
        persistent.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(keep_alive(Version::HTTP_10, &persistent));
        assert!(keep_alive(Version::HTTP_11, &HeaderMap::new()));

        headers.insert(header::EXPECT, HeaderValue::from_static("100-Continue"));
        assert!(expects_continue(&headers));
    }
}
