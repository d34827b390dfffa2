//! Incremental HTTP/1.1 request parsing (RFC 7230).
//!
//! `parse_head` consumes nothing until a complete head is buffered, so the
//! caller just appends transport reads and retries: `Ok(None)` means more
//! bytes are needed, `Err` carries the status the peer must see. Body
//! decoding is a separate state machine because bodies stream through the
//! receive queue one chunk at a time.

use crate::{
    errors::ProtocolError,
    limits::ConnLimits,
    scope::{trim_ows, HeaderList, Method, Version},
};
use bytes::{Bytes, BytesMut};
use memchr::{memchr, memmem};

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
}

/// A parsed request line and header block.
#[derive(Debug, PartialEq)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) target: Bytes,
    pub(crate) raw_path: Bytes,
    pub(crate) path: String,
    pub(crate) query: Bytes,
    pub(crate) headers: HeaderList,
    pub(crate) body: BodyKind,
    pub(crate) keep_alive: bool,
}

/// Tries to parse one request head from the front of `buf`.
///
/// On success the head bytes are consumed from `buf`; body bytes (if any)
/// remain. `Ok(None)` means the head is not complete yet.
pub(crate) fn parse_head(
    buf: &mut BytesMut,
    limits: &ConnLimits,
) -> Result<Option<RequestHead>, ProtocolError> {
    let Some(head_end) = memmem::find(buf, b"\r\n\r\n") else {
        if buf.len() > limits.max_head_size {
            return Err(ProtocolError::HeadersTooLarge);
        }
        return Ok(None);
    };
    if head_end + 4 > limits.max_head_size {
        return Err(ProtocolError::HeadersTooLarge);
    }

    let head = buf.split_to(head_end + 4).freeze();
    let line_end = memmem::find(&head, b"\r\n").expect("head contains CRLF");

    let (method, version, target) = parse_request_line(&head, line_end)?;
    let headers = parse_headers(&head, line_end + 2, head_end)?;
    let body = body_framing(&headers, version, limits)?;
    let keep_alive = keep_alive(&headers, version);
    let (raw_path, query) = split_target(&target)?;
    let path = percent_decode(&raw_path);

    Ok(Some(RequestHead {
        method,
        version,
        target,
        raw_path,
        path,
        query,
        headers,
        body,
        keep_alive,
    }))
}

fn parse_request_line(
    head: &Bytes,
    line_end: usize,
) -> Result<(Method, Version, Bytes), ProtocolError> {
    let line = &head[..line_end];
    let (method, after_method) = Method::from_bytes(line)?;

    let rest = &line[after_method..];
    let target_end = memchr(b' ', rest).ok_or(ProtocolError::InvalidTarget)?;
    if target_end == 0 {
        return Err(ProtocolError::InvalidTarget);
    }

    let target_bytes = &rest[..target_end];
    if !(target_bytes[0] == b'/' || target_bytes == b"*") {
        return Err(ProtocolError::InvalidTarget);
    }
    if target_bytes.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(ProtocolError::InvalidTarget);
    }

    let version_bytes = &rest[target_end + 1..];
    if version_bytes.len() != 8 {
        return Err(ProtocolError::InvalidVersion);
    }
    let (version, _) = Version::from_bytes(version_bytes)?;

    let start = after_method;
    let target = head.slice(start..start + target_end);
    Ok((method, version, target))
}

fn parse_headers(
    head: &Bytes,
    mut at: usize,
    block_end: usize,
) -> Result<HeaderList, ProtocolError> {
    let mut headers = HeaderList::with_capacity(16);

    while at < block_end {
        let line_len =
            memmem::find(&head[at..], b"\r\n").ok_or(ProtocolError::InvalidHeader)?;
        let line = &head[at..at + line_len];

        let colon = memchr(b':', line).ok_or(ProtocolError::InvalidHeader)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
            return Err(ProtocolError::InvalidHeader);
        }

        let value = trim_ows(&line[colon + 1..]);
        if value.iter().any(|&b| b == 0 || b == b'\r' || b == b'\n') {
            return Err(ProtocolError::InvalidHeader);
        }

        let mut lowered = name.to_vec();
        lowered.make_ascii_lowercase();
        headers.push_lowercase(Bytes::from(lowered), Bytes::copy_from_slice(value));

        at += line_len + 2;
    }

    Ok(headers)
}

// RFC 7230 token characters, the only bytes legal in a header name.
#[inline]
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
        | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

/// Decides body framing from `content-length` / `transfer-encoding`.
///
/// Exactly one signal is allowed; anything else is a 400-class error.
fn body_framing(
    headers: &HeaderList,
    version: Version,
    limits: &ConnLimits,
) -> Result<BodyKind, ProtocolError> {
    let mut content_length: Option<u64> = None;
    for value in headers.get_all(b"content-length") {
        let parsed = parse_decimal(value).ok_or(ProtocolError::InvalidContentLength)?;
        match content_length {
            Some(previous) if previous != parsed => {
                return Err(ProtocolError::InvalidContentLength)
            }
            _ => content_length = Some(parsed),
        }
    }

    let mut chunked = false;
    for value in headers.get_all(b"transfer-encoding") {
        if trim_ows(value).eq_ignore_ascii_case(b"chunked") {
            chunked = true;
        } else {
            return Err(ProtocolError::AmbiguousFraming);
        }
    }

    match (chunked, content_length) {
        (true, Some(_)) => Err(ProtocolError::AmbiguousFraming),
        (true, None) if version == Version::Http10 => Err(ProtocolError::AmbiguousFraming),
        (true, None) => Ok(BodyKind::Chunked),
        (false, Some(0)) | (false, None) => Ok(BodyKind::Empty),
        (false, Some(n)) if n > limits.max_body_size as u64 => Err(ProtocolError::BodyTooLarge),
        (false, Some(n)) => Ok(BodyKind::Length(n)),
    }
}

fn keep_alive(headers: &HeaderList, version: Version) -> bool {
    if headers.contains_token(b"connection", b"close") {
        return false;
    }
    match version {
        Version::Http11 => true,
        Version::Http10 => headers.contains_token(b"connection", b"keep-alive"),
    }
}

#[inline]
fn parse_decimal(src: &[u8]) -> Option<u64> {
    let src = trim_ows(src);
    if src.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in src {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

fn split_target(target: &Bytes) -> Result<(Bytes, Bytes), ProtocolError> {
    match memchr(b'?', target) {
        Some(q) => Ok((target.slice(..q), target.slice(q + 1..))),
        None => Ok((target.clone(), Bytes::new())),
    }
}

/// Percent-decodes a path; invalid escapes pass through literally, and the
/// result is interpreted as UTF-8 with replacement.
pub(crate) fn percent_decode(src: &[u8]) -> String {
    let mut out = Vec::with_capacity(src.len());
    let mut at = 0;
    while at < src.len() {
        if src[at] == b'%' && at + 2 < src.len() {
            if let (Some(hi), Some(lo)) = (hex_val(src[at + 1]), hex_val(src[at + 2])) {
                out.push(hi << 4 | lo);
                at += 3;
                continue;
            }
        }
        out.push(src[at]);
        at += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[inline]
fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// CHUNKED BODIES

/// Output of one decoder step.
#[derive(Debug, PartialEq)]
pub(crate) enum Chunk {
    /// A slice of body data. One wire chunk may surface as several of
    /// these when it arrives split across reads.
    Data(Bytes),
    /// The terminating zero chunk and its trailer block are fully consumed.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
    Done,
}

/// Streaming `transfer-encoding: chunked` decoder.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

// Size line cap: 16 hex digits, extensions, CRLF.
const MAX_CHUNK_LINE: usize = 128;

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Decodes the next piece from `buf`, consuming what it uses.
    /// `Ok(None)` means more transport bytes are needed.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Chunk>, ProtocolError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line_len) = memmem::find(buf, b"\r\n") else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(ProtocolError::InvalidChunk);
                        }
                        return Ok(None);
                    };
                    if line_len > MAX_CHUNK_LINE {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    let size = parse_chunk_size(&buf[..line_len])?;
                    let _ = buf.split_to(line_len + 2);
                    self.state = match size {
                        0 => ChunkState::Trailers,
                        n => ChunkState::Data(n),
                    };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (remaining as usize).min(buf.len());
                    let data = buf.split_to(take).freeze();
                    self.state = match remaining - take as u64 {
                        0 => ChunkState::DataCrlf,
                        left => ChunkState::Data(left),
                    };
                    return Ok(Some(Chunk::Data(data)));
                }
                ChunkState::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    let _ = buf.split_to(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line_len) = memmem::find(buf, b"\r\n") else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(ProtocolError::InvalidChunk);
                        }
                        return Ok(None);
                    };
                    let _ = buf.split_to(line_len + 2);
                    if line_len == 0 {
                        self.state = ChunkState::Done;
                        return Ok(Some(Chunk::Complete));
                    }
                    // Trailer fields are consumed and discarded.
                }
                ChunkState::Done => return Ok(Some(Chunk::Complete)),
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let digits = match memchr(b';', line) {
        Some(sc) => &line[..sc],
        None => line,
    };
    let digits = trim_ows(digits);
    if digits.is_empty() {
        return Err(ProtocolError::InvalidChunk);
    }

    let mut size: u64 = 0;
    for &b in digits {
        let value = hex_val(b).ok_or(ProtocolError::InvalidChunk)?;
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(value)))
            .ok_or(ProtocolError::InvalidChunk)?;
    }
    Ok(size)
}

#[cfg(test)]
mod head {
    use super::*;

    fn parse(src: &str) -> Result<Option<RequestHead>, ProtocolError> {
        let mut buf = BytesMut::from(src.as_bytes());
        parse_head(&mut buf, &ConnLimits::default())
    }

    #[test]
    fn complete_requests() {
        #[rustfmt::skip]
        let cases = [
            (
                "GET /hello HTTP/1.1\r\nHost: x\r\n\r\n",
                (Method::Get, Version::Http11, "/hello", "", BodyKind::Empty, true),
            ),
            (
                "POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\n",
                (Method::Post, Version::Http11, "/x", "", BodyKind::Length(5), true),
            ),
            (
                "GET /a/b?k=v&d HTTP/1.0\r\n\r\n",
                (Method::Get, Version::Http10, "/a/b", "k=v&d", BodyKind::Empty, false),
            ),
            (
                "GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
                (Method::Get, Version::Http10, "/", "", BodyKind::Empty, true),
            ),
            (
                "GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
                (Method::Get, Version::Http11, "/", "", BodyKind::Empty, false),
            ),
            (
                "POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                (Method::Post, Version::Http11, "/u", "", BodyKind::Chunked, true),
            ),
        ];

        for (src, (method, version, path, query, body, keep_alive)) in cases {
            let head = parse(src).unwrap().unwrap_or_else(|| panic!("incomplete: {src:?}"));
            assert_eq!(head.method, method, "{src:?}");
            assert_eq!(head.version, version);
            assert_eq!(head.path, path);
            assert_eq!(head.query.as_ref(), query.as_bytes());
            assert_eq!(head.body, body);
            assert_eq!(head.keep_alive, keep_alive, "{src:?}");
        }
    }

    #[test]
    fn header_names_lowercased_duplicates_in_order() {
        let head = parse(
            "GET / HTTP/1.1\r\nX-Tag: one\r\nHost: h\r\nx-TAG: two\r\n\r\n",
        )
        .unwrap()
        .unwrap();

        let entries: Vec<_> = head.headers.iter().collect();
        assert_eq!(
            entries,
            vec![
                (b"x-tag" as &[u8], b"one" as &[u8]),
                (b"host", b"h"),
                (b"x-tag", b"two"),
            ]
        );
    }

    #[test]
    fn consumes_head_leaves_body() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let head = parse_head(&mut buf, &ConnLimits::default()).unwrap().unwrap();
        assert_eq!(head.body, BodyKind::Length(5));
        assert_eq!(buf.as_ref(), b"hello");
    }

    #[test]
    fn incomplete_heads_need_more() {
        #[rustfmt::skip]
        let cases = [
            "",
            "GET",
            "GET / HTTP/1.1\r\n",
            "GET / HTTP/1.1\r\nHost: x\r\n",
        ];

        for src in cases {
            assert!(matches!(parse(src), Ok(None)), "{src:?}");
        }
    }

    #[test]
    fn malformed_requests() {
        #[rustfmt::skip]
        let cases = [
            (" GET / HTTP/1.1\r\n\r\n",                       ProtocolError::InvalidMethod),
            ("TRACE / HTTP/1.1\r\n\r\n",                      ProtocolError::InvalidMethod),
            ("GET  HTTP/1.1\r\n\r\n",                         ProtocolError::InvalidTarget),
            ("GET no-slash HTTP/1.1\r\n\r\n",                 ProtocolError::InvalidTarget),
            ("GET / HTTP/2.0\r\n\r\n",                        ProtocolError::UnsupportedVersion),
            ("GET / HTTP/1.1extra\r\n\r\n",                   ProtocolError::InvalidVersion),
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n",             ProtocolError::InvalidHeader),
            ("GET / HTTP/1.1\r\n: v\r\n\r\n",                 ProtocolError::InvalidHeader),
            ("GET / HTTP/1.1\r\nBad Name: v\r\n\r\n",         ProtocolError::InvalidHeader),
            (
                "GET / HTTP/1.1\r\nContent-Length: nan\r\n\r\n",
                ProtocolError::InvalidContentLength,
            ),
            (
                "GET / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n",
                ProtocolError::InvalidContentLength,
            ),
            (
                "GET / HTTP/1.1\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n",
                ProtocolError::AmbiguousFraming,
            ),
            (
                "GET / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
                ProtocolError::AmbiguousFraming,
            ),
            (
                "POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n",
                ProtocolError::AmbiguousFraming,
            ),
        ];

        for (src, expected) in cases {
            assert_eq!(parse(src), Err(expected), "{src:?}");
        }
    }

    #[test]
    fn equal_duplicate_content_lengths_are_tolerated() {
        let head = parse("POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body, BodyKind::Length(5));
    }

    #[test]
    fn oversize_declared_body() {
        let limits = ConnLimits {
            max_body_size: 4,
            ..ConnLimits::default()
        };
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n"[..]);
        assert_eq!(
            parse_head(&mut buf, &limits),
            Err(ProtocolError::BodyTooLarge)
        );
    }

    #[test]
    fn oversize_head() {
        let limits = ConnLimits {
            max_head_size: 32,
            ..ConnLimits::default()
        };
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX: yyyyyyyyyyyyyyyyyyyyyyyy"[..]);
        assert_eq!(
            parse_head(&mut buf, &limits),
            Err(ProtocolError::HeadersTooLarge)
        );
    }

    #[test]
    fn percent_decoding() {
        #[rustfmt::skip]
        let cases = [
            ("/plain",        "/plain"),
            ("/a%20b",        "/a b"),
            ("/%2Fdeep",      "//deep"),
            ("/bad%zz",       "/bad%zz"),
            ("/trail%2",      "/trail%2"),
        ];

        for (src, expected) in cases {
            assert_eq!(percent_decode(src.as_bytes()), expected);
        }
    }
}
