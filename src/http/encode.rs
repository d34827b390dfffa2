//! HTTP/1.1 response serialization.
//!
//! The connection driver hands this module the app's `http.response.start`
//! and body events; it owns the framing decision (declared length vs
//! chunked vs close-delimited), the `date` header, HEAD stripping, and the
//! canned error pages. Every response produced here carries `date`.

use crate::scope::{HeaderList, Version};
use std::time::SystemTime;

/// RFC 1123 timestamp for the `date` header.
#[inline]
pub(crate) fn http_date() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        425 => "Too Early",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// How response body bytes get framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    /// `content-length` declared by the app; bytes are counted against it.
    Length(u64),
    /// No declared length on HTTP/1.1: `transfer-encoding: chunked`.
    Chunked,
    /// No declared length on HTTP/1.0: stream until close.
    CloseDelimited,
    /// Status forbids a body (1xx, 204, 304).
    NoBody,
}

/// Everything the driver needs to encode one response head.
pub(crate) struct HeadSpec<'a> {
    pub(crate) version: Version,
    pub(crate) status: u16,
    pub(crate) headers: &'a HeaderList,
    pub(crate) date: &'a str,
    /// Driver wants `connection: close` (draining, request asked, cap hit).
    pub(crate) close: bool,
    pub(crate) head_request: bool,
}

/// Body-phase state carried between `http.response.body` events.
#[derive(Debug)]
pub(crate) struct ResponseStream {
    framing: Framing,
    head_request: bool,
    /// Close the connection once the response completes.
    pub(crate) close: bool,
    complete: bool,
    body_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BodyVerdict {
    /// More body events expected.
    Continue,
    /// Response fully framed.
    Complete,
    /// App finished short of its declared length; the framing is broken
    /// and the connection must close.
    CompleteTruncated,
}

/// Serializes the response head and returns the body-phase state.
pub(crate) fn encode_head(spec: HeadSpec<'_>) -> (Vec<u8>, ResponseStream) {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(spec.version.as_str().as_bytes());
    out.extend_from_slice(
        format!(" {} {}\r\n", spec.status, reason_phrase(spec.status)).as_bytes(),
    );

    let mut declared_length: Option<u64> = None;
    let mut has_date = false;
    let mut has_connection = false;
    let mut app_close = false;

    for (name, value) in spec.headers.iter() {
        match name {
            b"content-length" => {
                declared_length = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.trim().parse().ok());
            }
            b"date" => has_date = true,
            b"connection" => {
                has_connection = true;
                app_close = value
                    .split(|&b| b == b',')
                    .any(|t| crate::scope::trim_ows(t).eq_ignore_ascii_case(b"close"));
            }
            _ => {}
        }
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    if !has_date {
        out.extend_from_slice(b"date: ");
        out.extend_from_slice(spec.date.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    let framing = match declared_length {
        _ if no_body_status(spec.status) => Framing::NoBody,
        Some(n) => Framing::Length(n),
        None if spec.version == Version::Http11 => {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
            Framing::Chunked
        }
        None => Framing::CloseDelimited,
    };

    let close = spec.close || app_close || framing == Framing::CloseDelimited;
    if close && !has_connection {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");

    (
        out,
        ResponseStream {
            framing,
            head_request: spec.head_request,
            close,
            complete: false,
            body_bytes: 0,
        },
    )
}

impl ResponseStream {
    /// Frames one `http.response.body` event into `out`.
    ///
    /// HEAD responses suppress all body bytes while keeping the declared
    /// framing headers accurate.
    pub(crate) fn encode_chunk(
        &mut self,
        body: &[u8],
        more: bool,
        out: &mut Vec<u8>,
    ) -> BodyVerdict {
        debug_assert!(!self.complete, "body after final chunk");
        self.body_bytes += body.len() as u64;

        match &mut self.framing {
            Framing::Length(remaining) => {
                let take = (*remaining).min(body.len() as u64) as usize;
                if !self.head_request {
                    out.extend_from_slice(&body[..take]);
                }
                *remaining -= take as u64;
                if more {
                    BodyVerdict::Continue
                } else {
                    self.complete = true;
                    match *remaining {
                        0 => BodyVerdict::Complete,
                        _ => BodyVerdict::CompleteTruncated,
                    }
                }
            }
            Framing::Chunked => {
                if !self.head_request && !body.is_empty() {
                    out.extend_from_slice(format!("{:X}\r\n", body.len()).as_bytes());
                    out.extend_from_slice(body);
                    out.extend_from_slice(b"\r\n");
                }
                if more {
                    BodyVerdict::Continue
                } else {
                    if !self.head_request {
                        out.extend_from_slice(b"0\r\n\r\n");
                    }
                    self.complete = true;
                    BodyVerdict::Complete
                }
            }
            Framing::CloseDelimited => {
                if !self.head_request {
                    out.extend_from_slice(body);
                }
                if more {
                    BodyVerdict::Continue
                } else {
                    self.complete = true;
                    BodyVerdict::Complete
                }
            }
            Framing::NoBody => {
                if more {
                    BodyVerdict::Continue
                } else {
                    self.complete = true;
                    BodyVerdict::Complete
                }
            }
        }
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// Response bytes the app produced, for the access log.
    #[inline]
    pub(crate) fn body_bytes(&self) -> u64 {
        self.body_bytes
    }
}

#[inline]
fn no_body_status(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

/// A complete minimal response: status line, `date`, plain-text body,
/// `connection: close`, plus any extra headers.
pub(crate) fn simple_response(
    status: u16,
    extra_headers: &[(&str, &str)],
    body: &str,
    date: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes(),
    );
    out.extend_from_slice(format!("date: {date}\r\n").as_bytes());
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(b"content-type: text/plain; charset=utf-8\r\n");
    }
    out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"connection: close\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}

/// The admission-control rejection sent to over-cap connections.
pub(crate) fn overloaded_response(date: &str) -> Vec<u8> {
    simple_response(503, &[("retry-after", "5")], "Service Unavailable", date)
}

#[cfg(test)]
mod heads {
    use super::*;

    const DATE: &str = "Sat, 01 Jan 2000 00:00:00 GMT";

    fn spec<'a>(status: u16, headers: &'a HeaderList) -> HeadSpec<'a> {
        HeadSpec {
            version: Version::Http11,
            status,
            headers,
            date: DATE,
            close: false,
            head_request: false,
        }
    }

    #[test]
    fn declared_length_response() {
        let headers: HeaderList = [("content-type", "text/plain"), ("content-length", "5")]
            .into_iter()
            .collect();
        let (head, mut stream) = encode_head(spec(200, &headers));
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("content-type: text/plain\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert!(head.contains(&format!("date: {DATE}\r\n")));
        assert!(!head.contains("transfer-encoding"));
        assert!(head.ends_with("\r\n\r\n"));

        let mut out = Vec::new();
        assert_eq!(
            stream.encode_chunk(b"hello", false, &mut out),
            BodyVerdict::Complete
        );
        assert_eq!(out, b"hello");
        assert!(!stream.close);
    }

    #[test]
    fn undeclared_length_uses_chunked() {
        let headers: HeaderList = [("content-type", "text/plain")].into_iter().collect();
        let (head, mut stream) = encode_head(spec(200, &headers));
        assert!(String::from_utf8(head).unwrap().contains("transfer-encoding: chunked\r\n"));

        let mut out = Vec::new();
        assert_eq!(stream.encode_chunk(b"ab", true, &mut out), BodyVerdict::Continue);
        assert_eq!(stream.encode_chunk(b"cd", true, &mut out), BodyVerdict::Continue);
        assert_eq!(stream.encode_chunk(b"", false, &mut out), BodyVerdict::Complete);
        assert_eq!(out, b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n");
    }

    #[test]
    fn http10_without_length_closes() {
        let headers = HeaderList::new();
        let (head, stream) = encode_head(HeadSpec {
            version: Version::Http10,
            ..spec(200, &headers)
        });
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert!(!head.contains("transfer-encoding"));
        assert!(stream.close);
    }

    #[test]
    fn head_request_strips_body_keeps_length() {
        let headers: HeaderList = [("content-length", "5")].into_iter().collect();
        let (head, mut stream) = encode_head(HeadSpec {
            head_request: true,
            ..spec(200, &headers)
        });
        assert!(String::from_utf8(head).unwrap().contains("content-length: 5\r\n"));

        let mut out = Vec::new();
        assert_eq!(
            stream.encode_chunk(b"hello", false, &mut out),
            BodyVerdict::Complete
        );
        assert!(out.is_empty());
    }

    #[test]
    fn truncated_body_demands_close() {
        let headers: HeaderList = [("content-length", "10")].into_iter().collect();
        let (_, mut stream) = encode_head(spec(200, &headers));

        let mut out = Vec::new();
        assert_eq!(
            stream.encode_chunk(b"short", false, &mut out),
            BodyVerdict::CompleteTruncated
        );
    }

    #[test]
    fn driver_close_adds_connection_header_once() {
        let headers = HeaderList::new();
        let (head, _) = encode_head(HeadSpec {
            close: true,
            ..spec(204, &headers)
        });
        let head = String::from_utf8(head).unwrap();
        assert_eq!(head.matches("connection: close").count(), 1);
    }

    #[test]
    fn app_headers_preserved_in_order_with_duplicates() {
        let headers: HeaderList = [("x-a", "1"), ("x-b", "2"), ("x-a", "3")]
            .into_iter()
            .collect();
        let (head, _) = encode_head(spec(200, &headers));
        let head = String::from_utf8(head).unwrap();

        let a1 = head.find("x-a: 1").unwrap();
        let b2 = head.find("x-b: 2").unwrap();
        let a3 = head.find("x-a: 3").unwrap();
        assert!(a1 < b2 && b2 < a3);
    }

    #[test]
    fn overloaded_page() {
        let page = String::from_utf8(overloaded_response(DATE)).unwrap();
        assert!(page.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(page.contains("retry-after: 5\r\n"));
        assert!(page.contains("connection: close\r\n"));
        assert!(page.contains(&format!("date: {DATE}\r\n")));
    }
}
