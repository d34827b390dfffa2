//! Scope, header list and per-worker state types shared by core and apps.

use crate::errors::ProtocolError;
use bytes::Bytes;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

// METHOD

/// HTTP request methods accepted by the request-line parser.
///
/// `TRACE` and `CONNECT` are rejected at parse time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Head,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Parses a method followed by a single space, returning the method and
    /// the number of bytes consumed (method + space).
    #[inline]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<(Self, usize), ProtocolError> {
        match src {
            [b'G', b'E', b'T', b' ', ..] => Ok((Method::Get, 4)),
            [b'P', b'U', b'T', b' ', ..] => Ok((Method::Put, 4)),
            [b'P', b'O', b'S', b'T', b' ', ..] => Ok((Method::Post, 5)),
            [b'H', b'E', b'A', b'D', b' ', ..] => Ok((Method::Head, 5)),
            [b'P', b'A', b'T', b'C', b'H', b' ', ..] => Ok((Method::Patch, 6)),
            [b'D', b'E', b'L', b'E', b'T', b'E', b' ', ..] => Ok((Method::Delete, 7)),
            [b'O', b'P', b'T', b'I', b'O', b'N', b'S', b' ', ..] => Ok((Method::Options, 8)),
            _ => Err(ProtocolError::InvalidMethod),
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version of a request cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 ([RFC 1945](https://tools.ietf.org/html/rfc1945))
    Http10,
    /// HTTP/1.1 ([RFC 7230](https://tools.ietf.org/html/rfc7230))
    Http11,
}

impl Version {
    /// Parses `HTTP/1.1` / `HTTP/1.0` and returns the version together with
    /// its default keep-alive disposition.
    #[inline]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<(Self, bool), ProtocolError> {
        match src {
            b"HTTP/1.1" => Ok((Self::Http11, true)),
            b"HTTP/1.0" => Ok((Self::Http10, false)),
            _ => Err(ProtocolError::UnsupportedVersion),
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

// SCHEME

/// URL scheme of the transport a scope arrived over.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

// HEADER LIST

/// An ordered sequence of `(name, value)` header pairs.
///
/// Names are lowercased when inserted; duplicates are preserved in input
/// order. Neither a map nor an insertion-ordered map can represent this
/// faithfully, so the list itself is the canonical form and lookup helpers
/// scan it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderList {
    entries: Vec<(Bytes, Bytes)>,
}

impl HeaderList {
    #[inline]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header, lowercasing the name.
    #[inline]
    pub fn push(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        let mut name = name.as_ref().to_vec();
        name.make_ascii_lowercase();
        self.entries
            .push((Bytes::from(name), Bytes::copy_from_slice(value.as_ref())));
    }

    /// Appends a header whose name is already lowercase.
    #[inline]
    pub(crate) fn push_lowercase(&mut self, name: Bytes, value: Bytes) {
        debug_assert!(!name.iter().any(u8::is_ascii_uppercase));
        self.entries.push((name, value));
    }

    /// First value for `name`, case-insensitive.
    #[inline]
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// All values for `name` in input order, case-insensitive.
    #[inline]
    pub fn get_all<'a>(&'a self, name: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Whether `name` has a comma-separated value list containing `token`
    /// (case-insensitive). Used for `connection` / `upgrade` dispatch.
    #[inline]
    pub fn contains_token(&self, name: &[u8], token: &[u8]) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(|&b| b == b',')
                .any(|part| trim_ows(part).eq_ignore_ascii_case(token))
        })
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.entries.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut list = HeaderList::new();
        for (name, value) in iter {
            list.push(name, value);
        }
        list
    }
}

#[inline]
pub(crate) fn trim_ows(src: &[u8]) -> &[u8] {
    let start = src
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(src.len());
    let end = src
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &src[start..end]
}

// STATE

/// Per-worker mutable map the app populates during `lifespan.startup` and
/// reads from every request scope in the same worker.
///
/// The worker event loop is single-threaded, so the inner mutex is never
/// contended; it only keeps the handle `Send` for task spawning. Workers
/// never share a `State`.
#[derive(Clone, Default)]
pub struct State {
    inner: Arc<Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>>,
}

impl State {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner
            .lock()
            .expect("state mutex poisoned")
            .insert(key.into(), Box::new(value));
    }

    /// Returns a clone of the value stored under `key`, if it exists and has
    /// type `T`.
    pub fn get<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        self.inner
            .lock()
            .expect("state mutex poisoned")
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("state mutex poisoned")
            .contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("state mutex poisoned")
            .remove(key)
            .is_some()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock().expect("state mutex poisoned");
        f.debug_struct("State").field("keys", &guard.len()).finish()
    }
}

// SCOPE

/// Discriminates the four invocation kinds of the gateway contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Http,
    WebSocket,
    Sse,
    Lifespan,
}

impl ScopeKind {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Http => "http",
            ScopeKind::WebSocket => "websocket",
            ScopeKind::Sse => "sse",
            ScopeKind::Lifespan => "lifespan",
        }
    }
}

/// The immutable envelope handed to an application invocation.
///
/// Constructed by the connection state machine once per request (or once per
/// worker for lifespan) and never mutated afterwards. The [`State`] handle
/// inside points at per-worker storage whose *contents* the app may mutate.
#[derive(Debug, Clone)]
pub struct Scope {
    kind: ScopeKind,
    http_version: Version,
    method: Method,
    scheme: Scheme,
    path: String,
    raw_path: Bytes,
    query_string: Bytes,
    root_path: String,
    headers: HeaderList,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    state: State,
    extensions: HashMap<String, String>,
}

impl Scope {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn request(
        kind: ScopeKind,
        http_version: Version,
        method: Method,
        scheme: Scheme,
        path: String,
        raw_path: Bytes,
        query_string: Bytes,
        root_path: String,
        headers: HeaderList,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
        state: State,
        extensions: HashMap<String, String>,
    ) -> Self {
        Self {
            kind,
            http_version,
            method,
            scheme,
            path,
            raw_path,
            query_string,
            root_path,
            headers,
            client,
            server,
            state,
            extensions,
        }
    }

    pub(crate) fn lifespan(state: State) -> Self {
        Self {
            kind: ScopeKind::Lifespan,
            http_version: Version::Http11,
            method: Method::Get,
            scheme: Scheme::Http,
            path: String::new(),
            raw_path: Bytes::new(),
            query_string: Bytes::new(),
            root_path: String::new(),
            headers: HeaderList::new(),
            client: None,
            server: None,
            state,
            extensions: HashMap::new(),
        }
    }

    #[inline]
    pub const fn kind(&self) -> ScopeKind {
        self.kind
    }

    #[inline]
    pub const fn http_version(&self) -> Version {
        self.http_version
    }

    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Percent-decoded request path.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request path exactly as it appeared on the wire.
    #[inline]
    pub fn raw_path(&self) -> &[u8] {
        &self.raw_path
    }

    /// Query string bytes, without the leading `?`.
    #[inline]
    pub fn query_string(&self) -> &[u8] {
        &self.query_string
    }

    /// Mount prefix configured by an outer shell, empty by default.
    #[inline]
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    #[inline]
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    #[inline]
    pub const fn client(&self) -> Option<SocketAddr> {
        self.client
    }

    #[inline]
    pub const fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Per-worker shared state. See [`State`].
    #[inline]
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Feature flags negotiated by the deployment.
    #[inline]
    pub fn extensions(&self) -> &HashMap<String, String> {
        &self.extensions
    }
}


#[cfg(test)]
mod header_list {
    use super::*;

    #[test]
    fn lowercases_and_preserves_order() {
        let mut headers = HeaderList::new();
        headers.push("Host", "example.com");
        headers.push("X-Tag", "a");
        headers.push("x-tag", "b");

        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(
            entries,
            vec![
                (b"host" as &[u8], b"example.com" as &[u8]),
                (b"x-tag", b"a"),
                (b"x-tag", b"b"),
            ]
        );
    }

    #[test]
    fn get_is_case_insensitive_and_returns_first() {
        let headers: HeaderList = [("X-Tag", "a"), ("x-tag", "b")].into_iter().collect();

        assert_eq!(headers.get(b"X-TAG"), Some(b"a" as &[u8]));
        assert_eq!(headers.get(b"missing"), None);
        assert_eq!(headers.get_all(b"x-tag").count(), 2);
    }

    #[test]
    fn contains_token_splits_on_commas() {
        let headers: HeaderList = [("Connection", "keep-alive, Upgrade")].into_iter().collect();

        assert!(headers.contains_token(b"connection", b"upgrade"));
        assert!(headers.contains_token(b"connection", b"keep-alive"));
        assert!(!headers.contains_token(b"connection", b"close"));
        assert!(!headers.contains_token(b"upgrade", b"websocket"));
    }

    #[test]
    fn trim_ows_cases() {
        #[rustfmt::skip]
        let cases = [
            ("  x ",  "x"),
            ("\tx\t", "x"),
            ("x",     "x"),
            ("   ",   ""),
            ("",      ""),
        ];

        for (src, expected) in cases {
            assert_eq!(trim_ows(src.as_bytes()), expected.as_bytes());
        }
    }
}
