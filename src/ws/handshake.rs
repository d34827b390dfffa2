//! WebSocket opening handshake (RFC 6455 §4).

use crate::{
    errors::ProtocolError,
    http::parse::RequestHead,
    scope::{HeaderList, Method, Version},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A validated upgrade request.
#[derive(Debug)]
pub(crate) struct Handshake {
    pub(crate) key: String,
}

/// Checks the upgrade headers of a request already routed as WebSocket.
pub(crate) fn validate(head: &RequestHead) -> Result<Handshake, ProtocolError> {
    if head.method != Method::Get || head.version != Version::Http11 {
        return Err(ProtocolError::BadUpgrade);
    }
    if !head.headers.contains_token(b"connection", b"upgrade")
        || !head.headers.contains_token(b"upgrade", b"websocket")
    {
        return Err(ProtocolError::BadUpgrade);
    }

    match head.headers.get(b"sec-websocket-version") {
        Some(b"13") => {}
        _ => return Err(ProtocolError::BadUpgrade),
    }

    let key = head
        .headers
        .get(b"sec-websocket-key")
        .ok_or(ProtocolError::BadUpgrade)?;
    // The key must be base64 for 16 bytes of entropy.
    let decoded = BASE64
        .decode(key)
        .map_err(|_| ProtocolError::BadUpgrade)?;
    if decoded.len() != 16 {
        return Err(ProtocolError::BadUpgrade);
    }

    let key = std::str::from_utf8(key)
        .map_err(|_| ProtocolError::BadUpgrade)?
        .to_owned();
    Ok(Handshake { key })
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID);
    BASE64.encode(sha.finalize())
}

/// Serializes the `101 Switching Protocols` response.
pub(crate) fn encode_accept(
    key: &str,
    subprotocol: Option<&str>,
    extra_headers: &HeaderList,
    date: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(192);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"upgrade: websocket\r\n");
    out.extend_from_slice(b"connection: Upgrade\r\n");
    out.extend_from_slice(b"sec-websocket-accept: ");
    out.extend_from_slice(accept_key(key).as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(subprotocol) = subprotocol {
        out.extend_from_slice(b"sec-websocket-protocol: ");
        out.extend_from_slice(subprotocol.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for (name, value) in extra_headers.iter() {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"date: ");
    out.extend_from_slice(date.as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out
}

#[cfg(test)]
mod handshakes {
    use super::*;
    use crate::limits::ConnLimits;
    use bytes::BytesMut;

    fn head_for(extra: &str) -> RequestHead {
        let raw = format!(
            "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n{extra}\r\n"
        );
        let mut buf = BytesMut::from(raw.as_bytes());
        crate::http::parse::parse_head(&mut buf, &ConnLimits::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn rfc_sample_accept_key() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn valid_handshake() {
        let handshake = validate(&head_for("")).unwrap();
        assert_eq!(handshake.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn rejects_bad_handshakes() {
        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
               Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 12\r\n\r\n"[..],
        );
        let head = crate::http::parse::parse_head(&mut buf, &ConnLimits::default())
            .unwrap()
            .unwrap();
        assert!(matches!(validate(&head), Err(ProtocolError::BadUpgrade)));

        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
               Sec-WebSocket-Version: 13\r\n\r\n"[..],
        );
        let head = crate::http::parse::parse_head(&mut buf, &ConnLimits::default())
            .unwrap()
            .unwrap();
        assert!(matches!(validate(&head), Err(ProtocolError::BadUpgrade)));

        // Key that does not decode to 16 bytes.
        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
               Sec-WebSocket-Key: c2hvcnQ=\r\nSec-WebSocket-Version: 13\r\n\r\n"[..],
        );
        let head = crate::http::parse::parse_head(&mut buf, &ConnLimits::default())
            .unwrap()
            .unwrap();
        assert!(matches!(validate(&head), Err(ProtocolError::BadUpgrade)));
    }

    #[test]
    fn accept_response_bytes() {
        let response = encode_accept(
            "dGhlIHNhbXBsZSBub25jZQ==",
            Some("chat"),
            &HeaderList::new(),
            "Sat, 01 Jan 2000 00:00:00 GMT",
        );
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("sec-websocket-protocol: chat\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
