//! RFC 6455 frame codec.
//!
//! The parser is incremental over the connection's read buffer: `Ok(None)`
//! means the frame is not complete yet. Validation failures carry the close
//! code the peer must see (1002 protocol error, 1009 too big). The server
//! side requires inbound masking and never masks outbound frames.

use crate::errors::ProtocolError;
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    #[inline]
    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            _ => Err(ProtocolError::WsProtocol("reserved opcode")),
        }
    }

    #[inline]
    const fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    #[inline]
    pub(crate) const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One parsed frame with its payload unmasked.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub(crate) fin: bool,
    pub(crate) opcode: OpCode,
    pub(crate) payload: Bytes,
}

/// Tries to parse one client frame from the front of `buf`.
pub(crate) fn parse_frame(
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(ProtocolError::WsProtocol("reserved bits set"));
    }
    let opcode = OpCode::from_bits(buf[0] & 0x0f)?;

    let masked = buf[1] & 0x80 != 0;
    if !masked {
        return Err(ProtocolError::WsProtocol("unmasked client frame"));
    }

    let len7 = buf[1] & 0x7f;
    if opcode.is_control() {
        if len7 > 125 {
            return Err(ProtocolError::WsProtocol("oversized control frame"));
        }
        if !fin {
            return Err(ProtocolError::WsProtocol("fragmented control frame"));
        }
    }

    let extra = match len7 {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_size = 2 + extra + 4;
    if buf.len() < header_size {
        return Ok(None);
    }

    let payload_len = match extra {
        0 => u64::from(len7),
        2 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
        _ => u64::from_be_bytes(buf[2..10].try_into().expect("8 length bytes")),
    };
    if payload_len > max_frame_size as u64 {
        return Err(ProtocolError::WsMessageTooBig);
    }
    let payload_len = payload_len as usize;

    if buf.len() < header_size + payload_len {
        return Ok(None);
    }

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[header_size - 4..header_size]);

    let mut frame = buf.split_to(header_size + payload_len);
    let mut payload = frame.split_off(header_size);
    unmask(&mut payload, mask);

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

#[inline]
fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Encodes one server frame (never masked).
pub(crate) fn encode_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push((fin as u8) << 7 | opcode.bits());

    match payload.len() {
        len @ 0..=125 => out.push(len as u8),
        len @ 126..=65535 => {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

// CLOSE FRAMES

/// Close codes a peer may legitimately put on the wire. 1005, 1006 and
/// 1015 are reserved for local use; 1004 and 1016-2999 are unassigned.
#[inline]
pub(crate) const fn close_code_allowed(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Decodes and validates a close frame payload.
///
/// An empty payload means "no status received" and surfaces as 1005.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), ProtocolError> {
    match payload.len() {
        0 => Ok((1005, String::new())),
        1 => Err(ProtocolError::WsProtocol("one-byte close payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code_allowed(code) {
                return Err(ProtocolError::WsProtocol("invalid close code"));
            }
            let reason = simdutf8::basic::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::WsInvalidUtf8)?;
            Ok((code, reason.to_owned()))
        }
    }
}

/// Builds a close frame payload from code and reason.
///
/// Control payloads cap at 125 bytes; the reason truncates at a char edge.
pub(crate) fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());

    let mut end = reason.len().min(123);
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

#[cfg(test)]
pub(crate) fn masked_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
    let mut out = Vec::new();
    out.push((fin as u8) << 7 | opcode.bits());
    match payload.len() {
        len @ 0..=125 => out.push(0x80 | len as u8),
        len @ 126..=65535 => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&MASK);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i & 3]));
    out
}
