//! The event alphabet crossing the core/app boundary.
//!
//! Every message is a tagged variant; the set below is exhaustive. Events
//! the core delivers are [`ReceiveEvent`]s, events the app produces are
//! [`SendEvent`]s. Which variants are legal depends on the scope kind and
//! the protocol state; [`SendHandle::send`](crate::channel::SendHandle::send)
//! rejects out-of-state events.

use crate::scope::HeaderList;
use bytes::Bytes;

/// One WebSocket message payload, text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WsPayload {
    Text(String),
    Binary(Bytes),
}

impl WsPayload {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            WsPayload::Text(s) => s.len(),
            WsPayload::Binary(b) => b.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One Server-Sent Events record, encoded as a single atomic block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseRecord {
    /// `event:` field, omitted when `None`.
    pub event: Option<String>,
    /// `data:` payload; embedded newlines become multiple `data:` lines.
    pub data: String,
    /// `id:` field, omitted when `None`.
    pub id: Option<String>,
    /// `retry:` reconnection delay in milliseconds, omitted when `None`.
    pub retry: Option<u64>,
}

impl SseRecord {
    /// A record carrying only data.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }
}

/// Events delivered to the application through `receive`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveEvent {
    /// One request body chunk; repeated until `more` is false. A bodyless
    /// request yields exactly one event with an empty body.
    HttpRequest { body: Bytes, more: bool },
    /// The peer went away (close, reset or idle timeout) before the
    /// invocation completed.
    HttpDisconnect,

    /// The WebSocket handshake arrived; the app must answer with accept or
    /// close.
    WsConnect,
    /// One fully assembled WebSocket message.
    WsReceive(WsPayload),
    /// The WebSocket connection ended.
    WsDisconnect { code: u16, reason: String },

    /// The SSE client went away.
    SseDisconnect,

    /// The worker is starting; initialize shared state now.
    LifespanStartup,
    /// The worker is shutting down; release shared state now.
    LifespanShutdown,
}

/// Events the application produces through `send`.
#[derive(Debug, Clone, PartialEq)]
pub enum SendEvent {
    /// Response status and headers. Exactly one per HTTP request, before
    /// any body.
    ResponseStart { status: u16, headers: HeaderList },
    /// One response body chunk; repeated until `more` is false.
    ResponseBody { body: Bytes, more: bool },

    /// Complete the WebSocket handshake with `101`.
    WsAccept {
        subprotocol: Option<String>,
        headers: HeaderList,
    },
    /// Send one WebSocket message.
    WsSend(WsPayload),
    /// Close the WebSocket: a `403` if the handshake was never accepted, a
    /// close frame otherwise.
    WsClose { code: u16, reason: String },

    /// Start the SSE response; must precede any record.
    SseStart { status: u16, headers: HeaderList },
    /// Emit one SSE record.
    SseSend(SseRecord),

    /// Startup finished; the worker may accept connections.
    StartupComplete,
    /// Startup failed; the worker aborts before accepting.
    StartupFailed { message: String },
    /// Shutdown finished; the worker may exit.
    ShutdownComplete,
    /// Shutdown failed; logged, then the worker exits anyway.
    ShutdownFailed { message: String },
}

impl SendEvent {
    /// Wire name of the event, for diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            SendEvent::ResponseStart { .. } => "http.response.start",
            SendEvent::ResponseBody { .. } => "http.response.body",
            SendEvent::WsAccept { .. } => "websocket.accept",
            SendEvent::WsSend(_) => "websocket.send",
            SendEvent::WsClose { .. } => "websocket.close",
            SendEvent::SseStart { .. } => "sse.start",
            SendEvent::SseSend(_) => "sse.send",
            SendEvent::StartupComplete => "lifespan.startup.complete",
            SendEvent::StartupFailed { .. } => "lifespan.startup.failed",
            SendEvent::ShutdownComplete => "lifespan.shutdown.complete",
            SendEvent::ShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }
}

impl ReceiveEvent {
    /// Wire name of the event, for diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            ReceiveEvent::HttpRequest { .. } => "http.request",
            ReceiveEvent::HttpDisconnect => "http.disconnect",
            ReceiveEvent::WsConnect => "websocket.connect",
            ReceiveEvent::WsReceive(_) => "websocket.receive",
            ReceiveEvent::WsDisconnect { .. } => "websocket.disconnect",
            ReceiveEvent::SseDisconnect => "sse.disconnect",
            ReceiveEvent::LifespanStartup => "lifespan.startup",
            ReceiveEvent::LifespanShutdown => "lifespan.shutdown",
        }
    }
}
