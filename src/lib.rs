//! pagi - async gateway interface and its reference server
//!
//! PAGI is a message-passing contract between a server core and
//! applications: every interaction - HTTP request, WebSocket connection,
//! Server-Sent Events stream, process lifespan - is a scope plus a pair of
//! event channels. This crate ships the contract types and the reference
//! server implementing it for HTTP/1.1, WebSocket and SSE over TCP or TLS.
//!
//! # Architecture
//!
//! ```text
//! supervisor (pre-fork, signals)
//!     └─ worker ×N (single-threaded event loop, shared listen socket)
//!         └─ admission (connection cap, fd backoff)
//!             └─ connection state machine (http | websocket | sse)
//!                 └─ app invocation: call(scope, receive, send)
//! ```
//!
//! Each worker is one process with one cooperative event loop: app
//! callbacks within a worker interleave at awaits but never run in
//! parallel, so worker-local state needs no locks. Workers share nothing
//! but the listen socket.
//!
//! # Quick start
//!
//! ```no_run
//! use bytes::Bytes;
//! use pagi::{
//!     AppError, Application, HeaderList, ReceiveEvent, ReceiveHandle, Scope,
//!     SendEvent, SendHandle, Server,
//! };
//!
//! struct Hello;
//!
//! impl Application for Hello {
//!     async fn call(
//!         &self,
//!         _scope: Scope,
//!         mut receive: ReceiveHandle,
//!         send: SendHandle,
//!     ) -> Result<(), AppError> {
//!         while let ReceiveEvent::HttpRequest { more: true, .. } = receive.recv().await {}
//!
//!         let headers: HeaderList =
//!             [("content-type", "text/plain"), ("content-length", "5")]
//!                 .into_iter()
//!                 .collect();
//!         send.send(SendEvent::ResponseStart { status: 200, headers }).await?;
//!         send.send(SendEvent::ResponseBody {
//!             body: Bytes::from_static(b"hello"),
//!             more: false,
//!         })
//!         .await?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), pagi::Error> {
//!     Server::builder()
//!         .bind("127.0.0.1:8000".parse().unwrap())
//!         .app(Hello)
//!         .build()
//!         .run()
//! }
//! ```
//!
//! # Operational surface
//!
//! With multiple workers the supervisor answers `TERM`/`INT` (graceful
//! stop), `HUP` (rolling restart), `TTIN` (one more worker) and `TTOU`
//! (one fewer, floor of one). Workers drain in-flight requests before
//! exiting and roll themselves after `max_requests` when configured.

pub(crate) mod http {
    pub(crate) mod encode;
    pub(crate) mod parse;
}
pub(crate) mod ws {
    pub(crate) mod frame;
    pub(crate) mod handshake;
    pub(crate) mod session;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod listener;
    pub(crate) mod server_impl;
    #[cfg(unix)]
    pub(crate) mod supervisor;
    pub(crate) mod worker;
}
pub(crate) mod app;
pub(crate) mod channel;
pub(crate) mod errors;
pub(crate) mod event;
pub(crate) mod files;
pub(crate) mod lifespan;
pub mod limits;
pub(crate) mod scope;
pub(crate) mod sse;

pub use crate::{
    app::{AppError, Application},
    channel::{ReceiveHandle, SendError, SendHandle},
    errors::Error,
    event::{ReceiveEvent, SendEvent, SseRecord, WsPayload},
    files::read_file_bounded,
    scope::{HeaderList, Method, Scheme, Scope, ScopeKind, State, Version},
    server::server_impl::{Server, ServerBuilder},
};
