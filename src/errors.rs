use std::{io, net::SocketAddr};

/// Protocol-level failures detected while parsing or enforcing limits.
///
/// Each variant carries the wire action required to report it: an HTTP
/// status for request-phase errors, a WebSocket close code for frame-phase
/// errors. Parse functions return these instead of using errors for control
/// flow; the connection driver turns them into bytes exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolError {
    InvalidMethod,
    InvalidTarget,
    InvalidVersion,
    UnsupportedVersion,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    AmbiguousFraming,
    HeadersTooLarge,
    BodyTooLarge,
    BadUpgrade,

    WsProtocol(&'static str),
    WsMessageTooBig,
    WsInvalidUtf8,
}

macro_rules! http_statuses {
    ($($name:ident => $status:literal, $reason:literal;)*) => {
        /// Status line and reason for the error response, when the error is
        /// reportable over HTTP.
        pub(crate) const fn status(&self) -> Option<(u16, &'static str)> {
            match self {
                $(Self::$name => Some(($status, $reason)),)*
                _ => None,
            }
        }
    };
}

impl ProtocolError {
    http_statuses! {
        InvalidMethod        => 400, "Bad Request";
        InvalidTarget        => 400, "Bad Request";
        InvalidVersion       => 400, "Bad Request";
        UnsupportedVersion   => 505, "HTTP Version Not Supported";
        InvalidHeader        => 400, "Bad Request";
        InvalidContentLength => 400, "Bad Request";
        InvalidChunk         => 400, "Bad Request";
        AmbiguousFraming     => 400, "Bad Request";
        HeadersTooLarge      => 431, "Request Header Fields Too Large";
        BodyTooLarge         => 413, "Payload Too Large";
        BadUpgrade           => 400, "Bad Request";
    }

    /// WebSocket close code for frame-phase errors.
    pub(crate) const fn close_code(&self) -> Option<u16> {
        match self {
            Self::WsProtocol(_) => Some(1002),
            Self::WsMessageTooBig => Some(1009),
            Self::WsInvalidUtf8 => Some(1007),
            _ => None,
        }
    }
}

/// Server-level failures surfaced to the embedding process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("lifespan startup failed: {0}")]
    LifespanStartup(String),

    #[error("lifespan shutdown failed: {0}")]
    LifespanShutdown(String),

    #[cfg(unix)]
    #[error("supervisor error: {0}")]
    Supervisor(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
