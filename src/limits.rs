//! Server configuration limits and timeouts.
//!
//! Defaults are intentionally conservative: a freshly built server refuses
//! oversized bodies, caps queued events per connection, and derives its
//! connection ceiling from the process file-descriptor limit. Raise limits
//! deliberately, per deployment.

use std::{path::PathBuf, time::Duration};

/// Worker-pool and admission configuration.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker processes (default: `1`).
    ///
    /// With one worker, everything runs in the calling process. With more,
    /// a pre-fork supervisor owns the listen socket and keeps the pool at
    /// this size, honoring `TERM`/`INT`, `HUP`, `TTIN` and `TTOU`.
    pub workers: usize,

    /// Maximum concurrent connections per worker (default: `0` = derive).
    ///
    /// `0` derives the cap from the file-descriptor limit as
    /// `max(10, RLIMIT_NOFILE - 50)`. Connections over the cap receive a
    /// complete `503` response with `retry-after: 5` and are closed without
    /// ever reaching the application.
    pub max_connections: usize,

    /// Requests served before a worker voluntarily exits (default: `0` = never).
    ///
    /// The supervisor respawns a replacement; rolling workers bounds slow
    /// resource drift in long-lived processes.
    pub max_requests: u64,

    /// How long a draining worker waits for in-flight requests (default: `10 seconds`).
    pub shutdown_grace: Duration,

    /// Emit one access-log record per completed request (default: `true`).
    ///
    /// Records go to the `pagi::access` tracing target; without a
    /// subscriber they cost almost nothing.
    pub access_log: bool,

    /// Advertise sendfile-style file responses to applications (default: `false`).
    ///
    /// Only gates the startup banner and the `http.response.sendfile`
    /// extension flag in request scopes; the core itself serves no files.
    pub sendfile: bool,

    /// Files at or under this size are read inline on the event loop;
    /// larger files go through the blocking pool (default: `16 KB`).
    pub sync_file_read_threshold: u64,

    /// Mount prefix reported as `root_path` in request scopes (default: empty).
    pub root_path: String,

    /// Listen backlog passed to the OS (default: `1024`).
    pub backlog: u32,

    /// Write the supervisor PID here at startup, remove it at clean
    /// shutdown (default: `None`).
    pub pid_file: Option<PathBuf>,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: 1,
            max_connections: 0, // derive from RLIMIT_NOFILE
            max_requests: 0,    // never roll
            shutdown_grace: Duration::from_secs(10),
            access_log: true,
            sendfile: false,
            sync_file_read_threshold: 16 * 1024,
            root_path: String::new(),
            backlog: 1024,
            pid_file: None,

            _priv: (),
        }
    }
}

/// Per-connection limits and timeouts.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum time without forward progress before a connection is
    /// abandoned (default: `15 seconds`).
    ///
    /// Applies while reading a request head or body and while a keep-alive
    /// connection sits idle between requests.
    pub idle_timeout: Duration,

    /// Maximum time for a single write to make progress (default: `10 seconds`).
    pub write_timeout: Duration,

    /// Maximum request head size, request line plus header block (default: `16 KB`).
    pub max_head_size: usize,

    /// Maximum request body size; oversize requests elicit `413` and the
    /// connection closes (default: `4 MB`).
    pub max_body_size: usize,

    /// Receive-queue capacity in events (default: `64`).
    ///
    /// When the app is slow to drain the queue the connection stops reading
    /// the transport; overflow is backpressure, never an error.
    pub max_receive_queue: usize,

    /// Maximum requests served on one keep-alive connection (default: `1000`).
    pub max_requests_per_connection: u64,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline]
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(10),
            max_head_size: 16 * 1024,
            max_body_size: 4 * 1024 * 1024,
            max_receive_queue: 64,
            max_requests_per_connection: 1000,

            _priv: (),
        }
    }
}

/// WebSocket protocol limits.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Maximum payload of a single frame (default: `1 MB`).
    ///
    /// A larger frame closes the connection with `1009 Message Too Big`.
    pub max_frame_size: usize,

    /// Maximum size of an assembled fragmented message (default: `16 MB`).
    ///
    /// Exceeding it closes the connection with `1009`.
    pub max_message_size: usize,

    /// Heartbeat interval (default: `None` = no pings).
    ///
    /// When set, the server sends a ping after this long without outbound
    /// traffic and closes the connection if no pong arrives within
    /// [`heartbeat_timeout`](Self::heartbeat_timeout).
    pub heartbeat_interval: Option<Duration>,

    /// Time allowed for a pong after a heartbeat ping (default: `20 seconds`).
    pub heartbeat_timeout: Duration,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
            heartbeat_interval: None,
            heartbeat_timeout: Duration::from_secs(20),

            _priv: (),
        }
    }
}

/// Server-Sent Events limits.
#[derive(Debug, Clone)]
pub struct SseLimits {
    /// Keepalive comment interval (default: `30 seconds`; `None` disables).
    ///
    /// After this long without an app record the stream carries a
    /// `: keepalive` comment line to defeat idle proxy timeouts. Keepalives
    /// never split a record.
    pub keepalive_interval: Option<Duration>,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(30)),

            _priv: (),
        }
    }
}

/// Lifespan dialogue deadlines.
#[derive(Debug, Clone)]
pub struct LifespanLimits {
    /// Time the app has to answer `lifespan.startup` (default: `30 seconds`).
    ///
    /// No answer counts as a failed startup and the worker exits nonzero.
    pub startup_timeout: Duration,

    /// Time the app has to answer `lifespan.shutdown` before the worker
    /// force-exits (default: `30 seconds`).
    pub shutdown_timeout: Duration,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for LifespanLimits {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Every limit group, bundled for handoff to workers and connections.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) ws: WsLimits,
    pub(crate) sse: SseLimits,
    pub(crate) lifespan: LifespanLimits,
}
