//! The reference server entry point: bind, supervise, accept, serve.

use crate::{
    app::Application,
    errors::Error,
    limits::{AllLimits, ConnLimits, LifespanLimits, ServerLimits, SseLimits, WsLimits},
    server::{listener, worker},
};
use std::{net::SocketAddr, sync::Arc};

/// The assembled server, ready to run.
///
/// `run` blocks the calling thread: with one worker it hosts the event
/// loop itself, with more it becomes the pre-fork supervisor. Build one
/// with [`Server::builder`].
///
/// # Examples
///
/// ```no_run
/// use pagi::{Server, limits::ServerLimits};
/// # use pagi::{AppError, ReceiveHandle, Scope, SendHandle};
/// # struct App;
/// # impl pagi::Application for App {
/// #     async fn call(&self, _: Scope, _: ReceiveHandle, _: SendHandle) -> Result<(), AppError> {
/// #         Ok(())
/// #     }
/// # }
///
/// fn main() -> Result<(), pagi::Error> {
///     Server::builder()
///         .bind("127.0.0.1:8000".parse().unwrap())
///         .app(App)
///         .server_limits(ServerLimits {
///             workers: 4,
///             ..ServerLimits::default()
///         })
///         .build()
///         .run()
/// }
/// ```
pub struct Server<A: Application> {
    bind: BindTarget,
    app: Arc<A>,
    limits: AllLimits,
    tls: worker::TlsContext,
}

enum BindTarget {
    Addr(SocketAddr),
    Listener(std::net::TcpListener),
}

impl<A: Application> Server<A> {
    /// Creates a new builder.
    #[inline]
    pub fn builder() -> ServerBuilder<A> {
        ServerBuilder {
            bind: None,
            app: None,
            server_limits: None,
            conn_limits: None,
            ws_limits: None,
            sse_limits: None,
            lifespan_limits: None,
            tls: worker::TlsContext::default(),
        }
    }

    /// Binds (if needed), prints the startup banner, and serves until a
    /// stop signal. Returns once every worker has exited.
    pub fn run(self) -> Result<(), Error> {
        let limits = Arc::new(self.limits);

        let listener = match self.bind {
            BindTarget::Listener(listener) => listener,
            BindTarget::Addr(addr) => listener::bind_std(addr, limits.server.backlog)
                .map_err(|source| Error::Bind { addr, source })?,
        };
        let local = listener.local_addr()?;

        let tls_on = self.tls.enabled();
        let scheme = if tls_on { "https" } else { "http" };
        eprintln!(
            "{}",
            listener::banner(
                scheme,
                local,
                limits.server.workers.max(1),
                listener::effective_max_connections(limits.server.max_connections),
                tls_banner_state(tls_on),
                limits.server.sendfile,
            )
        );

        if let Some(path) = &limits.server.pid_file {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
        }

        let result = if limits.server.workers <= 1 {
            worker::run(listener, self.app, limits.clone(), self.tls)
        } else {
            serve_forked(listener, self.app, limits.clone(), self.tls)
        };

        if let Some(path) = &limits.server.pid_file {
            let _ = std::fs::remove_file(path);
        }
        result
    }
}

#[cfg(unix)]
fn serve_forked<A: Application>(
    listener: std::net::TcpListener,
    app: Arc<A>,
    limits: Arc<AllLimits>,
    tls: worker::TlsContext,
) -> Result<(), Error> {
    crate::server::supervisor::run(listener, app, limits, tls)
}

#[cfg(not(unix))]
fn serve_forked<A: Application>(
    _listener: std::net::TcpListener,
    _app: Arc<A>,
    _limits: Arc<AllLimits>,
    _tls: worker::TlsContext,
) -> Result<(), Error> {
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "multi-worker mode requires unix",
    )))
}

fn tls_banner_state(configured: bool) -> &'static str {
    #[cfg(feature = "tls")]
    {
        if configured {
            "on"
        } else {
            "disabled"
        }
    }
    #[cfg(not(feature = "tls"))]
    {
        let _ = configured;
        "not installed"
    }
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder<A: Application> {
    bind: Option<BindTarget>,
    app: Option<A>,
    server_limits: Option<ServerLimits>,
    conn_limits: Option<ConnLimits>,
    ws_limits: Option<WsLimits>,
    sse_limits: Option<SseLimits>,
    lifespan_limits: Option<LifespanLimits>,
    tls: worker::TlsContext,
}

impl<A: Application> ServerBuilder<A> {
    /// Address to bind. **Required** unless [`listener`](Self::listener)
    /// is used.
    #[inline]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(BindTarget::Addr(addr));
        self
    }

    /// Serves on an already-bound listener instead of binding.
    #[inline]
    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.bind = Some(BindTarget::Listener(listener));
        self
    }

    /// The application invoked for every scope. **Required.**
    #[inline]
    pub fn app(mut self, app: A) -> Self {
        self.app = Some(app);
        self
    }

    /// Worker-pool and admission configuration.
    #[inline]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Per-connection limits and timeouts.
    #[inline]
    pub fn conn_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = Some(limits);
        self
    }

    /// WebSocket protocol limits.
    #[inline]
    pub fn ws_limits(mut self, limits: WsLimits) -> Self {
        self.ws_limits = Some(limits);
        self
    }

    /// Server-Sent Events limits.
    #[inline]
    pub fn sse_limits(mut self, limits: SseLimits) -> Self {
        self.sse_limits = Some(limits);
        self
    }

    /// Lifespan dialogue deadlines.
    #[inline]
    pub fn lifespan_limits(mut self, limits: LifespanLimits) -> Self {
        self.lifespan_limits = Some(limits);
        self
    }

    /// Wraps every accepted stream in TLS with this configuration.
    ///
    /// Certificate loading is the caller's concern; the transport wrapper
    /// changes nothing above the socket.
    #[cfg(feature = "tls")]
    #[inline]
    pub fn tls_config(mut self, config: Arc<tokio_rustls::rustls::ServerConfig>) -> Self {
        self.tls.acceptor = Some(tokio_rustls::TlsAcceptor::from(config));
        self
    }

    /// Finalizes the builder.
    ///
    /// # Panics
    ///
    /// Panics when `bind`/`listener` or `app` was never called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<A> {
        Server {
            bind: self
                .bind
                .expect("the `bind` or `listener` method must be called to create"),
            app: Arc::new(self.app.expect("the `app` method must be called to create")),
            limits: AllLimits {
                server: self.server_limits.unwrap_or_default(),
                conn: self.conn_limits.unwrap_or_default(),
                ws: self.ws_limits.unwrap_or_default(),
                sse: self.sse_limits.unwrap_or_default(),
                lifespan: self.lifespan_limits.unwrap_or_default(),
            },
            tls: self.tls,
        }
    }
}
