//! One worker: a single-threaded event loop over the shared listen socket.
//!
//! Parallelism comes from the pre-fork pool, not from threads; every app
//! callback in a worker is serialized on this loop. The worker runs the
//! lifespan startup before its first accept, drains on TERM/INT or when
//! the max-requests budget is spent, and runs the lifespan shutdown on the
//! way out.

use crate::{
    app::Application,
    errors::Error,
    http::encode,
    lifespan,
    limits::AllLimits,
    scope::State,
    server::{
        connection::{self, ConnectionCtx},
        listener,
    },
};
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// TLS acceptance state, empty unless the `tls` feature is enabled and a
/// config was installed.
#[derive(Clone, Default)]
pub(crate) struct TlsContext {
    #[cfg(feature = "tls")]
    pub(crate) acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl TlsContext {
    pub(crate) fn enabled(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.acceptor.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

/// The byte stream under a connection: plain TCP or TLS-wrapped. The
/// wrapper changes nothing above the socket.
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Runs one worker to completion on its own current-thread runtime.
pub(crate) fn run<A: Application>(
    listener: std::net::TcpListener,
    app: Arc<A>,
    limits: Arc<AllLimits>,
    tls: TlsContext,
) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(worker_main(listener, app, limits, tls))
}

async fn worker_main<A: Application>(
    listener: std::net::TcpListener,
    app: Arc<A>,
    limits: Arc<AllLimits>,
    tls: TlsContext,
) -> Result<(), Error> {
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;

    let state = State::new();
    let lifespan = lifespan::startup(&app, state.clone(), &limits.lifespan).await?;

    let (drain_tx, drain_rx) = watch::channel(false);
    let drain_tx = Arc::new(drain_tx);
    spawn_signal_listener(drain_tx.clone());

    let requests_served = Arc::new(AtomicU64::new(0));
    let admission =
        listener::Admission::new(listener::effective_max_connections(limits.server.max_connections));
    let tls_on = tls.enabled();

    accept_loop(
        &listener,
        &app,
        &limits,
        &tls,
        &state,
        &drain_tx,
        drain_rx.clone(),
        &requests_served,
        &admission,
        tls_on,
    )
    .await;

    drop(listener);
    info!(
        served = requests_served.load(Ordering::Relaxed),
        "worker draining",
    );

    // Let in-flight requests finish, bounded by the shutdown grace.
    let deadline = Instant::now() + limits.server.shutdown_grace;
    while admission.active() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if let lifespan::Startup::Supported(handle) = lifespan {
        // Failures are logged inside; the exit continues regardless.
        let _ = lifespan::shutdown(handle, &limits.lifespan).await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop<A: Application>(
    listener: &TcpListener,
    app: &Arc<A>,
    limits: &Arc<AllLimits>,
    tls: &TlsContext,
    state: &State,
    drain_tx: &Arc<watch::Sender<bool>>,
    mut drain_rx: watch::Receiver<bool>,
    requests_served: &Arc<AtomicU64>,
    admission: &listener::Admission,
    tls_on: bool,
) {
    let mut budget_check = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            biased;

            _ = drain_rx.changed() => {
                if *drain_rx.borrow() {
                    return;
                }
            }

            _ = budget_check.tick() => {
                let max = limits.server.max_requests;
                if max > 0 && requests_served.load(Ordering::Relaxed) >= max {
                    info!(max_requests = max, "request budget spent, rolling worker");
                    let _ = drain_tx.send(true);
                    return;
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    handle_accept(
                        stream,
                        peer,
                        app,
                        limits,
                        tls,
                        state,
                        drain_rx.clone(),
                        requests_served,
                        admission,
                        tls_on,
                    );
                }
                Err(error) if listener::fd_exhausted(&error) => {
                    // Out of descriptors: back off instead of crashing.
                    warn!(%error, "accept failed on fd exhaustion, pausing");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(error) => {
                    error!(%error, "accept failed");
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_accept<A: Application>(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    app: &Arc<A>,
    limits: &Arc<AllLimits>,
    tls: &TlsContext,
    state: &State,
    draining: watch::Receiver<bool>,
    requests_served: &Arc<AtomicU64>,
    admission: &listener::Admission,
    tls_on: bool,
) {
    let _ = stream.set_nodelay(true);

    let Some(guard) = admission.try_admit() else {
        let write_timeout = limits.conn.write_timeout;
        tokio::spawn(async move {
            let mut stream = stream;
            let page = encode::overloaded_response(&encode::http_date());
            let _ =
                connection::write_all_timed(&mut stream, &page, write_timeout).await;
            let _ = stream.shutdown().await;
        });
        return;
    };

    let ctx = ConnectionCtx {
        limits: limits.clone(),
        state: state.clone(),
        draining,
        requests_served: requests_served.clone(),
        tls: tls_on,
        peer: Some(peer),
        local: stream.local_addr().ok(),
    };
    let app = app.clone();
    let tls = tls.clone();

    tokio::spawn(async move {
        let _guard = guard;
        match wrap_transport(stream, &tls).await {
            Ok(transport) => connection::serve_connection(transport, app, ctx).await,
            Err(error) => debug!(%error, "transport setup failed"),
        }
    });
}

#[cfg(feature = "tls")]
async fn wrap_transport(stream: TcpStream, tls: &TlsContext) -> io::Result<Transport> {
    match &tls.acceptor {
        None => Ok(Transport::Plain(stream)),
        Some(acceptor) => {
            let handshake = acceptor.accept(stream);
            tokio::select! {
                biased;

                result = handshake => result.map(|s| Transport::Tls(Box::new(s))),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tls handshake timeout",
                )),
            }
        }
    }
}

#[cfg(not(feature = "tls"))]
async fn wrap_transport(stream: TcpStream, _tls: &TlsContext) -> io::Result<Transport> {
    Ok(Transport::Plain(stream))
}

#[cfg(unix)]
fn spawn_signal_listener(drain_tx: Arc<watch::Sender<bool>>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(error) => {
                error!(%error, "failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => info!("received SIGTERM, draining"),
            _ = int.recv() => info!("received SIGINT, draining"),
        }
        let _ = drain_tx.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(drain_tx: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, draining");
            let _ = drain_tx.send(true);
        }
    });
}
