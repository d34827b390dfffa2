//! The per-socket connection state machine.
//!
//! One task owns the transport for the life of the connection. Each request
//! cycle parses a head, routes it (HTTP, WebSocket upgrade, SSE), builds a
//! fresh scope and channel set, and spawns the application invocation as
//! its own task. The driver then pumps transport reads into the bounded
//! receive queue and serializes the app's send events onto the wire; the
//! two sides couple only through backpressure.

use crate::{
    app::{AppError, Application},
    channel::{self, CommandReceiver, EventSender, SendCommand, SendError},
    errors::ProtocolError,
    event::{ReceiveEvent, SendEvent},
    http::{
        encode::{self, BodyVerdict, HeadSpec, ResponseStream},
        parse::{parse_head, BodyKind, Chunk, ChunkedDecoder, RequestHead},
    },
    scope::{Method, Scope, ScopeKind, Scheme},
    sse,
    ws::{handshake, session},
};
use bytes::{Bytes, BytesMut};
use memchr::memmem;
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::{debug, info, warn};

/// Worker-wide context shared by every connection.
#[derive(Clone)]
pub(crate) struct ConnectionCtx {
    pub(crate) limits: Arc<crate::limits::AllLimits>,
    pub(crate) state: crate::scope::State,
    pub(crate) draining: watch::Receiver<bool>,
    pub(crate) requests_served: Arc<AtomicU64>,
    pub(crate) tls: bool,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,
}

/// Writes everything or fails; a stalled peer trips the timeout.
pub(crate) async fn write_all_timed<W: AsyncWrite + Unpin>(
    wr: &mut W,
    bytes: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    tokio::select! {
        biased;

        result = async {
            wr.write_all(bytes).await?;
            wr.flush().await
        } => result,
        _ = tokio::time::sleep(timeout) => {
            Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
        }
    }
}

enum HeadOutcome {
    Head(Box<RequestHead>),
    /// Peer closed, errored, or idled out between requests.
    Closed,
    Malformed(ProtocolError),
}

async fn read_head<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
    limits: &crate::limits::ConnLimits,
) -> HeadOutcome {
    loop {
        match parse_head(buf, limits) {
            Err(error) => return HeadOutcome::Malformed(error),
            Ok(Some(head)) => return HeadOutcome::Head(Box::new(head)),
            Ok(None) => {}
        }

        tokio::select! {
            biased;

            read = rd.read_buf(buf) => match read {
                // A half-closed peer with a partial head gets no response.
                Ok(0) | Err(_) => return HeadOutcome::Closed,
                Ok(_) => {}
            },
            _ = tokio::time::sleep(limits.idle_timeout) => return HeadOutcome::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Route {
    Http,
    WebSocket,
    Sse,
}

fn route(head: &RequestHead) -> Route {
    if head.headers.contains_token(b"upgrade", b"websocket") {
        return Route::WebSocket;
    }
    let wants_sse = head
        .headers
        .get_all(b"accept")
        .any(|value| memmem::find(value, b"text/event-stream").is_some());
    if wants_sse {
        Route::Sse
    } else {
        Route::Http
    }
}

/// Serves one accepted transport stream until it closes.
pub(crate) async fn serve_connection<S, A>(stream: S, app: Arc<A>, ctx: ConnectionCtx)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    A: Application,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut served_on_conn: u64 = 0;

    loop {
        let head = match read_head(&mut rd, &mut buf, &ctx.limits.conn).await {
            HeadOutcome::Head(head) => head,
            HeadOutcome::Closed => break,
            HeadOutcome::Malformed(error) => {
                let (status, reason) = error.status().unwrap_or((400, "Bad Request"));
                let page = encode::simple_response(status, &[], reason, &encode::http_date());
                let _ = write_all_timed(&mut wr, &page, ctx.limits.conn.write_timeout).await;
                break;
            }
        };

        served_on_conn += 1;
        let close = match route(&head) {
            Route::Http => {
                http_cycle(&mut rd, &mut buf, &mut wr, &app, &ctx, &head, served_on_conn).await
            }
            Route::WebSocket => {
                ws_cycle(&mut rd, &mut buf, &mut wr, &app, &ctx, &head).await;
                true
            }
            Route::Sse => {
                sse_cycle(&mut rd, &mut wr, &app, &ctx, &head).await;
                true
            }
        };

        if close
            || *ctx.draining.borrow()
            || served_on_conn >= ctx.limits.conn.max_requests_per_connection
        {
            break;
        }
    }
}

fn build_scope(head: &RequestHead, kind: ScopeKind, ctx: &ConnectionCtx) -> Scope {
    let scheme = match (kind, ctx.tls) {
        (ScopeKind::WebSocket, false) => Scheme::Ws,
        (ScopeKind::WebSocket, true) => Scheme::Wss,
        (_, false) => Scheme::Http,
        (_, true) => Scheme::Https,
    };

    let mut extensions = HashMap::new();
    if ctx.limits.server.sendfile {
        extensions.insert("http.response.sendfile".to_string(), String::new());
    }

    Scope::request(
        kind,
        head.version,
        head.method,
        scheme,
        head.path.clone(),
        head.raw_path.clone(),
        head.query.clone(),
        ctx.limits.server.root_path.clone(),
        head.headers.clone(),
        ctx.peer,
        ctx.local,
        ctx.state.clone(),
        extensions,
    )
}

fn spawn_app<A: Application>(
    app: &Arc<A>,
    scope: Scope,
    kind: ScopeKind,
    capacity: usize,
) -> (EventSender, CommandReceiver, JoinHandle<Result<(), AppError>>) {
    let (event_tx, cmd_rx, receive, send) = channel::pair(kind, capacity);
    let app = app.clone();
    let task = tokio::spawn(async move { app.call(scope, receive, send).await });
    (event_tx, cmd_rx, task)
}

fn log_app_end(result: &Result<Result<(), AppError>, JoinError>) -> bool {
    match result {
        Ok(Ok(())) => false,
        Ok(Err(error)) => {
            debug!(%error, "application returned an error");
            true
        }
        Err(join_error) => {
            warn!(%join_error, "application task panicked");
            true
        }
    }
}

fn access_log(ctx: &ConnectionCtx, head: &RequestHead, status: u16, bytes: u64, began: Instant) {
    if !ctx.limits.server.access_log {
        return;
    }
    let remote = ctx
        .peer
        .map_or_else(|| "-".to_string(), |addr| addr.to_string());
    info!(
        target: "pagi::access",
        remote = %remote,
        request = %format!(
            "{} {} {}",
            head.method,
            String::from_utf8_lossy(&head.target),
            head.version.as_str(),
        ),
        status,
        bytes,
        elapsed_ms = began.elapsed().as_millis() as u64,
    );
}

// REQUEST BODIES

/// Streams the request body out of the parse buffer, one queue event per
/// decoded chunk.
struct BodySource {
    kind: BodyKind,
    decoder: ChunkedDecoder,
    max_body: u64,
    consumed: u64,
    done: bool,
}

impl BodySource {
    fn new(kind: BodyKind, max_body: usize) -> Self {
        Self {
            kind,
            decoder: ChunkedDecoder::new(),
            max_body: max_body as u64,
            consumed: 0,
            done: false,
        }
    }

    /// Produces the next `http.request` event, or `None` when more
    /// transport bytes are needed.
    fn next_event(&mut self, buf: &mut BytesMut) -> Result<Option<ReceiveEvent>, ProtocolError> {
        match self.kind {
            BodyKind::Empty => {
                self.done = true;
                Ok(Some(ReceiveEvent::HttpRequest {
                    body: Bytes::new(),
                    more: false,
                }))
            }
            BodyKind::Length(total) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let remaining = (total - self.consumed) as usize;
                let take = remaining.min(buf.len());
                let body = buf.split_to(take).freeze();
                self.consumed += take as u64;
                let more = self.consumed < total;
                if !more {
                    self.done = true;
                }
                Ok(Some(ReceiveEvent::HttpRequest { body, more }))
            }
            BodyKind::Chunked => match self.decoder.decode(buf)? {
                None => Ok(None),
                Some(Chunk::Data(body)) => {
                    self.consumed += body.len() as u64;
                    if self.consumed > self.max_body {
                        return Err(ProtocolError::BodyTooLarge);
                    }
                    Ok(Some(ReceiveEvent::HttpRequest { body, more: true }))
                }
                Some(Chunk::Complete) => {
                    self.done = true;
                    Ok(Some(ReceiveEvent::HttpRequest {
                        body: Bytes::new(),
                        more: false,
                    }))
                }
            },
        }
    }
}

enum TransportStep {
    Delivered,
    Eof,
    /// Bytes arrived after the body finished: the next keep-alive request.
    EarlyData,
    QueueClosed,
    Malformed(ProtocolError),
}

/// One transport step: deliver a body event under queue backpressure, or
/// watch for EOF once the body is finished.
async fn transport_step<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
    body: &mut BodySource,
    event_tx: &Option<EventSender>,
) -> TransportStep {
    if !body.done {
        let Some(tx) = event_tx else {
            return TransportStep::QueueClosed;
        };
        let Ok(permit) = tx.reserve().await else {
            return TransportStep::QueueClosed;
        };
        loop {
            match body.next_event(buf) {
                Err(error) => return TransportStep::Malformed(error),
                Ok(Some(event)) => {
                    permit.send(event);
                    return TransportStep::Delivered;
                }
                Ok(None) => match rd.read_buf(buf).await {
                    Ok(0) | Err(_) => return TransportStep::Eof,
                    Ok(_) => {}
                },
            }
        }
    } else {
        // Head parsing may already have buffered the next request.
        if !buf.is_empty() {
            return TransportStep::EarlyData;
        }
        match rd.read_buf(buf).await {
            Ok(0) | Err(_) => TransportStep::Eof,
            Ok(_) => TransportStep::EarlyData,
        }
    }
}

// HTTP CYCLE

/// Drives one plain HTTP request/response cycle. Returns whether the
/// connection must close afterwards.
#[allow(clippy::too_many_arguments)]
async fn http_cycle<R, W, A>(
    rd: &mut R,
    buf: &mut BytesMut,
    wr: &mut W,
    app: &Arc<A>,
    ctx: &ConnectionCtx,
    head: &RequestHead,
    served_on_conn: u64,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    A: Application,
{
    let began = Instant::now();
    let scope = build_scope(head, ScopeKind::Http, ctx);
    let (event_tx, mut cmd_rx, mut app_task) = spawn_app(
        app,
        scope,
        ScopeKind::Http,
        ctx.limits.conn.max_receive_queue,
    );

    let write_timeout = ctx.limits.conn.write_timeout;
    let mut event_tx = Some(event_tx);
    let mut body = BodySource::new(head.body, ctx.limits.conn.max_body_size);
    let mut response: Option<ResponseStream> = None;
    let mut status: u16 = 0;
    let mut bytes_sent: u64 = 0;
    let mut response_complete = false;
    let mut close = !head.keep_alive;
    let mut cmds_open = true;
    let mut watch_eof = true;
    let mut app_result: Option<Result<Result<(), AppError>, JoinError>> = None;
    let mut read_deadline = Instant::now() + ctx.limits.conn.idle_timeout;

    let close = loop {
        let reading_body = !body.done && event_tx.is_some();
        let transport_on = reading_body || (body.done && watch_eof && !response_complete);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv(), if cmds_open => {
                let Some(SendCommand { event, ack }) = cmd else {
                    cmds_open = false;
                    continue;
                };
                match event {
                    SendEvent::ResponseStart { status: s, headers } => {
                        if response.is_some() {
                            // Starting a response twice is a fatal
                            // application-protocol error.
                            let _ = ack.send(Err(SendError::Protocol(
                                "response already started",
                            )));
                            break true;
                        }
                        let wants_close = close
                            || *ctx.draining.borrow()
                            || served_on_conn >= ctx.limits.conn.max_requests_per_connection;
                        let (bytes, stream) = encode::encode_head(HeadSpec {
                            version: head.version,
                            status: s,
                            headers: &headers,
                            date: &encode::http_date(),
                            close: wants_close,
                            head_request: head.method == Method::Head,
                        });
                        match write_all_timed(wr, &bytes, write_timeout).await {
                            Ok(()) => {
                                ctx.requests_served.fetch_add(1, Ordering::Relaxed);
                                status = s;
                                close = close || stream.close;
                                response = Some(stream);
                                let _ = ack.send(Ok(()));
                            }
                            Err(_) => {
                                let _ = ack.send(Err(SendError::Disconnected));
                                break true;
                            }
                        }
                    }
                    SendEvent::ResponseBody { body: chunk, more } => match response.as_mut() {
                        None => {
                            let _ = ack.send(Err(SendError::Protocol(
                                "http.response.body before http.response.start",
                            )));
                        }
                        Some(_) if response_complete => {
                            let _ = ack.send(Err(SendError::Protocol(
                                "response already complete",
                            )));
                        }
                        Some(stream) => {
                            let mut out = Vec::with_capacity(chunk.len() + 16);
                            let verdict = stream.encode_chunk(&chunk, more, &mut out);
                            match write_all_timed(wr, &out, write_timeout).await {
                                Ok(()) => {
                                    bytes_sent = stream.body_bytes();
                                    match verdict {
                                        BodyVerdict::Continue => {}
                                        BodyVerdict::Complete => {
                                            response_complete = true;
                                            event_tx = None;
                                        }
                                        BodyVerdict::CompleteTruncated => {
                                            response_complete = true;
                                            event_tx = None;
                                            close = true;
                                        }
                                    }
                                    let _ = ack.send(Ok(()));
                                }
                                Err(_) => {
                                    let _ = ack.send(Err(SendError::Disconnected));
                                    break true;
                                }
                            }
                        }
                    },
                    _ => {
                        let _ = ack.send(Err(SendError::Protocol(
                            "event not valid in http scope",
                        )));
                    }
                }
                if response_complete && app_result.is_some() {
                    break close;
                }
            }

            result = &mut app_task, if app_result.is_none() => {
                let failed = log_app_end(&result);
                app_result = Some(result);

                if response.is_none() {
                    // Failed or returned without responding: both are 500s.
                    let page = encode::simple_response(
                        500,
                        &[],
                        "Internal Server Error",
                        &encode::http_date(),
                    );
                    let _ = write_all_timed(wr, &page, write_timeout).await;
                    status = 500;
                    break true;
                }
                if !response_complete {
                    // Mid-body exit truncates the response and closes.
                    debug!(failed, "application ended before completing its response");
                    break true;
                }
                break close;
            }

            step = transport_step(rd, buf, &mut body, &event_tx), if transport_on => {
                read_deadline = Instant::now() + ctx.limits.conn.idle_timeout;
                match step {
                    TransportStep::Delivered => {}
                    TransportStep::EarlyData => watch_eof = false,
                    TransportStep::QueueClosed => event_tx = None,
                    TransportStep::Eof => {
                        if let Some(tx) = &event_tx {
                            let _ = tx.try_send(ReceiveEvent::HttpDisconnect);
                        }
                        event_tx = None;
                        body.done = true;
                        watch_eof = false;
                        close = true;
                    }
                    TransportStep::Malformed(error) => {
                        if response.is_none() {
                            let (s, reason) = error.status().unwrap_or((400, "Bad Request"));
                            let page = encode::simple_response(
                                s,
                                &[],
                                reason,
                                &encode::http_date(),
                            );
                            let _ = write_all_timed(wr, &page, write_timeout).await;
                            status = s;
                        }
                        break true;
                    }
                }
            }

            // No forward progress while the request is still arriving.
            _ = tokio::time::sleep_until(read_deadline), if reading_body => {
                event_tx = None;
                break true;
            }
        }
    };

    access_log(ctx, head, status, bytes_sent, began);
    close || !body.done
}

// WEBSOCKET CYCLE

async fn ws_cycle<R, W, A>(
    rd: &mut R,
    buf: &mut BytesMut,
    wr: &mut W,
    app: &Arc<A>,
    ctx: &ConnectionCtx,
    head: &RequestHead,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    A: Application,
{
    let began = Instant::now();
    let write_timeout = ctx.limits.conn.write_timeout;

    let hs = match handshake::validate(head) {
        Ok(hs) => hs,
        Err(error) => {
            let (s, reason) = error.status().unwrap_or((400, "Bad Request"));
            let page = encode::simple_response(s, &[], reason, &encode::http_date());
            let _ = write_all_timed(wr, &page, write_timeout).await;
            access_log(ctx, head, s, 0, began);
            return;
        }
    };

    let scope = build_scope(head, ScopeKind::WebSocket, ctx);
    let (event_tx, mut cmd_rx, mut app_task) = spawn_app(
        app,
        scope,
        ScopeKind::WebSocket,
        ctx.limits.conn.max_receive_queue,
    );
    // Fresh queue, so the connect event always has room.
    let _ = event_tx.try_send(ReceiveEvent::WsConnect);

    // The app decides the handshake: accept or reject.
    let accepted = loop {
        tokio::select! {
            biased;

            result = &mut app_task => {
                log_app_end(&result);
                let page = encode::simple_response(
                    500,
                    &[],
                    "Internal Server Error",
                    &encode::http_date(),
                );
                let _ = write_all_timed(wr, &page, write_timeout).await;
                access_log(ctx, head, 500, 0, began);
                return;
            }

            cmd = cmd_rx.recv() => {
                let Some(SendCommand { event, ack }) = cmd else { continue };
                match event {
                    SendEvent::WsAccept { subprotocol, headers } => {
                        let bytes = handshake::encode_accept(
                            &hs.key,
                            subprotocol.as_deref(),
                            &headers,
                            &encode::http_date(),
                        );
                        match write_all_timed(wr, &bytes, write_timeout).await {
                            Ok(()) => {
                                ctx.requests_served.fetch_add(1, Ordering::Relaxed);
                                let _ = ack.send(Ok(()));
                                break true;
                            }
                            Err(_) => {
                                let _ = ack.send(Err(SendError::Disconnected));
                                break false;
                            }
                        }
                    }
                    // Rejecting before accepting answers the handshake 403.
                    SendEvent::WsClose { .. } => {
                        let page = encode::simple_response(
                            403,
                            &[],
                            "Forbidden",
                            &encode::http_date(),
                        );
                        let _ = write_all_timed(wr, &page, write_timeout).await;
                        ctx.requests_served.fetch_add(1, Ordering::Relaxed);
                        let _ = ack.send(Ok(()));
                        access_log(ctx, head, 403, 0, began);
                        return;
                    }
                    _ => {
                        let _ = ack.send(Err(SendError::Protocol(
                            "websocket handshake not complete",
                        )));
                    }
                }
            }
        }
    };

    if accepted {
        access_log(ctx, head, 101, 0, began);
        session::run_open(
            rd,
            buf,
            wr,
            cmd_rx,
            event_tx,
            &mut app_task,
            &ctx.limits.ws,
            &ctx.limits.conn,
        )
        .await;
    }
}

// SSE CYCLE

async fn sse_cycle<R, W, A>(
    rd: &mut R,
    wr: &mut W,
    app: &Arc<A>,
    ctx: &ConnectionCtx,
    head: &RequestHead,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    A: Application,
{
    let began = Instant::now();
    let scope = build_scope(head, ScopeKind::Sse, ctx);
    let (event_tx, cmd_rx, mut app_task) = spawn_app(
        app,
        scope,
        ScopeKind::Sse,
        ctx.limits.conn.max_receive_queue,
    );

    let started = sse::run_session(
        rd,
        wr,
        cmd_rx,
        event_tx,
        &mut app_task,
        &ctx.limits.sse,
        &ctx.limits.conn,
        &ctx.requests_served,
    )
    .await;

    access_log(ctx, head, started.unwrap_or(200), 0, began);
}

#[cfg(test)]
mod cycles {
    use super::*;
    use crate::{
        app::AppError,
        channel::{ReceiveHandle, SendHandle},
        event::{SseRecord, WsPayload},
        limits::{AllLimits, ConnLimits},
        scope::{HeaderList, State},
    };
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn test_ctx(limits: AllLimits) -> (ConnectionCtx, watch::Sender<bool>) {
        let (drain_tx, drain_rx) = watch::channel(false);
        let ctx = ConnectionCtx {
            limits: Arc::new(limits),
            state: State::new(),
            draining: drain_rx,
            requests_served: Arc::new(AtomicU64::new(0)),
            tls: false,
            peer: None,
            local: None,
        };
        (ctx, drain_tx)
    }

    /// Feeds `input` to a fresh connection and returns every byte the
    /// server wrote before closing.
    async fn drive<A: Application>(app: A, limits: AllLimits, input: &[u8]) -> Vec<u8> {
        let (mut client, server) = duplex(1 << 16);
        let (ctx, _drain_tx) = test_ctx(limits);
        let task = tokio::spawn(serve_connection(server, Arc::new(app), ctx));

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    fn head_and_tail(raw: &[u8]) -> (String, Vec<u8>) {
        let split = memmem::find(raw, b"\r\n\r\n").expect("response head") + 4;
        (
            String::from_utf8(raw[..split].to_vec()).unwrap(),
            raw[split..].to_vec(),
        )
    }

    struct PlainApp;

    impl Application for PlainApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            while let ReceiveEvent::HttpRequest { more: true, .. } = receive.recv().await {}

            let headers: HeaderList = [("content-type", "text/plain"), ("content-length", "5")]
                .into_iter()
                .collect();
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers,
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body: Bytes::from_static(b"hello"),
                more: false,
            })
            .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn get_200_plain() {
        let out = drive(
            PlainApp,
            AllLimits::default(),
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let (head, tail) = head_and_tail(&out);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("date: "));
        assert!(head.contains("content-type: text/plain\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert_eq!(tail, b"hello");
    }

    struct ChunkedApp;

    impl Application for ChunkedApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            while let ReceiveEvent::HttpRequest { more: true, .. } = receive.recv().await {}

            let headers: HeaderList = [("content-type", "text/plain")].into_iter().collect();
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers,
            })
            .await?;
            for (body, more) in [(&b"ab"[..], true), (b"cd", true), (b"", false)] {
                send.send(SendEvent::ResponseBody {
                    body: Bytes::copy_from_slice(body),
                    more,
                })
                .await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn chunked_streaming_response() {
        let out = drive(
            ChunkedApp,
            AllLimits::default(),
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let (head, tail) = head_and_tail(&out);

        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert_eq!(tail, b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn head_response_omits_body_keeps_length() {
        let out = drive(
            PlainApp,
            AllLimits::default(),
            b"HEAD /hello HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let (head, tail) = head_and_tail(&out);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn keep_alive_serves_sequential_requests() {
        let out = drive(
            PlainApp,
            AllLimits::default(),
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);

        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(text.matches("hello").count(), 2);
        // The second response begins only after the first body ended.
        let first_body = text.find("hello").unwrap();
        let second_head = text.rfind("HTTP/1.1 200 OK").unwrap();
        assert!(first_body < second_head);
    }

    /// Records every receive event, then answers 200 with no body.
    struct RecordingApp {
        events: Arc<Mutex<Vec<ReceiveEvent>>>,
    }

    impl Application for RecordingApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            loop {
                let event = receive.recv().await;
                let done = !matches!(event, ReceiveEvent::HttpRequest { more: true, .. });
                self.events.lock().unwrap().push(event);
                if done {
                    break;
                }
            }

            let headers: HeaderList = [("content-length", "0")].into_iter().collect();
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers,
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body: Bytes::new(),
                more: false,
            })
            .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn content_length_body_is_one_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let out = drive(
            RecordingApp {
                events: events.clone(),
            },
            AllLimits::default(),
            b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));

        let events = events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"hello"),
                more: false,
            }],
        );
    }

    #[tokio::test]
    async fn bodyless_request_is_one_empty_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        drive(
            RecordingApp {
                events: events.clone(),
            },
            AllLimits::default(),
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;

        let events = events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[ReceiveEvent::HttpRequest {
                body: Bytes::new(),
                more: false,
            }],
        );
    }

    #[tokio::test]
    async fn chunked_request_body_concatenates() {
        let events = Arc::new(Mutex::new(Vec::new()));
        drive(
            RecordingApp {
                events: events.clone(),
            },
            AllLimits::default(),
            b"POST /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
        )
        .await;

        let events = events.lock().unwrap();
        let mut body = Vec::new();
        for event in events.iter() {
            match event {
                ReceiveEvent::HttpRequest { body: piece, more } => {
                    body.extend_from_slice(piece);
                    if !more {
                        break;
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(body, b"hello");
        assert!(matches!(
            events.last(),
            Some(ReceiveEvent::HttpRequest { more: false, .. })
        ));
    }

    /// Tries to send a body before the start event, then recovers.
    struct BodyFirstApp;

    impl Application for BodyFirstApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            while let ReceiveEvent::HttpRequest { more: true, .. } = receive.recv().await {}

            let early = send
                .send(SendEvent::ResponseBody {
                    body: Bytes::from_static(b"sneaky"),
                    more: false,
                })
                .await;
            assert_eq!(
                early,
                Err(SendError::Protocol(
                    "http.response.body before http.response.start"
                ))
            );

            let headers: HeaderList = [("content-length", "2")].into_iter().collect();
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers,
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body: Bytes::from_static(b"ok"),
                more: false,
            })
            .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn body_before_start_is_rejected_without_bytes() {
        let out = drive(
            BodyFirstApp,
            AllLimits::default(),
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let (head, tail) = head_and_tail(&out);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(tail, b"ok");
        assert!(!out.windows(6).any(|w| w == b"sneaky"));
    }

    struct FailingApp;

    impl Application for FailingApp {
        async fn call(
            &self,
            _scope: Scope,
            _receive: ReceiveHandle,
            _send: SendHandle,
        ) -> Result<(), AppError> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn app_failure_before_start_is_500() {
        let out = drive(
            FailingApp,
            AllLimits::default(),
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let (head, tail) = head_and_tail(&out);

        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert_eq!(tail, b"Internal Server Error");
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let out = drive(
            PlainApp,
            AllLimits::default(),
            b"BLAH / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn oversize_declared_body_is_413() {
        let limits = AllLimits {
            conn: ConnLimits {
                max_body_size: 4,
                ..ConnLimits::default()
            },
            ..AllLimits::default()
        };
        let out = drive(
            PlainApp,
            limits,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n0123456789",
        )
        .await;
        assert!(out.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));
    }

    struct DoubleStartApp {
        second: Arc<Mutex<Option<Result<(), SendError>>>>,
    }

    impl Application for DoubleStartApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            while let ReceiveEvent::HttpRequest { more: true, .. } = receive.recv().await {}

            send.send(SendEvent::ResponseStart {
                status: 200,
                headers: [("content-length", "0")].into_iter().collect(),
            })
            .await?;
            let second = send
                .send(SendEvent::ResponseStart {
                    status: 200,
                    headers: HeaderList::new(),
                })
                .await;
            *self.second.lock().unwrap() = Some(second);
            Ok(())
        }
    }

    #[tokio::test]
    async fn starting_a_response_twice_is_fatal() {
        let second = Arc::new(Mutex::new(None));
        let out = drive(
            DoubleStartApp {
                second: second.clone(),
            },
            AllLimits::default(),
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;

        // One head on the wire, and the connection closed afterwards.
        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.matches("HTTP/1.1 200").count(), 1);
        assert_eq!(
            second.lock().unwrap().clone(),
            Some(Err(SendError::Protocol("response already started"))),
        );
    }

    // WEBSOCKET

    const WS_HANDSHAKE: &[u8] = b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
        Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    struct WsEchoApp;

    impl Application for WsEchoApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            assert_eq!(receive.recv().await, ReceiveEvent::WsConnect);
            send.send(SendEvent::WsAccept {
                subprotocol: None,
                headers: HeaderList::new(),
            })
            .await?;

            match receive.recv().await {
                ReceiveEvent::WsReceive(WsPayload::Text(text)) => {
                    send.send(SendEvent::WsSend(WsPayload::Text(text))).await?;
                }
                other => panic!("expected a text message, got {other:?}"),
            }
            send.send(SendEvent::WsClose {
                code: 1000,
                reason: String::new(),
            })
            .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn websocket_echo() {
        let mut input = WS_HANDSHAKE.to_vec();
        input.extend_from_slice(&crate::ws::frame::masked_frame(
            true,
            crate::ws::frame::OpCode::Text,
            b"hi",
        ));
        let out = drive(WsEchoApp, AllLimits::default(), &input).await;
        let (head, frames) = head_and_tail(&out);

        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        // Unmasked text echo, then a clean close frame.
        assert_eq!(frames, b"\x81\x02hi\x88\x02\x03\xe8");
    }

    struct WsSinkApp;

    impl Application for WsSinkApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            assert_eq!(receive.recv().await, ReceiveEvent::WsConnect);
            send.send(SendEvent::WsAccept {
                subprotocol: None,
                headers: HeaderList::new(),
            })
            .await?;
            // Read until the connection reports its end.
            loop {
                if let ReceiveEvent::WsDisconnect { .. } = receive.recv().await {
                    return Ok(());
                }
            }
        }
    }

    #[tokio::test]
    async fn unmasked_client_frame_closes_1002() {
        let mut input = WS_HANDSHAKE.to_vec();
        // Unmasked text frame straight from the encoder.
        input.extend_from_slice(&crate::ws::frame::encode_frame(
            crate::ws::frame::OpCode::Text,
            b"hi",
            true,
        ));
        let out = drive(WsSinkApp, AllLimits::default(), &input).await;
        let (_, frames) = head_and_tail(&out);
        // Close frame carrying 1002.
        assert_eq!(&frames[..4], b"\x88\x02\x03\xea");
    }

    struct WsRejectApp;

    impl Application for WsRejectApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            assert_eq!(receive.recv().await, ReceiveEvent::WsConnect);
            send.send(SendEvent::WsClose {
                code: 1000,
                reason: String::new(),
            })
            .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_before_accept_rejects_handshake_403() {
        let out = drive(WsRejectApp, AllLimits::default(), WS_HANDSHAKE).await;
        assert!(out.starts_with(b"HTTP/1.1 403 Forbidden\r\n"));
    }

    // SSE

    struct SseApp;

    impl Application for SseApp {
        async fn call(
            &self,
            _scope: Scope,
            _receive: ReceiveHandle,
            send: SendHandle,
        ) -> Result<(), AppError> {
            send.send(SendEvent::SseStart {
                status: 200,
                headers: HeaderList::new(),
            })
            .await?;
            send.send(SendEvent::SseSend(SseRecord::data("x"))).await?;
            // Quiet long enough for exactly one keepalive comment.
            tokio::time::sleep(Duration::from_secs(45)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sse_stream_with_keepalive() {
        let out = drive(
            SseApp,
            AllLimits::default(),
            b"GET /events HTTP/1.1\r\nHost: x\r\nAccept: text/event-stream\r\n\r\n",
        )
        .await;
        let (head, body) = head_and_tail(&out);
        let body = String::from_utf8(body).unwrap();

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("content-type: text/event-stream; charset=utf-8\r\n"));
        assert!(body.starts_with("data: x\n\n"));
        assert_eq!(body.matches(": keepalive\n\n").count(), 1);
    }

    struct SseSilentApp;

    impl Application for SseSilentApp {
        async fn call(
            &self,
            _scope: Scope,
            _receive: ReceiveHandle,
            _send: SendHandle,
        ) -> Result<(), AppError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sse_app_without_start_gets_empty_200() {
        let out = drive(
            SseSilentApp,
            AllLimits::default(),
            b"GET /events HTTP/1.1\r\nHost: x\r\nAccept: text/event-stream\r\n\r\n",
        )
        .await;
        let (head, body) = head_and_tail(&out);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("content-length: 0\r\n"));
        assert!(body.is_empty());
    }
}
