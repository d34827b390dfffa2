//! Server-Sent Events: record encoding and the streaming session.
//!
//! Records are encoded as one atomic block each, so a keepalive comment can
//! never split a record. The response itself is a raw close-delimited
//! stream: head, then records, until either side goes away.

use crate::{
    app::AppError,
    channel::{CommandReceiver, EventSender, SendCommand, SendError},
    event::{ReceiveEvent, SendEvent, SseRecord},
    http::encode,
    limits::{ConnLimits, SseLimits},
    scope::HeaderList,
    server::connection::write_all_timed,
};
use bytes::BytesMut;
use memchr::memchr_iter;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

pub(crate) const KEEPALIVE: &[u8] = b": keepalive\n\n";

/// Encodes one record: `id:`, `event:`, `retry:`, then one `data:` line per
/// LF-separated line of the payload, terminated by a blank line.
pub(crate) fn encode_record(record: &SseRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(record.data.len() + 32);

    if let Some(id) = &record.id {
        out.extend_from_slice(b"id: ");
        out.extend_from_slice(id.as_bytes());
        out.push(b'\n');
    }
    if let Some(event) = &record.event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(event.as_bytes());
        out.push(b'\n');
    }
    if let Some(retry) = record.retry {
        out.extend_from_slice(format!("retry: {retry}\n").as_bytes());
    }

    let data = record.data.as_bytes();
    let mut start = 0;
    for nl in memchr_iter(b'\n', data) {
        push_data_line(&mut out, &data[start..nl]);
        start = nl + 1;
    }
    push_data_line(&mut out, &data[start..]);

    out.push(b'\n');
    out
}

#[inline]
fn push_data_line(out: &mut Vec<u8>, line: &[u8]) {
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(line);
    out.push(b'\n');
}

/// Serializes the `sse.start` response head. The stream is close-delimited,
/// so no length framing is added.
pub(crate) fn encode_start_head(status: u16, headers: &HeaderList, date: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(192);
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", status, encode::reason_phrase(status)).as_bytes(),
    );

    for (name, value) in headers.iter() {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    if headers.get(b"content-type").is_none() {
        out.extend_from_slice(b"content-type: text/event-stream; charset=utf-8\r\n");
    }
    if headers.get(b"cache-control").is_none() {
        out.extend_from_slice(b"cache-control: no-cache\r\n");
    }
    if headers.get(b"connection").is_none() {
        out.extend_from_slice(b"connection: keep-alive\r\n");
    }
    if headers.get(b"date").is_none() {
        out.extend_from_slice(b"date: ");
        out.extend_from_slice(date.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Drives one SSE invocation after routing. Returns the status sent by
/// `sse.start`, or `None` when the app never started (the fallback empty
/// `200` goes out instead). The connection always closes afterwards
/// because the stream is close-delimited.
pub(crate) async fn run_session<R, W>(
    rd: &mut R,
    wr: &mut W,
    mut cmd_rx: CommandReceiver,
    event_tx: EventSender,
    app_task: &mut JoinHandle<Result<(), AppError>>,
    limits: &SseLimits,
    conn_limits: &ConnLimits,
    requests_served: &AtomicU64,
) -> Option<u16>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut started: Option<u16> = None;
    let mut peer_gone = false;
    let mut scratch = BytesMut::with_capacity(512);
    let mut next_keepalive = limits.keepalive_interval.map(|k| Instant::now() + k);

    loop {
        tokio::select! {
            biased;

            result = &mut *app_task => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => debug!(%error, "sse app ended with error"),
                    Err(join_error) => debug!(%join_error, "sse app task failed"),
                }
                if started.is_none() {
                    // The app produced nothing; answer with an empty 200.
                    let page = encode::simple_response(200, &[], "", &encode::http_date());
                    let _ = write_all_timed(wr, &page, conn_limits.write_timeout).await;
                    requests_served.fetch_add(1, Ordering::Relaxed);
                }
                return started;
            }

            cmd = cmd_rx.recv() => {
                let Some(SendCommand { event, ack }) = cmd else {
                    // Send handle dropped; keep waiting for the app task.
                    continue;
                };
                match (event, started) {
                    (SendEvent::SseStart { status, headers }, None) => {
                        let head = encode_start_head(status, &headers, &encode::http_date());
                        match write_all_timed(wr, &head, conn_limits.write_timeout).await {
                            Ok(()) => {
                                requests_served.fetch_add(1, Ordering::Relaxed);
                                started = Some(status);
                                if let Some(k) = limits.keepalive_interval {
                                    next_keepalive = Some(Instant::now() + k);
                                }
                                let _ = ack.send(Ok(()));
                            }
                            Err(_) => {
                                let _ = event_tx.try_send(ReceiveEvent::SseDisconnect);
                                let _ = ack.send(Err(SendError::Disconnected));
                                return started;
                            }
                        }
                    }
                    (SendEvent::SseStart { .. }, Some(_)) => {
                        let _ = ack.send(Err(SendError::Protocol("sse.start already sent")));
                    }
                    (SendEvent::SseSend(record), Some(_)) => {
                        let block = encode_record(&record);
                        match write_all_timed(wr, &block, conn_limits.write_timeout).await {
                            Ok(()) => {
                                if let Some(k) = limits.keepalive_interval {
                                    next_keepalive = Some(Instant::now() + k);
                                }
                                let _ = ack.send(Ok(()));
                            }
                            Err(_) => {
                                // Write errors after start terminate silently.
                                let _ = event_tx.try_send(ReceiveEvent::SseDisconnect);
                                let _ = ack.send(Err(SendError::Disconnected));
                                return started;
                            }
                        }
                    }
                    (SendEvent::SseSend(_), None) => {
                        let _ = ack.send(Err(SendError::Protocol("sse.send before sse.start")));
                    }
                    _ => {
                        let _ = ack.send(Err(SendError::Protocol("event not valid in sse scope")));
                    }
                }
            }

            // A keepalive comment fires only between records, never inside one.
            _ = tokio::time::sleep_until(next_keepalive.unwrap_or_else(Instant::now)),
                if started.is_some() && next_keepalive.is_some() =>
            {
                if write_all_timed(wr, KEEPALIVE, conn_limits.write_timeout).await.is_err() {
                    let _ = event_tx.try_send(ReceiveEvent::SseDisconnect);
                    return started;
                }
                let k = limits.keepalive_interval.expect("interval set");
                next_keepalive = Some(Instant::now() + k);
            }

            read = rd.read_buf(&mut scratch), if !peer_gone => {
                match read {
                    Ok(0) | Err(_) => {
                        peer_gone = true;
                        let _ = event_tx.try_send(ReceiveEvent::SseDisconnect);
                    }
                    // Anything a client writes mid-stream is discarded.
                    Ok(_) => scratch.clear(),
                }
            }
        }
    }
}
