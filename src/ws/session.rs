//! The open WebSocket connection: message assembly, control frames,
//! heartbeat, and close semantics.

use crate::{
    app::AppError,
    channel::{CommandReceiver, EventSender, SendCommand, SendError},
    errors::ProtocolError,
    event::{ReceiveEvent, SendEvent, WsPayload},
    limits::{ConnLimits, WsLimits},
    server::connection::write_all_timed,
    ws::frame::{
        self, close_payload, encode_frame, parse_close_payload, parse_frame, Frame, OpCode,
    },
};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

/// Accumulates data frames into one logical message.
#[derive(Debug, Default)]
struct Assembler {
    pending: Option<(OpCode, Vec<u8>)>,
}

impl Assembler {
    /// Feeds one data frame; returns the finished message on FIN.
    fn push(
        &mut self,
        frame: Frame,
        limits: &WsLimits,
    ) -> Result<Option<WsPayload>, ProtocolError> {
        match (frame.opcode, &mut self.pending) {
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                Err(ProtocolError::WsProtocol("expected continuation frame"))
            }
            (OpCode::Continuation, None) => {
                Err(ProtocolError::WsProtocol("continuation without start"))
            }
            (OpCode::Text | OpCode::Binary, None) if frame.fin => {
                Self::finish(frame.opcode, frame.payload.to_vec())
            }
            (OpCode::Text | OpCode::Binary, None) => {
                self.pending = Some((frame.opcode, frame.payload.to_vec()));
                Ok(None)
            }
            (OpCode::Continuation, Some((opcode, data))) => {
                if data.len() + frame.payload.len() > limits.max_message_size {
                    return Err(ProtocolError::WsMessageTooBig);
                }
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    let (opcode, data) = self.pending.take().expect("pending message");
                    Self::finish(opcode, data)
                } else {
                    Ok(None)
                }
            }
            _ => Err(ProtocolError::WsProtocol("unexpected frame")),
        }
    }

    fn finish(opcode: OpCode, data: Vec<u8>) -> Result<Option<WsPayload>, ProtocolError> {
        match opcode {
            OpCode::Text => {
                simdutf8::basic::from_utf8(&data).map_err(|_| ProtocolError::WsInvalidUtf8)?;
                // Validated just above.
                let text = unsafe { String::from_utf8_unchecked(data) };
                Ok(Some(WsPayload::Text(text)))
            }
            _ => Ok(Some(WsPayload::Binary(Bytes::from(data)))),
        }
    }
}

/// One step of inbound processing.
enum Inbound {
    /// A full message was delivered into the receive queue.
    Delivered,
    /// The peer pinged; a pong is owed.
    Ping(Bytes),
    /// The peer answered a heartbeat.
    Pong,
    /// The peer sent a close frame.
    Close { code: u16, reason: String, echo: Bytes },
    /// End of stream without a close frame.
    Eof,
    /// The app dropped its receive handle; stop reading.
    QueueClosed,
    Failed(ProtocolError),
    Died,
}

/// Reads until one inbound step completes. A queue permit is reserved
/// first, so a slow app stalls transport reads instead of growing memory.
async fn next_inbound<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
    assembler: &mut Assembler,
    event_tx: &EventSender,
    limits: &WsLimits,
) -> Inbound {
    let Ok(permit) = event_tx.reserve().await else {
        return Inbound::QueueClosed;
    };

    loop {
        match parse_frame(buf, limits.max_frame_size) {
            Err(error) => return Inbound::Failed(error),
            Ok(Some(frame)) => match frame.opcode {
                OpCode::Ping => return Inbound::Ping(frame.payload),
                OpCode::Pong => return Inbound::Pong,
                OpCode::Close => match parse_close_payload(&frame.payload) {
                    Ok((code, reason)) => {
                        return Inbound::Close {
                            code,
                            reason,
                            echo: frame.payload,
                        }
                    }
                    Err(error) => return Inbound::Failed(error),
                },
                _ => match assembler.push(frame, limits) {
                    Ok(Some(message)) => {
                        permit.send(ReceiveEvent::WsReceive(message));
                        return Inbound::Delivered;
                    }
                    Ok(None) => {}
                    Err(error) => return Inbound::Failed(error),
                },
            },
            Ok(None) => match rd.read_buf(buf).await {
                Ok(0) => return Inbound::Eof,
                Ok(_) => {}
                Err(_) => return Inbound::Died,
            },
        }
    }
}

/// Drives an accepted WebSocket until close. The connection always closes
/// afterwards: an upgraded stream never returns to HTTP.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_open<R, W>(
    rd: &mut R,
    buf: &mut BytesMut,
    wr: &mut W,
    mut cmd_rx: CommandReceiver,
    event_tx: EventSender,
    app_task: &mut JoinHandle<Result<(), AppError>>,
    limits: &WsLimits,
    conn_limits: &ConnLimits,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut assembler = Assembler::default();
    let mut reading = true;
    let mut awaiting_pong = false;
    let mut heartbeat_at = limits.heartbeat_interval.map(|h| Instant::now() + h);

    macro_rules! send_close {
        ($code:expr, $reason:expr) => {{
            let payload = close_payload($code, $reason);
            let _ = write_all_timed(
                wr,
                &encode_frame(OpCode::Close, &payload, true),
                conn_limits.write_timeout,
            )
            .await;
        }};
    }

    loop {
        tokio::select! {
            biased;

            result = &mut *app_task => {
                match result {
                    Ok(Ok(())) => send_close!(1000, ""),
                    Ok(Err(error)) => {
                        debug!(%error, "websocket app ended with error");
                        send_close!(1011, "internal error");
                    }
                    Err(join_error) => {
                        debug!(%join_error, "websocket app task failed");
                        send_close!(1011, "internal error");
                    }
                }
                return;
            }

            cmd = cmd_rx.recv() => {
                let Some(SendCommand { event, ack }) = cmd else { continue };
                match event {
                    SendEvent::WsSend(payload) => {
                        let bytes = match &payload {
                            WsPayload::Text(text) => {
                                encode_frame(OpCode::Text, text.as_bytes(), true)
                            }
                            WsPayload::Binary(data) => encode_frame(OpCode::Binary, data, true),
                        };
                        match write_all_timed(wr, &bytes, conn_limits.write_timeout).await {
                            Ok(()) => {
                                if let Some(h) = limits.heartbeat_interval {
                                    heartbeat_at = Some(Instant::now() + h);
                                }
                                let _ = ack.send(Ok(()));
                            }
                            Err(_) => {
                                let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                                    code: 1006,
                                    reason: String::new(),
                                });
                                let _ = ack.send(Err(SendError::Disconnected));
                                return;
                            }
                        }
                    }
                    SendEvent::WsClose { code, reason } => {
                        let code = if frame::close_code_allowed(code) { code } else { 1000 };
                        send_close!(code, &reason);
                        let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                            code,
                            reason,
                        });
                        let _ = ack.send(Ok(()));
                        return;
                    }
                    SendEvent::WsAccept { .. } => {
                        let _ = ack.send(Err(SendError::Protocol("handshake already complete")));
                    }
                    _ => {
                        let _ = ack.send(Err(SendError::Protocol(
                            "event not valid in websocket scope",
                        )));
                    }
                }
            }

            inbound = next_inbound(rd, buf, &mut assembler, &event_tx, limits), if reading => {
                match inbound {
                    Inbound::Delivered => {}
                    Inbound::Ping(payload) => {
                        let pong = encode_frame(OpCode::Pong, &payload, true);
                        if write_all_timed(wr, &pong, conn_limits.write_timeout).await.is_err() {
                            let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                                code: 1006,
                                reason: String::new(),
                            });
                            return;
                        }
                    }
                    Inbound::Pong => {
                        awaiting_pong = false;
                        if let Some(h) = limits.heartbeat_interval {
                            heartbeat_at = Some(Instant::now() + h);
                        }
                    }
                    Inbound::Close { code, reason, echo } => {
                        let reply = encode_frame(OpCode::Close, &echo, true);
                        let _ = write_all_timed(wr, &reply, conn_limits.write_timeout).await;
                        let _ = event_tx.try_send(ReceiveEvent::WsDisconnect { code, reason });
                        return;
                    }
                    Inbound::Eof | Inbound::Died => {
                        let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                            code: 1006,
                            reason: String::new(),
                        });
                        return;
                    }
                    Inbound::QueueClosed => reading = false,
                    Inbound::Failed(error) => {
                        let code = error.close_code().unwrap_or(1002);
                        send_close!(code, "");
                        let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                            code,
                            reason: String::new(),
                        });
                        return;
                    }
                }
            }

            // Heartbeat: ping after quiet periods, give up when the pong
            // deadline lapses.
            _ = tokio::time::sleep_until(heartbeat_at.unwrap_or_else(Instant::now)),
                if heartbeat_at.is_some() =>
            {
                if awaiting_pong {
                    send_close!(1001, "heartbeat timeout");
                    let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                        code: 1001,
                        reason: String::new(),
                    });
                    return;
                }
                let ping = encode_frame(OpCode::Ping, b"", true);
                if write_all_timed(wr, &ping, conn_limits.write_timeout).await.is_err() {
                    let _ = event_tx.try_send(ReceiveEvent::WsDisconnect {
                        code: 1006,
                        reason: String::new(),
                    });
                    return;
                }
                awaiting_pong = true;
                heartbeat_at = Some(Instant::now() + limits.heartbeat_timeout);
            }
        }
    }
}
