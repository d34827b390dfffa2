//! The application channel: receive/send handles and their plumbing.
//!
//! The connection driver owns the transport. Applications talk to it
//! through two handles: [`ReceiveHandle`] drains the bounded per-connection
//! event queue, [`SendHandle`] submits outbound events and waits for the
//! driver to hand them to the transport. The handles borrow nothing from
//! the connection; they hold channel endpoints, so the app task and the
//! driver are free to run concurrently.

use crate::{
    event::{ReceiveEvent, SendEvent},
    scope::ScopeKind,
};
use tokio::sync::{mpsc, oneshot};

/// Why a send did not reach the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The event is not legal in the current protocol state, e.g. a
    /// `http.response.body` before `http.response.start`.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The connection is gone; this and every later send fails.
    #[error("connection closed")]
    Disconnected,
}

/// One outbound event plus the slot the driver answers through once the
/// event has been serialized into the transport write (or rejected).
pub(crate) struct SendCommand {
    pub(crate) event: SendEvent,
    pub(crate) ack: oneshot::Sender<Result<(), SendError>>,
}

pub(crate) type EventSender = mpsc::Sender<ReceiveEvent>;
pub(crate) type CommandReceiver = mpsc::Receiver<SendCommand>;

/// Consumes the connection's inbound event queue.
///
/// At most one `recv` can be outstanding because it takes `&mut self`; the
/// single-consumer invariant is enforced by ownership rather than at
/// runtime. Once the connection ends, `recv` keeps yielding the terminal
/// disconnect event for the scope kind instead of failing.
pub struct ReceiveHandle {
    rx: mpsc::Receiver<ReceiveEvent>,
    terminal: ReceiveEvent,
}

impl ReceiveHandle {
    /// Resolves to the next inbound event, suspending while the queue is
    /// empty.
    pub async fn recv(&mut self) -> ReceiveEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => self.terminal.clone(),
        }
    }
}

/// Submits outbound events for the connection driver to serialize.
///
/// `send` resolves once the event has been validated and written into the
/// transport buffer, not when the peer acknowledges anything. Under write
/// backpressure it suspends. After a transport error every send fails with
/// [`SendError::Disconnected`].
#[derive(Clone)]
pub struct SendHandle {
    tx: mpsc::Sender<SendCommand>,
}

impl SendHandle {
    pub async fn send(&self, event: SendEvent) -> Result<(), SendError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SendCommand { event, ack })
            .await
            .map_err(|_| SendError::Disconnected)?;
        done.await.map_err(|_| SendError::Disconnected)?
    }
}

const fn terminal_event(kind: ScopeKind) -> ReceiveEvent {
    match kind {
        ScopeKind::Http => ReceiveEvent::HttpDisconnect,
        ScopeKind::WebSocket => ReceiveEvent::WsDisconnect {
            code: 1006,
            reason: String::new(),
        },
        ScopeKind::Sse => ReceiveEvent::SseDisconnect,
        ScopeKind::Lifespan => ReceiveEvent::LifespanShutdown,
    }
}

/// Builds the channel set for one app invocation.
///
/// `capacity` bounds the receive queue; the driver awaits a queue permit
/// before reading more transport bytes, which is what turns a slow
/// consumer into transport backpressure.
pub(crate) fn pair(
    kind: ScopeKind,
    capacity: usize,
) -> (EventSender, CommandReceiver, ReceiveHandle, SendHandle) {
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
    let (cmd_tx, cmd_rx) = mpsc::channel(8);

    (
        event_tx,
        cmd_rx,
        ReceiveHandle {
            rx: event_rx,
            terminal: terminal_event(kind),
        },
        SendHandle { tx: cmd_tx },
    )
}

#[cfg(test)]
mod handles {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn recv_in_queue_order_then_terminal() {
        let (event_tx, _cmd_rx, mut receive, _send) = pair(ScopeKind::Http, 4);

        event_tx
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"a"),
                more: true,
            })
            .await
            .unwrap();
        event_tx
            .send(ReceiveEvent::HttpRequest {
                body: Bytes::from_static(b"b"),
                more: false,
            })
            .await
            .unwrap();
        drop(event_tx);

        assert!(matches!(
            receive.recv().await,
            ReceiveEvent::HttpRequest { ref body, more: true } if body.as_ref() == b"a"
        ));
        assert!(matches!(
            receive.recv().await,
            ReceiveEvent::HttpRequest { ref body, more: false } if body.as_ref() == b"b"
        ));
        // Closed queue degrades to the terminal event, repeatedly.
        assert_eq!(receive.recv().await, ReceiveEvent::HttpDisconnect);
        assert_eq!(receive.recv().await, ReceiveEvent::HttpDisconnect);
    }

    #[test]
    fn terminal_events_per_kind() {
        assert_eq!(
            terminal_event(ScopeKind::Sse),
            ReceiveEvent::SseDisconnect
        );
        assert_eq!(
            terminal_event(ScopeKind::Lifespan),
            ReceiveEvent::LifespanShutdown
        );
        assert!(matches!(
            terminal_event(ScopeKind::WebSocket),
            ReceiveEvent::WsDisconnect { code: 1006, .. }
        ));
    }

    #[tokio::test]
    async fn queue_capacity_applies_backpressure() {
        let (event_tx, _cmd_rx, _receive, _send) = pair(ScopeKind::Http, 2);

        for _ in 0..2 {
            event_tx
                .try_send(ReceiveEvent::HttpDisconnect)
                .expect("within capacity");
        }
        // Third event has no permit until the app drains the queue.
        assert!(event_tx.try_send(ReceiveEvent::HttpDisconnect).is_err());
    }

    #[tokio::test]
    async fn send_resolves_with_driver_verdict() {
        let (_event_tx, mut cmd_rx, _receive, send) = pair(ScopeKind::Http, 4);

        let driver = tokio::spawn(async move {
            let SendCommand { ack, .. } = cmd_rx.recv().await.unwrap();
            let _ = ack.send(Err(SendError::Protocol("response not started")));
            // Dropping the receiver fails later sends outright.
        });

        let verdict = send
            .send(SendEvent::ResponseBody {
                body: Bytes::new(),
                more: false,
            })
            .await;
        assert_eq!(
            verdict,
            Err(SendError::Protocol("response not started"))
        );

        driver.await.unwrap();
        let verdict = send.send(SendEvent::ShutdownComplete).await;
        assert_eq!(verdict, Err(SendError::Disconnected));
    }
}
