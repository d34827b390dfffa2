//! The once-per-worker lifespan dialogue.
//!
//! Before a worker accepts its first connection the app gets one chance to
//! populate the shared [`State`]; before the worker exits it gets one
//! chance to tear it down. Both phases are bounded by deadlines so a
//! wedged app cannot stall the pool.

use crate::{
    app::{AppError, Application},
    channel::{self, CommandReceiver, EventSender, SendCommand, SendError},
    errors::Error,
    event::{ReceiveEvent, SendEvent},
    limits::LifespanLimits,
    scope::{Scope, ScopeKind, State},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// The running lifespan invocation, kept alive for the worker's lifetime.
pub(crate) struct LifespanHandle {
    event_tx: EventSender,
    cmd_rx: CommandReceiver,
    app_task: JoinHandle<Result<(), AppError>>,
}

pub(crate) enum Startup {
    /// The app completed startup; hold this until shutdown.
    Supported(LifespanHandle),
    /// The app does not speak lifespan; proceed with an empty state.
    Unsupported,
}

/// Runs `lifespan.startup`. An explicit failure or a blown deadline is
/// fatal to the worker; an app that ends without answering simply does not
/// support lifespan.
pub(crate) async fn startup<A: Application>(
    app: &Arc<A>,
    state: State,
    limits: &LifespanLimits,
) -> Result<Startup, Error> {
    let (event_tx, mut cmd_rx, receive, send) = channel::pair(ScopeKind::Lifespan, 8);
    let scope = Scope::lifespan(state);
    let app = app.clone();
    let mut app_task = tokio::spawn(async move { app.call(scope, receive, send).await });

    // Fresh queue, so the startup event always has room.
    let _ = event_tx.try_send(ReceiveEvent::LifespanStartup);

    let dialogue = async {
        loop {
            tokio::select! {
                biased;

                result = &mut app_task => {
                    match result {
                        Ok(Ok(())) => debug!("app ended lifespan without answering"),
                        Ok(Err(error)) => debug!(%error, "app rejected the lifespan scope"),
                        Err(join_error) => debug!(%join_error, "lifespan task failed"),
                    }
                    return Ok(None);
                }

                cmd = cmd_rx.recv() => {
                    let Some(SendCommand { event, ack }) = cmd else { continue };
                    match event {
                        SendEvent::StartupComplete => {
                            let _ = ack.send(Ok(()));
                            return Ok(Some(()));
                        }
                        SendEvent::StartupFailed { message } => {
                            let _ = ack.send(Ok(()));
                            return Err(Error::LifespanStartup(message));
                        }
                        _ => {
                            let _ = ack.send(Err(SendError::Protocol(
                                "event not valid during lifespan startup",
                            )));
                        }
                    }
                }
            }
        }
    };

    match tokio::time::timeout(limits.startup_timeout, dialogue).await {
        Ok(Ok(Some(()))) => {
            info!("lifespan startup complete");
            Ok(Startup::Supported(LifespanHandle {
                event_tx,
                cmd_rx,
                app_task,
            }))
        }
        Ok(Ok(None)) => Ok(Startup::Unsupported),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(Error::LifespanStartup(
            "no startup answer within the deadline".to_string(),
        )),
    }
}

/// Runs `lifespan.shutdown` within the grace period. Failures are reported
/// but never block the exit that is already underway.
pub(crate) async fn shutdown(handle: LifespanHandle, limits: &LifespanLimits) -> Result<(), Error> {
    let LifespanHandle {
        event_tx,
        mut cmd_rx,
        app_task,
    } = handle;

    let _ = event_tx.try_send(ReceiveEvent::LifespanShutdown);

    let dialogue = async {
        loop {
            match cmd_rx.recv().await {
                // App ended without acknowledging; nothing left to wait for.
                None => return Ok(()),
                Some(SendCommand { event, ack }) => match event {
                    SendEvent::ShutdownComplete => {
                        let _ = ack.send(Ok(()));
                        return Ok(());
                    }
                    SendEvent::ShutdownFailed { message } => {
                        let _ = ack.send(Ok(()));
                        return Err(Error::LifespanShutdown(message));
                    }
                    _ => {
                        let _ = ack.send(Err(SendError::Protocol(
                            "event not valid during lifespan shutdown",
                        )));
                    }
                },
            }
        }
    };

    let verdict = match tokio::time::timeout(limits.shutdown_timeout, dialogue).await {
        Ok(verdict) => verdict,
        Err(_) => Err(Error::LifespanShutdown(
            "no shutdown answer within the grace period".to_string(),
        )),
    };
    if let Err(error) = &verdict {
        error!(%error, "lifespan shutdown did not complete cleanly");
    }
    app_task.abort();
    verdict
}
