//! The application side of the gateway contract.

use crate::{
    channel::{ReceiveHandle, SendHandle},
    scope::Scope,
};
use std::future::Future;

/// Errors an application invocation may end with.
///
/// The core never inspects the error beyond logging it; what matters is the
/// protocol fallout: `500` before `http.response.start`, truncation after,
/// close `1011` for WebSocket, silent termination for SSE.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// An application: a callable invoked once per scope with the scope
/// envelope, a receive handle and a send handle.
///
/// One invocation runs per HTTP request, per WebSocket connection, per SSE
/// stream, and once per worker for lifespan. Invocations within a worker
/// run on a single-threaded event loop: they interleave at awaits but never
/// in parallel, so worker-local data needs no locking.
///
/// # Examples
///
/// ```
/// use pagi::{Application, AppError, ReceiveHandle, Scope, SendHandle};
/// use pagi::{HeaderList, ReceiveEvent, SendEvent};
/// use bytes::Bytes;
///
/// struct Hello;
///
/// impl Application for Hello {
///     async fn call(
///         &self,
///         _scope: Scope,
///         mut receive: ReceiveHandle,
///         send: SendHandle,
///     ) -> Result<(), AppError> {
///         // Drain the request body.
///         while let ReceiveEvent::HttpRequest { more: true, .. } = receive.recv().await {}
///
///         let headers: HeaderList =
///             [("content-type", "text/plain"), ("content-length", "5")]
///                 .into_iter()
///                 .collect();
///         send.send(SendEvent::ResponseStart { status: 200, headers }).await?;
///         send.send(SendEvent::ResponseBody {
///             body: Bytes::from_static(b"hello"),
///             more: false,
///         })
///         .await?;
///         Ok(())
///     }
/// }
/// ```
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: ReceiveHandle,
        send: SendHandle,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
