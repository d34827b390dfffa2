//! Listener construction, admission control and the startup banner.
//!
//! The listen socket is built with socket2 in the supervisor process so
//! bind errors surface before any fork and workers inherit the descriptor.
//! Admission keeps the worker's file-descriptor budget deterministic:
//! connections over the cap get a complete dated `503` and never become a
//! connection state machine.

use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::warn;

/// Binds a nonblocking std listener ready for sharing across workers.
pub(crate) fn bind_std(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(socket.into())
}

/// The connection cap: the configured value, or a safety margin under the
/// process file-descriptor limit when unconfigured.
pub(crate) fn effective_max_connections(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let limit = fd_limit().unwrap_or(1024);
    (limit.saturating_sub(50)).max(10)
}

#[cfg(unix)]
fn fd_limit() -> Option<usize> {
    use nix::sys::resource::{getrlimit, Resource};
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE).ok()?;
    usize::try_from(soft).ok()
}

#[cfg(not(unix))]
fn fd_limit() -> Option<usize> {
    None
}

/// Counts active connections against the cap.
#[derive(Clone)]
pub(crate) struct Admission {
    active: Arc<AtomicUsize>,
    max: usize,
}

impl Admission {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Admits one connection, or reports the cap was hit. The guard
    /// releases the slot on drop.
    pub(crate) fn try_admit(&self) -> Option<AdmissionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                warn!(
                    active = current,
                    max = self.max,
                    "connection limit reached, rejecting with 503",
                );
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(AdmissionGuard {
                        active: self.active.clone(),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

pub(crate) struct AdmissionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// `too many open files`, at either the process or system level.
#[cfg(unix)]
pub(crate) fn fd_exhausted(error: &io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        error.raw_os_error(),
        Some(code) if code == Errno::EMFILE as i32 || code == Errno::ENFILE as i32
    )
}

#[cfg(not(unix))]
pub(crate) fn fd_exhausted(_error: &io::Error) -> bool {
    false
}

/// The stderr line printed once the listen socket is live.
pub(crate) fn banner(
    scheme: &str,
    addr: SocketAddr,
    workers: usize,
    max_conn: usize,
    tls: &str,
    sendfile: bool,
) -> String {
    format!(
        "listening on {scheme}://{addr}/ (workers: {workers}, max_conn: {max_conn}, \
         tls: {tls}, sendfile: {})",
        if sendfile { "on" } else { "off" },
    )
}

#[cfg(test)]
mod admission {
    use super::*;

    #[test]
    fn cap_is_enforced_and_released() {
        let admission = Admission::new(2);

        let first = admission.try_admit().expect("first under cap");
        let _second = admission.try_admit().expect("second under cap");
        assert!(admission.try_admit().is_none(), "third over cap");
        assert_eq!(admission.active(), 2);

        drop(first);
        assert!(admission.try_admit().is_some(), "slot released on drop");
    }

    #[test]
    fn effective_max_has_a_floor() {
        assert_eq!(effective_max_connections(7), 7);
        assert!(effective_max_connections(0) >= 10);
    }

    #[test]
    fn banner_format() {
        let addr: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        assert_eq!(
            banner("http", addr, 4, 100, "disabled", false),
            "listening on http://127.0.0.1:8000/ (workers: 4, max_conn: 100, \
             tls: disabled, sendfile: off)",
        );
    }

    #[test]
    fn binds_an_ephemeral_port() {
        let listener = bind_std("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // A second bind to the same port must fail and report the address.
        let err = bind_std(addr, 128);
        assert!(err.is_err());
    }
}
