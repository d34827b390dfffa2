//! The pre-fork supervisor (unix only).
//!
//! The parent binds the listen socket, blocks its signal set, forks the
//! pool, and then sits in a synchronous `sigwait` loop: no runtime, no
//! threads, nothing that makes forking hazardous. Workers inherit the
//! socket and run their own event loops.

use crate::{app::Application, errors::Error, limits::AllLimits, server::worker};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

/// Ceiling for TTIN scaling.
const MAX_WORKERS: usize = 256;

/// Crash-respawn backoff bounds.
const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const BACKOFF_CEIL: Duration = Duration::from_secs(10);
/// A respawn this soon after the previous spawn counts as a crash loop.
const CRASH_WINDOW: Duration = Duration::from_secs(1);

struct WorkerSlot {
    pid: Pid,
    dont_respawn: bool,
    spawned_at: Instant,
}

struct Pool<'a, A: Application> {
    listener: &'a std::net::TcpListener,
    app: Arc<A>,
    limits: Arc<AllLimits>,
    tls: worker::TlsContext,
    blocked: SigSet,
    workers: Vec<WorkerSlot>,
    backoff: Duration,
    shutting_down: bool,
}

/// Runs the pool until a stop signal lands. Blocking; call before any
/// async runtime exists in this process.
pub(crate) fn run<A: Application>(
    listener: std::net::TcpListener,
    app: Arc<A>,
    limits: Arc<AllLimits>,
    tls: worker::TlsContext,
) -> Result<(), Error> {
    let mut blocked = SigSet::empty();
    for signal in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGCHLD,
    ] {
        blocked.add(signal);
    }
    blocked.thread_block()?;

    let mut pool = Pool {
        listener: &listener,
        app,
        limits: limits.clone(),
        tls,
        blocked,
        workers: Vec::new(),
        backoff: BACKOFF_FLOOR,
        shutting_down: false,
    };

    for _ in 0..limits.server.workers.max(1) {
        pool.spawn()?;
    }
    info!(workers = pool.workers.len(), "worker pool started");

    loop {
        let signal = match pool.blocked.wait() {
            Ok(signal) => signal,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        };
        match signal {
            Signal::SIGCHLD => pool.reap_and_respawn()?,
            Signal::SIGTERM | Signal::SIGINT => {
                info!("received stop signal, shutting down pool");
                pool.shutdown();
                return Ok(());
            }
            Signal::SIGHUP => pool.rolling_restart()?,
            Signal::SIGTTIN => {
                if pool.workers.len() < MAX_WORKERS {
                    pool.spawn()?;
                    info!(workers = pool.workers.len(), "scaled up");
                }
            }
            Signal::SIGTTOU => pool.retire_newest(),
            _ => {}
        }
    }
}

impl<A: Application> Pool<'_, A> {
    fn spawn(&mut self) -> Result<(), Error> {
        let forked = unsafe { fork() }?;
        match forked {
            ForkResult::Parent { child } => {
                self.workers.push(WorkerSlot {
                    pid: child,
                    dont_respawn: false,
                    spawned_at: Instant::now(),
                });
                Ok(())
            }
            ForkResult::Child => {
                // The worker handles TERM/INT itself.
                let _ = self.blocked.thread_unblock();
                let code = match self.listener.try_clone() {
                    Err(error) => {
                        error!(%error, "worker could not clone the listener");
                        1
                    }
                    Ok(listener) => match worker::run(
                        listener,
                        self.app.clone(),
                        self.limits.clone(),
                        self.tls.clone(),
                    ) {
                        Ok(()) => 0,
                        Err(error) => {
                            error!(%error, "worker exited with error");
                            1
                        }
                    },
                };
                std::process::exit(code);
            }
        }
    }

    /// Collects every exited child; respawns unless retiring or stopping.
    fn reap_and_respawn(&mut self) -> Result<(), Error> {
        loop {
            let (pid, clean) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, code == 0),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    warn!(%pid, %signal, "worker killed by signal");
                    (pid, false)
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(()),
                Ok(_) => continue,
                Err(errno) => return Err(errno.into()),
            };

            let Some(at) = self.workers.iter().position(|w| w.pid == pid) else {
                continue;
            };
            let slot = self.workers.remove(at);
            if self.shutting_down || slot.dont_respawn {
                continue;
            }

            if !clean && slot.spawned_at.elapsed() < CRASH_WINDOW {
                // Crash loop: fork bombs are worse than slow recovery.
                self.backoff = (self.backoff * 2).min(BACKOFF_CEIL);
                warn!(%pid, backoff_ms = self.backoff.as_millis() as u64, "worker crash loop");
                thread::sleep(self.backoff);
            } else {
                self.backoff = BACKOFF_FLOOR;
                info!(%pid, clean, "worker exited, respawning");
            }
            self.spawn()?;
        }
    }

    /// HUP: replace workers one at a time so the pool never empties.
    fn rolling_restart(&mut self) -> Result<(), Error> {
        info!("rolling restart");
        let pids: Vec<Pid> = self.workers.iter().map(|w| w.pid).collect();
        for pid in pids {
            let _ = kill(pid, Signal::SIGTERM);
            let _ = waitpid(pid, None);
            if let Some(at) = self.workers.iter().position(|w| w.pid == pid) {
                self.workers.remove(at);
            }
            self.spawn()?;
        }
        Ok(())
    }

    /// TTOU: retire the most recently spawned worker, floor of one.
    fn retire_newest(&mut self) {
        if self.workers.len() <= 1 {
            return;
        }
        if let Some(newest) = self
            .workers
            .iter_mut()
            .max_by_key(|worker| worker.spawned_at)
        {
            newest.dont_respawn = true;
            info!(pid = %newest.pid, "scaling down");
            let _ = kill(newest.pid, Signal::SIGTERM);
        }
    }

    /// TERM/INT: broadcast TERM, wait out the grace, then KILL stragglers.
    fn shutdown(&mut self) {
        self.shutting_down = true;
        for slot in &self.workers {
            let _ = kill(slot.pid, Signal::SIGTERM);
        }

        let grace =
            self.limits.server.shutdown_grace + self.limits.lifespan.shutdown_timeout;
        let deadline = Instant::now() + grace;
        while !self.workers.is_empty() && Instant::now() < deadline {
            self.collect_exited();
            thread::sleep(Duration::from_millis(50));
        }

        for slot in self.workers.drain(..) {
            warn!(pid = %slot.pid, "worker ignored the grace period, killing");
            let _ = kill(slot.pid, Signal::SIGKILL);
            let _ = waitpid(slot.pid, None);
        }
    }

    fn collect_exited(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.workers.retain(|w| w.pid != pid);
                }
                _ => return,
            }
        }
    }
}
