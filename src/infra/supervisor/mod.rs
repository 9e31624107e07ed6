//! Worker pool supervision.
//!
//! The supervisor keeps a fixed number of worker slots filled. Whenever a
//! worker ends, for whatever reason, its slot is relaunched after the delay
//! chosen by [`RespawnPolicy`]. It never accepts connections itself.

mod backoff;
mod launcher;

use std::{
    num::NonZeroUsize,
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};

use metrics::{counter, gauge};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
    task::JoinSet,
    time::{Instant, sleep},
};
use tracing::{error, info, warn};

use super::error::InfraError;

pub use backoff::{RespawnPolicy, SlotBackoff};
pub use launcher::{
    DispatcherFactory, ProcessLauncher, TaskLauncher, WorkerExit, WorkerLauncher,
};

use launcher::AbortOnDrop;

/// Listener descriptor handed to re-executed workers.
pub const WORKER_FD_ENV: &str = "MARKDOWND_WORKER_FD";
/// Slot number of a re-executed worker.
pub const WORKER_ID_ENV: &str = "MARKDOWND_WORKER_ID";

const METRIC_WORKER_EXITS: &str = "markdownd_worker_exits_total";
const METRIC_WORKER_RESTARTS: &str = "markdownd_worker_restarts_total";
const METRIC_WORKERS_RUNNING: &str = "markdownd_workers_running";

/// Role of a process started by [`ProcessLauncher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritedWorker {
    pub fd: RawFd,
    pub slot: usize,
}

impl InheritedWorker {
    /// `None` unless this process was launched as a worker.
    pub fn from_env() -> Result<Option<Self>, InfraError> {
        let Some(fd) = std::env::var_os(WORKER_FD_ENV) else {
            return Ok(None);
        };
        let fd = fd
            .to_str()
            .and_then(|value| value.parse::<RawFd>().ok())
            .ok_or_else(|| {
                InfraError::configuration(format!("{WORKER_FD_ENV} is not a descriptor"))
            })?;
        let slot = std::env::var(WORKER_ID_ENV)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or_default();
        Ok(Some(Self { fd, slot }))
    }
}

struct SlotReport {
    slot: usize,
    lived: Duration,
    exit: WorkerExit,
}

pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    workers: NonZeroUsize,
    policy: RespawnPolicy,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        workers: NonZeroUsize,
        policy: RespawnPolicy,
    ) -> Self {
        Self {
            launcher,
            workers,
            policy,
        }
    }

    /// Keep every slot filled until `shutdown` flips to `true`, then stop
    /// all workers. Returns the number of respawns performed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let workers = self.workers.get();
        let mut pool = JoinSet::new();
        let mut backoff = vec![SlotBackoff::default(); workers];
        let mut respawns = 0u64;

        info!(
            target = "markdownd::supervisor",
            workers,
            "starting worker pool"
        );
        for slot in 0..workers {
            launch(&mut pool, Arc::clone(&self.launcher), slot, Duration::ZERO);
        }
        gauge!(METRIC_WORKERS_RUNNING).set(workers as f64);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                Some(joined) = pool.join_next() => {
                    let report = match joined {
                        Ok(report) => report,
                        Err(err) => {
                            error!(
                                target = "markdownd::supervisor",
                                error = %err,
                                "slot task failed"
                            );
                            continue;
                        }
                    };
                    if *shutdown.borrow() {
                        break;
                    }

                    counter!(METRIC_WORKER_EXITS, "reason" => report.exit.label()).increment(1);
                    let delay = self.policy.next_delay(&mut backoff[report.slot], report.lived);
                    warn!(
                        target = "markdownd::supervisor",
                        worker = report.slot,
                        exit = ?report.exit,
                        lived_ms = report.lived.as_millis() as u64,
                        respawn_in_ms = delay.as_millis() as u64,
                        "worker exited; respawning"
                    );

                    counter!(METRIC_WORKER_RESTARTS).increment(1);
                    respawns += 1;
                    launch(&mut pool, Arc::clone(&self.launcher), report.slot, delay);
                }
            }
        }

        info!(target = "markdownd::supervisor", "stopping worker pool");
        pool.shutdown().await;
        gauge!(METRIC_WORKERS_RUNNING).set(0.0);
        respawns
    }
}

fn launch(
    pool: &mut JoinSet<SlotReport>,
    launcher: Arc<dyn WorkerLauncher>,
    slot: usize,
    delay: Duration,
) {
    pool.spawn(async move {
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let started = Instant::now();
        // A panicking launcher must not take the slot with it.
        let run = tokio::spawn(async move { launcher.run(slot).await });
        let _guard = AbortOnDrop(run.abort_handle());
        let exit = match run.await {
            Ok(exit) => exit,
            Err(err) => WorkerExit::Crashed {
                reason: format!("launcher panicked: {err}"),
            },
        };
        SlotReport {
            slot,
            lived: started.elapsed(),
            exit,
        }
    });
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() -> Result<(), InfraError> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    info!(target = "markdownd::supervisor", signal = name, "shutdown requested");
    Ok(())
}
