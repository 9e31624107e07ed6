//! Ways of running one worker slot to completion.

use std::{
    env,
    ffi::OsString,
    os::{fd::RawFd, unix::process::ExitStatusExt},
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::{process::Command, sync::watch};
use tracing::{debug, info};

use crate::application::render::{RenderDispatcher, RenderError};
use crate::infra::{
    error::InfraError,
    server::{ConnectionLimits, WorkerContext, run_worker},
    transport::Listener,
};

use super::{WORKER_FD_ENV, WORKER_ID_ENV, wait_for_shutdown};

/// How a worker slot ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on its own with success.
    Clean,
    /// Could not start, or stopped with an error status.
    Failed { reason: String },
    /// Killed by a signal or a panic.
    Crashed { reason: String },
}

impl WorkerExit {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerExit::Clean => "clean",
            WorkerExit::Failed { .. } => "failed",
            WorkerExit::Crashed { .. } => "crashed",
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return WorkerExit::Clean;
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Failed {
                reason: format!("exit code {code}"),
            },
            (None, Some(signal)) => WorkerExit::Crashed {
                reason: format!("signal {signal}"),
            },
            (None, None) => WorkerExit::Crashed {
                reason: status.to_string(),
            },
        }
    }
}

/// Runs one worker for a slot and reports how it ended.
///
/// Dropping the returned future must stop the worker.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn run(&self, slot: usize) -> WorkerExit;
}

/// Re-executes the current binary as a worker on an inherited listener.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    listener_fd: RawFd,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<OsString>, listener_fd: RawFd) -> Self {
        Self {
            program,
            args,
            listener_fd,
        }
    }

    /// Launch workers with the same executable and arguments as this process.
    pub fn current(listener_fd: RawFd) -> Result<Self, InfraError> {
        let program = env::current_exe()?;
        Ok(Self::new(program, env::args_os().skip(1).collect(), listener_fd))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn run(&self, slot: usize) -> WorkerExit {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_FD_ENV, self.listener_fd.to_string())
            .env(WORKER_ID_ENV, slot.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                return WorkerExit::Failed {
                    reason: InfraError::Spawn {
                        worker: slot,
                        source,
                    }
                    .to_string(),
                };
            }
        };

        info!(
            target = "markdownd::supervisor",
            worker = slot,
            pid = child.id(),
            "worker process started"
        );

        match child.wait().await {
            Ok(status) => WorkerExit::from_status(status),
            Err(err) => WorkerExit::Failed {
                reason: format!("failed to wait for worker: {err}"),
            },
        }
    }
}

/// Builds the dispatcher a task worker serves with.
pub type DispatcherFactory =
    Arc<dyn Fn() -> Result<RenderDispatcher, RenderError> + Send + Sync>;

/// Runs workers as tasks sharing one listener inside this process.
pub struct TaskLauncher {
    listener: Arc<Listener>,
    dispatcher: DispatcherFactory,
    limits: ConnectionLimits,
    shutdown: watch::Receiver<bool>,
}

impl TaskLauncher {
    pub fn new(
        listener: Arc<Listener>,
        dispatcher: DispatcherFactory,
        limits: ConnectionLimits,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            limits,
            shutdown,
        }
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn run(&self, slot: usize) -> WorkerExit {
        let dispatcher = match (self.dispatcher)() {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                return WorkerExit::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let context = WorkerContext {
            worker: slot,
            dispatcher,
            limits: self.limits,
        };
        let mut shutdown = self.shutdown.clone();
        let task = tokio::spawn(run_worker(Arc::clone(&self.listener), context, async move {
            wait_for_shutdown(&mut shutdown).await;
        }));
        let _guard = AbortOnDrop(task.abort_handle());

        match task.await {
            Ok(()) => WorkerExit::Clean,
            Err(err) if err.is_panic() => WorkerExit::Crashed {
                reason: format!("worker task panicked: {err}"),
            },
            Err(err) => {
                debug!(
                    target = "markdownd::supervisor",
                    worker = slot,
                    error = %err,
                    "worker task cancelled"
                );
                WorkerExit::Clean
            }
        }
    }
}

/// Aborts a spawned worker when the future awaiting it is dropped.
pub(super) struct AbortOnDrop(pub(super) tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tempfile::TempDir;

    use super::*;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("worker.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[tokio::test]
    async fn process_worker_sees_its_slot_and_fd() {
        let dir = TempDir::new().expect("temp dir");
        let out = dir.path().join("env.txt");
        let program = script(
            &dir,
            &format!(
                "echo \"${WORKER_ID_ENV}:${WORKER_FD_ENV}\" > '{}'",
                out.display()
            ),
        );

        let exit = ProcessLauncher::new(program, Vec::new(), 7).run(3).await;

        assert_eq!(exit, WorkerExit::Clean);
        assert_eq!(fs::read_to_string(out).expect("env").trim(), "3:7");
    }

    #[tokio::test]
    async fn exit_status_is_classified() {
        let dir = TempDir::new().expect("temp dir");
        let failing = script(&dir, "exit 3");
        let exit = ProcessLauncher::new(failing, Vec::new(), 0).run(0).await;
        assert_eq!(
            exit,
            WorkerExit::Failed {
                reason: "exit code 3".into()
            }
        );

        let dir = TempDir::new().expect("temp dir");
        let killed = script(&dir, "kill -9 $$");
        let exit = ProcessLauncher::new(killed, Vec::new(), 0).run(0).await;
        assert_eq!(exit.label(), "crashed");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let exit = ProcessLauncher::new(PathBuf::from("/nonexistent/markdownd"), Vec::new(), 0)
            .run(1)
            .await;
        assert!(matches!(exit, WorkerExit::Failed { ref reason } if reason.contains("worker 1")));
    }
}
