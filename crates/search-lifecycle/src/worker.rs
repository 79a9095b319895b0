//! Process-isolated full reindex.
//!
//! A full rebuild of a large index can run for hours; running it inline
//! would stall every other logical index. The runner spawns the daemon
//! binary's hidden worker subcommand bound to one (key, generation)
//! pair. The worker opens its own backend connection, drains the source
//! fully, validates the result and exits with [`WORKER_SUCCESS_EXIT`] on
//! success; any other exit code, or death by signal, is a failure and
//! leaves the `next` pointer in place for a retry on a later cycle.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::LifecycleError;

/// Sentinel exit code a worker uses to signal a validated reindex.
///
/// Distinct from 0 so that an accidental clean exit (e.g. a panic
/// handler or a wrapper script swallowing the real status) is never
/// mistaken for success.
pub const WORKER_SUCCESS_EXIT: i32 = 42;

/// Observable state of a reindex job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexStatus {
    /// No job started, or the last one was already reaped
    Idle,
    /// Worker process alive
    Running,
    /// Worker exited with the success sentinel
    Succeeded,
    /// Worker exited any other way
    Failed,
}

/// Driver for asynchronous reindex jobs.
#[async_trait]
pub trait ReindexRunner: Send {
    /// Spawn a job for one generation. Errors when one is already live.
    async fn start(&mut self, key: &str, generation: &str) -> Result<(), LifecycleError>;

    /// Reap the job state; `Succeeded`/`Failed` are returned once and
    /// the runner goes back to `Idle`.
    async fn poll(&mut self) -> ReindexStatus;

    /// Advisory termination, used at shutdown.
    async fn terminate(&mut self);
}

/// [`ReindexRunner`] that forks the current executable.
pub struct ProcessReindexRunner {
    config_path: PathBuf,
    child: Option<Child>,
}

impl ProcessReindexRunner {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            child: None,
        }
    }
}

#[async_trait]
impl ReindexRunner for ProcessReindexRunner {
    async fn start(&mut self, key: &str, generation: &str) -> Result<(), LifecycleError> {
        if self.child.is_some() {
            return Err(LifecycleError::Worker(format!(
                "reindex worker already running for {key}"
            )));
        }
        let exe = std::env::current_exe()
            .map_err(|e| LifecycleError::Worker(format!("current_exe: {e}")))?;
        let child = Command::new(exe)
            .arg("reindex-worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--key")
            .arg(key)
            .arg("--generation")
            .arg(generation)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| LifecycleError::Worker(format!("spawn: {e}")))?;
        info!(
            key,
            generation,
            pid = child.id().unwrap_or(0),
            "Reindex worker started"
        );
        self.child = Some(child);
        Ok(())
    }

    async fn poll(&mut self) -> ReindexStatus {
        let Some(child) = self.child.as_mut() else {
            return ReindexStatus::Idle;
        };
        match child.try_wait() {
            Ok(None) => ReindexStatus::Running,
            Ok(Some(status)) => {
                self.child = None;
                match status.code() {
                    Some(WORKER_SUCCESS_EXIT) => {
                        info!(code = WORKER_SUCCESS_EXIT, "Reindex worker succeeded");
                        ReindexStatus::Succeeded
                    }
                    Some(code) => {
                        error!(code, "Reindex worker failed");
                        ReindexStatus::Failed
                    }
                    None => {
                        error!("Reindex worker killed by signal");
                        ReindexStatus::Failed
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Reindex worker state unavailable");
                ReindexStatus::Running
            }
        }
    }

    async fn terminate(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Some(pid) = child.id() {
            info!(pid, "Terminating reindex worker");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => info!(?status, "Reindex worker stopped"),
            Ok(Err(e)) => warn!(error = %e, "Reindex worker wait failed"),
            Err(_) => {
                warn!("Reindex worker did not stop, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Reindex worker kill failed");
                }
            }
        }
        self.child = None;
    }
}
