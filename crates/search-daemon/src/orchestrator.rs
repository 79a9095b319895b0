//! The single-threaded cooperative indexing loop.
//!
//! Lifecycles are visited in configuration order; each tick runs one
//! `process` pass and flushes the engine's bulk buffer before moving to
//! the next logical index. The only true parallelism is the isolated
//! reindex worker process, which shares nothing with the parent beyond
//! the name store file and its exit code.

use anyhow::Result;
use tracing::{error, info};

use search_engine::WriteEngine;
use search_lifecycle::{IndexLifecycle, LifecycleError};

pub struct Orchestrator {
    engine: WriteEngine,
    lifecycles: Vec<IndexLifecycle>,
}

impl Orchestrator {
    pub fn new(engine: WriteEngine, lifecycles: Vec<IndexLifecycle>) -> Self {
        Self { engine, lifecycles }
    }

    /// Run until cancelled. A lifecycle or flush error that survived its
    /// own retries ends the loop with a non-zero exit so a supervisor
    /// can restart the daemon, unless `ignore_errors` is configured, in
    /// which case it is logged and the loop continues.
    pub async fn run(&mut self) -> Result<()> {
        let keys: Vec<&str> = self.lifecycles.iter().map(|l| l.key()).collect();
        info!(indexes = ?keys, "Configured logical indexes");

        self.engine.wait_for_backend().await?;

        let slave = self.engine.is_slave();
        if slave {
            info!("Starting in slave mode");
        } else if self.engine.settings().check_on_start {
            info!("Checking current generations");
            for lifecycle in &mut self.lifecycles {
                lifecycle.check_on_start(&mut self.engine).await;
            }
        }

        let allow_reindex = !slave;
        let update_wait = self.engine.settings().update_wait_secs;
        while !self.engine.cancelled() {
            if let Err(e) = self.pass(allow_reindex).await {
                self.shutdown().await;
                return Err(e);
            }
            self.engine.sleep(update_wait as f64).await;
        }
        info!("Leaving main loop");
        self.shutdown().await;
        Ok(())
    }

    async fn pass(&mut self, allow_reindex: bool) -> Result<()> {
        let ignore_errors = self.engine.settings().ignore_errors;
        for lifecycle in &mut self.lifecycles {
            if self.engine.cancelled() {
                return Ok(());
            }
            match lifecycle.process(&mut self.engine, allow_reindex).await {
                Ok(_) => {}
                Err(LifecycleError::Cancelled) => return Ok(()),
                Err(e) if ignore_errors => {
                    error!(key = %lifecycle.key(), error = %e, "Lifecycle pass failed, continuing")
                }
                Err(e) => {
                    error!(key = %lifecycle.key(), error = %e, "Lifecycle pass failed");
                    return Err(e.into());
                }
            }
            if let Err(e) = self.engine.flush_bulk().await {
                if ignore_errors {
                    error!(key = %lifecycle.key(), error = %e, "Bulk flush failed, continuing");
                } else {
                    error!(key = %lifecycle.key(), error = %e, "Bulk flush failed");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        for lifecycle in &mut self.lifecycles {
            lifecycle.terminate_worker().await;
        }
        if let Err(e) = self.engine.flush_bulk().await {
            error!(error = %e, "Final bulk flush failed");
        }
    }
}
