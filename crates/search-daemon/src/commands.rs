//! Daemon command implementations.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use search_engine::WriteEngine;
use search_lifecycle::{IndexLifecycle, ProcessReindexRunner, WORKER_SUCCESS_EXIT};
use search_names::NameStore;
use search_source::FeedSource;
use search_types::Settings;

use crate::orchestrator::Orchestrator;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 only probes for existence
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Take the `<prefix>.pid` lock, refusing to start while another live
/// instance holds it. A pid file left behind by a dead process is
/// replaced.
fn acquire_pid_file(prefix: &str) -> Result<PathBuf> {
    let path = PathBuf::from(format!("{prefix}.pid"));
    if let Ok(raw) = fs::read_to_string(&path) {
        if let Ok(pid) = raw.trim().parse::<u32>() {
            if pid != std::process::id() && process_alive(pid) {
                bail!(
                    "another instance is already running (pid {pid}, lock {})",
                    path.display()
                );
            }
            warn!(pid, path = %path.display(), "Removing stale pid file");
        }
    }
    fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", path.display()))?;
    Ok(path)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                        _ = term.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Could not install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C, shutting down");
        }
        cancel.cancel();
    });
}

/// Run the indexing loop until a shutdown signal arrives.
pub async fn run_daemon(
    config: Option<&str>,
    names_override: Option<&str>,
    log_level: Option<&str>,
) -> Result<()> {
    let mut settings = Settings::load(config)?;
    if let Some(level) = log_level {
        settings.log_level = level.to_string();
    }
    init_tracing(&settings.log_level);

    if let Some(names) = names_override {
        settings.index_names = names.to_string();
        if settings.engine.slave_mode.take().is_some() {
            warn!("Name store override given, slave mode disabled");
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting search daemon");
    info!("Configuration:\n\t{}", settings.dump());
    if settings.indexes.is_empty() {
        bail!("no [[index]] sections configured");
    }

    let pid_file = acquire_pid_file(&settings.index_names)?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let engine = WriteEngine::new(settings.engine.clone(), &settings.index_names, cancel.clone())?;
    let slave = engine.is_slave();

    let mut lifecycles = Vec::with_capacity(settings.indexes.len());
    for index in &settings.indexes {
        let source = FeedSource::new(&index.doc_type, index.feed.clone(), cancel.clone());
        let mut lifecycle = IndexLifecycle::new(index.clone(), Box::new(source));
        if index.async_reindex && !slave {
            match config {
                Some(path) => {
                    lifecycle = lifecycle.with_runner(Box::new(ProcessReindexRunner::new(path)));
                }
                None => warn!(
                    key = %index.key,
                    "async_reindex needs a config file path, reindexes will run inline"
                ),
            }
        }
        lifecycles.push(lifecycle);
    }

    engine.sleep(settings.engine.start_wait_secs as f64).await;

    let result = Orchestrator::new(engine, lifecycles).run().await;
    if let Err(e) = fs::remove_file(&pid_file) {
        warn!(path = %pid_file.display(), error = %e, "Could not remove pid file");
    }
    info!("Shutdown complete");
    result
}

/// Drain one generation in this isolated process, then exit with the
/// success sentinel code so the parent can tell a clean finish from a
/// crash.
pub async fn run_reindex_worker(
    config: Option<&str>,
    key: &str,
    generation: &str,
    log_level: Option<&str>,
) -> Result<()> {
    let mut settings = Settings::load(config)?;
    if let Some(level) = log_level {
        settings.log_level = level.to_string();
    }
    init_tracing(&settings.log_level);
    info!(key, generation, pid = std::process::id(), "Reindex worker starting");

    // The worker always writes, whatever role the parent runs in
    settings.engine.slave_mode = None;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut engine =
        WriteEngine::new(settings.engine.clone(), &settings.index_names, cancel.clone())?;
    engine.sleep(settings.engine.reindex_wait_secs as f64).await;
    engine.wait_for_backend().await?;

    let index = settings
        .indexes
        .iter()
        .find(|i| i.key == key)
        .with_context(|| format!("no index configured under key {key}"))?;
    let source = FeedSource::new(&index.doc_type, index.feed.clone(), cancel.clone());
    let mut lifecycle = IndexLifecycle::new(index.clone(), Box::new(source));

    match lifecycle.run_worker(&mut engine, generation).await {
        Ok(()) => {
            info!(index = %generation, "Worker drain complete");
            std::process::exit(WORKER_SUCCESS_EXIT);
        }
        Err(e) => {
            error!(index = %generation, error = %e, "Worker drain failed");
            std::process::exit(1);
        }
    }
}

/// Print the current name store contents.
pub fn dump_names(config: Option<&str>) -> Result<()> {
    let settings = Settings::load(config)?;
    let mut store = NameStore::open(&settings.index_names, Duration::ZERO)?;
    println!("{}", store.dump());
    Ok(())
}
