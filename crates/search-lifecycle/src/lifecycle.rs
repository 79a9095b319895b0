//! Generation lifecycle for one logical index.
//!
//! A logical key (e.g. `tenders`) resolves through the name store to a
//! physical generation `tenders_<unix-ts>`. The lifecycle decides when a
//! rebuild is due, allocates and validates generations, promotes them,
//! and keeps the current generation topped up with incremental drains.

use chrono::{DateTime, Datelike, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use search_engine::{WriteEngine, WriteOutcome};
use search_names::{next_key, prev_key};
use search_source::Source;
use search_types::{DocMeta, IndexSettings};

use crate::error::LifecycleError;
use crate::hooks::Plugin;
use crate::template;
use crate::worker::{ReindexRunner, ReindexStatus};

/// A persisted-but-unpromoted `next` generation older than this is
/// abandoned instead of resumed.
const GENERATION_REUSE_MAX_AGE_SECS: i64 = 86_400;

/// References handled between stat lines, heartbeat refreshes and rate
/// shaping pauses during a drain.
const STAT_INTERVAL: usize = 500;

type NoindexPredicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Lifecycle state machine over one logical index.
pub struct IndexLifecycle {
    settings: IndexSettings,
    source: Box<dyn Source>,
    hooks: Vec<Box<dyn Plugin>>,
    runner: Option<Box<dyn ReindexRunner>>,
    custom_noindex: Option<NoindexPredicate>,
    force_reindex: bool,
}

impl IndexLifecycle {
    pub fn new(settings: IndexSettings, source: Box<dyn Source>) -> Self {
        Self {
            settings,
            source,
            hooks: Vec::new(),
            runner: None,
            custom_noindex: None,
            force_reindex: false,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn Plugin>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_runner(mut self, runner: Box<dyn ReindexRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_custom_noindex(mut self, predicate: NoindexPredicate) -> Self {
        self.custom_noindex = Some(predicate);
        self
    }

    pub fn key(&self) -> &str {
        &self.settings.key
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Current generation per the name store, if any.
    pub fn current(&self, engine: &mut WriteEngine) -> Option<String> {
        engine.get_name(&self.settings.key)
    }

    /// Age in seconds derived from the generation name's timestamp
    /// suffix. Unparsable names count as infinitely old.
    pub fn index_age(name: &str) -> i64 {
        let now = Utc::now().timestamp();
        match name.rsplit_once('_').and_then(|(_, s)| s.parse::<i64>().ok()) {
            Some(ts) => now - ts,
            None => now,
        }
    }

    fn weekday_allows(&self, iso_weekday: u32) -> bool {
        iso_weekday >= self.settings.reindex_from_weekday as u32
    }

    /// Whether a full rebuild is due. Reading a raised force flag
    /// consumes it.
    pub fn needs_reindex(&mut self, engine: &mut WriteEngine) -> bool {
        let Some(current) = self.current(engine) else {
            return true;
        };
        if self.force_reindex {
            self.force_reindex = false;
            return true;
        }
        if Self::index_age(&current) > self.settings.max_age_secs as i64 {
            // Rebuilds are restricted to the configured low-traffic
            // window at the end of the week
            return self.weekday_allows(chrono::Local::now().weekday().number_from_monday());
        }
        false
    }

    /// Allocate (or resume) the `next` generation.
    ///
    /// A persisted `next` survives a crash and is reused when it is
    /// distinct from current, young enough, and still present in the
    /// backend. When no current generation exists at all, the new name
    /// also becomes current so readers have something to resolve.
    pub async fn new_generation(
        &mut self,
        engine: &mut WriteEngine,
    ) -> Result<String, LifecycleError> {
        let key = self.settings.key.clone();
        let next = next_key(&key);
        let current = self.current(engine);

        let mut candidate = engine.get_name(&next);
        if let Some(name) = &candidate {
            if Some(name) == current.as_ref()
                || Self::index_age(name) > GENERATION_REUSE_MAX_AGE_SECS
                || !engine.index_exists(name).await
            {
                candidate = None;
            }
        }

        let name = match candidate {
            Some(name) => {
                info!(index = %name, "Resuming unpromoted generation");
                name
            }
            None => {
                let fresh = format!("{key}_{}", Utc::now().timestamp());
                let mut body = template::assemble(
                    &self.settings.base_template,
                    &self.settings.type_template,
                    &self.settings.languages,
                )?;
                for hook in &self.hooks {
                    hook.before_create_index(&fresh, &mut body);
                }
                engine.create_index(&fresh, &body).await?;
                engine.set_name(&next, &fresh)?;
                info!(index = %fresh, "Generation created");
                fresh
            }
        };

        if current.is_none() {
            engine.set_name(&key, &name)?;
        }
        Ok(name)
    }

    /// Validate a generation before it may be promoted.
    ///
    /// A missing catch-all mapping field means a bad or half-applied
    /// template; that raises the force-reindex flag. The doc-count and
    /// freshness half detects a generation that silently stopped
    /// receiving data.
    pub async fn check_generation(
        &mut self,
        engine: &mut WriteEngine,
        name: &str,
    ) -> Result<(), LifecycleError> {
        let info = engine.index_info(name).await?;
        let catch_all = info
            .pointer(&format!("/mappings/{}/_all/enabled", self.settings.doc_type))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !catch_all {
            self.force_reindex = true;
            return Err(LifecycleError::Validation {
                name: name.to_string(),
                reason: "catch-all field missing from mapping".to_string(),
            });
        }
        if self.settings.skip_check {
            return Ok(());
        }
        let count = engine.doc_count(name).await?;
        if count < self.settings.check_min_docs {
            return Err(LifecycleError::Validation {
                name: name.to_string(),
                reason: format!(
                    "doc count {count} below minimum {}",
                    self.settings.check_min_docs
                ),
            });
        }
        let newest = engine.max_date_modified(name).await?;
        match newest {
            Some(newest) => {
                let staleness = (Utc::now() - newest).num_seconds();
                if staleness > self.settings.check_max_stale_secs as i64 {
                    return Err(LifecycleError::Validation {
                        name: name.to_string(),
                        reason: format!("newest document is {staleness}s old"),
                    });
                }
            }
            None if self.settings.check_min_docs > 0 => {
                return Err(LifecycleError::Validation {
                    name: name.to_string(),
                    reason: "no documents with a modification date".to_string(),
                });
            }
            None => {}
        }
        Ok(())
    }

    /// Make a generation current: move the old current to `.prev`,
    /// repoint the alias, clear a matching `.next`. Never runs during
    /// shutdown.
    pub async fn promote(
        &mut self,
        engine: &mut WriteEngine,
        name: &str,
    ) -> Result<(), LifecycleError> {
        if engine.cancelled() {
            return Err(LifecycleError::Cancelled);
        }
        let key = self.settings.key.clone();
        let old = self.current(engine);
        if old.as_deref() != Some(name) {
            info!(key = %key, from = ?old, to = %name, "Changing current generation");
            engine.set_name(&key, name)?;
            if let Some(old) = old {
                // Kept for offline deletion, never served again
                engine.set_name(&prev_key(&key), &old)?;
            }
            engine.set_alias(&key, name).await;
        }
        if engine.get_name(&next_key(&key)).as_deref() == Some(name) {
            engine.set_name(&next_key(&key), "")?;
        }
        Ok(())
    }

    fn suppressed(&self, data: &Value) -> bool {
        if self.settings.noindex.iter().any(|rule| rule.suppresses(data)) {
            return true;
        }
        match &self.custom_noindex {
            Some(predicate) => predicate(data),
            None => false,
        }
    }

    fn indexing_stat(
        &self,
        index_name: &str,
        fetched: u64,
        indexed: u64,
        last_date: Option<DateTime<Utc>>,
    ) {
        let last = last_date.map(|d| d.to_rfc3339()).unwrap_or_default();
        info!(
            index = index_name,
            fetched, indexed, last, "Indexing progress"
        );
    }

    /// A standby told to stand down re-establishes its feed cursor
    /// before the drain that follows its wakeup.
    fn stand_down(&mut self, engine: &mut WriteEngine) {
        if engine.is_slave() && !engine.cancelled() {
            debug!(key = %self.settings.key, "Standing down, source reset requested");
            self.source.request_reset();
        }
    }

    /// Drain all currently available documents from the source into one
    /// generation. Progress is durable per item; cancellation aborts
    /// promptly and a later drain continues where the feed cursor left
    /// off.
    pub async fn drain(
        &mut self,
        engine: &mut WriteEngine,
        index_name: &str,
    ) -> Result<u64, LifecycleError> {
        let mut indexed = 0u64;
        let mut fetched = 0u64;
        'pages: loop {
            if !engine.heartbeat().await {
                self.stand_down(engine);
                break;
            }
            let refs = self.source.items().await?;
            if refs.is_empty() {
                if let Some(skipped) = self.source.last_skipped() {
                    debug!(index = index_name, last_skipped = %skipped, "Feed ahead of window");
                }
                break;
            }
            let mut iter_count = 0usize;
            let mut last_date = None;
            for reference in &refs {
                if engine.cancelled() {
                    return Err(LifecycleError::Cancelled);
                }
                last_date = Some(reference.date_modified);
                let meta = DocMeta::new(
                    reference.id.clone(),
                    self.source.doc_type(),
                    reference.date_modified,
                );
                let stored = engine
                    .exists_with_version(index_name, &meta)
                    .await
                    .unwrap_or(false);
                if !stored {
                    let mut envelope = self.source.get(reference).await?;
                    if self.suppressed(&envelope.data) {
                        debug!(index = index_name, id = %reference.id, "Noindex");
                    } else {
                        for hook in &self.hooks {
                            hook.before_index_item(&mut envelope);
                        }
                        match engine.index_item(index_name, envelope).await? {
                            WriteOutcome::Written | WriteOutcome::Buffered => indexed += 1,
                            WriteOutcome::Skipped | WriteOutcome::Dropped => {}
                        }
                    }
                }
                iter_count += 1;
                fetched += 1;
                if iter_count >= STAT_INTERVAL {
                    self.indexing_stat(index_name, fetched, indexed, last_date);
                    if !engine.heartbeat().await {
                        self.stand_down(engine);
                        break 'pages;
                    }
                    self.source.pause_for(iter_count).await;
                    iter_count = 0;
                }
            }
            if iter_count > 0 {
                self.indexing_stat(index_name, fetched, indexed, last_date);
                self.source.pause_for(iter_count).await;
            }
        }
        Ok(indexed)
    }

    /// One orchestrator tick: reap or start a rebuild when due, then an
    /// incremental drain of the current generation.
    pub async fn process(
        &mut self,
        engine: &mut WriteEngine,
        allow_reindex: bool,
    ) -> Result<u64, LifecycleError> {
        for hook in &self.hooks {
            hook.before_process(&self.settings.key);
        }

        let mut worker_live = false;
        if let Some(mut runner) = self.runner.take() {
            let status = runner.poll().await;
            self.runner = Some(runner);
            match status {
                ReindexStatus::Running => worker_live = true,
                ReindexStatus::Succeeded => {
                    let next = engine.get_name(&next_key(&self.settings.key));
                    if let Some(next) = next {
                        match self.check_generation(engine, &next).await {
                            Ok(()) => self.promote(engine, &next).await?,
                            Err(e) => {
                                warn!(index = %next, error = %e, "Rebuilt generation not promoted")
                            }
                        }
                    }
                }
                ReindexStatus::Failed => {
                    // Leave `next` in place; a later cycle resumes it
                    warn!(key = %self.settings.key, "Reindex worker failed, will retry");
                }
                ReindexStatus::Idle => {}
            }
        }

        if allow_reindex && !worker_live && self.needs_reindex(engine) {
            let name = self.new_generation(engine).await?;
            if self.settings.async_reindex && self.runner.is_some() {
                if let Some(runner) = self.runner.as_mut() {
                    runner.start(&self.settings.key, &name).await?;
                }
            } else {
                info!(index = %name, "Starting full reindex");
                for hook in &self.hooks {
                    hook.before_source_reset(self.source.doc_type());
                }
                self.source.reset().await?;
                self.drain(engine, &name).await?;
                engine.flush_bulk().await?;
                match self.check_generation(engine, &name).await {
                    Ok(()) => {
                        self.promote(engine, &name).await?;
                        info!(index = %name, "Finished full reindex");
                    }
                    Err(e) => warn!(index = %name, error = %e, "New generation not promoted"),
                }
            }
        }

        let current = match self.current(engine) {
            Some(current) => current,
            None if engine.is_slave() => {
                // A standby may simply not have seen the master's names yet
                engine.heartbeat().await;
                match self.current(engine) {
                    Some(current) => current,
                    None => {
                        warn!(key = %self.settings.key, "No current index");
                        return Ok(0);
                    }
                }
            }
            None => {
                warn!(key = %self.settings.key, "No current index");
                return Ok(0);
            }
        };
        self.drain(engine, &current).await
    }

    /// Startup validation of the current generation; a failure raises
    /// the force-reindex flag instead of erroring.
    pub async fn check_on_start(&mut self, engine: &mut WriteEngine) {
        let Some(current) = self.current(engine) else {
            info!(key = %self.settings.key, "No current generation yet");
            return;
        };
        match self.check_generation(engine, &current).await {
            Ok(()) => info!(index = %current, "Current generation valid"),
            Err(e) => {
                warn!(index = %current, error = %e, "Validation failed, reindex forced");
                self.force_reindex = true;
            }
        }
    }

    /// Full drain of one named generation, as run inside an isolated
    /// reindex worker. Validates the result; the caller translates
    /// success into the sentinel exit code.
    pub async fn run_worker(
        &mut self,
        engine: &mut WriteEngine,
        generation: &str,
    ) -> Result<(), LifecycleError> {
        for hook in &self.hooks {
            hook.on_worker_start(&self.settings.key, generation);
        }
        for hook in &self.hooks {
            hook.before_source_reset(self.source.doc_type());
        }
        self.source.reset().await?;
        self.drain(engine, generation).await?;
        engine.flush_bulk().await?;
        self.check_generation(engine, generation).await
    }

    /// Stop a live reindex worker, if any.
    pub async fn terminate_worker(&mut self) {
        if let Some(runner) = self.runner.as_mut() {
            runner.terminate().await;
        }
    }
}
