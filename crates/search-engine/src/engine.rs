//! The write engine.
//!
//! Single-item writes are optimistic: the external version makes a
//! conflicting write a skip, not an error. Bulk writes buffer per index
//! and degrade to the per-item path after any batch failure, so one bad
//! batch slows a pass down instead of losing documents.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use search_names::{HeartbeatFile, MasterStatus, NameStore};
use search_types::{DocMeta, DocumentEnvelope, EngineSettings};

use crate::client::StoreClient;
use crate::error::EngineError;
use crate::heartbeat::{MasterProbe, WriterRole};

/// Software version reported on the status surface and compared against
/// the master when running as a standby.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported backend major version.
const MIN_BACKEND_MAJOR: u32 = 1;

/// Buffered items per index that trigger a flush.
const BULK_FLUSH_THRESHOLD: usize = 100;

/// Below this batch size the per-item path is used even when healthy.
const MIN_BULK_BATCH: usize = 50;

/// Retries for a failing single-document write.
const SINGLE_WRITE_RETRIES: u32 = 3;

/// Retries for index-admin reads (stats, info, existence).
const ADMIN_RETRIES: u32 = 5;

/// Retries while waiting for the backend at startup.
const BACKEND_WAIT_RETRIES: u32 = 30;

/// Name store cache TTL; writer and standby share the file on disk.
const NAMES_TTL: Duration = Duration::from_secs(1);

/// Outcome of one write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted by the backend
    Written,
    /// An equal-or-newer version is already stored
    Skipped,
    /// Buffered for a later bulk flush
    Buffered,
    /// Rejected locally (corrupt input or ignored failure)
    Dropped,
}

/// Read-side result payload.
///
/// Failures surface as an explicit `error` field, never as a transport
/// exception to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub items: Vec<Value>,
    pub total: u64,
    pub start: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            start: 0,
            error: Some(message.into()),
        }
    }
}

pub struct WriteEngine {
    client: StoreClient,
    names: NameStore,
    beat: HeartbeatFile,
    probe: Option<MasterProbe>,
    settings: EngineSettings,
    cancel: CancellationToken,
    bulk_buffer: HashMap<String, Vec<DocumentEnvelope>>,
    bulk_degraded: bool,
}

impl WriteEngine {
    pub fn new(
        settings: EngineSettings,
        names_prefix: &str,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let client = StoreClient::new(
            &settings.store_url,
            Duration::from_secs(settings.timeout_secs),
        )?;
        let names = NameStore::open(names_prefix, NAMES_TTL)?;
        let beat = HeartbeatFile::new(names_prefix);
        let probe = match &settings.slave_mode {
            Some(url) if !url.is_empty() => Some(MasterProbe::new(url)?),
            _ => None,
        };
        Ok(Self {
            client,
            names,
            beat,
            probe,
            settings,
            cancel,
            bulk_buffer: HashMap::new(),
            bulk_degraded: false,
        })
    }

    /// Replace the master probe, e.g. with a shorter cache TTL.
    pub fn set_probe(&mut self, probe: Option<MasterProbe>) {
        self.probe = probe;
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_slave(&self) -> bool {
        self.probe.is_some()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Interruptible sleep; returns early on shutdown.
    pub async fn sleep(&self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        }
    }

    // ---- name store ----

    pub fn get_name(&mut self, key: &str) -> Option<String> {
        self.names.get(key)
    }

    pub fn set_name(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        self.names.set(key, value)?;
        Ok(())
    }

    pub fn names_snapshot(&mut self) -> BTreeMap<String, String> {
        self.names.snapshot()
    }

    pub fn dump_names(&mut self) -> String {
        self.names.dump()
    }

    /// Resolve the served physical names for a set of logical keys,
    /// falling back to `.prev` then `.next` so readers keep working
    /// around a promotion.
    pub fn current_indexes(&mut self, keys: &[&str]) -> Option<String> {
        let mut names = Vec::new();
        for key in keys {
            let name = self
                .names
                .get(key)
                .or_else(|| self.names.get(&search_names::prev_key(key)))
                .or_else(|| self.names.get(&search_names::next_key(key)));
            if let Some(name) = name {
                names.push(name);
            }
        }
        if names.is_empty() {
            None
        } else {
            Some(names.join(","))
        }
    }

    /// Status payload served to remote standbys.
    pub fn master_status(&mut self) -> MasterStatus {
        MasterStatus {
            heartbeat: self.beat.read().unwrap_or(0),
            index_names: self.names.snapshot(),
            version: Some(ENGINE_VERSION.to_string()),
        }
    }

    // ---- heartbeat / master-slave ----

    /// Record the local heartbeat and decide whether this instance may
    /// write.
    ///
    /// Master mode: always `Proceed` (unless shutting down). Slave mode:
    /// `Proceed` only once the master's heartbeat is staler than
    /// `slave_wakeup_secs`; otherwise the local name mapping is refreshed
    /// from the master's view and the caller must stand down.
    pub async fn writer_role(&mut self) -> WriterRole {
        if self.cancel.is_cancelled() {
            return WriterRole::StandDown;
        }
        let now = Utc::now().timestamp();
        if let Err(e) = self.beat.record(now) {
            warn!(error = %e, "Heartbeat not recorded");
        }
        let Some(probe) = &mut self.probe else {
            return WriterRole::Proceed;
        };
        let (value, status) = probe.observe().await;
        if let Some(status) = status {
            if let Some(version) = &status.version {
                if version != ENGINE_VERSION {
                    warn!(
                        master = %version,
                        local = ENGINE_VERSION,
                        "Master version differs from standby"
                    );
                }
            }
            if !status.index_names.is_empty() {
                if let Err(e) = self.names.replace_all(status.index_names) {
                    warn!(error = %e, "Name store not refreshed from master");
                }
            }
        }
        let lag = now - value;
        if lag > self.settings.slave_wakeup_secs as i64 {
            warn!(lag_secs = lag, "Master heartbeat stale, proceeding as writer");
            WriterRole::Proceed
        } else {
            WriterRole::StandDown
        }
    }

    /// Convenience wrapper: whether this instance may write right now.
    pub async fn heartbeat(&mut self) -> bool {
        self.writer_role().await == WriterRole::Proceed
    }

    // ---- write path ----

    /// Write one document, routing through the bulk buffer when bulk
    /// inserts are configured.
    pub async fn index_item(
        &mut self,
        index: &str,
        item: DocumentEnvelope,
    ) -> Result<WriteOutcome, EngineError> {
        if let Err(e) = item.validate() {
            warn!(index, error = %e, "Corrupt document dropped");
            return Ok(WriteOutcome::Dropped);
        }
        if self.settings.bulk_insert {
            return self.buffer_bulk(index, item).await;
        }
        self.index_single(index, item).await
    }

    async fn index_single(
        &mut self,
        index: &str,
        item: DocumentEnvelope,
    ) -> Result<WriteOutcome, EngineError> {
        let meta = item.meta.clone();
        let mut attempt = 0u32;
        loop {
            match self
                .client
                .put_versioned(index, &meta.doc_type, &meta.id, meta.version, &item.data)
                .await
            {
                Ok(()) => return Ok(WriteOutcome::Written),
                Err(EngineError::VersionConflict) => return Ok(WriteOutcome::Skipped),
                Err(e) => {
                    if meta.ignore_exists
                        && self.exists_with_version(index, &meta).await.unwrap_or(false)
                    {
                        return Ok(WriteOutcome::Skipped);
                    }
                    if attempt >= SINGLE_WRITE_RETRIES {
                        if self.settings.ignore_errors {
                            error!(
                                index,
                                id = %meta.id,
                                error = %e,
                                "Write failed after retries (ignored)"
                            );
                            return Ok(WriteOutcome::Dropped);
                        }
                        return Err(e);
                    }
                    attempt += 1;
                    error!(
                        index,
                        id = %meta.id,
                        attempt,
                        error = %e,
                        "Write failed, retrying"
                    );
                    self.sleep(self.settings.error_wait_secs as f64).await;
                    if self.cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    // Someone else may have written it meanwhile
                    if self.exists_with_version(index, &meta).await.unwrap_or(false) {
                        return Ok(WriteOutcome::Skipped);
                    }
                }
            }
        }
    }

    async fn buffer_bulk(
        &mut self,
        index: &str,
        item: DocumentEnvelope,
    ) -> Result<WriteOutcome, EngineError> {
        let buffer = self.bulk_buffer.entry(index.to_string()).or_default();
        buffer.push(item);
        if buffer.len() >= BULK_FLUSH_THRESHOLD {
            self.flush_bulk().await?;
        }
        Ok(WriteOutcome::Buffered)
    }

    /// Whether the engine is currently forcing the per-item fallback.
    pub fn bulk_degraded(&self) -> bool {
        self.bulk_degraded
    }

    /// Buffered-but-unflushed item count, across indexes.
    pub fn buffered(&self) -> usize {
        self.bulk_buffer.values().map(Vec::len).sum()
    }

    /// Flush all per-index buffers.
    ///
    /// Small batches and degraded passes go through the per-item
    /// versioned path (safer, slower). Healthy large batches are
    /// de-duplicated by id, keeping only the highest version, and sent
    /// as one bulk call. Any batch failure re-queues the affected items
    /// and degrades the engine until a flush completes cleanly.
    pub async fn flush_bulk(&mut self) -> Result<(), EngineError> {
        if self.bulk_buffer.is_empty() {
            return Ok(());
        }
        let buffers: Vec<(String, Vec<DocumentEnvelope>)> = self.bulk_buffer.drain().collect();
        let mut degraded = false;
        let mut requeue: HashMap<String, Vec<DocumentEnvelope>> = HashMap::new();

        for (index, items) in buffers {
            if items.len() < MIN_BULK_BATCH || self.bulk_degraded {
                debug!(index, count = items.len(), "Flushing per item");
                for item in items {
                    if self
                        .exists_with_version(&index, &item.meta)
                        .await
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    self.index_single(&index, item).await?;
                }
                continue;
            }

            let mut by_id: HashMap<String, DocumentEnvelope> = HashMap::new();
            for item in items {
                if self
                    .exists_with_version(&index, &item.meta)
                    .await
                    .unwrap_or(false)
                {
                    if !item.meta.ignore_exists {
                        warn!(index, id = %item.meta.id, "Bulk item already stored");
                    }
                    continue;
                }
                match by_id.entry(item.meta.id.clone()) {
                    Entry::Occupied(mut kept) => {
                        if item.meta.version < kept.get().meta.version {
                            // Out-of-order delivery; the higher version wins
                            warn!(
                                index,
                                id = %item.meta.id,
                                kept = kept.get().meta.version,
                                dropped = item.meta.version,
                                "Lower version arrived after higher in one batch"
                            );
                        } else {
                            kept.insert(item);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(item);
                    }
                }
            }
            if by_id.is_empty() {
                continue;
            }
            let batch: Vec<DocumentEnvelope> = by_id.into_values().collect();
            match self.client.bulk(&index, &batch).await {
                Ok(report) => {
                    if report.has_failures() {
                        warn!(
                            index,
                            failed = report.failed.len(),
                            "Bulk reported item failures, degrading to per-item writes"
                        );
                        degraded = true;
                        requeue.entry(index.clone()).or_default().extend(
                            batch
                                .into_iter()
                                .filter(|i| report.failed.contains(&i.meta.id)),
                        );
                    }
                }
                Err(e) => {
                    error!(index, error = %e, "Bulk call failed, degrading to per-item writes");
                    degraded = true;
                    requeue.entry(index.clone()).or_default().extend(batch);
                }
            }
        }

        for (index, items) in requeue {
            self.bulk_buffer.entry(index).or_default().extend(items);
        }
        self.bulk_degraded = degraded;
        Ok(())
    }

    // ---- existence / admin ----

    /// Whether the backend already stores this id at `meta.version` or
    /// newer.
    pub async fn exists_with_version(
        &self,
        index: &str,
        meta: &DocMeta,
    ) -> Result<bool, EngineError> {
        let stored = self
            .retry_admin("stored_version", || {
                self.client.stored_version(index, &meta.doc_type, &meta.id)
            })
            .await?;
        Ok(matches!(stored, Some(v) if v >= meta.version))
    }

    pub async fn create_index(&self, name: &str, body: &Value) -> Result<(), EngineError> {
        self.client.create_index(name, body).await
    }

    pub async fn index_exists(&self, name: &str) -> bool {
        self.client.index_exists(name).await.unwrap_or(false)
    }

    pub async fn index_info(&self, name: &str) -> Result<Value, EngineError> {
        self.retry_admin("index_info", || self.client.index_info(name))
            .await
    }

    pub async fn doc_count(&self, name: &str) -> Result<u64, EngineError> {
        self.retry_admin("doc_count", || self.client.doc_count(name))
            .await
    }

    pub async fn max_date_modified(
        &self,
        name: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>, EngineError> {
        self.retry_admin("max_date_modified", || self.client.max_date_modified(name))
            .await
    }

    /// Per-logical-index document counts for the status surface.
    pub async fn index_doc_counts(&mut self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for (key, name) in self.names.snapshot() {
            if key.ends_with(".next") || key.ends_with(".prev") {
                continue;
            }
            match self.client.doc_count(&name).await {
                Ok(count) => {
                    counts.insert(format!("{key}_docs_count"), count);
                }
                Err(e) => debug!(index = %name, error = %e, "Doc count unavailable"),
            }
        }
        counts
    }

    /// Repoint the logical alias at a new generation. Alias failures are
    /// logged, not fatal: lookups still work through the name store.
    pub async fn set_alias(&self, logical: &str, physical: &str) {
        let stale_pattern = format!("{logical}_*");
        if let Err(e) = self.client.delete_alias(&stale_pattern, logical).await {
            error!(alias = logical, error = %e, "Stale alias removal failed");
            return;
        }
        match self.client.put_alias(physical, logical).await {
            Ok(()) => info!(alias = logical, index = physical, "Alias set"),
            Err(e) => error!(alias = logical, index = physical, error = %e, "Alias not set"),
        }
    }

    /// Block until the backend answers its info probe, with bounded
    /// retries, then verify the version floor.
    pub async fn wait_for_backend(&mut self) -> Result<(), EngineError> {
        if self.settings.start_wait_secs > 0 {
            info!(
                seconds = self.settings.start_wait_secs,
                "Waiting before first pass"
            );
            self.sleep(self.settings.start_wait_secs as f64).await;
        }
        let mut attempts = 0u32;
        let info = loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.writer_role().await;
            match self.client.server_info().await {
                Ok(info) => break info,
                Err(e) => {
                    if attempts >= BACKEND_WAIT_RETRIES {
                        return Err(EngineError::RetriesExhausted {
                            operation: "server_info".to_string(),
                            last: e.to_string(),
                        });
                    }
                    attempts += 1;
                    error!(attempt = attempts, error = %e, "Backend not reachable");
                    self.sleep(self.settings.error_wait_secs as f64).await;
                }
            }
        };
        info!(version = %info.version.number, "Backend reachable");
        let major = info
            .version
            .number
            .split('.')
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        if major < MIN_BACKEND_MAJOR {
            return Err(EngineError::UnsupportedBackend(info.version.number));
        }
        Ok(())
    }

    // ---- read side ----

    /// Translate a query against the current generations of the given
    /// logical keys. Backend failures come back as an `error` payload.
    pub async fn search(
        &mut self,
        index_keys: &[&str],
        body: &Value,
        start: usize,
        limit: usize,
    ) -> SearchResult {
        let Some(index) = self.current_indexes(index_keys) else {
            return SearchResult::error("current index not found");
        };
        let limit = if limit == 0 { 10 } else { limit };
        let payload = match self.client.search(&index, body, start, limit).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(index = %index, error = %e, "Search failed");
                return SearchResult::error(e.to_string());
            }
        };
        let Some(hits) = payload.get("hits") else {
            error!(index = %index, "Search returned no hits section");
            return SearchResult::error("bad response");
        };
        let items = hits
            .pointer("/hits")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|h| h.get("_source").cloned())
                    .collect()
            })
            .unwrap_or_default();
        let total = hits
            .get("total")
            .map(|t| t.as_u64().or_else(|| t.pointer("/value").and_then(Value::as_u64)))
            .flatten()
            .unwrap_or(0);
        SearchResult {
            items,
            total,
            start,
            error: None,
        }
    }

    async fn retry_admin<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempts + 1 < ADMIN_RETRIES => {
                    attempts += 1;
                    let pause = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(1));
                    warn!(
                        operation,
                        attempt = attempts,
                        retry_in_ms = pause.as_millis() as u64,
                        error = %e,
                        "Backend call failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(EngineError::RetriesExhausted {
                        operation: operation.to_string(),
                        last: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}
