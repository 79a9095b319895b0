//! Incremental feed polling.
//!
//! [`FeedSource`] produces a deduplicated, monotonically advancing
//! stream of references from a paginated upstream feed and resolves them
//! to full documents, surviving restarts and upstream flakiness: list
//! failures retry with escalating pauses and then re-establish the
//! cursor instead of failing permanently.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use search_types::{parse_feed_date, DocumentEnvelope, FeedRef, FeedSettings};

use crate::cache::ContentCache;
use crate::error::SourceError;
use crate::feed::FeedClient;

/// List retries before a page failure is surfaced to the caller.
const LIST_RETRIES: u32 = 3;

/// Get-by-id retries before the fetch failure is surfaced.
const GET_RETRIES: u32 = 3;

/// A page shorter than this ends the gathering loop: the feed head has
/// been reached.
const SHORT_PAGE: usize = 10;

/// Pages the fast cursor steps back from the feed head before flipping
/// to forward order.
const FAST_STEPS_BACK: u32 = 5;

/// A pull-based document source.
///
/// `items` yields one bounded page of references per call, advancing an
/// internal cursor; an empty page means nothing new is available right
/// now. References outside the configured time window are counted as
/// skipped, not yielded, so a caller can tell "feed exhausted" from
/// "feed has nothing in range yet".
#[async_trait]
pub trait Source: Send {
    fn doc_type(&self) -> &str;

    /// Drop and re-establish the upstream cursor.
    async fn reset(&mut self) -> Result<(), SourceError>;

    /// Next page of in-window references.
    async fn items(&mut self) -> Result<Vec<FeedRef>, SourceError>;

    /// Resolve a reference to its full document.
    async fn get(&mut self, reference: &FeedRef) -> Result<DocumentEnvelope, SourceError>;

    /// Ask for a cursor re-establishment before the next `items` call.
    fn request_reset(&mut self);

    /// Timestamp of the most recently skipped reference in the last
    /// `items` call, if any.
    fn last_skipped(&self) -> Option<DateTime<Utc>>;

    /// Rate shaping: pause proportionally to the amount of work just
    /// drained.
    async fn pause_for(&self, count: usize);
}

#[derive(Debug, Default)]
struct SourceStats {
    queries: u64,
    fetched: u64,
    skipped: u64,
    resets: u64,
}

/// [`Source`] over a generic paginated record feed.
pub struct FeedSource {
    doc_type: String,
    settings: FeedSettings,
    client: Option<FeedClient>,
    fast: Option<FeedClient>,
    skip_until: Option<DateTime<Utc>>,
    skip_after: Option<DateTime<Utc>>,
    last_skipped: Option<DateTime<Utc>>,
    should_reset: bool,
    cache: Option<ContentCache>,
    cancel: CancellationToken,
    stats: SourceStats,
}

impl FeedSource {
    pub fn new(doc_type: &str, settings: FeedSettings, cancel: CancellationToken) -> Self {
        let cache = ContentCache::new(settings.cache_size, &settings.cache_allow_statuses);
        Self {
            doc_type: doc_type.to_string(),
            settings,
            client: None,
            fast: None,
            skip_until: None,
            skip_after: None,
            last_skipped: None,
            should_reset: false,
            cache,
            cancel,
            stats: SourceStats::default(),
        }
    }

    fn window_bound(raw: &Option<String>) -> Option<DateTime<Utc>> {
        let raw = raw.as_deref()?;
        match parse_feed_date(raw) {
            Ok(dt) => Some(dt),
            Err(_) => {
                warn!(value = raw, "Unparsable window bound ignored");
                None
            }
        }
    }

    /// In-window check; out-of-window references are recorded as skipped.
    fn in_window(&mut self, reference: &FeedRef) -> bool {
        if let Some(until) = self.skip_until {
            if reference.date_modified < until {
                self.last_skipped = Some(reference.date_modified);
                self.stats.skipped += 1;
                return false;
            }
        }
        if let Some(after) = self.skip_after {
            if reference.date_modified > after {
                self.last_skipped = Some(reference.date_modified);
                self.stats.skipped += 1;
                return false;
            }
        }
        true
    }

    async fn sleep(&self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        }
    }

    async fn ensure_client(&mut self) -> Result<(), SourceError> {
        if self.client.is_none() || self.should_reset {
            self.reset_cursor().await?;
        }
        Ok(())
    }

    async fn reset_cursor(&mut self) -> Result<(), SourceError> {
        info!(
            doc_type = %self.doc_type,
            skip_until = ?self.settings.skip_until,
            skip_after = ?self.settings.skip_after,
            "Feed cursor reset"
        );
        self.stats.resets += 1;
        self.client = Some(FeedClient::new(&self.settings, false)?);
        self.fast = None;
        if self.settings.fast_cursor {
            // Walk a few pages back from the head, then flip forward, so
            // the newest changes surface before the main cursor catches up
            let mut fast = FeedClient::new(&self.settings, true)?;
            let mut usable = true;
            for _ in 0..FAST_STEPS_BACK {
                if self.cancel.is_cancelled() {
                    usable = false;
                    break;
                }
                match fast.list().await {
                    Ok(page) if page.is_empty() => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(doc_type = %self.doc_type, error = %e, "Fast cursor unavailable");
                        usable = false;
                        break;
                    }
                }
            }
            if usable {
                fast.clear_descending();
                self.fast = Some(fast);
            }
        }
        self.skip_until = Self::window_bound(&self.settings.skip_until);
        self.skip_after = Self::window_bound(&self.settings.skip_after);
        self.should_reset = false;
        Ok(())
    }

    /// Gather raw references: one fast-cursor page first (discarding the
    /// fast cursor once it runs dry), then forward pages until a short
    /// page or the preload bound.
    async fn gather(&mut self) -> Result<Vec<FeedRef>, SourceError> {
        let mut refs = Vec::new();

        if let Some(mut fast) = self.fast.take() {
            match fast.list().await {
                Ok(page) if !page.is_empty() => {
                    self.stats.queries += 1;
                    debug!(doc_type = %self.doc_type, count = page.len(), "Fast cursor page");
                    refs.extend(page);
                    self.fast = Some(fast);
                }
                Ok(_) => {
                    debug!(doc_type = %self.doc_type, "Fast cursor exhausted");
                }
                Err(e) => {
                    warn!(doc_type = %self.doc_type, error = %e, "Fast cursor dropped");
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = match self.client.as_mut() {
                Some(client) => client.list().await,
                None => {
                    self.reset_cursor().await?;
                    continue;
                }
            };
            let page = match result {
                Ok(page) => {
                    self.stats.queries += 1;
                    attempt = 0;
                    page
                }
                Err(e) => {
                    if attempt >= LIST_RETRIES {
                        return Err(e);
                    }
                    attempt += 1;
                    error!(
                        doc_type = %self.doc_type,
                        attempt,
                        gathered = refs.len(),
                        error = %e,
                        "Feed page failed, retrying"
                    );
                    self.sleep(5.0 * attempt as f64).await;
                    self.reset_cursor().await?;
                    continue;
                }
            };
            if page.is_empty() {
                break;
            }
            let short = page.len() < SHORT_PAGE;
            refs.extend(page);
            if short || refs.len() >= self.settings.preload {
                break;
            }
        }

        if refs.len() >= 100 {
            if let Some(last) = refs.last() {
                info!(
                    doc_type = %self.doc_type,
                    count = refs.len(),
                    last = %last.date_modified,
                    "Feed page gathered"
                );
            }
        }
        Ok(refs)
    }

    /// Keep the highest observed version per id when the fast and
    /// forward cursors both listed it.
    fn dedup(refs: Vec<FeedRef>) -> Vec<FeedRef> {
        let mut kept: Vec<FeedRef> = Vec::with_capacity(refs.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(refs.len());
        for reference in refs {
            match index.get(&reference.id) {
                Some(&at) => {
                    if reference.date_modified > kept[at].date_modified {
                        kept[at] = reference;
                    }
                }
                None => {
                    index.insert(reference.id.clone(), kept.len());
                    kept.push(reference);
                }
            }
        }
        kept
    }

    /// Award and contract entries in an active state get an `activeDate`
    /// marker derived from their `date`, needed by the index templates.
    fn patch_document(data: &mut Value) {
        for section in ["awards", "contracts"] {
            let Some(entries) = data.get_mut(section).and_then(Value::as_array_mut) else {
                continue;
            };
            for entry in entries {
                if entry.get("status").and_then(Value::as_str) == Some("active") {
                    if let Some(date) = entry.get("date").cloned() {
                        entry["activeDate"] = date;
                    }
                }
            }
        }
    }

    fn envelope_from(
        &self,
        reference: &FeedRef,
        mut data: Value,
    ) -> Result<DocumentEnvelope, SourceError> {
        Self::patch_document(&mut data);
        let envelope = DocumentEnvelope::from_body(&self.doc_type, data)?;
        if envelope.meta.date_modified != reference.date_modified {
            // Upstream moved forward since the listing; the envelope's
            // version was derived from the fresh body and stays ahead
            debug!(
                id = %reference.id,
                listed = %reference.date_modified,
                fetched = %envelope.meta.date_modified,
                "Reference version healed from fetched body"
            );
        }
        Ok(envelope)
    }
}

#[async_trait]
impl Source for FeedSource {
    fn doc_type(&self) -> &str {
        &self.doc_type
    }

    async fn reset(&mut self) -> Result<(), SourceError> {
        self.reset_cursor().await
    }

    async fn items(&mut self) -> Result<Vec<FeedRef>, SourceError> {
        self.ensure_client().await?;
        self.last_skipped = None;
        let refs = self.gather().await?;
        let mut kept = Vec::with_capacity(refs.len());
        for reference in refs {
            if self.cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            if self.in_window(&reference) {
                kept.push(reference);
            }
        }
        let kept = Self::dedup(kept);
        self.stats.fetched += kept.len() as u64;
        Ok(kept)
    }

    async fn get(&mut self, reference: &FeedRef) -> Result<DocumentEnvelope, SourceError> {
        if let Some(cache) = &mut self.cache {
            if let Some(data) = cache.lookup(reference) {
                return self.envelope_from(reference, data);
            }
        }
        let mut attempt = 0u32;
        let data = loop {
            if self.cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            self.ensure_client().await?;
            let result = match self.client.as_ref() {
                Some(client) => client.fetch(&reference.id).await,
                None => continue,
            };
            match result {
                Ok(data) => {
                    let body_id = data.get("id").and_then(Value::as_str).unwrap_or("");
                    if body_id != reference.id {
                        // Corrupt upstream answer, retrying cannot help
                        return Err(SourceError::Inconsistent {
                            id: reference.id.clone(),
                            reason: format!("upstream returned id {body_id}"),
                        });
                    }
                    let raw = data
                        .get("dateModified")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let fetched = parse_feed_date(raw).map_err(SourceError::Types)?;
                    if fetched >= reference.date_modified {
                        break data;
                    }
                    // Replica lag upstream may serve a stale copy; retry
                    let stale = SourceError::Inconsistent {
                        id: reference.id.clone(),
                        reason: format!(
                            "dateModified moved backwards: listed {}, fetched {fetched}",
                            reference.date_modified
                        ),
                    };
                    if attempt >= GET_RETRIES {
                        return Err(stale);
                    }
                    attempt += 1;
                    warn!(id = %reference.id, attempt, error = %stale, "Stale copy fetched, retrying");
                    self.sleep(5.0 * attempt as f64).await;
                    if attempt > 1 {
                        self.should_reset = true;
                    }
                }
                Err(e) => {
                    if attempt >= GET_RETRIES {
                        return Err(e);
                    }
                    attempt += 1;
                    error!(
                        id = %reference.id,
                        attempt,
                        error = %e,
                        "Document fetch failed, retrying"
                    );
                    self.sleep(5.0 * attempt as f64).await;
                    if attempt > 1 {
                        self.should_reset = true;
                    }
                }
            }
        };
        let envelope = self.envelope_from(reference, data)?;
        if let Some(cache) = &mut self.cache {
            cache.store(&envelope);
        }
        self.stats.fetched += 1;
        Ok(envelope)
    }

    fn request_reset(&mut self) {
        self.should_reset = true;
    }

    fn last_skipped(&self) -> Option<DateTime<Utc>> {
        self.last_skipped
    }

    async fn pause_for(&self, count: usize) {
        if count == 0 || self.settings.index_speed <= 0.0 {
            return;
        }
        self.sleep(count as f64 / self.settings.index_speed).await;
    }
}
