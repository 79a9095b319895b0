//! Content cache for fetched documents.
//!
//! Only documents in an allow-listed terminal status are cached, and a
//! cached copy is served only when its modification timestamp matches
//! the reference exactly. Anything still subject to change upstream
//! always goes back to the feed.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::Value;
use tracing::debug;

use search_types::{DocumentEnvelope, FeedRef};

struct CachedDoc {
    date_modified: DateTime<Utc>,
    data: Value,
}

/// LRU cache of full document bodies, keyed by id.
pub struct ContentCache {
    entries: LruCache<String, CachedDoc>,
    allow_statuses: HashSet<String>,
    hits: u64,
    misses: u64,
}

impl ContentCache {
    /// `None` when the configured capacity is zero.
    pub fn new(capacity: usize, allow_statuses: &[String]) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: LruCache::new(capacity),
            allow_statuses: allow_statuses.iter().cloned().collect(),
            hits: 0,
            misses: 0,
        })
    }

    /// Cached body for a reference, valid only on an exact timestamp
    /// match.
    pub fn lookup(&mut self, reference: &FeedRef) -> Option<Value> {
        match self.entries.get(&reference.id) {
            Some(entry) if entry.date_modified == reference.date_modified => {
                self.hits += 1;
                Some(entry.data.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Remember a fetched document when its status is terminal.
    pub fn store(&mut self, envelope: &DocumentEnvelope) {
        let status = envelope
            .data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !self.allow_statuses.contains(status) {
            return;
        }
        debug!(id = %envelope.meta.id, status, "Document cached");
        self.entries.put(
            envelope.meta.id.clone(),
            CachedDoc {
                date_modified: envelope.meta.date_modified,
                data: envelope.data.clone(),
            },
        );
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
