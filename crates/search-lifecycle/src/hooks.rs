//! Plugin hooks around the indexing pipeline.
//!
//! Hooks are ordered; every lifecycle event walks the full list. All
//! methods default to no-ops, so a plugin only implements the seams it
//! cares about.

use serde_json::Value;

use search_types::DocumentEnvelope;

/// Extension points called by [`IndexLifecycle`](crate::IndexLifecycle).
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Before a new physical index is created; may adjust the template.
    fn before_create_index(&self, _name: &str, _template: &mut Value) {}

    /// Before the source cursor is re-established for a full drain.
    fn before_source_reset(&self, _doc_type: &str) {}

    /// Before one document is written; may adjust the body.
    fn before_index_item(&self, _envelope: &mut DocumentEnvelope) {}

    /// At the top of every lifecycle tick.
    fn before_process(&self, _key: &str) {}

    /// Inside a freshly started reindex worker process.
    fn on_worker_start(&self, _key: &str, _generation: &str) {}
}
