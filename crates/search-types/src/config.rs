//! Configuration loading for the search daemon.
//!
//! Layered precedence: built-in defaults -> TOML config file ->
//! `SEARCH_*` environment variables. CLI flags are applied by the caller
//! after [`Settings::load`] returns.

use std::collections::HashSet;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypesError;

/// Write engine and orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Backing index store base URL
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Request timeout for backend calls (seconds)
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,

    /// Buffer writes and flush them in batches
    #[serde(default)]
    pub bulk_insert: bool,

    /// After exhausting write retries, log and continue instead of
    /// propagating to the top level
    #[serde(default)]
    pub ignore_errors: bool,

    /// Validate current generations once at startup
    #[serde(default = "default_true")]
    pub check_on_start: bool,

    /// Pause between orchestrator passes (seconds)
    #[serde(default = "default_update_wait")]
    pub update_wait_secs: u64,

    /// Pause before retrying a failed backend call (seconds)
    #[serde(default = "default_error_wait")]
    pub error_wait_secs: u64,

    /// Pause before the first pass after startup (seconds)
    #[serde(default)]
    pub start_wait_secs: u64,

    /// Pause inside a freshly spawned reindex worker before it starts
    /// draining (seconds)
    #[serde(default = "default_reindex_wait")]
    pub reindex_wait_secs: u64,

    /// Master status URL. When set, this instance runs as a standby and
    /// only starts writing once the master's heartbeat goes stale.
    #[serde(default)]
    pub slave_mode: Option<String>,

    /// Heartbeat age (seconds) past which a standby takes over writing
    #[serde(default = "default_slave_wakeup")]
    pub slave_wakeup_secs: u64,
}

fn default_store_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_store_timeout() -> u64 {
    300
}

fn default_update_wait() -> u64 {
    5
}

fn default_error_wait() -> u64 {
    10
}

fn default_reindex_wait() -> u64 {
    5
}

fn default_slave_wakeup() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            timeout_secs: default_store_timeout(),
            bulk_insert: false,
            ignore_errors: false,
            check_on_start: true,
            update_wait_secs: default_update_wait(),
            error_wait_secs: default_error_wait(),
            start_wait_secs: 0,
            reindex_wait_secs: default_reindex_wait(),
            slave_mode: None,
            slave_wakeup_secs: default_slave_wakeup(),
        }
    }
}

/// Upstream feed settings for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    /// Feed base URL (list + get-by-id endpoints)
    pub api_url: String,

    /// Optional API key sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Optional `mode` filter forwarded to the list endpoint
    #[serde(default)]
    pub api_mode: Option<String>,

    /// Page size for the list endpoint
    #[serde(default = "default_feed_limit")]
    pub limit: usize,

    /// Upper bound on references gathered per drain pass
    #[serde(default = "default_feed_preload")]
    pub preload: usize,

    /// Skip references modified before this timestamp
    #[serde(default)]
    pub skip_until: Option<String>,

    /// Skip references modified after this timestamp
    #[serde(default)]
    pub skip_after: Option<String>,

    /// Request timeout for feed calls (seconds)
    #[serde(default = "default_feed_timeout")]
    pub timeout_secs: u64,

    /// Target indexing throughput (items per second) used for rate
    /// shaping between pages
    #[serde(default = "default_index_speed")]
    pub index_speed: f64,

    /// Open a second descending cursor that surfaces the newest changes
    /// first during a full drain
    #[serde(default = "default_true")]
    pub fast_cursor: bool,

    /// Content cache capacity (entries); 0 disables the cache
    #[serde(default)]
    pub cache_size: usize,

    /// Terminal statuses eligible for cache serving. Documents in any
    /// other status may still change upstream and are never cache-served.
    #[serde(default)]
    pub cache_allow_statuses: Vec<String>,
}

fn default_feed_limit() -> usize {
    1000
}

fn default_feed_preload() -> usize {
    500_000
}

fn default_feed_timeout() -> u64 {
    30
}

fn default_index_speed() -> f64 {
    100.0
}

/// A data-driven suppression rule evaluated against a document body.
///
/// A document is suppressed (not indexed) when its procurement method
/// matches, the optional status gate matches, and none of the `unless_*`
/// escapes hold. Rules with a `since` gate only apply to documents whose
/// gate field sorts after the given value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoindexRule {
    /// `procurementMethodType` values this rule applies to
    pub methods: Vec<String>,

    /// Only suppress when the document status equals this value
    #[serde(default)]
    pub status: Option<String>,

    /// Escape: keep the document if any award has one of these statuses
    #[serde(default)]
    pub unless_award_status: Vec<String>,

    /// Escape: keep the document if any award carries complaints
    #[serde(default)]
    pub unless_award_complaints: bool,

    /// Escape: keep the document if any contract has one of these statuses
    #[serde(default)]
    pub unless_contract_status: Vec<String>,

    /// Apply only when `data[field] > after` (lexicographic)
    #[serde(default)]
    pub since: Option<FieldAfter>,
}

/// Lexicographic gate on a top-level document field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAfter {
    pub field: String,
    pub after: String,
}

impl NoindexRule {
    /// Whether this rule suppresses the given document body.
    pub fn suppresses(&self, data: &Value) -> bool {
        if let Some(gate) = &self.since {
            match data.get(&gate.field).and_then(Value::as_str) {
                Some(v) if v > gate.after.as_str() => {}
                _ => return false,
            }
        }
        let method = data
            .get("procurementMethodType")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !self.methods.iter().any(|m| m == method) {
            return false;
        }
        if let Some(status) = &self.status {
            return data.get("status").and_then(Value::as_str) == Some(status.as_str());
        }
        if !self.unless_award_status.is_empty() || self.unless_award_complaints {
            for award in list_of(data, "awards") {
                let st = award.get("status").and_then(Value::as_str).unwrap_or("");
                if self.unless_award_status.iter().any(|s| s == st) {
                    return false;
                }
                if self.unless_award_complaints {
                    if let Some(c) = award.get("complaints").and_then(Value::as_array) {
                        if !c.is_empty() {
                            return false;
                        }
                    }
                }
            }
        }
        if !self.unless_contract_status.is_empty() {
            for contract in list_of(data, "contracts") {
                let st = contract.get("status").and_then(Value::as_str).unwrap_or("");
                if self.unless_contract_status.iter().any(|s| s == st) {
                    return false;
                }
            }
        }
        true
    }
}

fn list_of<'a>(data: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .unwrap_or_default()
}

/// Per-logical-index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Logical index key, e.g. "tenders"
    pub key: String,

    /// Document type written under this index
    pub doc_type: String,

    /// Shared base template (schema + settings), JSON file path
    pub base_template: String,

    /// Per-type template merged over the base, JSON file path
    pub type_template: String,

    /// Language codes whose filter lists are injected into the template
    #[serde(default)]
    pub languages: Vec<String>,

    /// Maximum generation age before a reindex is due (seconds)
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// First ISO weekday (1 = Monday) of the allowed reindex window; an
    /// aged generation is only rebuilt from this day onwards
    #[serde(default = "default_reindex_weekday")]
    pub reindex_from_weekday: u8,

    /// Minimum document count a generation must hold to pass validation
    #[serde(default = "default_check_min_docs")]
    pub check_min_docs: u64,

    /// Maximum age of the newest document for a generation to pass
    /// validation (seconds)
    #[serde(default = "default_check_max_stale")]
    pub check_max_stale_secs: u64,

    /// Skip the doc-count/freshness half of validation (the catch-all
    /// mapping field is always checked)
    #[serde(default)]
    pub skip_check: bool,

    /// Run full reindexes in an isolated worker process
    #[serde(default)]
    pub async_reindex: bool,

    /// Data-driven suppression rules
    #[serde(default)]
    pub noindex: Vec<NoindexRule>,

    pub feed: FeedSettings,
}

fn default_max_age() -> u64 {
    864_000 // 10 days
}

fn default_reindex_weekday() -> u8 {
    5
}

fn default_check_min_docs() -> u64 {
    1
}

fn default_check_max_stale() -> u64 {
    97_200 // 27 hours
}

/// Main daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name store path prefix; the store file is `<prefix>.toml` and the
    /// heartbeat side file is `<prefix>.beat`
    #[serde(default = "default_index_names")]
    pub index_names: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default, rename = "index")]
    pub indexes: Vec<IndexSettings>,
}

fn default_index_names() -> String {
    "index_names".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            index_names: default_index_names(),
            log_level: default_log_level(),
            engine: EngineSettings::default(),
            indexes: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (optional)
    /// 3. Environment variables (`SEARCH_*`, `__` as separator)
    pub fn load(config_path: Option<&str>) -> Result<Self, TypesError> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("SEARCH")
                .separator("__")
                .try_parsing(true),
        );
        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.index_names.is_empty() {
            return Err(TypesError::Config("index_names must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.key.is_empty() {
                return Err(TypesError::Config("index key must not be empty".into()));
            }
            if !seen.insert(index.key.as_str()) {
                return Err(TypesError::Config(format!(
                    "duplicate index key {}",
                    index.key
                )));
            }
            if !(1..=7).contains(&index.reindex_from_weekday) {
                return Err(TypesError::Config(format!(
                    "[{}] reindex_from_weekday must be 1-7",
                    index.key
                )));
            }
            if index.feed.index_speed <= 0.0 {
                return Err(TypesError::Config(format!(
                    "[{}] index_speed must be positive",
                    index.key
                )));
            }
            if index.feed.api_url.is_empty() {
                return Err(TypesError::Config(format!(
                    "[{}] feed api_url must not be empty",
                    index.key
                )));
            }
        }
        Ok(())
    }

    /// Config listing for the startup log, secrets elided.
    pub fn dump(&self) -> String {
        let mut lines = vec![
            format!("{:<24} = {}", "index_names", self.index_names),
            format!("{:<24} = {}", "store_url", self.engine.store_url),
            format!("{:<24} = {}", "bulk_insert", self.engine.bulk_insert),
            format!("{:<24} = {}", "ignore_errors", self.engine.ignore_errors),
            format!(
                "{:<24} = {}",
                "slave_mode",
                self.engine.slave_mode.as_deref().unwrap_or("(master)")
            ),
            format!("{:<24} = {}", "update_wait_secs", self.engine.update_wait_secs),
        ];
        for index in &self.indexes {
            lines.push(format!(
                "{:<24} = {} ({}), async_reindex={}",
                format!("index.{}", index.key),
                index.feed.api_url,
                index.doc_type,
                index.async_reindex
            ));
        }
        lines.join("\n\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineSettings::default();
        assert_eq!(engine.store_url, "http://localhost:9200");
        assert_eq!(engine.update_wait_secs, 5);
        assert_eq!(engine.error_wait_secs, 10);
        assert_eq!(engine.slave_wakeup_secs, 600);
        assert!(engine.check_on_start);
        assert!(!engine.bulk_insert);
        assert!(engine.slave_mode.is_none());
    }

    #[test]
    fn test_settings_from_toml() {
        let raw = r#"
            index_names = "var/names"

            [engine]
            store_url = "http://es:9200"
            bulk_insert = true

            [[index]]
            key = "tenders"
            doc_type = "tender"
            base_template = "settings/base.json"
            type_template = "settings/tender.json"
            languages = ["uk", "en"]
            async_reindex = true

            [index.feed]
            api_url = "http://api.example/tenders"
            limit = 100
        "#;
        let settings: Settings = toml::from_str(raw).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.index_names, "var/names");
        assert!(settings.engine.bulk_insert);
        assert_eq!(settings.indexes.len(), 1);
        let index = &settings.indexes[0];
        assert_eq!(index.key, "tenders");
        assert_eq!(index.feed.limit, 100);
        assert_eq!(index.feed.preload, 500_000);
        assert_eq!(index.max_age_secs, 864_000);
        assert!(index.async_reindex);
    }

    #[test]
    fn test_validate_duplicate_keys() {
        let feed = FeedSettings {
            api_url: "http://api".into(),
            api_key: None,
            api_mode: None,
            limit: 10,
            preload: 10,
            skip_until: None,
            skip_after: None,
            timeout_secs: 30,
            index_speed: 100.0,
            fast_cursor: true,
            cache_size: 0,
            cache_allow_statuses: vec![],
        };
        let index = IndexSettings {
            key: "tenders".into(),
            doc_type: "tender".into(),
            base_template: "base.json".into(),
            type_template: "tender.json".into(),
            languages: vec![],
            max_age_secs: default_max_age(),
            reindex_from_weekday: 5,
            check_min_docs: 1,
            check_max_stale_secs: default_check_max_stale(),
            skip_check: false,
            async_reindex: false,
            noindex: vec![],
            feed,
        };
        let settings = Settings {
            indexes: vec![index.clone(), index],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_noindex_award_rule() {
        let rule = NoindexRule {
            methods: vec!["negotiation".into(), "negotiation.quick".into()],
            unless_award_status: vec!["active".into(), "cancelled".into()],
            unless_award_complaints: true,
            since: Some(FieldAfter {
                field: "tenderID".into(),
                after: "UA-2016-05-31".into(),
            }),
            ..Default::default()
        };

        // No active award, no complaints: suppressed
        let doc = json!({
            "tenderID": "UA-2017-01-01-000001",
            "procurementMethodType": "negotiation",
            "awards": [{"status": "pending"}],
        });
        assert!(rule.suppresses(&doc));

        // Active award escapes the rule
        let doc = json!({
            "tenderID": "UA-2017-01-01-000001",
            "procurementMethodType": "negotiation",
            "awards": [{"status": "active"}],
        });
        assert!(!rule.suppresses(&doc));

        // Complaints escape the rule
        let doc = json!({
            "tenderID": "UA-2017-01-01-000001",
            "procurementMethodType": "negotiation.quick",
            "awards": [{"status": "pending", "complaints": [{}]}],
        });
        assert!(!rule.suppresses(&doc));

        // Predates the gate: rule does not apply
        let doc = json!({
            "tenderID": "UA-2016-01-01-000001",
            "procurementMethodType": "negotiation",
        });
        assert!(!rule.suppresses(&doc));

        // Different method: rule does not apply
        let doc = json!({
            "tenderID": "UA-2017-01-01-000001",
            "procurementMethodType": "aboveThreshold",
        });
        assert!(!rule.suppresses(&doc));
    }

    #[test]
    fn test_noindex_status_rule() {
        let rule = NoindexRule {
            methods: vec![
                "competitiveDialogueUA.stage2".into(),
                "competitiveDialogueEU.stage2".into(),
            ],
            status: Some("draft.stage2".into()),
            ..Default::default()
        };
        let doc = json!({
            "procurementMethodType": "competitiveDialogueUA.stage2",
            "status": "draft.stage2",
        });
        assert!(rule.suppresses(&doc));
        let doc = json!({
            "procurementMethodType": "competitiveDialogueUA.stage2",
            "status": "active.tendering",
        });
        assert!(!rule.suppresses(&doc));
    }

    #[test]
    fn test_noindex_contract_rule() {
        let rule = NoindexRule {
            methods: vec!["reporting".into()],
            unless_contract_status: vec!["active".into()],
            ..Default::default()
        };
        let doc = json!({
            "procurementMethodType": "reporting",
            "contracts": [{"status": "pending"}],
        });
        assert!(rule.suppresses(&doc));
        let doc = json!({
            "procurementMethodType": "reporting",
            "contracts": [{"status": "active"}],
        });
        assert!(!rule.suppresses(&doc));
    }

    #[test]
    fn test_dump_elides_secrets() {
        let settings = Settings::default();
        let dump = settings.dump();
        assert!(dump.contains("store_url"));
        assert!(!dump.contains("api_key"));
    }
}
