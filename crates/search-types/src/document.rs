//! Document envelopes and feed references.
//!
//! A document travels through the pipeline as a [`DocumentEnvelope`]:
//! the full upstream body under `data` plus a [`DocMeta`] header carrying
//! the external version used for optimistic-concurrency writes.
//!
//! The external version is a microsecond encoding of the upstream
//! modification timestamp, so re-delivery and out-of-order delivery of
//! the same document are idempotent: the backend keeps whichever copy
//! carries the higher version.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypesError;

/// Encode a modification timestamp as a monotonic external version.
///
/// Microsecond resolution: two distinct `dateModified` values always map
/// to two distinct versions, and later timestamps map to larger versions.
pub fn long_version(dt: DateTime<Utc>) -> u64 {
    dt.timestamp_micros().max(0) as u64
}

/// Parse an upstream timestamp, accepting RFC 3339 with offset or a
/// naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` form (treated as UTC).
pub fn parse_feed_date(raw: &str) -> Result<DateTime<Utc>, TypesError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| TypesError::InvalidTimestamp(raw.to_string()))
}

/// Lightweight document reference from a paginated feed listing.
///
/// The list endpoint returns `{id, dateModified}` stubs; the full body
/// is fetched separately via the source's `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRef {
    pub id: String,

    #[serde(rename = "dateModified")]
    pub date_modified: DateTime<Utc>,
}

impl FeedRef {
    pub fn new(id: impl Into<String>, date_modified: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            date_modified,
        }
    }

    /// External version this reference implies.
    pub fn version(&self) -> u64 {
        long_version(self.date_modified)
    }
}

/// Write metadata for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    pub id: String,

    pub doc_type: String,

    /// External optimistic-concurrency token; see [`long_version`].
    pub version: u64,

    #[serde(rename = "dateModified")]
    pub date_modified: DateTime<Utc>,

    /// When set, a write that collides with an already-stored copy at an
    /// acceptable version is silently swallowed instead of logged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_exists: bool,
}

impl DocMeta {
    pub fn new(id: impl Into<String>, doc_type: impl Into<String>, date_modified: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            version: long_version(date_modified),
            date_modified,
            ignore_exists: false,
        }
    }
}

/// A full document plus its write metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEnvelope {
    pub meta: DocMeta,
    pub data: Value,
}

impl DocumentEnvelope {
    pub fn new(meta: DocMeta, data: Value) -> Self {
        Self { meta, data }
    }

    /// Build an envelope from a raw upstream body, deriving the metadata
    /// from the body's `id` and `dateModified` fields.
    pub fn from_body(doc_type: &str, data: Value) -> Result<Self, TypesError> {
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| TypesError::CorruptDocument {
                id: "<unknown>".to_string(),
                reason: "missing id".to_string(),
            })?
            .to_string();
        let raw_date = data
            .get("dateModified")
            .and_then(Value::as_str)
            .ok_or_else(|| TypesError::CorruptDocument {
                id: id.clone(),
                reason: "missing dateModified".to_string(),
            })?;
        let date_modified = parse_feed_date(raw_date)?;
        Ok(Self {
            meta: DocMeta::new(id, doc_type, date_modified),
            data,
        })
    }

    /// Consistency check between the metadata and the body.
    ///
    /// A mismatch means corrupt input: the caller drops the document
    /// with a warning instead of writing it.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.meta.version != long_version(self.meta.date_modified) {
            return Err(TypesError::CorruptDocument {
                id: self.meta.id.clone(),
                reason: format!(
                    "version {} does not encode dateModified {}",
                    self.meta.version, self.meta.date_modified
                ),
            });
        }
        if let Some(body_id) = self.data.get("id").and_then(Value::as_str) {
            if body_id != self.meta.id {
                return Err(TypesError::CorruptDocument {
                    id: self.meta.id.clone(),
                    reason: format!("body id {} differs from meta id", body_id),
                });
            }
        }
        if let Some(raw) = self.data.get("dateModified").and_then(Value::as_str) {
            let body_date = parse_feed_date(raw)?;
            if body_date != self.meta.date_modified {
                return Err(TypesError::CorruptDocument {
                    id: self.meta.id.clone(),
                    reason: format!(
                        "body dateModified {} differs from meta {}",
                        body_date, self.meta.date_modified
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_feed_date(raw).unwrap()
    }

    #[test]
    fn test_long_version_monotonic() {
        let v1 = long_version(ts("2024-03-01T10:00:00.000001+00:00"));
        let v2 = long_version(ts("2024-03-01T10:00:00.000002+00:00"));
        let v3 = long_version(ts("2024-03-02T10:00:00+00:00"));
        assert!(v1 < v2);
        assert!(v2 < v3);
    }

    #[test]
    fn test_parse_feed_date_with_offset() {
        let with_offset = ts("2024-03-01T12:00:00+02:00");
        let utc = ts("2024-03-01T10:00:00+00:00");
        assert_eq!(with_offset, utc);
    }

    #[test]
    fn test_parse_feed_date_naive() {
        let naive = ts("2024-03-01T10:00:00.123456");
        assert_eq!(naive.timestamp_subsec_micros(), 123_456);
    }

    #[test]
    fn test_parse_feed_date_invalid() {
        assert!(parse_feed_date("not a date").is_err());
    }

    #[test]
    fn test_feed_ref_version() {
        let r = FeedRef::new("abc", ts("2024-03-01T10:00:00+00:00"));
        assert_eq!(r.version(), long_version(r.date_modified));
    }

    #[test]
    fn test_envelope_from_body() {
        let body = json!({
            "id": "tender-1",
            "dateModified": "2024-03-01T10:00:00+00:00",
            "status": "active.tendering",
        });
        let env = DocumentEnvelope::from_body("tender", body).unwrap();
        assert_eq!(env.meta.id, "tender-1");
        assert_eq!(env.meta.doc_type, "tender");
        assert_eq!(env.meta.version, long_version(env.meta.date_modified));
        env.validate().unwrap();
    }

    #[test]
    fn test_envelope_from_body_missing_fields() {
        assert!(DocumentEnvelope::from_body("tender", json!({"id": "x"})).is_err());
        assert!(DocumentEnvelope::from_body("tender", json!({"dateModified": "2024-03-01T10:00:00Z"})).is_err());
    }

    #[test]
    fn test_validate_rejects_timestamp_mismatch() {
        let body = json!({
            "id": "tender-1",
            "dateModified": "2024-03-01T10:00:00+00:00",
        });
        let mut env = DocumentEnvelope::from_body("tender", body).unwrap();
        env.data["dateModified"] = json!("2024-03-02T10:00:00+00:00");
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_stale_version() {
        let body = json!({
            "id": "tender-1",
            "dateModified": "2024-03-01T10:00:00+00:00",
        });
        let mut env = DocumentEnvelope::from_body("tender", body).unwrap();
        env.meta.version -= 1;
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_meta_serde_shape() {
        let meta = DocMeta::new("a", "tender", ts("2024-03-01T10:00:00+00:00"));
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"dateModified\""));
        // Default ignore_exists is elided from the wire shape
        assert!(!json.contains("ignore_exists"));
        let back: DocMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
