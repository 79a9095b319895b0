//! HTTP client for the backing document-index store.
//!
//! The engine depends only on this capability set, not on a particular
//! backend product: versioned put with external-version semantics, bulk
//! put, get-by-id with and without body, index create-with-body, alias
//! add/remove, per-index stats and a server info probe.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use search_types::DocumentEnvelope;

use crate::error::EngineError;

/// Backend server identity from the root info probe.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub version: ServerVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerVersion {
    pub number: String,
}

/// Outcome of one bulk call.
#[derive(Debug, Default)]
pub struct BulkReport {
    /// Documents accepted by the backend
    pub written: usize,
    /// Documents rejected with a version conflict (already up to date)
    pub conflicts: usize,
    /// Ids of documents that failed for any other reason
    pub failed: Vec<String>,
}

impl BulkReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Thin reqwest wrapper around the store's HTTP API.
#[derive(Debug, Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl StoreClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 409 {
            return Err(EngineError::VersionConflict);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Backend {
            status: status.as_u16(),
            body,
        })
    }

    /// GET `/` for server identity and version.
    pub async fn server_info(&self) -> Result<ServerInfo, EngineError> {
        let response = Self::check(self.http.get(&self.base_url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Versioned put of one document under `{index, type, id, version}`.
    ///
    /// The backend rejects the write with 409 when it already stores an
    /// equal-or-newer version for this id; that surfaces as
    /// [`EngineError::VersionConflict`].
    pub async fn put_versioned(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        version: u64,
        body: &Value,
    ) -> Result<(), EngineError> {
        let response = self
            .http
            .put(self.url(&format!("{index}/{doc_type}/{id}")))
            .query(&[
                ("version", version.to_string()),
                ("version_type", "external".to_string()),
            ])
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Bulk put of many documents in one call.
    ///
    /// Per-document results are reported individually; a version
    /// conflict on one document never fails the call.
    pub async fn bulk(
        &self,
        index: &str,
        items: &[DocumentEnvelope],
    ) -> Result<BulkReport, EngineError> {
        let mut lines = Vec::with_capacity(items.len() * 2);
        for item in items {
            let action = json!({
                "index": {
                    "_index": index,
                    "_type": item.meta.doc_type,
                    "_id": item.meta.id,
                    "_version": item.meta.version,
                    "_version_type": "external",
                }
            });
            lines.push(action.to_string());
            lines.push(item.data.to_string());
        }
        let mut body = lines.join("\n");
        body.push('\n');

        let response = self
            .http
            .post(self.url("_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let payload: Value = Self::check(response).await?.json().await?;

        let mut report = BulkReport::default();
        for entry in payload
            .get("items")
            .and_then(Value::as_array)
            .map(|a| a.as_slice())
            .unwrap_or_default()
        {
            let action = entry.get("index").unwrap_or(entry);
            let status = action.get("status").and_then(Value::as_u64).unwrap_or(0);
            match status {
                200 | 201 => report.written += 1,
                409 => report.conflicts += 1,
                _ => {
                    let id = action
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or("<unknown>");
                    report.failed.push(id.to_string());
                }
            }
        }
        debug!(
            index,
            written = report.written,
            conflicts = report.conflicts,
            failed = report.failed.len(),
            "Bulk call finished"
        );
        Ok(report)
    }

    /// Version currently stored for an id, or `None` when absent.
    pub async fn stored_version(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
    ) -> Result<Option<u64>, EngineError> {
        let response = self
            .http
            .get(self.url(&format!("{index}/{doc_type}/{id}")))
            .query(&[("_source", "false")])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let payload: Value = Self::check(response).await?.json().await?;
        Ok(payload.get("_version").and_then(Value::as_u64))
    }

    /// Full stored document, or `None` when absent.
    pub async fn get_doc(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
    ) -> Result<Option<Value>, EngineError> {
        let response = self
            .http
            .get(self.url(&format!("{index}/{doc_type}/{id}")))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let payload: Value = Self::check(response).await?.json().await?;
        Ok(payload.get("_source").cloned())
    }

    /// Create a physical index with the given schema/settings body.
    pub async fn create_index(&self, name: &str, body: &Value) -> Result<(), EngineError> {
        let response = self.http.put(self.url(name)).json(body).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Index definition (settings + mappings) as stored by the backend.
    pub async fn index_info(&self, name: &str) -> Result<Value, EngineError> {
        let response = self.http.get(self.url(name)).send().await?;
        let payload: Value = Self::check(response).await?.json().await?;
        // The backend wraps the definition under the index name
        Ok(payload.get(name).cloned().unwrap_or(payload))
    }

    /// Whether a physical index exists.
    pub async fn index_exists(&self, name: &str) -> Result<bool, EngineError> {
        let response = self.http.head(self.url(name)).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Primary-shard document count for an index.
    pub async fn doc_count(&self, name: &str) -> Result<u64, EngineError> {
        let response = self
            .http
            .get(self.url(&format!("{name}/_stats")))
            .send()
            .await?;
        let payload: Value = Self::check(response).await?.json().await?;
        Ok(payload
            .pointer(&format!("/indices/{name}/primaries/docs/count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Modification timestamp of the newest document in an index.
    pub async fn max_date_modified(
        &self,
        name: &str,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let body = json!({
            "size": 1,
            "sort": [{"dateModified": {"order": "desc"}}],
            "_source": ["dateModified"],
        });
        let payload = self.search(name, &body, 0, 1).await?;
        let raw = payload
            .pointer("/hits/hits/0/_source/dateModified")
            .and_then(Value::as_str);
        match raw {
            Some(raw) => Ok(Some(
                search_types::document::parse_feed_date(raw)
                    .map_err(|_| EngineError::Backend {
                        status: 200,
                        body: format!("unparsable dateModified {raw:?}"),
                    })?,
            )),
            None => Ok(None),
        }
    }

    /// Raw query against one or more indexes (comma-separated).
    pub async fn search(
        &self,
        index: &str,
        body: &Value,
        from: usize,
        size: usize,
    ) -> Result<Value, EngineError> {
        let response = self
            .http
            .post(self.url(&format!("{index}/_search")))
            .query(&[("from", from.to_string()), ("size", size.to_string())])
            .json(body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Remove an alias from any index matching a pattern. A missing
    /// alias is not an error.
    pub async fn delete_alias(&self, index_pattern: &str, alias: &str) -> Result<(), EngineError> {
        let response = self
            .http
            .delete(self.url(&format!("{index_pattern}/_alias/{alias}")))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    /// Point an alias at a physical index.
    pub async fn put_alias(&self, index: &str, alias: &str) -> Result<(), EngineError> {
        let response = self
            .http
            .put(self.url(&format!("{index}/_alias/{alias}")))
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
