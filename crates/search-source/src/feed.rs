//! HTTP cursor over a paginated record feed.
//!
//! The feed exposes a list endpoint returning `{id, dateModified}` stubs
//! with a continuation offset under `next_page`, and a get-by-id
//! endpoint returning the full record under `data`. The cursor keeps the
//! offset between calls, so consecutive [`FeedClient::list`] calls walk
//! the feed forward.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use search_types::{FeedRef, FeedSettings};

use crate::error::SourceError;

/// One page of the list endpoint.
#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    data: Vec<FeedRef>,
    #[serde(default)]
    next_page: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    offset: String,
}

/// Stateful pagination cursor against one feed endpoint.
#[derive(Debug, Clone)]
pub struct FeedClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    mode: Option<String>,
    limit: usize,
    descending: bool,
    offset: Option<String>,
}

impl FeedClient {
    pub fn new(settings: &FeedSettings, descending: bool) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            mode: settings.api_mode.clone(),
            limit: settings.limit,
            descending,
            offset: None,
        })
    }

    /// Stop walking backwards; subsequent pages continue forward from
    /// the current offset.
    pub fn clear_descending(&mut self) {
        self.descending = false;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the next page of references, advancing the offset.
    ///
    /// An empty page means the feed has nothing new past the cursor.
    pub async fn list(&mut self) -> Result<Vec<FeedRef>, SourceError> {
        let mut query: Vec<(&str, String)> = vec![
            ("feed", "changes".to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(mode) = &self.mode {
            query.push(("mode", mode.clone()));
        }
        if self.descending {
            query.push(("descending", "1".to_string()));
        }
        if let Some(offset) = &self.offset {
            query.push(("offset", offset.clone()));
        }
        let mut request = self.http.get(&self.base_url).query(&query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Upstream {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let page: FeedPage = response.json().await?;
        if let Some(next) = page.next_page {
            self.offset = Some(next.offset);
        }
        Ok(page.data)
    }

    /// Fetch one full record by id.
    pub async fn fetch(&self, id: &str) -> Result<Value, SourceError> {
        let mut request = self.http.get(format!("{}/{id}", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(SourceError::NotFound { id: id.to_string() });
        }
        if !status.is_success() {
            return Err(SourceError::Upstream {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let payload: Value = response.json().await?;
        // The feed wraps the record under `data`
        Ok(payload.get("data").cloned().unwrap_or(payload))
    }
}
