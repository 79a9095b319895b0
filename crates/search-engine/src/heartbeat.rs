//! Standby-side view of the master writer's heartbeat.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use search_names::MasterStatus;

use crate::error::EngineError;

/// How long a fetched master status stays cached before re-probing.
pub const MASTER_PROBE_CACHE_SECS: u64 = 60;

/// Probe request timeout. Deliberately short: a slow master is handled
/// by the cached fallback, not by blocking the write loop.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a standby should do after consulting the master's heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterRole {
    /// Master is gone; proceed with independent writes.
    Proceed,
    /// Master is alive; do not write, mirror its name mapping instead.
    StandDown,
}

/// Cached fetcher for the master's `{heartbeat, index_names, version}`
/// status endpoint.
///
/// A fetch failure falls back to the last successfully observed value
/// (initially "now", so a standby never takes over just because its own
/// first probe failed).
pub struct MasterProbe {
    url: String,
    http: reqwest::Client,
    cache_ttl: Duration,
    checked_at: Option<Instant>,
    last_value: i64,
}

impl MasterProbe {
    pub fn new(url: &str) -> Result<Self, EngineError> {
        Self::with_cache_ttl(url, Duration::from_secs(MASTER_PROBE_CACHE_SECS))
    }

    pub fn with_cache_ttl(url: &str, cache_ttl: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            url: url.to_string(),
            http,
            cache_ttl,
            checked_at: None,
            last_value: Utc::now().timestamp(),
        })
    }

    /// Last observed master heartbeat, re-fetching when the cached value
    /// is older than the TTL. Also returns the freshly fetched status,
    /// when one was fetched, so the caller can adopt the master's name
    /// mapping.
    pub async fn observe(&mut self) -> (i64, Option<MasterStatus>) {
        if let Some(at) = self.checked_at {
            if at.elapsed() < self.cache_ttl {
                return (self.last_value, None);
            }
        }
        let status = match self.fetch().await {
            Ok(status) => {
                let lag_min = (Utc::now().timestamp() - status.heartbeat) / 60;
                info!(heartbeat = status.heartbeat, lag_min, "Master heartbeat observed");
                self.last_value = status.heartbeat;
                Some(status)
            }
            Err(e) => {
                // Keep the last accepted value; a flaky probe must not
                // look like a dead master.
                warn!(url = %self.url, error = %e, "Master heartbeat check failed");
                None
            }
        };
        self.checked_at = Some(Instant::now());
        (self.last_value, status)
    }

    async fn fetch(&self) -> Result<MasterStatus, EngineError> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Backend {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}
