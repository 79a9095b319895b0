//! Heartbeat side file and the master status payload.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NamesError;

/// Minimum spacing between heartbeat file writes, seconds.
pub const HEARTBEAT_WRITE_INTERVAL_SECS: i64 = 10;

/// Status payload the read server exposes for remote standbys.
///
/// A standby fetches this over HTTP, adopts `index_names` as its local
/// view while the master is alive, and takes over writing once
/// `heartbeat` goes stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterStatus {
    /// Last successful write-pass timestamp, epoch seconds
    pub heartbeat: i64,

    /// Master's current logical -> physical name mapping
    #[serde(default)]
    pub index_names: BTreeMap<String, String>,

    /// Master's software version, for mismatch warnings
    #[serde(default)]
    pub version: Option<String>,
}

/// The `<prefix>.beat` file holding the last write-pass timestamp.
///
/// Writes are throttled to one per [`HEARTBEAT_WRITE_INTERVAL_SECS`] so
/// a busy drain loop does not hammer the filesystem.
pub struct HeartbeatFile {
    path: PathBuf,
    last_saved: Option<i64>,
}

impl HeartbeatFile {
    pub fn new(prefix: impl AsRef<Path>) -> Self {
        Self {
            path: prefix.as_ref().with_extension("beat"),
            last_saved: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the given timestamp, unless one was written within the
    /// throttle interval. Returns whether a write happened.
    pub fn record(&mut self, now: i64) -> Result<bool, NamesError> {
        if let Some(last) = self.last_saved {
            if now - last < HEARTBEAT_WRITE_INTERVAL_SECS {
                return Ok(false);
            }
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| NamesError::io(parent, e))?;
            }
        }
        fs::write(&self.path, format!("{now}\n")).map_err(|e| NamesError::io(&self.path, e))?;
        self.last_saved = Some(now);
        debug!(value = now, "Heartbeat recorded");
        Ok(true)
    }

    /// Read the last recorded timestamp. A missing file reads as 0.
    pub fn read(&self) -> Result<i64, NamesError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(NamesError::io(&self.path, e)),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        trimmed
            .parse()
            .map_err(|_| NamesError::MalformedHeartbeat(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut beat = HeartbeatFile::new(dir.path().join("index_names"));
        assert_eq!(beat.read().unwrap(), 0);
        assert!(beat.record(1_700_000_000).unwrap());
        assert_eq!(beat.read().unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_record_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let mut beat = HeartbeatFile::new(dir.path().join("index_names"));
        assert!(beat.record(1_700_000_000).unwrap());
        // Within the interval: skipped, file unchanged
        assert!(!beat.record(1_700_000_005).unwrap());
        assert_eq!(beat.read().unwrap(), 1_700_000_000);
        // Past the interval: written
        assert!(beat.record(1_700_000_010).unwrap());
        assert_eq!(beat.read().unwrap(), 1_700_000_010);
    }

    #[test]
    fn test_malformed_value() {
        let dir = tempfile::tempdir().unwrap();
        let beat = HeartbeatFile::new(dir.path().join("index_names"));
        fs::write(beat.path(), "not a number\n").unwrap();
        assert!(matches!(
            beat.read(),
            Err(NamesError::MalformedHeartbeat(_))
        ));
    }

    #[test]
    fn test_master_status_json_shape() {
        let raw = r#"{
            "heartbeat": 1700000000,
            "index_names": {"tenders": "tenders_1699999000"},
            "version": "1.2.0"
        }"#;
        let status: MasterStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.heartbeat, 1_700_000_000);
        assert_eq!(
            status.index_names.get("tenders").map(String::as_str),
            Some("tenders_1699999000")
        );
        assert_eq!(status.version.as_deref(), Some("1.2.0"));

        // Bare payload still parses: names and version are optional
        let status: MasterStatus = serde_json::from_str(r#"{"heartbeat": 5}"#).unwrap();
        assert!(status.index_names.is_empty());
        assert!(status.version.is_none());
    }
}
