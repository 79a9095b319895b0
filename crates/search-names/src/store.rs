//! TTL-cached shared file map with atomic rewrite.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::NamesError;

/// Name store key for the generation being built.
pub fn next_key(key: &str) -> String {
    format!("{key}.next")
}

/// Name store key for the retired generation pending deletion.
pub fn prev_key(key: &str) -> String {
    format!("{key}.prev")
}

/// Persisted logical-key -> physical-index-name mapping.
///
/// Mutation policy is last-writer-wins with a read-merge-write pass:
/// every `set` re-reads the file, overlays the change and rewrites the
/// whole file via a temp file + rename. That tolerates concurrent
/// writers (active writer plus a standby taking over) because the store
/// is a cache of state re-derivable from the backend, not the source of
/// truth.
pub struct NameStore {
    path: PathBuf,
    ttl: Duration,
    cache: BTreeMap<String, String>,
    last_sync: Option<Instant>,
}

impl NameStore {
    /// Open a store persisted at `<prefix>.toml`.
    ///
    /// A missing file is an empty store, not an error.
    pub fn open(prefix: impl AsRef<Path>, ttl: Duration) -> Result<Self, NamesError> {
        let mut store = Self {
            path: prefix.as_ref().with_extension("toml"),
            ttl,
            cache: BTreeMap::new(),
            last_sync: None,
        };
        store.reload()?;
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn expired(&self) -> bool {
        match self.last_sync {
            Some(at) => at.elapsed() > self.ttl,
            None => true,
        }
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, String>, NamesError> {
        match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).map_err(|e| NamesError::Malformed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(NamesError::io(path, e)),
        }
    }

    /// Force a re-read from disk regardless of TTL.
    pub fn reload(&mut self) -> Result<(), NamesError> {
        self.cache = Self::read_file(&self.path)?;
        self.last_sync = Some(Instant::now());
        Ok(())
    }

    fn refresh_if_expired(&mut self) {
        if self.expired() {
            // A transiently unreadable file keeps the cached view
            if let Ok(map) = Self::read_file(&self.path) {
                self.cache = map;
            }
            self.last_sync = Some(Instant::now());
        }
    }

    /// Look up a name, refreshing the cache when it is older than the TTL.
    pub fn get(&mut self, key: &str) -> Option<String> {
        self.refresh_if_expired();
        self.cache.get(key).cloned()
    }

    /// Set a name. An empty value removes the key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), NamesError> {
        if self.cache.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        // Read-merge-write: overlay our change on the latest disk state
        let mut merged = Self::read_file(&self.path).unwrap_or_default();
        if value.is_empty() {
            merged.remove(key);
            self.cache.remove(key);
        } else {
            merged.insert(key.to_string(), value.to_string());
            self.cache.insert(key.to_string(), value.to_string());
        }
        debug!(key, value, "Name store update");
        self.write_file(&merged)
    }

    /// Replace the whole mapping, e.g. with the master's view while
    /// running as a standby.
    pub fn replace_all(&mut self, map: BTreeMap<String, String>) -> Result<(), NamesError> {
        self.cache = map.clone();
        self.write_file(&map)
    }

    fn write_file(&mut self, map: &BTreeMap<String, String>) -> Result<(), NamesError> {
        let raw = toml::to_string(map).map_err(|e| NamesError::Malformed {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| NamesError::io(parent, e))?;
            }
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, raw).map_err(|e| NamesError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| NamesError::io(&self.path, e))?;
        self.last_sync = Some(Instant::now());
        Ok(())
    }

    /// Current mapping, refreshed when expired.
    pub fn snapshot(&mut self) -> BTreeMap<String, String> {
        self.refresh_if_expired();
        self.cache.clone()
    }

    /// Formatted listing for the startup log.
    pub fn dump(&mut self) -> String {
        let map = self.snapshot();
        if map.is_empty() {
            return "(name store is empty)".to_string();
        }
        map.iter()
            .map(|(k, v)| format!("{k:<24} = {v}"))
            .collect::<Vec<_>>()
            .join("\n\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_store(ttl: Duration) -> (tempfile::TempDir, NameStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = NameStore::open(dir.path().join("index_names"), ttl).unwrap();
        (dir, store)
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(next_key("tenders"), "tenders.next");
        assert_eq!(prev_key("tenders"), "tenders.prev");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, mut store) = temp_store(Duration::from_secs(1));
        assert_eq!(store.get("tenders"), None);
        assert_eq!(store.dump(), "(name store is empty)");
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (_dir, mut store) = temp_store(Duration::from_secs(1));
        store.set("tenders", "tenders_1700000000").unwrap();
        store.set("tenders.next", "tenders_1700000100").unwrap();
        assert_eq!(store.get("tenders").as_deref(), Some("tenders_1700000000"));
        assert_eq!(
            store.get(&next_key("tenders")).as_deref(),
            Some("tenders_1700000100")
        );
    }

    #[test]
    fn test_empty_value_removes_key() {
        let (_dir, mut store) = temp_store(Duration::from_secs(1));
        store.set("tenders.next", "tenders_1700000100").unwrap();
        store.set("tenders.next", "").unwrap();
        assert_eq!(store.get("tenders.next"), None);
        // Removal is durable
        let mut reopened = NameStore::open(
            store.path().with_extension(""),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(reopened.get("tenders.next"), None);
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("index_names");
        {
            let mut store = NameStore::open(&prefix, Duration::from_secs(1)).unwrap();
            store.set("plans", "plans_1700000000").unwrap();
        }
        let mut other = NameStore::open(&prefix, Duration::from_secs(1)).unwrap();
        assert_eq!(other.get("plans").as_deref(), Some("plans_1700000000"));
    }

    #[test]
    fn test_read_merge_write_keeps_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("index_names");
        let mut writer_a = NameStore::open(&prefix, Duration::from_secs(60)).unwrap();
        let mut writer_b = NameStore::open(&prefix, Duration::from_secs(60)).unwrap();
        writer_a.set("tenders", "tenders_1").unwrap();
        // B's cache predates A's write; B's own write must not clobber it
        writer_b.set("plans", "plans_1").unwrap();
        let mut reader = NameStore::open(&prefix, Duration::from_secs(60)).unwrap();
        assert_eq!(reader.get("tenders").as_deref(), Some("tenders_1"));
        assert_eq!(reader.get("plans").as_deref(), Some("plans_1"));
    }

    #[test]
    fn test_ttl_refresh_sees_external_update() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("index_names");
        let mut reader = NameStore::open(&prefix, Duration::from_millis(0)).unwrap();
        let mut writer = NameStore::open(&prefix, Duration::from_secs(60)).unwrap();
        writer.set("tenders", "tenders_2").unwrap();
        // Zero TTL: every get re-reads
        assert_eq!(reader.get("tenders").as_deref(), Some("tenders_2"));
    }

    #[test]
    fn test_replace_all() {
        let (_dir, mut store) = temp_store(Duration::from_secs(1));
        store.set("tenders", "tenders_old").unwrap();
        let mut map = BTreeMap::new();
        map.insert("tenders".to_string(), "tenders_new".to_string());
        map.insert("plans".to_string(), "plans_1".to_string());
        store.replace_all(map).unwrap();
        assert_eq!(store.get("tenders").as_deref(), Some("tenders_new"));
        assert_eq!(store.get("plans").as_deref(), Some("plans_1"));
    }

    #[test]
    fn test_no_rewrite_on_unchanged_value() {
        let (_dir, mut store) = temp_store(Duration::from_secs(60));
        store.set("tenders", "tenders_1").unwrap();
        let mtime = fs::metadata(store.path()).unwrap().modified().unwrap();
        store.set("tenders", "tenders_1").unwrap();
        assert_eq!(
            fs::metadata(store.path()).unwrap().modified().unwrap(),
            mtime
        );
    }
}
