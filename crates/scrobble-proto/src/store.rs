//! Size-bounded persistent key-value store.
//!
//! Values live in named partitions (`partition -> key -> value`). The whole
//! map is mirrored to a single JSON file; writes land in a temp file first and
//! are renamed into place, so a reader never sees half a document. The byte
//! budget covers every partition name, key and value, and a write that would
//! exceed it is rejected without touching the map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

pub const PARTITION_ROSTER: &str = "roster";
pub const PARTITION_SCHEDULE: &str = "schedule";

/// Partitions that survive quota recovery.
pub const ESSENTIAL_PARTITIONS: &[&str] = &[PARTITION_ROSTER, PARTITION_SCHEDULE];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store quota exceeded: {needed} bytes needed, capacity {capacity}")]
    QuotaExceeded { needed: usize, capacity: usize },

    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

type Partitions = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Default)]
struct Inner {
    partitions: Partitions,
    used_bytes: usize,
    dirty: bool,
}

pub struct PersistentStore {
    path: Option<PathBuf>,
    capacity_bytes: usize,
    inner: Mutex<Inner>,
}

fn entry_size(partition: &str, key: &str, value: &str) -> usize {
    partition.len() + key.len() + value.len()
}

fn measure(partitions: &Partitions) -> usize {
    partitions
        .iter()
        .flat_map(|(p, entries)| entries.iter().map(move |(k, v)| entry_size(p, k, v)))
        .sum()
}

impl PersistentStore {
    /// Open the store backed by `path`. A missing or unreadable file starts
    /// empty; the next flush replaces it.
    pub fn open(path: PathBuf, capacity_bytes: usize) -> Self {
        let partitions = Self::load(&path);
        let used_bytes = measure(&partitions);
        debug!(
            "store: opened {:?} ({} partitions, {} bytes)",
            path,
            partitions.len(),
            used_bytes
        );
        Self {
            path: Some(path),
            capacity_bytes,
            inner: Mutex::new(Inner {
                partitions,
                used_bytes,
                dirty: false,
            }),
        }
    }

    /// A store with no backing file; `flush` is a no-op.
    pub fn in_memory(capacity_bytes: usize) -> Self {
        Self {
            path: None,
            capacity_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn load(path: &Path) -> Partitions {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Partitions::new();
        };
        match serde_json::from_str::<Partitions>(&content) {
            Ok(p) => p,
            Err(e) => {
                warn!("store: discarding unreadable {:?}: {}", path, e);
                Partitions::new()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    pub fn get(&self, partition: &str, key: &str) -> Option<String> {
        self.lock()
            .partitions
            .get(partition)
            .and_then(|p| p.get(key))
            .cloned()
    }

    pub fn set(&self, partition: &str, key: &str, value: String) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let old = inner
            .partitions
            .get(partition)
            .and_then(|p| p.get(key))
            .map(|v| entry_size(partition, key, v))
            .unwrap_or(0);
        let needed = inner.used_bytes - old + entry_size(partition, key, &value);
        if needed > self.capacity_bytes {
            return Err(StoreError::QuotaExceeded {
                needed,
                capacity: self.capacity_bytes,
            });
        }
        inner
            .partitions
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_string(), value);
        inner.used_bytes = needed;
        inner.dirty = true;
        Ok(())
    }

    pub fn remove(&self, partition: &str, key: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner
            .partitions
            .get_mut(partition)
            .and_then(|p| p.remove(key));
        match removed {
            Some(v) => {
                inner.used_bytes -= entry_size(partition, key, &v);
                inner.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, partition: &str, key: &str) -> bool {
        self.lock()
            .partitions
            .get(partition)
            .map_or(false, |p| p.contains_key(key))
    }

    pub fn len(&self, partition: &str) -> usize {
        self.lock().partitions.get(partition).map_or(0, |p| p.len())
    }

    pub fn keys(&self, partition: &str) -> Vec<String> {
        self.lock()
            .partitions
            .get(partition)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries(&self, partition: &str) -> Vec<(String, String)> {
        self.lock()
            .partitions
            .get(partition)
            .map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.lock().partitions.keys().cloned().collect()
    }

    /// Drop every partition not named in `keep`.
    pub fn clear_except(&self, keep: &[&str]) {
        let mut inner = self.lock();
        inner.partitions.retain(|name, _| keep.contains(&name.as_str()));
        inner.used_bytes = measure(&inner.partitions);
        inner.dirty = true;
    }

    pub fn clear_all(&self) {
        self.clear_except(&[]);
    }

    /// Persist pending changes, if any.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            self.lock().dirty = false;
            return Ok(());
        };

        let json = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            serde_json::to_string(&inner.partitions)?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, path)) {
            self.lock().dirty = true;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Write a value; on quota exhaustion clear everything outside `keep` and
/// retry exactly once.
pub fn set_with_recovery(
    store: &PersistentStore,
    keep: &[&str],
    partition: &str,
    key: &str,
    value: String,
) -> Result<(), StoreError> {
    match store.set(partition, key, value.clone()) {
        Err(e) if e.is_quota() => {
            warn!(
                "store: {} writing {}/{}; clearing all but {:?}",
                e, partition, key, keep
            );
            store.clear_except(keep);
            store.set(partition, key, value)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_rejects_without_mutation() {
        let store = PersistentStore::in_memory(32);
        store.set("p", "a", "x".repeat(10)).unwrap();
        let before = store.used_bytes();
        let err = store.set("p", "b", "y".repeat(40)).unwrap_err();
        assert!(err.is_quota());
        assert_eq!(store.used_bytes(), before);
        assert!(store.get("p", "b").is_none());
    }

    #[test]
    fn test_overwrite_accounts_for_old_value() {
        let store = PersistentStore::in_memory(64);
        store.set("p", "k", "x".repeat(40)).unwrap();
        store.set("p", "k", "y".repeat(40)).unwrap();
        assert_eq!(store.used_bytes(), 1 + 1 + 40);
        assert!(store.remove("p", "k"));
        assert_eq!(store.used_bytes(), 0);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let store = PersistentStore::open(path.clone(), 1024);
        store.set(PARTITION_SCHEDULE, "activity", "1700000000000".into()).unwrap();
        store.flush().unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = PersistentStore::open(path, 1024);
        assert_eq!(
            reopened.get(PARTITION_SCHEDULE, "activity").as_deref(),
            Some("1700000000000")
        );
        assert_eq!(reopened.used_bytes(), store.used_bytes());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = PersistentStore::open(path, 1024);
        assert!(store.partition_names().is_empty());
    }

    #[test]
    fn test_recovery_keeps_essential_partitions() {
        let store = PersistentStore::in_memory(100);
        store.set(PARTITION_ROSTER, "me", "a,b".into()).unwrap();
        store.set("recent", "a:1", "z".repeat(70)).unwrap();
        set_with_recovery(&store, ESSENTIAL_PARTITIONS, "recent", "b:1", "w".repeat(40)).unwrap();
        assert!(store.get(PARTITION_ROSTER, "me").is_some());
        assert!(store.get("recent", "a:1").is_none());
        assert!(store.get("recent", "b:1").is_some());
    }
}
