//! Keyed TTL cache for upstream responses, layered on [`PersistentStore`].
//!
//! Each resource type owns one store partition and an entry cap; the oldest
//! entries by insertion are evicted past the cap. Insertion order is kept in
//! memory, read from the store once at startup. Stale entries are never
//! served: a read that finds one removes it and reports a miss.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{set_with_recovery, PersistentStore, StoreError, ESSENTIAL_PARTITIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Recent,
    TopArtists,
    TopAlbums,
    TopTracks,
    Listeners,
    Previews,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Recent,
        Resource::TopArtists,
        Resource::TopAlbums,
        Resource::TopTracks,
        Resource::Listeners,
        Resource::Previews,
    ];

    pub fn partition(&self) -> &'static str {
        match self {
            Self::Recent => "recent",
            Self::TopArtists => "top_artists",
            Self::TopAlbums => "top_albums",
            Self::TopTracks => "top_tracks",
            Self::Listeners => "listeners",
            Self::Previews => "previews",
        }
    }
}

/// `{entityId}:{page}` style key.
pub fn page_key(entity_id: &str, page: impl std::fmt::Display) -> String {
    format!("{}:{}", crate::model::id_key(entity_id), page)
}

/// `{entityId}:{artist}:{track}` style key.
pub fn track_key(entity_id: &str, artist: &str, track: &str) -> String {
    format!(
        "{}:{}:{}",
        crate::model::id_key(entity_id),
        artist.trim().to_lowercase(),
        track.trim().to_lowercase()
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub fetched_at_ms: i64,
    pub ttl_ms: i64,
    /// Insertion order, for cap eviction.
    pub seq: u64,
}

impl CacheEntry {
    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms - self.fetched_at_ms > self.ttl_ms
    }
}

/// Only the insertion sequence of a stored entry; the payload is skipped.
#[derive(Deserialize)]
struct EntrySeq {
    seq: u64,
}

/// Insertion order of one partition. May name keys the store has since
/// dropped (stale reads, quota recovery); those are skipped on eviction.
#[derive(Debug, Default)]
struct InsertionOrder {
    by_seq: BTreeMap<u64, String>,
    by_key: HashMap<String, u64>,
}

impl InsertionOrder {
    fn insert(&mut self, key: &str, seq: u64) {
        self.forget(key);
        self.by_seq.insert(seq, key.to_string());
        self.by_key.insert(key.to_string(), seq);
    }

    fn forget(&mut self, key: &str) {
        if let Some(seq) = self.by_key.remove(key) {
            self.by_seq.remove(&seq);
        }
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, key) = self.by_seq.pop_first()?;
        self.by_key.remove(&key);
        Some(key)
    }
}

pub struct ResponseCache {
    store: Arc<PersistentStore>,
    default_cap: usize,
    caps: HashMap<Resource, usize>,
    next_seq: AtomicU64,
    order: Mutex<HashMap<Resource, InsertionOrder>>,
}

impl ResponseCache {
    pub fn new(store: Arc<PersistentStore>, default_cap: usize) -> Self {
        let mut order: HashMap<Resource, InsertionOrder> = HashMap::new();
        let mut max_seq = 0;
        for resource in Resource::ALL {
            let index = order.entry(resource).or_default();
            for (key, raw) in store.entries(resource.partition()) {
                // unreadable entries sort first and go on the next eviction
                let seq = serde_json::from_str::<EntrySeq>(&raw).map_or(0, |e| e.seq);
                max_seq = max_seq.max(seq);
                index.insert(&key, seq);
            }
        }
        Self {
            store,
            default_cap: default_cap.max(1),
            caps: HashMap::new(),
            next_seq: AtomicU64::new(max_seq + 1),
            order: Mutex::new(order),
        }
    }

    fn order(&self) -> MutexGuard<'_, HashMap<Resource, InsertionOrder>> {
        self.order.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Override the entry cap for one resource type.
    pub fn with_cap(mut self, resource: Resource, cap: usize) -> Self {
        self.caps.insert(resource, cap.max(1));
        self
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    fn cap(&self, resource: Resource) -> usize {
        self.caps.get(&resource).copied().unwrap_or(self.default_cap)
    }

    pub fn get<T: DeserializeOwned>(&self, resource: Resource, key: &str, now_ms: i64) -> Option<T> {
        let partition = resource.partition();
        let raw = self.store.get(partition, key)?;
        let entry = match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(e) => e,
            Err(e) => {
                warn!("cache: dropping unreadable {}/{}: {}", partition, key, e);
                self.invalidate(resource, key);
                return None;
            }
        };
        if entry.is_stale(now_ms) {
            debug!("cache: stale {}/{}", partition, key);
            self.invalidate(resource, key);
            return None;
        }
        match serde_json::from_value(entry.payload) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("cache: payload mismatch {}/{}: {}", partition, key, e);
                self.invalidate(resource, key);
                None
            }
        }
    }

    pub fn put<T: Serialize>(
        &self,
        resource: Resource,
        key: &str,
        payload: &T,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let partition = resource.partition();
        let entry = CacheEntry {
            payload: serde_json::to_value(payload)?,
            fetched_at_ms: now_ms,
            ttl_ms: ttl.as_millis() as i64,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let seq = entry.seq;
        let raw = serde_json::to_string(&entry)?;

        self.enforce_cap(resource, key);
        set_with_recovery(&self.store, ESSENTIAL_PARTITIONS, partition, key, raw)?;
        self.order().entry(resource).or_default().insert(key, seq);
        Ok(())
    }

    /// Make room for one more entry under `key`, oldest insertions first.
    fn enforce_cap(&self, resource: Resource, key: &str) {
        let partition = resource.partition();
        let cap = self.cap(resource);
        let mut order = self.order();
        let index = order.entry(resource).or_default();
        index.forget(key);

        let mut others = self.store.len(partition) - usize::from(self.store.contains(partition, key));
        while others >= cap {
            let Some(oldest) = index.pop_oldest() else {
                break;
            };
            if self.store.remove(partition, &oldest) {
                debug!("cache: evicting {}/{} (cap {})", partition, oldest, cap);
                others -= 1;
            }
        }
    }

    pub fn invalidate(&self, resource: Resource, key: &str) {
        self.store.remove(resource.partition(), key);
        if let Some(index) = self.order().get_mut(&resource) {
            index.forget(key);
        }
    }

    /// Clear every partition outside `keep`.
    pub fn evict(&self, keep: &[&str]) {
        self.store.clear_except(keep);
    }

    pub fn len(&self, resource: Resource) -> usize {
        self.store.keys(resource.partition()).len()
    }

    pub fn is_empty(&self, resource: Resource) -> bool {
        self.len(resource) == 0
    }
}
