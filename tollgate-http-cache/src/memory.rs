//! In-process cache backend: a locked map with an explicit sweep entry point for the
//! scheduled sweeper (C13) rather than its own background timer, keeping this crate free
//! of any task-spawning opinion (§4.3 "Backends").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{CacheEntry, HttpCacheBackend};

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry expired as of `now`. Intended to be called periodically by the
    /// sweeper; `get` already treats an expired entry as a miss on its own, so this is
    /// purely about reclaiming memory rather than correctness.
    pub fn sweep_expired(&self, now: i64) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        (before - entries.len()) as u64
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HttpCacheBackend for InMemoryCache {
    async fn get(&self, key: &str, now: i64) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: String, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(key, entry);
    }

    async fn purge(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    async fn purge_by_prefix(&self, prefix: &str) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let to_remove: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &to_remove {
            entries.remove(key);
        }
        to_remove.len() as u64
    }

    async fn sweep_expired(&self, now: i64) -> u64 {
        InMemoryCache::sweep_expired(self, now)
    }
}
