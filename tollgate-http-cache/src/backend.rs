//! Storage contract (§4.3 "Operations" / "Backends"). In-process and shared backends
//! must be behaviorally identical to the caller -- the request pipeline never knows
//! which one it is talking to.

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: i64,
    pub ttl_secs: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.stored_at + self.ttl_secs
    }
}

#[async_trait]
pub trait HttpCacheBackend: Send + Sync {
    /// Misses on an absent key or an expired entry (§4.3 `Get`).
    async fn get(&self, key: &str, now: i64) -> Option<CacheEntry>;

    /// Replaces any existing entry under `key` (§4.3 `Set`).
    async fn set(&self, key: String, entry: CacheEntry);

    async fn purge(&self, key: &str) -> bool;

    async fn purge_by_prefix(&self, prefix: &str) -> u64;

    /// Scans and drops expired entries (§4.9 "Cache eviction"). The in-process backend
    /// overrides this; a shared backend relies on native TTL and the default no-op
    /// keeps the sweeper's call harmless there.
    async fn sweep_expired(&self, _now: i64) -> u64 {
        0
    }
}
