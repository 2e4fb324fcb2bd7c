//! The token validation cache (C2): a map from token id to `{project_id, cached_expiry}`
//! guarded by a single lock (§5), with eviction driven by a min-heap keyed on expiry so a
//! full cache drops its soonest-to-expire entry in `O(log n)` rather than scanning
//! linearly (§9 explicitly rejects naive linear scans).
//!
//! Lazy deletion: the heap can hold stale entries for a token that has since been
//! overwritten or removed. Every pop is checked against the live map entry's sequence
//! number before being trusted; stale pops are discarded and the search continues.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedValidation {
    pub project_id: String,
    pub cached_expiry: i64,
}

struct Entry {
    value: CachedValidation,
    seq: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    heap: BinaryHeap<Reverse<(i64, u64, String)>>,
    next_seq: u64,
}

/// Bounded, single-locked validation cache. `capacity` and the per-entry TTL are fixed
/// at construction, matching `token_cache_capacity` / `token_cache_ttl` (§6.4).
pub struct TokenCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Looks up `token_id`. Returns `None` on a miss *or* an expired entry -- callers
    /// never need to distinguish the two (§4.1 step 1).
    pub fn get(&self, token_id: &str, now: i64) -> Option<CachedValidation> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(token_id) {
            Some(entry) if entry.value.cached_expiry > now => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(token_id);
                None
            }
            None => None,
        }
    }

    /// Inserts or replaces the cached validation for `token_id`, evicting the
    /// soonest-to-expire entry first if the cache is already at capacity (§4.1 step 4).
    pub fn insert(&self, token_id: String, value: CachedValidation) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.entries.contains_key(&token_id) && inner.entries.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse((value.cached_expiry, seq, token_id.clone())));
        inner.entries.insert(token_id, Entry { value, seq });
    }

    /// Removes a token from the cache immediately. Used by `Revoke` so a subsequent
    /// `Validate` can never see a stale "valid" answer (§4.1).
    pub fn evict(&self, token_id: &str) {
        self.inner.lock().unwrap().entries.remove(token_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_one(inner: &mut Inner) {
        while let Some(Reverse((expiry, seq, token_id))) = inner.heap.pop() {
            match inner.entries.get(&token_id) {
                Some(entry) if entry.seq == seq && entry.value.cached_expiry == expiry => {
                    inner.entries.remove(&token_id);
                    return;
                }
                _ => continue, // stale heap entry, superseded or already removed
            }
        }
    }
}
