//! First-story priming cache: couples the background root generation kicked
//! off by `prepare_start` to the `start` call that consumes it.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimeKey {
    user_id: String,
    wish_digest: [u8; 32],
}

impl PrimeKey {
    pub fn new(user_id: &str, wish: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(wish.as_bytes());
        Self {
            user_id: user_id.to_string(),
            wish_digest: hasher.finalize().into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimedStory {
    pub session_id: i64,
    pub root_node_id: i64,
    /// Short provenance note ("reused" / "generated") for logs.
    pub trace: String,
}

/// Bounded LRU behind a single mutex. On overflow the least-recently-used
/// entry is evicted; `store` on an existing key overwrites and moves it to
/// most-recently-used.
pub struct FirstStoryCache {
    inner: Mutex<LruCache<PrimeKey, PrimedStory>>,
}

impl FirstStoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self, key: PrimeKey, value: PrimedStory) {
        self.inner.lock().unwrap().put(key, value);
    }

    /// Remove and return the entry, if present.
    pub fn pop(&self, key: &PrimeKey) -> Option<PrimedStory> {
        self.inner.lock().unwrap().pop(key)
    }

    /// Delete without returning; used when the background task fails.
    pub fn remove(&self, key: &PrimeKey) {
        self.inner.lock().unwrap().pop(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
