//! Envelope de-duplication.
//!
//! The same envelope can arrive twice (direct link and relay, or a relay room
//! plus a mesh broadcast). Ids are tracked in a bounded LRU so memory stays flat;
//! an id that ages out of the window would be accepted again.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct DeduplicationFilter {
    seen: Mutex<LruCache<String, ()>>,
}

impl DeduplicationFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns true if `id` was already seen; records it either way.
    pub fn check_and_insert(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.get(id).is_some() {
            return true;
        }
        seen.put(id.to_string(), ());
        false
    }

    /// Record an id without checking, e.g. for envelopes we sent ourselves.
    pub fn mark(&self, id: &str) {
        self.seen.lock().put(id.to_string(), ());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl Default for DeduplicationFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
