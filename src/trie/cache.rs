//! Page cache of serialized node bytes
//!
//! A least-recently-used cache bounded by the total size of the cached
//! bytes. It is purely an optimization: every read falls back to the store
//! on a miss, so clearing it at any point never changes results.

use crate::model::ChkKey;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Default capacity, roughly one 255-way layer of internal pages
pub const DEFAULT_PAGE_CACHE_BYTES: usize = 4 * 1024 * 1024;

struct Entry {
    bytes: Bytes,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ChkKey, Entry>,
    /// Access tick → key, oldest first
    order: BTreeMap<u64, ChkKey>,
    total: usize,
    next_tick: u64,
}

impl Inner {
    fn touch(&mut self, key: &ChkKey) -> Option<Bytes> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, *key);
        self.next_tick += 1;
        Some(entry.bytes.clone())
    }

    fn remove(&mut self, key: &ChkKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
            self.total -= entry.bytes.len();
        }
    }
}

/// Size-bounded LRU cache of node bytes, shared between maps via `Arc`
pub struct PageCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl PageCache {
    /// Create a cache holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        PageCache {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up cached bytes, marking them as recently used
    pub fn get(&self, key: &ChkKey) -> Option<Bytes> {
        let hit = self.inner.lock().touch(key);
        trace!(key = %key, hit = hit.is_some(), "page cache lookup");
        hit
    }

    pub fn contains(&self, key: &ChkKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Cache bytes for `key`, evicting the least recently used pages as
    /// needed. Pages larger than the whole cache are not stored.
    pub fn insert(&self, key: ChkKey, bytes: Bytes) {
        if bytes.len() > self.capacity {
            return;
        }
        let mut inner = self.inner.lock();
        inner.remove(&key);

        while inner.total + bytes.len() > self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&oldest) {
                inner.total -= entry.bytes.len();
                trace!(key = %oldest, "page cache eviction");
            }
        }

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.total += bytes.len();
        inner.order.insert(tick, key);
        inner.entries.insert(key, Entry { bytes, tick });
    }

    /// Drop every cached page
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.total = 0;
    }

    /// Number of cached pages
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cached bytes
    pub fn size(&self) -> usize {
        self.inner.lock().total
    }
}

impl Default for PageCache {
    fn default() -> Self {
        PageCache::new(DEFAULT_PAGE_CACHE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> ChkKey {
        ChkKey::digest(&[n])
    }

    #[test]
    fn test_insert_and_get() {
        let cache = PageCache::new(100);
        cache.insert(key(1), Bytes::from_static(b"hello"));
        assert_eq!(cache.get(&key(1)).unwrap(), Bytes::from_static(b"hello"));
        assert!(cache.get(&key(2)).is_none());
        assert_eq!(cache.size(), 5);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = PageCache::new(10);
        cache.insert(key(1), Bytes::from_static(b"aaaa"));
        cache.insert(key(2), Bytes::from_static(b"bbbb"));
        // touch 1 so 2 becomes the oldest
        cache.get(&key(1));
        cache.insert(key(3), Bytes::from_static(b"cccc"));

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert_eq!(cache.size(), 8);
    }

    #[test]
    fn test_reinsert_replaces() {
        let cache = PageCache::new(10);
        cache.insert(key(1), Bytes::from_static(b"aaaa"));
        cache.insert(key(1), Bytes::from_static(b"aaaa"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 4);
    }

    #[test]
    fn test_oversized_page_is_skipped() {
        let cache = PageCache::new(3);
        cache.insert(key(1), Bytes::from_static(b"toolong"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = PageCache::new(100);
        cache.insert(key(1), Bytes::from_static(b"x"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }
}
