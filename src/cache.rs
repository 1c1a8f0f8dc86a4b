//! Response cache for plain HTTP traffic.
//!
//! Entries are keyed by the verbatim request URL and kept in recency order.
//! Space is reclaimed in two passes on every insert: expired entries first,
//! then least-recently-used entries until the new body fits. Every public
//! operation runs under a single lock so lookups and inserts from concurrent
//! connections never observe a half-updated cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

struct CacheEntry {
    created_at: Instant,
    size: usize,
    content: Bytes,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    current_size: usize,
}

impl CacheState {
    fn remove(&mut self, url: &str) {
        if let Some(old) = self.entries.pop(url) {
            self.current_size -= old.size;
        }
    }

    fn sweep_expired(&mut self, now: Instant, ttl: Duration) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, ttl))
            .map(|(url, _)| url.clone())
            .collect();

        for url in expired {
            trace!("Cache: expired {}", url);
            self.remove(&url);
        }
    }
}

pub struct ResponseCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// `max_size` is a byte budget over all stored bodies.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                current_size: 0,
            }),
            max_size,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, url: &str) -> Option<Bytes> {
        self.lookup_at(url, Instant::now())
    }

    /// Returns `false` when the body is larger than the whole cache.
    pub fn insert(&self, url: &str, content: Bytes) -> bool {
        self.insert_at(url, content, Instant::now())
    }

    fn lookup_at(&self, url: &str, now: Instant) -> Option<Bytes> {
        let mut state = self.state.lock();

        let expired = match state.entries.peek(url) {
            Some(entry) => entry.is_expired(now, self.ttl),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            trace!("Cache: {} is older than {:?}, dropping", url, self.ttl);
            state.remove(url);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        state.entries.get(url).map(|entry| entry.content.clone())
    }

    fn insert_at(&self, url: &str, content: Bytes, now: Instant) -> bool {
        let size = content.len();
        if size > self.max_size {
            trace!(
                "Cache: {} ({} bytes) exceeds capacity {}",
                url,
                size,
                self.max_size
            );
            return false;
        }

        let mut state = self.state.lock();
        state.remove(url);
        state.sweep_expired(now, self.ttl);

        while state.current_size + size > self.max_size {
            match state.entries.pop_lru() {
                Some((evicted, entry)) => {
                    trace!("Cache: evicted {} ({} bytes)", evicted, entry.size);
                    state.current_size -= entry.size;
                }
                None => break,
            }
        }

        state.entries.put(
            url.to_string(),
            CacheEntry {
                created_at: now,
                size,
                content,
            },
        );
        state.current_size += size;
        trace!(
            "Cache: stored {} ({} bytes, {}/{} used)",
            url,
            size,
            state.current_size,
            self.max_size
        );
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held, including entries that expired but have not been swept.
    pub fn current_size(&self) -> usize {
        self.state.lock().current_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn resident_size(&self) -> usize {
        self.state.lock().entries.iter().map(|(_, e)| e.size).sum()
    }
}
