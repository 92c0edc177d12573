//! Bounded-lifetime cache of seen `(phone, message_id)` pairs.
//!
//! First line of defense against at-least-once delivery. Entries expire after
//! the TTL and the oldest are evicted past capacity; the session's
//! `last_message_id` covers replays that outlive the cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

type Key = (String, String);

struct Inner {
    seen: HashMap<Key, Instant>,
    /// Insertion order, oldest first. May hold keys already removed from `seen`.
    order: VecDeque<(Key, Instant)>,
}

/// Concurrent dedupe cache with TTL eviction.
pub struct DedupeCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl DedupeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record a message id. Returns false if it was already seen and unexpired.
    pub fn mark_seen(&self, phone: &str, message_id: &str) -> bool {
        self.mark_seen_at(phone, message_id, Instant::now())
    }

    pub fn mark_seen_at(&self, phone: &str, message_id: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut inner, now);

        let key = (phone.to_string(), message_id.to_string());
        if inner.seen.contains_key(&key) {
            debug!(message_id, "Duplicate message id suppressed by dedupe cache");
            return false;
        }
        inner.seen.insert(key.clone(), now);
        inner.order.push_back((key, now));

        while inner.seen.len() > self.capacity {
            let Some((old, at)) = inner.order.pop_front() else {
                break;
            };
            if inner.seen.get(&old) == Some(&at) {
                inner.seen.remove(&old);
            }
        }
        true
    }

    /// Drop a message id so a redelivery is processed again (used when
    /// processing failed after the id was marked).
    pub fn forget(&self, phone: &str, message_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .seen
            .remove(&(phone.to_string(), message_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, inner: &mut Inner, now: Instant) {
        while let Some((key, at)) = inner.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if inner.seen.get(key) == Some(at) {
                inner.seen.remove(key);
            }
            inner.order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_duplicate() {
        let cache = DedupeCache::new(Duration::from_secs(60), 100);
        assert!(cache.mark_seen("+15550001111", "m1"));
        assert!(!cache.mark_seen("+15550001111", "m1"));
        // Same id from a different phone is a different message.
        assert!(cache.mark_seen("+15550002222", "m1"));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = DedupeCache::new(Duration::from_secs(60), 100);
        let start = Instant::now();
        assert!(cache.mark_seen_at("+15550001111", "m1", start));
        assert!(!cache.mark_seen_at("+15550001111", "m1", start + Duration::from_secs(30)));
        assert!(cache.mark_seen_at("+15550001111", "m1", start + Duration::from_secs(61)));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = DedupeCache::new(Duration::from_secs(60), 2);
        assert!(cache.mark_seen("+15550001111", "a"));
        assert!(cache.mark_seen("+15550001111", "b"));
        assert!(cache.mark_seen("+15550001111", "c"));
        assert_eq!(cache.len(), 2);
        // "a" was evicted, so it is treated as new.
        assert!(cache.mark_seen("+15550001111", "a"));
    }

    #[test]
    fn forget_allows_reprocessing() {
        let cache = DedupeCache::new(Duration::from_secs(60), 10);
        assert!(cache.mark_seen("+15550001111", "m1"));
        cache.forget("+15550001111", "m1");
        assert!(cache.mark_seen("+15550001111", "m1"));
    }
}
