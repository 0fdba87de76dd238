//! Bounded set of keys that have already been delivered.
//!
//! Guards against injecting the same output or notice twice when the host
//! repeats an event or a caller harvests the same task again. Entries expire
//! after a TTL and the oldest entry is evicted once capacity is reached.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::CacheConfig;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

#[derive(Debug)]
pub struct DeliveryCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl DeliveryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    /// Record `key`. Returns `false` when it was already present and live.
    pub fn insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.evict_expired(&mut state, now);

        if state.entries.contains_key(key) {
            return false;
        }

        while state.entries.len() >= self.capacity {
            let Some((old_key, stamp)) = state.order.pop_front() else {
                break;
            };
            if state.entries.get(&old_key) == Some(&stamp) {
                state.entries.remove(&old_key);
            }
        }

        state.entries.insert(key.to_string(), now);
        state.order.push_back((key.to_string(), now));
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.evict_expired(&mut state, now);
        state.entries.contains_key(key)
    }

    /// Forget `key`, e.g. when the delivery it guarded failed.
    pub fn remove(&self, key: &str) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.evict_expired(&mut state, now);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, state: &mut CacheState, now: Instant) {
        while let Some((key, stamp)) = state.order.front() {
            let live = state.entries.get(key) == Some(stamp);
            if live && now.duration_since(*stamp) < self.ttl {
                break;
            }
            if live {
                let key = key.clone();
                state.entries.remove(&key);
            }
            state.order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_once() {
        let cache = DeliveryCache::new(8, Duration::from_secs(60));
        assert!(cache.insert("ses_1"));
        assert!(!cache.insert("ses_1"));
        assert!(cache.contains("ses_1"));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = DeliveryCache::new(2, Duration::from_secs(60));
        cache.insert("a");
        cache.insert("b");
        cache.insert("c");

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = DeliveryCache::new(8, Duration::from_secs(10));
        cache.insert("a");
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.insert("b");
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.insert("a"));
    }

    #[tokio::test]
    async fn test_remove_allows_reinsert() {
        let cache = DeliveryCache::new(8, Duration::from_secs(60));
        cache.insert("a");
        cache.remove("a");
        assert!(cache.is_empty());
        assert!(cache.insert("a"));
        assert_eq!(cache.len(), 1);
    }
}
