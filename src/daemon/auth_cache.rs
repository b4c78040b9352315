//! Short-lived cache of policy decisions, keyed by uid.
//!
//! Keyed only by uid: a new process of an already-cached user reuses the
//! decision until the entry expires, so a revoked authorization can remain
//! effective for up to one TTL. An expired entry is a miss (the policy
//! service is asked again), never an implicit deny.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::{self, Clock};

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    expires_at: Instant,
    authorized: bool,
}

pub struct AuthorizationCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<u32, CacheEntry>>,
}

impl AuthorizationCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached decision for `uid`, if one exists and has not expired.
    pub fn get(&self, uid: u32) -> Option<bool> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(&uid) {
            Some(entry) if now < entry.expires_at => Some(entry.authorized),
            Some(_) => {
                entries.remove(&uid);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, uid: u32, authorized: bool) {
        let expires_at = clock::deadline(self.clock.now(), self.ttl);
        self.lock().insert(
            uid,
            CacheEntry {
                expires_at,
                authorized,
            },
        );
    }

    pub fn invalidate(&self, uid: u32) {
        self.lock().remove(&uid);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(ttl: u64) -> (AuthorizationCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            AuthorizationCache::new(Duration::from_secs(ttl), clock.clone()),
            clock,
        )
    }

    #[test]
    fn miss_then_hit() {
        let (c, _clock) = cache(30);
        assert_eq!(c.get(1000), None);
        c.insert(1000, true);
        assert_eq!(c.get(1000), Some(true));
    }

    #[test]
    fn negative_decisions_are_cached_too() {
        let (c, _clock) = cache(30);
        c.insert(1000, false);
        assert_eq!(c.get(1000), Some(false));
    }

    #[test]
    fn entry_expires_at_ttl_boundary() {
        let (c, clock) = cache(30);
        c.insert(1000, true);
        clock.advance(Duration::from_secs(29));
        assert_eq!(c.get(1000), Some(true));
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.get(1000), None);
        assert!(c.is_empty());
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let clock = Arc::new(ManualClock::new());
        let c = AuthorizationCache::new(Duration::from_secs(i64::MAX as u64), clock.clone());
        c.insert(1000, true);
        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(c.get(1000), Some(true));
    }

    #[test]
    fn invalidate_and_clear() {
        let (c, _clock) = cache(30);
        c.insert(1, true);
        c.insert(2, true);
        c.invalidate(1);
        assert_eq!(c.get(1), None);
        assert_eq!(c.len(), 1);
        c.clear();
        assert!(c.is_empty());
    }
}
