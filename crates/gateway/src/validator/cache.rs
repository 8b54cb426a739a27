//! Resolution cache
//!
//! Holds successful credential resolutions for a fixed TTL. Keys combine the
//! credential's SHA-256 fingerprint with the API the request targeted, since
//! the key service answers per API. Time is read through an injected clock.

use dashmap::DashMap;
use std::time::Duration;
use tollgate_common::{clock::SharedClock, Identity};

struct CachedIdentity {
    identity: Identity,
    expires_at_ms: i64,
}

pub struct ResolutionCache {
    entries: DashMap<String, CachedIdentity>,
    ttl_ms: i64,
    max_entries: usize,
    clock: SharedClock,
}

impl ResolutionCache {
    pub fn new(ttl: Duration, max_entries: usize, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: ttl.as_millis() as i64,
            max_entries,
            clock,
        }
    }

    /// Fresh identity for a key; expired entries are dropped on read
    pub fn get(&self, key: &str) -> Option<Identity> {
        let now = self.clock.now_millis();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at_ms > now {
                return Some(entry.identity.clone());
            }
        }

        // Shard read lock is released before taking the write lock
        self.entries.remove_if(key, |_, e| e.expires_at_ms <= now);
        None
    }

    pub fn insert(&self, key: String, identity: Identity) {
        let now = self.clock.now_millis();

        if self.entries.len() >= self.max_entries {
            self.entries.retain(|_, e| e.expires_at_ms > now);
            if self.entries.len() >= self.max_entries {
                tracing::debug!(max_entries = self.max_entries, "Resolution cache full, not caching");
                return;
            }
        }

        self.entries.insert(
            key,
            CachedIdentity {
                identity,
                expires_at_ms: now + self.ttl_ms,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tollgate_common::{clock::ManualClock, TierLimits};

    fn identity(id: &str) -> Identity {
        Identity {
            consumer_id: "c".into(),
            subscription_id: "s".into(),
            credential_id: id.into(),
            upstream_api_id: "a".into(),
            tier_limits: TierLimits::default(),
        }
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = ResolutionCache::new(Duration::from_secs(10), 10, clock.clone());

        cache.insert("fp".into(), identity("k-1"));
        clock.advance(Duration::from_millis(9_999));
        assert_eq!(cache.get("fp").unwrap().credential_id, "k-1");

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("fp").is_none());
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn test_full_cache_evicts_expired_first() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = ResolutionCache::new(Duration::from_secs(10), 2, clock.clone());

        cache.insert("a".into(), identity("a"));
        cache.insert("b".into(), identity("b"));
        cache.insert("c".into(), identity("c"));
        assert!(cache.get("c").is_none());

        clock.advance(Duration::from_secs(11));
        cache.insert("c".into(), identity("c"));
        assert_eq!(cache.entries.len(), 1);
        assert!(cache.get("c").is_some());
    }
}
