//! In-process window store
//!
//! Single-node deployments and tests. Each key's entries live in an ordered
//! set; the purge-count-insert sequence runs under that key's shard lock.

use super::{RateLimitDecision, WindowStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate_common::{clock::Clock, errors::Result};

/// Checks between sweeps of keys whose entries have all expired
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Default)]
struct WindowSet {
    /// (timestamp ms, sequence) keeps members unique when timestamps collide
    entries: BTreeSet<(i64, u64)>,
    expires_at_ms: i64,
}

impl WindowSet {
    fn check(&mut self, now: i64, limit: u64, window_ms: i64, seq: u64) -> RateLimitDecision {
        // Entries at or before now - window are outside the window
        let cutoff = (now - window_ms, u64::MAX);
        self.entries = self.entries.split_off(&cutoff);

        let count = self.entries.len() as u64;
        let allowed = count < limit;
        if allowed {
            self.entries.insert((now, seq));
            self.expires_at_ms = now + window_ms;
        }

        let oldest = self.entries.first().map(|&(ts, _)| ts).unwrap_or(now);
        RateLimitDecision {
            allowed,
            limit,
            remaining: if allowed { limit - count - 1 } else { 0 },
            reset_at_ms: oldest + window_ms,
            decided_at_ms: now,
        }
    }
}

pub struct MemoryWindowStore {
    windows: DashMap<String, WindowSet>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
            sequence: AtomicU64::new(0),
        }
    }

    fn sweep(&self, now: i64) {
        let before = self.windows.len();
        self.windows.retain(|_, set| set.expires_at_ms > now);
        tracing::debug!(removed = before - self.windows.len(), "Swept expired rate limit windows");
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        let window_ms = window.as_millis() as i64;

        if seq > 0 && seq % SWEEP_EVERY == 0 {
            self.sweep(now);
        }

        let mut set = self.windows.entry(key.to_string()).or_default();
        Ok(set.check(now, limit, window_ms, seq))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_common::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    fn store() -> (Arc<ManualClock>, MemoryWindowStore) {
        let clock = Arc::new(ManualClock::new(0));
        (clock.clone(), MemoryWindowStore::new(clock))
    }

    #[tokio::test]
    async fn test_remaining_counts_down_within_limit() {
        let (_clock, store) = store();
        let limit = 5;

        for n in 1..=limit {
            let decision = store.check("k", limit, MINUTE).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, limit - n);
        }
    }

    #[tokio::test]
    async fn test_denial_resets_from_oldest_entry() {
        let (clock, store) = store();

        clock.set_millis(5_000);
        store.check("k", 2, MINUTE).await.unwrap();
        clock.set_millis(9_000);
        store.check("k", 2, MINUTE).await.unwrap();

        clock.set_millis(10_000);
        let denied = store.check("k", 2, MINUTE).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at_ms, 65_000);
        assert_eq!(denied.retry_after_secs(), 55);
    }

    #[tokio::test]
    async fn test_three_per_minute_example() {
        let (clock, store) = store();
        let limit = 3;

        for (t, remaining) in [(0, 2), (1, 1), (2, 0)] {
            clock.set_millis(t * 1000);
            let decision = store.check("k", limit, MINUTE).await.unwrap();
            assert!(decision.allowed, "t={}", t);
            assert_eq!(decision.remaining, remaining);
        }

        clock.set_millis(3_000);
        let denied = store.check("k", limit, MINUTE).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_secs(), 60);

        clock.set_millis(61_000);
        let decision = store.check("k", limit, MINUTE).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_sliding_not_fixed_bucket() {
        let (clock, store) = store();
        let limit = 4;

        for _ in 0..limit {
            assert!(store.check("k", limit, MINUTE).await.unwrap().allowed);
        }

        clock.advance(MINUTE / 2);
        assert!(!store.check("k", limit, MINUTE).await.unwrap().allowed);

        // Exactly one window after the first request
        clock.set_millis(MINUTE.as_millis() as i64);
        assert!(store.check("k", limit, MINUTE).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_consume_quota() {
        let (clock, store) = store();

        store.check("k", 1, MINUTE).await.unwrap();
        for _ in 0..10 {
            clock.advance(Duration::from_secs(1));
            assert!(!store.check("k", 1, MINUTE).await.unwrap().allowed);
        }

        clock.set_millis(60_000);
        assert!(store.check("k", 1, MINUTE).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_colliding_timestamps_are_distinct_entries() {
        let (_clock, store) = store();

        for _ in 0..3 {
            store.check("k", 10, MINUTE).await.unwrap();
        }
        let decision = store.check("k", 10, MINUTE).await.unwrap();
        assert_eq!(decision.remaining, 6);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_clock, store) = store();

        assert!(store.check("a", 1, MINUTE).await.unwrap().allowed);
        assert!(!store.check("a", 1, MINUTE).await.unwrap().allowed);
        assert!(store.check("b", 1, MINUTE).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_never_over_admit() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryWindowStore::new(clock));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.check("shared", 10, MINUTE).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_keys() {
        let (clock, store) = store();

        store.check("stale", 5, MINUTE).await.unwrap();
        clock.advance(MINUTE * 2);
        for _ in 0..SWEEP_EVERY {
            store.check("live", u64::MAX, MINUTE).await.unwrap();
        }

        assert_eq!(store.windows.len(), 1);
    }
}
