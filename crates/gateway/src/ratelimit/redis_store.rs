//! Redis-backed window store
//!
//! Window entries live in a sorted set per key (score = unix ms). The whole
//! check runs as one Lua script so concurrent gateways cannot interleave
//! between the count and the insert. Time comes from the Redis server so
//! every gateway instance scores entries on the same clock.

use super::{RateLimitDecision, WindowStore};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;
use tollgate_common::{
    config::RedisConfig,
    errors::{AppError, Result},
};
use tracing::{debug, info};
use uuid::Uuid;

/// KEYS[1] window key; ARGV[1] window ms, ARGV[2] limit, ARGV[3] member suffix.
/// Returns {allowed, count, oldest score, now}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
    redis.call('ZADD', key, now, now .. '-' .. ARGV[3])
    redis.call('PEXPIRE', key, window)
    count = count + 1
    allowed = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = now
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end

return {allowed, count, oldest_score, now}
"#;

pub struct RedisWindowStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisWindowStore {
    /// Connect to Redis; the manager reconnects on its own after failures
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| AppError::Configuration {
            message: format!("Invalid Redis URL: {}", e),
        })?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::RateLimitStoreUnavailable {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        info!("Redis window store connected");

        Ok(Self {
            connection,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

/// Map a script reply onto a decision
fn decision_from_reply(reply: (i64, i64, i64, i64), limit: u64, window_ms: i64) -> RateLimitDecision {
    let (allowed, count, oldest, now) = reply;
    let allowed = allowed == 1;
    let count = count.max(0) as u64;

    RateLimitDecision {
        allowed,
        limit,
        remaining: if allowed { limit.saturating_sub(count) } else { 0 },
        reset_at_ms: oldest + window_ms,
        decided_at_ms: now,
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let window_ms = window.as_millis() as i64;
        let mut conn = self.connection.clone();

        // EVALSHA, falling back to EVAL when the script cache is cold
        let reply: (i64, i64, i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .arg(limit)
            .arg(Uuid::new_v4().simple().to_string())
            .invoke_async(&mut conn)
            .await?;

        let decision = decision_from_reply(reply, limit, window_ms);
        debug!(
            key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Window checked"
        );
        Ok(decision)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::RateLimitStoreUnavailable {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_reply() {
        // Third admitted request at t=2s, first entry at t=0
        let decision = decision_from_reply((1, 3, 0, 2_000), 3, 60_000);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at_ms, 60_000);
    }

    #[test]
    fn test_denied_reply() {
        let decision = decision_from_reply((0, 3, 0, 3_000), 3, 60_000);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_secs(), 57);
    }

    #[test]
    fn test_script_purges_inclusive_cutoff() {
        // An entry exactly one window old must be evicted
        assert!(SLIDING_WINDOW_SCRIPT.contains("'-inf', now - window"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let config = RedisConfig {
            url: "not-a-redis-url".into(),
            key_prefix: "t".into(),
        };
        let err = RedisWindowStore::connect(&config).await.err().unwrap();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    // The tests below need a live server: REDIS_URL=redis://... cargo test -- --ignored

    async fn live_store() -> RedisWindowStore {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            key_prefix: "tollgate-test".into(),
        };
        RedisWindowStore::connect(&config).await.unwrap()
    }

    fn unique_key() -> String {
        format!("tollgate-test:ratelimit:{}:minute", Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_live_remaining_counts_down_then_denies() {
        let store = live_store().await;
        let key = unique_key();
        let window = Duration::from_secs(60);

        for expected in (0..5).rev() {
            let decision = store.check(&key, 5, window).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = store.check(&key, 5, window).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_at_ms - denied.decided_at_ms <= 60_000);
        assert!((1..=60).contains(&denied.retry_after_secs()));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_live_entries_leave_the_window() {
        let store = live_store().await;
        let key = unique_key();
        let window = Duration::from_secs(1);

        assert!(store.check(&key, 2, window).await.unwrap().allowed);
        assert!(store.check(&key, 2, window).await.unwrap().allowed);
        assert!(!store.check(&key, 2, window).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let decision = store.check(&key, 2, window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_live_denied_checks_record_nothing() {
        let store = live_store().await;
        let key = unique_key();
        let window = Duration::from_secs(60);

        assert!(store.check(&key, 1, window).await.unwrap().allowed);
        for _ in 0..5 {
            assert!(!store.check(&key, 1, window).await.unwrap().allowed);
        }
        let after = store.check(&key, 2, window).await.unwrap();
        assert!(after.allowed);
        assert_eq!(after.remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a running Redis"]
    async fn test_live_concurrent_checks_never_exceed_limit() {
        let store = std::sync::Arc::new(live_store().await);
        let key = unique_key();

        let checks = (0..50).map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.check(&key, 10, Duration::from_secs(60)).await })
        });

        let mut admitted = 0;
        for result in futures::future::join_all(checks).await {
            if result.unwrap().unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}

