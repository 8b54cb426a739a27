//! Sliding-window rate limiting
//!
//! Each credential carries up to three independent windows (minute, day,
//! month). A window is a time-ordered set of entries, one per admitted
//! request; entries that fell out of the window are purged on every check.
//! The purge-count-insert sequence for one key is atomic inside the store.

pub mod memory_store;
pub mod redis_store;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tollgate_common::{errors::Result, identity::TierLimits, metrics, Identity};

pub use memory_store::MemoryWindowStore;
pub use redis_store::RedisWindowStore;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Time bucket a ceiling applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Minute,
    Day,
    Month,
}

impl Window {
    /// Evaluation order: finest granularity first
    pub const ALL: [Window; 3] = [Window::Minute, Window::Day, Window::Month];

    pub fn label(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Day => "day",
            Window::Month => "month",
        }
    }

    fn header_suffix(self) -> &'static str {
        match self {
            Window::Minute => "Minute",
            Window::Day => "Day",
            Window::Month => "Month",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Day => Duration::from_secs(DAY_SECS),
            Window::Month => Duration::from_secs(30 * DAY_SECS),
        }
    }

    /// Configured ceiling for this window, if enforced
    pub fn limit(self, tiers: &TierLimits) -> Option<u64> {
        let limit = match self {
            Window::Minute => tiers.per_minute,
            Window::Day => tiers.per_day,
            Window::Month => tiers.per_month,
        };
        limit.filter(|&l| l > 0)
    }
}

/// Store key for one credential's window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub credential_id: String,
    pub window: Window,
}

impl RateLimitKey {
    pub fn new(credential_id: impl Into<String>, window: Window) -> Self {
        Self {
            credential_id: credential_id.into(),
            window,
        }
    }

    pub fn render(&self, prefix: &str) -> String {
        format!("{}:ratelimit:{}:{}", prefix, self.credential_id, self.window.label())
    }
}

/// Outcome of one window check. Computed per check, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Oldest surviving entry plus the window, unix milliseconds
    pub reset_at_ms: i64,
    /// Store time the decision was taken at, unix milliseconds
    pub decided_at_ms: i64,
}

impl RateLimitDecision {
    /// Seconds until the oldest entry leaves the window, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        let wait_ms = (self.reset_at_ms - self.decided_at_ms).max(0) as u64;
        wait_ms.div_ceil(1000).max(1)
    }

    pub fn reset_at_secs(&self) -> i64 {
        self.reset_at_ms.div_euclid(1000) + i64::from(self.reset_at_ms.rem_euclid(1000) > 0)
    }
}

/// Backing store holding window entries
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Purge expired entries, count, and admit (recording an entry) or deny.
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision>;

    /// Connectivity probe for readiness checks
    async fn ping(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Decision for one evaluated window
#[derive(Debug, Clone, Copy)]
pub struct WindowOutcome {
    pub window: Window,
    pub decision: RateLimitDecision,
}

/// Combined result over every window evaluated for a request
#[derive(Debug, Clone, Default)]
pub struct RateLimitVerdict {
    pub outcomes: Vec<WindowOutcome>,
}

impl RateLimitVerdict {
    pub fn allowed(&self) -> bool {
        self.denied().is_none()
    }

    /// The window that rejected the request, if any
    pub fn denied(&self) -> Option<&WindowOutcome> {
        self.outcomes.iter().find(|o| !o.decision.allowed)
    }

    /// The denying window's reset, otherwise the soonest reset evaluated
    pub fn reset_at_secs(&self) -> Option<i64> {
        match self.denied() {
            Some(outcome) => Some(outcome.decision.reset_at_secs()),
            None => self.outcomes.iter().map(|o| o.decision.reset_at_secs()).min(),
        }
    }

    /// Write `X-RateLimit-*` headers for every evaluated window
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        for outcome in &self.outcomes {
            let suffix = outcome.window.header_suffix();
            let pairs = [
                (format!("x-ratelimit-limit-{}", suffix), outcome.decision.limit),
                (format!("x-ratelimit-remaining-{}", suffix), outcome.decision.remaining),
            ];
            for (name, value) in pairs {
                if let Ok(name) = HeaderName::try_from(name.to_ascii_lowercase()) {
                    headers.insert(name, HeaderValue::from(value));
                }
            }
        }
        if let Some(reset) = self.reset_at_secs() {
            headers.insert("x-ratelimit-reset", HeaderValue::from(reset));
        }
    }
}

/// Evaluates a credential's windows against a [`WindowStore`]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    key_prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// Check minute, day, then month; the first denial stops evaluation.
    ///
    /// Windows already evaluated keep the entry they recorded even when a
    /// coarser window denies.
    pub async fn check(&self, identity: &Identity) -> Result<RateLimitVerdict> {
        let mut verdict = RateLimitVerdict::default();

        for window in Window::ALL {
            let Some(limit) = window.limit(&identity.tier_limits) else {
                continue;
            };

            let key = RateLimitKey::new(identity.credential_id.clone(), window).render(&self.key_prefix);
            let decision = self.store.check(&key, limit, window.duration()).await?;
            metrics::record_rate_limit(window.label(), decision.allowed);

            verdict.outcomes.push(WindowOutcome { window, decision });
            if !decision.allowed {
                tracing::info!(
                    api_key_id = %identity.credential_id,
                    window = window.label(),
                    limit,
                    retry_after_secs = decision.retry_after_secs(),
                    "Rate limit exceeded"
                );
                break;
            }
        }

        Ok(verdict)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}
