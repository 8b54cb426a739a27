//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Tollgate metrics
pub const METRICS_PREFIX: &str = "tollgate";

/// SLO-aligned histogram buckets for request latency (in seconds)
/// Targets: P50 < 50ms, P99 < 150ms
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms - P50 target
    0.075,  // 75ms
    0.100,  // 100ms
    0.150,  // 150ms - P99 target
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of proxied HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Proxied request latency in seconds"
    );

    // Rate limiting
    describe_counter!(
        format!("{}_rate_limit_decisions_total", METRICS_PREFIX),
        Unit::Count,
        "Rate limit decisions by window and outcome"
    );

    describe_counter!(
        format!("{}_rate_limit_store_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Window store failures by applied policy"
    );

    // Key validation
    describe_counter!(
        format!("{}_validator_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Key validation lookups by outcome"
    );

    describe_histogram!(
        format!("{}_validator_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Key validation round-trip latency in seconds"
    );

    // Upstreams
    describe_counter!(
        format!("{}_upstream_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Upstream failures before response headers"
    );

    // Usage metering
    describe_counter!(
        format!("{}_usage_events_sent_total", METRICS_PREFIX),
        Unit::Count,
        "Usage events accepted by the collector"
    );

    describe_counter!(
        format!("{}_usage_events_failed_total", METRICS_PREFIX),
        Unit::Count,
        "Usage events the collector rejected or never acknowledged"
    );

    describe_counter!(
        format!("{}_usage_events_dropped_total", METRICS_PREFIX),
        Unit::Count,
        "Usage events dropped because the buffer was full"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    api: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, api: &str) -> Self {
        Self {
            start: Instant::now(),
            api: api.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "api" => self.api.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "api" => self.api
        )
        .record(duration);
    }
}

/// Helper to record a rate limit decision
pub fn record_rate_limit(window: &'static str, allowed: bool) {
    counter!(
        format!("{}_rate_limit_decisions_total", METRICS_PREFIX),
        "window" => window,
        "outcome" => if allowed { "allowed" } else { "denied" }
    )
    .increment(1);
}

/// Helper to record a window store failure
pub fn record_store_error(policy: &'static str) {
    counter!(
        format!("{}_rate_limit_store_errors_total", METRICS_PREFIX),
        "policy" => policy
    )
    .increment(1);
}

/// Helper to record key validation metrics
pub fn record_validation(duration_secs: f64, outcome: &'static str) {
    counter!(
        format!("{}_validator_requests_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(format!("{}_validator_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Helper to record an upstream failure
pub fn record_upstream_error(kind: &'static str) {
    counter!(
        format!("{}_upstream_errors_total", METRICS_PREFIX),
        "kind" => kind
    )
    .increment(1);
}

/// Usage delivery outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    Sent,
    Failed,
    Dropped,
}

/// Helper to record usage metering metrics
pub fn record_usage(outcome: UsageOutcome) {
    let name = match outcome {
        UsageOutcome::Sent => "usage_events_sent_total",
        UsageOutcome::Failed => "usage_events_failed_total",
        UsageOutcome::Dropped => "usage_events_dropped_total",
    };
    counter!(format!("{}_{}", METRICS_PREFIX, name)).increment(1);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &'static str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets() {
        // Verify buckets are sorted and contain SLO targets
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }

        assert!(LATENCY_BUCKETS.contains(&0.050));
        assert!(LATENCY_BUCKETS.contains(&0.150));
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every helper must be a silent no-op
        let metrics = RequestMetrics::start("GET", "acme/weather");
        metrics.finish(200);
        record_rate_limit("minute", false);
        record_store_error("fail_open");
        record_validation(0.01, "valid");
        record_upstream_error("connect");
        record_usage(UsageOutcome::Dropped);
        record_cache(true, "identity");
    }
}
