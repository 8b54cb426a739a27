//! Configuration management for Tollgate services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Key validation service configuration
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Usage metering collector configuration
    #[serde(default)]
    pub metering: MeteringConfig,

    /// Upstream proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidatorConfig {
    /// Base URL of the key management service (POST {url}/validate)
    #[serde(default = "default_validator_url")]
    pub url: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_validator_timeout")]
    pub timeout_ms: u64,

    /// How long a successful resolution may be reused (0 disables caching)
    #[serde(default)]
    pub cache_ttl_secs: u64,

    /// Upper bound on cached resolutions
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeteringConfig {
    /// Base URL of the metering collector (POST {url}/usage)
    #[serde(default = "default_metering_url")]
    pub url: String,

    /// Per-event delivery timeout in milliseconds
    #[serde(default = "default_metering_timeout")]
    pub timeout_ms: u64,

    /// Events buffered before new ones are dropped
    #[serde(default = "default_metering_buffer")]
    pub buffer_size: usize,

    /// Concurrent deliveries to the collector
    #[serde(default = "default_metering_in_flight")]
    pub max_in_flight: usize,

    /// How long shutdown waits for buffered events
    #[serde(default = "default_metering_shutdown")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Backend address template; `{owner}` and `{api}` are substituted
    #[serde(default = "default_upstream_template")]
    pub upstream_template: String,

    /// Upstream connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Time allowed for the upstream to send response headers
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Accepted request media types (empty disables the check)
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which store holds the sliding-window entries
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackend {
    Redis,
    Memory,
}

/// What to do with a request when the window store cannot be reached
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Reject with 503 RATE_LIMIT_STORE_UNAVAILABLE
    FailClosed,
    /// Admit the request, log at error level, count the outage
    FailOpen,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Window store
    #[serde(default = "default_backend")]
    pub backend: RateLimitBackend,

    /// Behaviour when the store is unreachable
    #[serde(default = "default_failure_policy")]
    pub on_store_failure: StoreFailurePolicy,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "tollgate".to_string() }
fn default_validator_url() -> String { "http://api-keys.internal:8080".to_string() }
fn default_validator_timeout() -> u64 { 5_000 }
fn default_cache_max_entries() -> usize { 10_000 }
fn default_metering_url() -> String { "http://metering.internal:8080".to_string() }
fn default_metering_timeout() -> u64 { 2_000 }
fn default_metering_buffer() -> usize { 4_096 }
fn default_metering_in_flight() -> usize { 32 }
fn default_metering_shutdown() -> u64 { 5 }
fn default_upstream_template() -> String {
    "http://{owner}-{api}.apis.svc.cluster.local".to_string()
}
fn default_connect_timeout() -> u64 { 3_000 }
fn default_response_timeout() -> u64 { 30 }
fn default_allowed_content_types() -> Vec<String> {
    [
        "application/json",
        "application/x-www-form-urlencoded",
        "multipart/form-data",
        "text/plain",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_enabled() -> bool { true }
fn default_backend() -> RateLimitBackend { RateLimitBackend::Redis }
fn default_failure_policy() -> StoreFailurePolicy { StoreFailurePolicy::FailClosed }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("proxy.allowed_content_types")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl ValidatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

impl MeteringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            url: default_validator_url(),
            timeout_ms: default_validator_timeout(),
            cache_ttl_secs: 0,
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            url: default_metering_url(),
            timeout_ms: default_metering_timeout(),
            buffer_size: default_metering_buffer(),
            max_in_flight: default_metering_in_flight(),
            shutdown_timeout_secs: default_metering_shutdown(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_template: default_upstream_template(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: default_backend(),
            on_store_failure: default_failure_policy(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            validator: ValidatorConfig::default(),
            metering: MeteringConfig::default(),
            proxy: ProxyConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
