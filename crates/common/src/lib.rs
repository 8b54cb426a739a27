//! Tollgate Common Library
//!
//! Shared code for the Tollgate gateway services including:
//! - Error types and handling
//! - Configuration management
//! - Caller identity and credential utilities
//! - Clock abstraction for window arithmetic
//! - Metrics and observability

pub mod clock;
pub mod config;
pub mod errors;
pub mod identity;
pub mod metrics;

// Re-export commonly used types
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use identity::{Identity, TierLimits};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
