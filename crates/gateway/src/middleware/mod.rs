//! Request middleware, outermost first: admission, auth, rate limiting

pub mod admission;
pub mod auth;
pub mod rate_limit;
