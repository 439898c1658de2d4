//! Distributed, policy-driven rate limiting
//!
//! [`policy`] holds the policy/mapping model and glob resolution,
//! [`engine`] the Redis-backed multi-window check, [`config_grain`] the
//! cluster-wide configuration authority, and [`metrics`] the meter and
//! history shapes.

pub mod config_grain;
pub mod engine;
pub mod metrics;
pub mod policy;

pub use config_grain::{config_stream, metrics_stream, RateLimitConfigGrain, RATE_LIMIT_CONFIG_GRAIN};
pub use engine::{RateLimitDecision, RateLimiter};
pub use metrics::{HistorySnapshot, RateLimitMetrics};
pub use policy::{
    glob_match, CompiledEndpointMappings, EndpointMapping, RateLimitPolicy, RateLimitRule,
    RateLimitingConfiguration,
};
