//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: TITAN_, `__` as section separator)
//! 2. Current working directory: ./titan.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Silo identity and endpoints
    pub silo: SiloConfig,

    /// Cluster membership tuning
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Activation runtime tuning
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Transaction coordinator tuning
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// SQL grain store (optional; in-memory storage is used when absent)
    #[serde(default)]
    pub storage: Option<StorageConfig>,

    /// Redis for sessions and rate limiting (optional for storage-only silos)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Session ticket store tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Rate limiter runtime tuning (policies live in the config grain)
    #[serde(default)]
    pub rate_limit: RateLimitRuntimeConfig,

    /// Catalog seeding
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Silo identity and endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiloConfig {
    /// Human-readable silo name (defaults to `silo-{port}`)
    #[serde(default)]
    pub name: Option<String>,

    /// Deployment id: namespaces the membership roster and every stored
    /// state blob, so multiple logical deployments can share storage
    #[serde(default = "default_deployment_id")]
    pub deployment_id: String,

    /// Host for silo-to-silo traffic
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for silo-to-silo traffic
    #[serde(default = "default_silo_port")]
    pub port: u16,

    /// Port announced to gateways
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl SiloConfig {
    /// The silo-to-silo endpoint string used as the membership row key
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Effective silo name
    pub fn silo_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("silo-{}", self.port))
    }
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            name: None,
            deployment_id: default_deployment_id(),
            host: default_host(),
            port: default_silo_port(),
            proxy_port: default_proxy_port(),
            log_level: default_log_level(),
            environment: default_environment(),
        }
    }
}

/// Cluster membership tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Heartbeat period in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Missed-heartbeat multiplier before a silo is suspected
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,

    /// Distinct suspecting silos required to declare a silo dead
    #[serde(default = "default_suspect_quorum")]
    pub suspect_quorum: usize,

    /// Seconds a silo tolerates failing its own heartbeat writes before
    /// assuming it has been evicted and shutting itself down
    #[serde(default = "default_eviction_grace_secs")]
    pub eviction_grace_secs: u64,
}

impl ClusterConfig {
    /// Liveness threshold after which a silo becomes suspect
    pub fn suspect_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs * u64::from(self.missed_heartbeats))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            missed_heartbeats: default_missed_heartbeats(),
            suspect_quorum: default_suspect_quorum(),
            eviction_grace_secs: default_eviction_grace_secs(),
        }
    }
}

/// Activation runtime tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Idle time after which an activation is collected, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Bounded mailbox capacity per activation
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Per-call deadline in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Bounded transparent retries for transient failures
    #[serde(default = "default_max_call_retries")]
    pub max_call_retries: u32,

    /// Base backoff between retries in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Default per-silo activation bound for stateless-worker grain types
    #[serde(default = "default_stateless_worker_limit")]
    pub stateless_worker_limit: usize,

    /// Period between reminder table scans, in seconds
    #[serde(default = "default_reminder_scan_secs")]
    pub reminder_scan_secs: u64,
}

impl RuntimeConfig {
    /// Idle timeout as a [`Duration`]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Per-call deadline as a [`Duration`]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            mailbox_capacity: default_mailbox_capacity(),
            call_timeout_secs: default_call_timeout_secs(),
            max_call_retries: default_max_call_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stateless_worker_limit: default_stateless_worker_limit(),
            reminder_scan_secs: default_reminder_scan_secs(),
        }
    }
}

/// Transaction coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Prepare phase timeout in seconds; elapse aborts the transaction
    #[serde(default = "default_prepare_timeout_secs")]
    pub prepare_timeout_secs: u64,

    /// Commit phase timeout in seconds per participant delivery attempt
    #[serde(default = "default_commit_timeout_secs")]
    pub commit_timeout_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_secs: default_prepare_timeout_secs(),
            commit_timeout_secs: default_commit_timeout_secs(),
        }
    }
}

/// SQL grain store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Session ticket store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Regular session lifetime in minutes
    #[serde(default = "default_session_lifetime_minutes")]
    pub lifetime_minutes: u64,

    /// Admin session lifetime in minutes
    #[serde(default = "default_admin_lifetime_minutes")]
    pub admin_lifetime_minutes: u64,

    /// Sliding-expiration extension in minutes applied on validation
    #[serde(default = "default_sliding_minutes")]
    pub sliding_minutes: u64,

    /// Maximum live sessions per user; 0 disables the cap
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,

    /// Redis key prefix for the session keyspace
    #[serde(default = "default_session_prefix")]
    pub key_prefix: String,

    /// Seconds a consumed connection ticket stays valid for handshake retries
    #[serde(default = "default_handshake_window_secs")]
    pub handshake_window_secs: u64,

    /// Seconds an unconsumed connection ticket survives
    #[serde(default = "default_connection_ticket_ttl_secs")]
    pub connection_ticket_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime_minutes: default_session_lifetime_minutes(),
            admin_lifetime_minutes: default_admin_lifetime_minutes(),
            sliding_minutes: default_sliding_minutes(),
            max_sessions_per_user: default_max_sessions_per_user(),
            key_prefix: default_session_prefix(),
            handshake_window_secs: default_handshake_window_secs(),
            connection_ticket_ttl_secs: default_connection_ticket_ttl_secs(),
        }
    }
}

/// Rate limiter runtime tuning
///
/// The authoritative policy set lives in the rate-limit config grain;
/// these knobs only control how silos consume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRuntimeConfig {
    /// Seconds a silo caches the configuration before re-reading it
    #[serde(default = "default_rl_cache_secs")]
    pub config_cache_secs: u64,

    /// Seconds between metrics history snapshots; 0 disables history
    #[serde(default = "default_rl_history_secs")]
    pub history_snapshot_secs: u64,
}

impl Default for RateLimitRuntimeConfig {
    fn default() -> Self {
        Self {
            config_cache_secs: default_rl_cache_secs(),
            history_snapshot_secs: default_rl_history_secs(),
        }
    }
}

/// Catalog seeding configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Explicit seed file path; falls back to the embedded resource
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Overwrite already-populated registries instead of skipping them
    #[serde(default)]
    pub force_reseed: bool,
}

impl Config {
    /// Load configuration from defaults, `titan.toml`, and `TITAN_*`
    /// environment variables
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("titan.toml"))
            .merge(Env::prefixed("TITAN_").split("__"))
            .extract()?;
        Ok(config)
    }
}

fn default_deployment_id() -> String {
    "titan-dev".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_silo_port() -> u16 {
    7001
}

fn default_proxy_port() -> u16 {
    7002
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_missed_heartbeats() -> u32 {
    3
}

fn default_suspect_quorum() -> usize {
    2
}

fn default_eviction_grace_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_mailbox_capacity() -> usize {
    128
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_call_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_stateless_worker_limit() -> usize {
    4
}

fn default_reminder_scan_secs() -> u64 {
    60
}

fn default_prepare_timeout_secs() -> u64 {
    10
}

fn default_commit_timeout_secs() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

fn default_redis_max_connections() -> usize {
    16
}

fn default_session_lifetime_minutes() -> u64 {
    30
}

fn default_admin_lifetime_minutes() -> u64 {
    15
}

fn default_sliding_minutes() -> u64 {
    30
}

fn default_max_sessions_per_user() -> usize {
    5
}

fn default_session_prefix() -> String {
    "session".to_string()
}

fn default_handshake_window_secs() -> u64 {
    10
}

fn default_connection_ticket_ttl_secs() -> u64 {
    30
}

fn default_rl_cache_secs() -> u64 {
    30
}

fn default_rl_history_secs() -> u64 {
    60
}
