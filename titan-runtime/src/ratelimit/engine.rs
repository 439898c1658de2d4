//! Redis-backed rate-limit engine
//!
//! Per-partition multi-window counters with timeout keys, checked in a
//! single pipelined round trip. The decision core is pure ([`plan`]);
//! Redis supplies the rule states and applies the planned writes. The
//! policy set comes from the config grain and is cached in silo memory
//! with a TTL, flushed explicitly or by the config invalidation stream.

use std::ops::DerefMut;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use deadpool_redis::Pool as RedisPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RateLimitRuntimeConfig;
use crate::error::{Error, Result};
use crate::ratelimit::config_grain::{config_stream, metrics_stream, RATE_LIMIT_CONFIG_GRAIN};
use crate::ratelimit::metrics::{HistorySnapshot, MetricsBroadcast, RateLimitMetrics};
use crate::ratelimit::policy::{
    CompiledEndpointMappings, RateLimitPolicy, RateLimitingConfiguration,
};
use crate::identity::GrainIdentity;
use crate::runtime::RuntimeHandle;

/// Capped length of the `rl|history` list
const HISTORY_LIMIT: isize = 300;

/// Key of the history list
const HISTORY_KEY: &str = "rl|history";

/// Counter key for one `(partition, policy, period)` window
pub fn counter_key(partition: &str, policy: &str, period_secs: u64) -> String {
    format!("rl|{partition}|{policy}|{period_secs}")
}

/// Timeout key for one `(partition, policy)`
pub fn timeout_key(partition: &str, policy: &str) -> String {
    format!("rl|timeout|{partition}|{policy}")
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Admit the request
    Allowed,
    /// Reject the request
    Denied {
        /// Policy that denied
        policy: String,
        /// Seconds until the timeout clears
        retry_after_secs: u64,
    },
}

/// One rule's observed Redis state
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RuleState {
    /// Remaining TTL of the timeout key; <= 0 means not armed
    pub timeout_ttl: i64,
    /// Current counter value, if the key exists
    pub counter: Option<i64>,
    /// Remaining TTL of the counter window; <= 0 means no live window
    pub counter_ttl: i64,
}

/// The writes an admission check must apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CheckPlan {
    /// An armed timeout is in force: deny, touch nothing
    Deny {
        retry_after_secs: u64,
    },
    /// A rule just tripped: arm its timeout, increment nothing
    ArmTimeout {
        rule_index: usize,
    },
    /// All rules pass: increment every counter
    IncrementAll,
}

/// Pure decision over a policy and its observed rule states.
///
/// Ordering matters: existing timeouts dominate (with the maximum
/// remaining timeout as retry-after), then the first violated rule arms
/// its timeout, then the request is admitted.
pub(crate) fn plan(policy: &RateLimitPolicy, states: &[RuleState]) -> CheckPlan {
    let max_timeout = states
        .iter()
        .map(|s| s.timeout_ttl)
        .filter(|ttl| *ttl > 0)
        .max();
    if let Some(ttl) = max_timeout {
        return CheckPlan::Deny {
            retry_after_secs: ttl as u64,
        };
    }

    for (index, (rule, state)) in policy.rules.iter().zip(states).enumerate() {
        if state.counter.unwrap_or(0) >= i64::from(rule.max_hits) {
            return CheckPlan::ArmTimeout { rule_index: index };
        }
    }

    CheckPlan::IncrementAll
}

struct CachedConfig {
    config: Arc<RateLimitingConfiguration>,
    compiled: Arc<CompiledEndpointMappings>,
    fetched_at: Instant,
}

/// Per-silo admission engine
pub struct RateLimiter {
    pool: RedisPool,
    runtime: RuntimeHandle,
    cache_ttl: Duration,
    history_period: Duration,
    cache: RwLock<Option<CachedConfig>>,
    metrics: Arc<RateLimitMetrics>,
}

impl RateLimiter {
    /// Create an engine over the shared Redis pool
    pub fn new(
        pool: RedisPool,
        runtime: RuntimeHandle,
        tuning: &RateLimitRuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            runtime,
            cache_ttl: Duration::from_secs(tuning.config_cache_secs),
            history_period: Duration::from_secs(tuning.history_snapshot_secs),
            cache: RwLock::new(None),
            metrics: Arc::new(RateLimitMetrics::new()),
        })
    }

    /// The engine's meter
    pub fn metrics(&self) -> &Arc<RateLimitMetrics> {
        &self.metrics
    }

    /// Spawn the invalidation subscriber and the history ticker
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = self.clone();
        let invalidation_cancel = cancel.clone();
        tokio::spawn(async move {
            let stream = config_stream();
            let mut subscription = match engine.runtime.subscribe_stream(&stream).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(error = %e, "config invalidation subscription failed; relying on TTL only");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = invalidation_cancel.cancelled() => break,
                    event = subscription.next() => {
                        if event.is_none() {
                            break;
                        }
                        debug!("rate-limit configuration invalidated");
                        engine.flush_cache();
                    }
                }
            }
        });

        if !self.history_period.is_zero() {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(engine.history_period);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {}
                    }
                    if let Err(e) = engine.snapshot_history().await {
                        warn!(error = %e, "history snapshot failed");
                    }
                }
            });
        }
    }

    /// Drop the cached configuration; the next check re-reads the grain
    pub fn flush_cache(&self) {
        let mut cache = self.cache.write().expect("rate-limit cache lock poisoned");
        *cache = None;
    }

    async fn configuration(
        &self,
    ) -> Result<(Arc<RateLimitingConfiguration>, Arc<CompiledEndpointMappings>)> {
        {
            let cache = self.cache.read().expect("rate-limit cache lock poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok((cached.config.clone(), cached.compiled.clone()));
                }
            }
        }

        let config: RateLimitingConfiguration = self
            .runtime
            .invoke_typed(
                &GrainIdentity::singleton(RATE_LIMIT_CONFIG_GRAIN),
                "get",
                &crate::ratelimit::config_grain::ConfigRequest {},
            )
            .await?;
        let config = Arc::new(config);
        let compiled = Arc::new(CompiledEndpointMappings::compile(&config)?);

        let mut cache = self.cache.write().expect("rate-limit cache lock poisoned");
        *cache = Some(CachedConfig {
            config: config.clone(),
            compiled: compiled.clone(),
            fetched_at: Instant::now(),
        });
        Ok((config, compiled))
    }

    /// Admission check for a request: resolve the endpoint's policy and
    /// evaluate it for the partition. Configuration failures propagate so
    /// the middleware can fail closed.
    pub async fn check(&self, partition: &str, path: &str) -> Result<RateLimitDecision> {
        let (config, compiled) = self.configuration().await?;
        if !config.enabled {
            return Ok(RateLimitDecision::Allowed);
        }
        let policy_name = compiled.policy_name_for(path)?;
        let policy = config.policy(policy_name).ok_or_else(|| {
            Error::Internal(format!("endpoint mapping names unknown policy {policy_name:?}"))
        })?;
        self.check_policy(partition, policy).await
    }

    /// Evaluate one policy for a partition against Redis state
    pub async fn check_policy(
        &self,
        partition: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::transient(format!("redis pool unavailable for rate limiting: {e}"))
        })?;

        // One batched read: (timeout-ttl, counter, counter-ttl) per rule
        let mut pipe = redis::pipe();
        let timeout = timeout_key(partition, &policy.name);
        for rule in &policy.rules {
            let counter = counter_key(partition, &policy.name, rule.period_secs);
            pipe.cmd("TTL").arg(&timeout);
            pipe.cmd("GET").arg(&counter);
            pipe.cmd("TTL").arg(&counter);
        }
        let values: Vec<redis::Value> = pipe.query_async(conn.deref_mut()).await?;

        let mut states = Vec::with_capacity(policy.rules.len());
        for chunk in values.chunks(3) {
            let timeout_ttl: i64 = redis::from_redis_value(&chunk[0])?;
            let counter: Option<i64> = redis::from_redis_value(&chunk[1])?;
            let counter_ttl: i64 = redis::from_redis_value(&chunk[2])?;
            states.push(RuleState {
                timeout_ttl,
                counter,
                counter_ttl,
            });
        }

        match plan(policy, &states) {
            CheckPlan::Deny { retry_after_secs } => {
                self.metrics.record_denied();
                Ok(RateLimitDecision::Denied {
                    policy: policy.name.clone(),
                    retry_after_secs,
                })
            }
            CheckPlan::ArmTimeout { rule_index } => {
                let rule = &policy.rules[rule_index];
                let _: () = redis::cmd("SET")
                    .arg(&timeout)
                    .arg(1)
                    .arg("EX")
                    .arg(rule.timeout_secs)
                    .query_async(conn.deref_mut())
                    .await?;
                warn!(
                    partition,
                    policy = %policy.name,
                    hits = states[rule_index].counter.unwrap_or(0),
                    window_remaining_secs = states[rule_index].counter_ttl.max(0),
                    timeout_secs = rule.timeout_secs,
                    "rate limit exceeded, timeout armed"
                );
                self.metrics.record_denied();
                self.metrics.record_timeout_armed();
                Ok(RateLimitDecision::Denied {
                    policy: policy.name.clone(),
                    retry_after_secs: rule.timeout_secs,
                })
            }
            CheckPlan::IncrementAll => {
                let mut pipe = redis::pipe();
                for rule in &policy.rules {
                    pipe.cmd("INCR")
                        .arg(counter_key(partition, &policy.name, rule.period_secs));
                }
                let counts: Vec<i64> = pipe.query_async(conn.deref_mut()).await?;
                // First increment of a window attaches the period TTL
                for (rule, count) in policy.rules.iter().zip(&counts) {
                    if *count == 1 {
                        let _: () = redis::cmd("EXPIRE")
                            .arg(counter_key(partition, &policy.name, rule.period_secs))
                            .arg(rule.period_secs)
                            .query_async(conn.deref_mut())
                            .await?;
                    }
                }
                self.metrics.record_allowed();
                Ok(RateLimitDecision::Allowed)
            }
        }
    }

    /// Admin: clear one partition's armed timeout for a policy
    pub async fn clear_timeout(&self, partition: &str, policy: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| Error::transient(e.to_string()))?;
        let _: () = redis::cmd("DEL")
            .arg(timeout_key(partition, policy))
            .query_async(conn.deref_mut())
            .await?;
        info!(partition, policy, "rate-limit timeout cleared");
        self.broadcast_metrics().await;
        Ok(())
    }

    /// Admin: drop every counter and timeout for one partition
    pub async fn clear_partition(&self, partition: &str) -> Result<u64> {
        let removed = self
            .delete_matching(&format!("rl|{partition}|*"))
            .await?
            + self
                .delete_matching(&format!("rl|timeout|{partition}|*"))
                .await?;
        info!(partition, removed, "rate-limit partition cleared");
        self.broadcast_metrics().await;
        Ok(removed)
    }

    /// Admin: wipe every rate-limit key
    pub async fn clear_all(&self) -> Result<u64> {
        let removed = self.delete_matching("rl|*").await?;
        info!(removed, "all rate-limit state cleared");
        self.broadcast_metrics().await;
        Ok(removed)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.pool.get().await.map_err(|e| Error::transient(e.to_string()))?;
        let mut removed = 0u64;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(conn.deref_mut())
                .await?;
            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(conn.deref_mut())
                    .await?;
                removed += deleted;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    /// Record one history entry: live bucket/timeout counts plus this
    /// silo's totals, trimmed to the capped ring
    pub async fn snapshot_history(&self) -> Result<()> {
        let (config, _) = self.configuration().await?;
        if !config.collect_metrics {
            return Ok(());
        }

        let mut conn = self.pool.get().await.map_err(|e| Error::transient(e.to_string()))?;
        let mut buckets = 0u64;
        let mut timeouts = 0u64;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("rl|*")
                .arg("COUNT")
                .arg(200)
                .query_async(conn.deref_mut())
                .await?;
            for key in &keys {
                if key == HISTORY_KEY {
                    continue;
                }
                if key.starts_with("rl|timeout|") {
                    timeouts += 1;
                } else {
                    buckets += 1;
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let snapshot = HistorySnapshot {
            timestamp: chrono::Utc::now(),
            active_buckets: buckets,
            active_timeouts: timeouts,
            total_requests: self.metrics.total(),
        };
        let serialized = serde_json::to_string(&snapshot)
            .map_err(|e| Error::Internal(format!("history snapshot serialization: {e}")))?;
        let _: () = redis::cmd("LPUSH")
            .arg(HISTORY_KEY)
            .arg(serialized)
            .query_async(conn.deref_mut())
            .await?;
        let _: () = redis::cmd("LTRIM")
            .arg(HISTORY_KEY)
            .arg(0)
            .arg(HISTORY_LIMIT - 1)
            .query_async(conn.deref_mut())
            .await?;
        Ok(())
    }

    /// Push current counters on the metrics stream so dashboards reconverge
    async fn broadcast_metrics(&self) {
        let broadcast = MetricsBroadcast {
            allowed: self.metrics.allowed(),
            denied: self.metrics.denied(),
            timeouts_armed: self.metrics.timeouts_armed(),
        };
        if let Err(e) = self
            .runtime
            .publish_typed(&metrics_stream(), &broadcast)
            .await
        {
            warn!(error = %e, "metrics broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::RateLimitRule;
    use std::collections::HashMap;

    fn policy(rules: Vec<RateLimitRule>) -> RateLimitPolicy {
        RateLimitPolicy {
            name: "Test".into(),
            rules,
        }
    }

    /// Minimal model of the Redis keyspace driven by [`CheckPlan`],
    /// with explicit time advancement for TTL behavior
    struct Model {
        policy: RateLimitPolicy,
        /// period -> (count, expires_at)
        counters: HashMap<u64, (i64, u64)>,
        timeout_expires_at: Option<u64>,
        now: u64,
    }

    impl Model {
        fn new(policy: RateLimitPolicy) -> Self {
            Self {
                policy,
                counters: HashMap::new(),
                timeout_expires_at: None,
                now: 0,
            }
        }

        fn advance(&mut self, secs: u64) {
            self.now += secs;
            self.counters.retain(|_, (_, expires)| *expires > self.now);
            if self.timeout_expires_at.is_some_and(|t| t <= self.now) {
                self.timeout_expires_at = None;
            }
        }

        fn states(&self) -> Vec<RuleState> {
            self.policy
                .rules
                .iter()
                .map(|rule| RuleState {
                    timeout_ttl: self
                        .timeout_expires_at
                        .map(|t| t.saturating_sub(self.now) as i64)
                        .unwrap_or(-2),
                    counter: self.counters.get(&rule.period_secs).map(|(c, _)| *c),
                    counter_ttl: self
                        .counters
                        .get(&rule.period_secs)
                        .map(|(_, expires)| expires.saturating_sub(self.now) as i64)
                        .unwrap_or(-2),
                })
                .collect()
        }

        /// One admission check: evaluate and apply the plan like the engine
        fn check(&mut self) -> bool {
            let rules = self.policy.rules.clone();
            match plan(&self.policy, &self.states()) {
                CheckPlan::Deny { .. } => false,
                CheckPlan::ArmTimeout { rule_index } => {
                    self.timeout_expires_at = Some(self.now + rules[rule_index].timeout_secs);
                    false
                }
                CheckPlan::IncrementAll => {
                    for rule in &rules {
                        let entry = self
                            .counters
                            .entry(rule.period_secs)
                            .or_insert((0, self.now + rule.period_secs));
                        entry.0 += 1;
                    }
                    true
                }
            }
        }

        fn counter(&self, period: u64) -> i64 {
            self.counters.get(&period).map(|(c, _)| *c).unwrap_or(0)
        }
    }

    #[test]
    fn rate_limit_monotonicity() {
        // max-hits=10, period=60, timeout=120
        let mut model = Model::new(policy(vec![RateLimitRule {
            max_hits: 10,
            period_secs: 60,
            timeout_secs: 120,
        }]));

        for n in 0..10 {
            assert!(model.check(), "check {n} within the window must pass");
        }
        // The 11th denies and arms a 120 s timeout
        assert!(!model.check());
        assert!(model.timeout_expires_at.is_some());

        // The period elapsing does not lift the timeout
        model.advance(70);
        assert!(!model.check());

        // After the timeout expires the next check succeeds
        model.advance(60);
        assert!(model.check());
    }

    #[test]
    fn deny_path_increments_nothing() {
        let mut model = Model::new(policy(vec![RateLimitRule {
            max_hits: 10,
            period_secs: 60,
            timeout_secs: 120,
        }]));

        for _ in 0..10 {
            assert!(model.check());
        }
        assert!(!model.check());
        assert_eq!(model.counter(60), 10);

        // Further denied checks also leave the counter untouched
        assert!(!model.check());
        assert_eq!(model.counter(60), 10);
    }

    #[test]
    fn any_violated_rule_denies_and_other_counters_stay() {
        let mut model = Model::new(policy(vec![
            RateLimitRule {
                max_hits: 2,
                period_secs: 10,
                timeout_secs: 60,
            },
            RateLimitRule {
                max_hits: 100,
                period_secs: 3600,
                timeout_secs: 600,
            },
        ]));

        assert!(model.check());
        assert!(model.check());
        // Third check violates the tight rule; the wide counter must not move
        assert!(!model.check());
        assert_eq!(model.counter(10), 2);
        assert_eq!(model.counter(3600), 2);
    }

    #[test]
    fn existing_timeout_reports_max_remaining() {
        let p = policy(vec![
            RateLimitRule {
                max_hits: 1,
                period_secs: 10,
                timeout_secs: 60,
            },
            RateLimitRule {
                max_hits: 1,
                period_secs: 20,
                timeout_secs: 600,
            },
        ]);
        let states = vec![
            RuleState {
                timeout_ttl: 30,
                counter: Some(0),
                counter_ttl: 5,
            },
            RuleState {
                timeout_ttl: 90,
                counter: Some(0),
                counter_ttl: 15,
            },
        ];
        assert_eq!(
            plan(&p, &states),
            CheckPlan::Deny {
                retry_after_secs: 90
            }
        );
    }

    #[test]
    fn keys_follow_the_documented_layout() {
        assert_eq!(counter_key("user:42", "Auth", 60), "rl|user:42|Auth|60");
        assert_eq!(timeout_key("ip:10.0.0.1", "Global"), "rl|timeout|ip:10.0.0.1|Global");
    }
}
