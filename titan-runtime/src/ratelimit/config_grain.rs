//! Rate-limit configuration grain
//!
//! The singleton authority for the policy set, endpoint mappings, and
//! engine flags. Mutations persist through the grain store and push an
//! invalidation event so every silo's cached copy refreshes immediately
//! instead of waiting out its TTL. The defaults captured on first
//! activation are kept as a snapshot that `reset` restores.

use async_trait::async_trait;

use crate::codec;
use crate::error::{Error, Result};
use crate::ratelimit::policy::{EndpointMapping, RateLimitPolicy, RateLimitingConfiguration};
use crate::runtime::grain::{Grain, GrainCall, GrainContext, PersistentState};
use crate::streams::StreamId;

/// Well-known type name of the config grain
pub const RATE_LIMIT_CONFIG_GRAIN: &str = "rate-limit-config";

/// Stream carrying config invalidation events
pub fn config_stream() -> StreamId {
    StreamId::new("ratelimit", "config")
}

/// Stream carrying metrics broadcasts
pub fn metrics_stream() -> StreamId {
    StreamId::new("ratelimit", "metrics")
}

/// Empty request for `get`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigRequest {}

/// Empty acknowledgement
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigAck {}

/// Invalidation event published after every mutation
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigInvalidation {}

/// Name argument for policy removal and default selection
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolicyName {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Replacement endpoint mapping list; order is the match order
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MappingList {
    #[prost(message, repeated, tag = "1")]
    pub mappings: Vec<EndpointMapping>,
}

/// Boolean flag argument
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetFlag {
    #[prost(bool, tag = "1")]
    pub value: bool,
}

/// Persisted grain state: the live configuration plus the first-boot
/// defaults snapshot `reset` restores
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RateLimitConfigState {
    #[prost(message, optional, tag = "1")]
    pub current: Option<RateLimitingConfiguration>,
    #[prost(message, optional, tag = "2")]
    pub stored_defaults: Option<RateLimitingConfiguration>,
}

/// The configuration authority grain
pub struct RateLimitConfigGrain {
    defaults: RateLimitingConfiguration,
    state: Option<PersistentState<RateLimitConfigState>>,
}

impl RateLimitConfigGrain {
    /// Create the grain with the deployment's default configuration
    pub fn new(defaults: RateLimitingConfiguration) -> Self {
        Self {
            defaults,
            state: None,
        }
    }

    fn state_mut(&mut self) -> &mut PersistentState<RateLimitConfigState> {
        self.state.as_mut().expect("config state loaded on activation")
    }

    fn current(&self) -> &RateLimitingConfiguration {
        self.state
            .as_ref()
            .and_then(|s| s.get().current.as_ref())
            .expect("config state initialized on activation")
    }

    async fn mutate<F>(&mut self, ctx: &mut GrainContext, mutate: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut RateLimitingConfiguration),
    {
        {
            let state = self.state_mut();
            let current = state
                .get_mut()
                .current
                .as_mut()
                .expect("config state initialized on activation");
            mutate(current);
        }
        self.state_mut().save(ctx).await?;
        self.publish_invalidation(ctx).await;
        Ok(codec::encode(&ConfigAck {}))
    }

    async fn publish_invalidation(&self, ctx: &GrainContext) {
        if let Err(e) = ctx
            .runtime()
            .publish_typed(&config_stream(), &ConfigInvalidation {})
            .await
        {
            tracing::warn!(error = %e, "config invalidation publish failed; silo caches expire by TTL");
        }
    }
}

#[async_trait]
impl Grain for RateLimitConfigGrain {
    async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
        let mut state = PersistentState::<RateLimitConfigState>::load(ctx).await?;
        if state.get().current.is_none() {
            // First activation: adopt the deployment defaults and capture
            // them as the reset snapshot
            state.get_mut().current = Some(self.defaults.clone());
            state.get_mut().stored_defaults = Some(self.defaults.clone());
            state.save(ctx).await?;
            tracing::info!("rate-limit configuration initialized from defaults");
        }
        self.state = Some(state);
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "get" => Ok(codec::encode(self.current())),
            "upsert-policy" => {
                let policy: RateLimitPolicy = call.request()?;
                if policy.name.is_empty() {
                    return Err(Error::BadRequest("policy name must not be empty".into()));
                }
                self.mutate(ctx, |config| config.upsert_policy(policy)).await
            }
            "remove-policy" => {
                let name: PolicyName = call.request()?;
                self.mutate(ctx, |config| {
                    config.policies.retain(|p| p.name != name.name);
                })
                .await
            }
            "set-mappings" => {
                let list: MappingList = call.request()?;
                self.mutate(ctx, |config| config.endpoint_mappings = list.mappings)
                    .await
            }
            "set-default-policy" => {
                let name: PolicyName = call.request()?;
                self.mutate(ctx, |config| config.default_policy = name.name).await
            }
            "set-enabled" => {
                let flag: SetFlag = call.request()?;
                self.mutate(ctx, |config| config.enabled = flag.value).await
            }
            "set-metrics" => {
                let flag: SetFlag = call.request()?;
                self.mutate(ctx, |config| config.collect_metrics = flag.value)
                    .await
            }
            "reset" => {
                let defaults = self
                    .state_mut()
                    .get()
                    .stored_defaults
                    .clone()
                    .unwrap_or_else(|| self.defaults.clone());
                self.mutate(ctx, move |config| *config = defaults).await
            }
            other => Err(Error::BadRequest(format!(
                "unknown rate-limit-config method {other:?}"
            ))),
        }
    }
}
