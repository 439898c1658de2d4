//! Registry grains: singleton catalog writers with cached readers
//!
//! A registry holds a whole static catalog (item definitions, modifier
//! pools, season descriptors) as one persisted map keyed by entry id.
//! The writer is a singleton grain addressed by a well-known string; the
//! reader is a stateless-worker type that caches the full catalog in
//! memory and refreshes when its TTL lapses or the writer broadcasts an
//! invalidation after a mutation. Entry values are opaque tagged records;
//! typed access lives at the call sites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prost::Message;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::identity::GrainIdentity;
use crate::runtime::grain::{Grain, GrainCall, GrainContext, GrainRegistration, PersistentState};
use crate::runtime::startup::StartupTask;
use crate::runtime::RuntimeHandle;
use crate::streams::StreamId;

/// Invalidation stream for a registry type
pub fn invalidation_stream(registry_type: &str) -> StreamId {
    StreamId::new("registry", registry_type)
}

/// One catalog entry
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryEntry {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl RegistryEntry {
    /// Build an entry from a typed value
    pub fn typed<M: Message>(key: impl Into<String>, value: &M) -> Self {
        Self {
            key: key.into(),
            value: codec::encode(value),
        }
    }
}

/// Insert-or-replace a batch of entries
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpsertRequest {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<RegistryEntry>,
}

/// Single-entry lookup
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(string, tag = "1")]
    pub key: String,
}

/// Lookup result; `found` distinguishes absent from empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryValue {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Whole-catalog read
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryList {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<RegistryEntry>,
}

/// Seed the catalog; `force` overwrites an already-populated registry
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SeedRequest {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<RegistryEntry>,
    #[prost(bool, tag = "2")]
    pub force: bool,
}

/// Seed outcome
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SeedResult {
    /// Whether the catalog was written
    #[prost(bool, tag = "1")]
    pub seeded: bool,
    /// Entries now in the catalog
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

/// Empty acknowledgement
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryAck {}

/// Invalidation event broadcast after writer mutations
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryInvalidation {}

/// Persisted registry state
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryState {
    #[prost(map = "string, bytes", tag = "1")]
    pub entries: HashMap<String, Vec<u8>>,
}

/// Singleton catalog writer
pub struct RegistryGrain {
    state: Option<PersistentState<RegistryState>>,
}

impl RegistryGrain {
    /// Create the writer
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Registration for a registry writer type
    pub fn registration(registry_type: impl Into<String>) -> GrainRegistration {
        GrainRegistration::new(registry_type, |_| RegistryGrain::new())
    }

    fn state_mut(&mut self) -> &mut PersistentState<RegistryState> {
        self.state.as_mut().expect("registry state loaded on activation")
    }

    async fn invalidate_readers(&self, ctx: &GrainContext) {
        let stream = invalidation_stream(&ctx.identity().grain_type);
        if let Err(e) = ctx
            .runtime()
            .publish_typed(&stream, &RegistryInvalidation {})
            .await
        {
            warn!(stream = %stream, error = %e, "reader invalidation publish failed");
        }
    }
}

impl Default for RegistryGrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grain for RegistryGrain {
    async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
        self.state = Some(PersistentState::load(ctx).await?);
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "get" => {
                let request: GetRequest = call.request()?;
                let value = self.state_mut().get().entries.get(&request.key);
                Ok(codec::encode(&RegistryValue {
                    found: value.is_some(),
                    value: value.cloned().unwrap_or_default(),
                }))
            }
            "list" => {
                let mut entries: Vec<RegistryEntry> = self
                    .state_mut()
                    .get()
                    .entries
                    .iter()
                    .map(|(key, value)| RegistryEntry {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect();
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(codec::encode(&RegistryList { entries }))
            }
            "upsert" => {
                let request: UpsertRequest = call.request()?;
                if request.entries.is_empty() {
                    return Err(Error::BadRequest("empty upsert".into()));
                }
                for entry in request.entries {
                    self.state_mut()
                        .get_mut()
                        .entries
                        .insert(entry.key, entry.value);
                }
                self.state_mut().save(ctx).await?;
                self.invalidate_readers(ctx).await;
                Ok(codec::encode(&RegistryAck {}))
            }
            "remove" => {
                let request: GetRequest = call.request()?;
                self.state_mut().get_mut().entries.remove(&request.key);
                self.state_mut().save(ctx).await?;
                self.invalidate_readers(ctx).await;
                Ok(codec::encode(&RegistryAck {}))
            }
            "seed" => {
                let request: SeedRequest = call.request()?;
                let populated = !self.state_mut().get().entries.is_empty();
                if populated && !request.force {
                    debug!(registry = %ctx.identity().grain_type, "already populated, seed skipped");
                    let count = self.state_mut().get().entries.len() as u32;
                    return Ok(codec::encode(&SeedResult {
                        seeded: false,
                        count,
                    }));
                }
                let entries: HashMap<String, Vec<u8>> = request
                    .entries
                    .into_iter()
                    .map(|e| (e.key, e.value))
                    .collect();
                let count = entries.len() as u32;
                self.state_mut().get_mut().entries = entries;
                self.state_mut().save(ctx).await?;
                self.invalidate_readers(ctx).await;
                info!(registry = %ctx.identity().grain_type, count, "catalog seeded");
                Ok(codec::encode(&SeedResult {
                    seeded: true,
                    count,
                }))
            }
            "clear" => {
                self.state_mut().get_mut().entries.clear();
                self.state_mut().save(ctx).await?;
                self.invalidate_readers(ctx).await;
                Ok(codec::encode(&RegistryAck {}))
            }
            other => Err(Error::BadRequest(format!(
                "unknown registry method {other:?}"
            ))),
        }
    }
}

/// Stateless-worker reader with a whole-catalog in-memory cache.
///
/// Serves the hot read path without a turn on the singleton writer.
/// Refreshes on TTL expiry or when the writer's invalidation broadcast
/// flips the dirty flag.
pub struct RegistryReaderGrain {
    source: String,
    cache_ttl: Duration,
    cached: Option<(Instant, Arc<HashMap<String, Vec<u8>>>)>,
    dirty: Arc<AtomicBool>,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl RegistryReaderGrain {
    /// Create a reader over the writer type `source`
    pub fn new(source: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            source: source.into(),
            cache_ttl,
            cached: None,
            dirty: Arc::new(AtomicBool::new(false)),
            watcher: None,
        }
    }

    /// Registration for a reader type over `source`, with the per-silo
    /// worker bound
    pub fn registration(
        reader_type: impl Into<String>,
        source: impl Into<String> + Clone + Send + Sync + 'static,
        cache_ttl: Duration,
        max_local: usize,
    ) -> GrainRegistration {
        GrainRegistration::stateless_worker(reader_type, max_local, move |_| {
            RegistryReaderGrain::new(source.clone(), cache_ttl)
        })
    }

    async fn catalog(&mut self, ctx: &GrainContext) -> Result<Arc<HashMap<String, Vec<u8>>>> {
        let stale = self.dirty.swap(false, Ordering::Relaxed)
            || self
                .cached
                .as_ref()
                .map(|(at, _)| at.elapsed() >= self.cache_ttl)
                .unwrap_or(true);
        if !stale {
            if let Some((_, cached)) = &self.cached {
                return Ok(cached.clone());
            }
        }

        let writer = GrainIdentity::singleton(self.source.clone());
        let list: RegistryList = ctx
            .runtime()
            .invoke_typed(&writer, "list", &RegistryAck {})
            .await?;
        let map: HashMap<String, Vec<u8>> = list
            .entries
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();
        let catalog = Arc::new(map);
        self.cached = Some((Instant::now(), catalog.clone()));
        Ok(catalog)
    }
}

#[async_trait]
impl Grain for RegistryReaderGrain {
    async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
        let stream = invalidation_stream(&self.source);
        let mut subscription = ctx.runtime().subscribe_stream(&stream).await?;
        let dirty = self.dirty.clone();
        self.watcher = Some(tokio::spawn(async move {
            while subscription.next().await.is_some() {
                dirty.store(true, Ordering::Relaxed);
            }
        }));
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "get" => {
                let request: GetRequest = call.request()?;
                let catalog = self.catalog(ctx).await?;
                let value = catalog.get(&request.key);
                Ok(codec::encode(&RegistryValue {
                    found: value.is_some(),
                    value: value.cloned().unwrap_or_default(),
                }))
            }
            "list" => {
                let catalog = self.catalog(ctx).await?;
                let mut entries: Vec<RegistryEntry> = catalog
                    .iter()
                    .map(|(key, value)| RegistryEntry {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect();
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(codec::encode(&RegistryList { entries }))
            }
            "invalidate-cache" => {
                self.cached = None;
                Ok(codec::encode(&RegistryAck {}))
            }
            other => Err(Error::BadRequest(format!(
                "unknown registry-reader method {other:?}"
            ))),
        }
    }

    async fn on_deactivate(&mut self, _ctx: &mut GrainContext) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        Ok(())
    }
}

/// Startup task seeding one registry with resolved entries
pub struct RegistrySeedTask {
    name: String,
    registry_type: String,
    entries: Vec<RegistryEntry>,
    force: bool,
}

impl RegistrySeedTask {
    /// Seed `registry_type` with `entries`; `force` overwrites an
    /// already-populated catalog
    pub fn new(registry_type: impl Into<String>, entries: Vec<RegistryEntry>, force: bool) -> Self {
        let registry_type = registry_type.into();
        Self {
            name: format!("seed-{registry_type}"),
            registry_type,
            entries,
            force,
        }
    }
}

#[async_trait]
impl StartupTask for RegistrySeedTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, runtime: &RuntimeHandle) -> Result<()> {
        let writer = GrainIdentity::singleton(self.registry_type.clone());
        let result: SeedResult = runtime
            .invoke_typed(
                &writer,
                "seed",
                &SeedRequest {
                    entries: self.entries.clone(),
                    force: self.force,
                },
            )
            .await?;
        if result.seeded {
            info!(registry = %self.registry_type, count = result.count, "registry seeded");
        } else {
            info!(registry = %self.registry_type, count = result.count, "registry already populated, seed skipped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestCluster;

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct ItemDefinition {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(uint32, tag = "2")]
        tier: u32,
        #[prost(map = "string, string", tag = "3")]
        metadata: HashMap<String, String>,
    }

    fn item(name: &str, tier: u32) -> ItemDefinition {
        ItemDefinition {
            name: name.to_string(),
            tier,
            metadata: HashMap::new(),
        }
    }

    fn registrations() -> Vec<crate::runtime::grain::GrainRegistration> {
        vec![
            RegistryGrain::registration("item-definitions"),
            RegistryReaderGrain::registration(
                "item-definitions-reader",
                "item-definitions",
                Duration::from_secs(30),
                2,
            ),
        ]
    }

    async fn seed(
        runtime: &crate::runtime::RuntimeHandle,
        entries: Vec<RegistryEntry>,
        force: bool,
    ) -> SeedResult {
        runtime
            .invoke_typed(
                &GrainIdentity::singleton("item-definitions"),
                "seed",
                &SeedRequest { entries, force },
            )
            .await
            .unwrap()
    }

    async fn get_via_reader(
        runtime: &crate::runtime::RuntimeHandle,
        key: &str,
    ) -> Option<ItemDefinition> {
        let value: RegistryValue = runtime
            .invoke_typed(
                &GrainIdentity::singleton("item-definitions-reader"),
                "get",
                &GetRequest {
                    key: key.to_string(),
                },
            )
            .await
            .unwrap();
        if value.found {
            Some(codec::decode(&value.value).unwrap())
        } else {
            None
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seed_skips_populated_registry_unless_forced() {
        let cluster = TestCluster::start(1, |_| {}, registrations).await;
        let runtime = cluster.runtime(0);

        let first = seed(
            &runtime,
            vec![RegistryEntry::typed("short-sword", &item("Short Sword", 1))],
            false,
        )
        .await;
        assert!(first.seeded);
        assert_eq!(first.count, 1);

        // A second silo boot against the populated registry changes nothing
        let second = seed(
            &runtime,
            vec![RegistryEntry::typed("long-sword", &item("Long Sword", 2))],
            false,
        )
        .await;
        assert!(!second.seeded);
        assert_eq!(second.count, 1);

        // force-reseed overwrites
        let forced = seed(
            &runtime,
            vec![RegistryEntry::typed("long-sword", &item("Long Sword", 2))],
            true,
        )
        .await;
        assert!(forced.seeded);
        assert_eq!(forced.count, 1);

        let value: RegistryValue = runtime
            .invoke_typed(
                &GrainIdentity::singleton("item-definitions"),
                "get",
                &GetRequest {
                    key: "short-sword".into(),
                },
            )
            .await
            .unwrap();
        assert!(!value.found);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reader_cache_refreshes_after_writer_mutation() {
        let cluster = TestCluster::start(1, |_| {}, registrations).await;
        let runtime = cluster.runtime(0);

        seed(
            &runtime,
            vec![RegistryEntry::typed("short-sword", &item("Short Sword", 1))],
            false,
        )
        .await;

        // Warm the reader cache
        let cached = get_via_reader(&runtime, "short-sword").await.unwrap();
        assert_eq!(cached.name, "Short Sword");
        assert!(get_via_reader(&runtime, "frost-blade").await.is_none());

        // Mutate through the writer; the invalidation broadcast flips the
        // reader's dirty flag so the next read refetches
        let _: RegistryAck = runtime
            .invoke_typed(
                &GrainIdentity::singleton("item-definitions"),
                "upsert",
                &UpsertRequest {
                    entries: vec![RegistryEntry::typed("frost-blade", &item("Frost Blade", 5))],
                },
            )
            .await
            .unwrap();

        let found = crate::testkit::eventually(std::time::Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move {
                get_via_reader(&runtime, "frost-blade")
                    .await
                    .ok_or_else(|| Error::transient("reader cache not refreshed yet"))
            }
        })
        .await
        .unwrap();
        assert_eq!(found.tier, 5);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seed_task_runs_during_silo_startup() {
        let mut cluster = TestCluster::start(0, |_| {}, registrations).await;
        // Startup tasks are declared per silo; spawn one with a seed task
        let config = {
            let mut config = crate::config::Config::default();
            config.silo.deployment_id = "test".into();
            config.silo.port = 7300;
            config
        };
        let silo = crate::runtime::SiloBuilder::new(config)
            .with_membership_table(cluster.membership.clone())
            .with_storage(cluster.storage.clone())
            .with_reminder_store(cluster.reminders.clone())
            .with_in_process_network(cluster.network.clone())
            .register(RegistryGrain::registration("item-definitions"))
            .with_startup_task(RegistrySeedTask::new(
                "item-definitions",
                vec![RegistryEntry::typed("short-sword", &item("Short Sword", 1))],
                false,
            ))
            .start()
            .await
            .unwrap();
        cluster.silos.push(Some(silo));

        let value: RegistryValue = cluster
            .runtime(0)
            .invoke_typed(
                &GrainIdentity::singleton("item-definitions"),
                "get",
                &GetRequest {
                    key: "short-sword".into(),
                },
            )
            .await
            .unwrap();
        assert!(value.found);

        cluster.stop().await;
    }
}
