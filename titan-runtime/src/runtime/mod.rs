//! Activation runtime
//!
//! A [`RuntimeHandle`] is the per-silo entry point for everything grains
//! and clients do: invoking other grains (local or remote, with bounded
//! transparent retries on transient failures), publishing and subscribing
//! to streams, and reaching the persistence provider.

pub mod activation;
pub mod catalog;
pub mod grain;
pub mod reminders;
pub mod silo;
pub mod startup;
pub mod transport;

use std::sync::Arc;

use dashmap::DashSet;
use prost::Message;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::directory::GrainDirectory;
use crate::codec;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::identity::GrainIdentity;
use crate::storage::{GrainStorage, ReminderStore};
use crate::streams::directory::{SubscriptionChange, SubscriberList, SUBSCRIPTION_DIRECTORY_GRAIN};
use crate::streams::{RelayedEvent, StreamBroker, StreamId, StreamSubscription};

pub use grain::{
    Grain, GrainCall, GrainContext, GrainRegistration, PersistentState, Placement, TxnContext,
};
pub use silo::{Silo, SiloBuilder};
pub use startup::StartupTask;

use catalog::ActivationCatalog;
use transport::{InvocationHandler, InvocationRequest, InvocationResponse, SiloTransport};

/// Method selector for cross-silo stream relay envelopes
const STREAM_RELAY_METHOD: &str = "@stream/publish";

pub(crate) struct RuntimeInner {
    pub service_id: String,
    pub config: RuntimeConfig,
    pub directory: GrainDirectory,
    pub storage: Arc<dyn GrainStorage>,
    pub reminder_store: Arc<dyn ReminderStore>,
    pub broker: StreamBroker,
    pub transport: Arc<dyn SiloTransport>,
    pub catalog: Arc<ActivationCatalog>,
    /// Streams this silo has registered with the subscription directory
    pub registered_streams: DashSet<StreamId>,
}

/// Cheap-to-clone handle to one silo's runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<RuntimeInner>,
}

impl RuntimeHandle {
    pub(crate) fn new(inner: RuntimeInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Deployment-wide storage namespace
    pub fn service_id(&self) -> &str {
        &self.inner.service_id
    }

    /// Runtime tuning knobs
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The grain directory for this silo's view of the cluster
    pub fn directory(&self) -> &GrainDirectory {
        &self.inner.directory
    }

    /// The grain state store
    pub fn storage(&self) -> &Arc<dyn GrainStorage> {
        &self.inner.storage
    }

    /// The durable reminder store
    pub fn reminder_store(&self) -> &Arc<dyn ReminderStore> {
        &self.inner.reminder_store
    }

    /// This silo's endpoint
    pub fn local_endpoint(&self) -> &str {
        &self.inner.directory.local_address().endpoint
    }

    pub(crate) fn catalog(&self) -> &Arc<ActivationCatalog> {
        &self.inner.catalog
    }

    /// Invoke a grain with an overall deadline and bounded transparent
    /// retries for transient failures (stale routes, host loss, races
    /// with idle collection).
    pub async fn invoke(&self, identity: &GrainIdentity, call: GrainCall) -> Result<Vec<u8>> {
        let timeout = self.inner.config.call_timeout();
        match tokio::time::timeout(timeout, self.invoke_with_retries(identity, call)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(timeout)),
        }
    }

    /// Invoke with a typed request and response
    pub async fn invoke_typed<Req, Resp>(
        &self,
        identity: &GrainIdentity,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let body = self.invoke(identity, GrainCall::typed(method, request)).await?;
        codec::decode(&body)
    }

    async fn invoke_with_retries(
        &self,
        identity: &GrainIdentity,
        call: GrainCall,
    ) -> Result<Vec<u8>> {
        let max_retries = self.inner.config.max_call_retries;
        let base_backoff = Duration::from_millis(self.inner.config.retry_backoff_ms);
        let mut attempt: u32 = 0;

        loop {
            match self.invoke_once(identity, &call).await {
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    let backoff = base_backoff * 2_u32.pow(attempt.saturating_sub(1));
                    debug!(
                        grain = %identity,
                        attempt,
                        error = %e,
                        "transient invocation failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn invoke_once(&self, identity: &GrainIdentity, call: &GrainCall) -> Result<Vec<u8>> {
        let owner = self.inner.directory.locate(identity)?;
        let deadline_ms = self.inner.config.call_timeout().as_millis() as u64;

        if &owner == self.inner.directory.local_address() {
            let deadline = Instant::now() + self.inner.config.call_timeout();
            return self
                .inner
                .catalog
                .invoke_local(self, identity, call.clone(), deadline)
                .await;
        }

        let request =
            InvocationRequest::new(identity, call, deadline_ms, Uuid::new_v4().to_string());
        let response = self.inner.transport.invoke(&owner.endpoint, request).await?;
        response.into_result()
    }

    /// Deliver a reminder tick into the local activation for `identity`
    pub(crate) async fn deliver_reminder(
        &self,
        identity: &GrainIdentity,
        name: &str,
    ) -> Result<()> {
        self.inner
            .catalog
            .deliver_reminder(self, identity, name)
            .await
    }

    /// Build the server-side dispatcher handed to transports
    pub(crate) fn invocation_handler(&self) -> InvocationHandler {
        let runtime = self.clone();
        Arc::new(move |request| {
            let runtime = runtime.clone();
            Box::pin(async move {
                InvocationResponse::from_result(runtime.dispatch_remote(request).await)
            })
        })
    }

    async fn dispatch_remote(&self, request: InvocationRequest) -> Result<Vec<u8>> {
        // Stream relays are silo-addressed, not grain-addressed
        if request.method == STREAM_RELAY_METHOD {
            let event: RelayedEvent = codec::decode(&request.body)?;
            let stream = StreamId::new(event.namespace, event.stream);
            self.inner.broker.publish_local(&stream, event.payload);
            return Ok(Vec::new());
        }

        let (identity, call) = request.unpack()?;
        // Single-activation guard: only the ring owner may host. A stale
        // caller view lands here during failover; the error is transient
        // and the caller retries against a refreshed view.
        if !self.inner.directory.owns(&identity) {
            return Err(Error::transient(format!(
                "{} is not the owner of {identity}",
                self.local_endpoint()
            )));
        }

        let deadline = Instant::now() + Duration::from_millis(request.deadline_ms.max(1));
        self.inner
            .catalog
            .invoke_local(self, &identity, call, deadline)
            .await
    }

    /// Subscribe to a stream, registering this silo with the subscription
    /// directory on first local interest
    pub async fn subscribe_stream(&self, stream: &StreamId) -> Result<StreamSubscription> {
        let subscription = self.inner.broker.subscribe_local(stream);

        if self.inner.registered_streams.insert(stream.clone()) {
            let change = SubscriptionChange {
                namespace: stream.namespace.clone(),
                stream: stream.id.clone(),
                endpoint: self.local_endpoint().to_string(),
            };
            let directory = GrainIdentity::singleton(SUBSCRIPTION_DIRECTORY_GRAIN);
            if let Err(e) = self
                .invoke_typed::<_, crate::streams::directory::Ack>(&directory, "subscribe", &change)
                .await
            {
                warn!(stream = %stream, error = %e, "stream registration failed; remote events will not arrive");
                self.inner.registered_streams.remove(stream);
            }
        }

        Ok(subscription)
    }

    /// Publish an encoded payload: local subscribers first, then fan-out
    /// to every other subscribed silo in publisher order
    pub async fn publish_stream(&self, stream: &StreamId, payload: Vec<u8>) -> Result<()> {
        self.inner.broker.publish_local(stream, payload.clone());

        let query = SubscriptionChange {
            namespace: stream.namespace.clone(),
            stream: stream.id.clone(),
            endpoint: String::new(),
        };
        let directory = GrainIdentity::singleton(SUBSCRIPTION_DIRECTORY_GRAIN);
        let subscribers: SubscriberList = match self
            .invoke_typed(&directory, "subscribers", &query)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(stream = %stream, error = %e, "subscriber lookup failed; local-only publish");
                return Ok(());
            }
        };

        let relay = RelayedEvent {
            namespace: stream.namespace.clone(),
            stream: stream.id.clone(),
            payload,
        };
        let body = codec::encode(&relay);
        for endpoint in subscribers
            .endpoints
            .iter()
            .filter(|e| e.as_str() != self.local_endpoint())
        {
            let request = InvocationRequest {
                target: None,
                method: STREAM_RELAY_METHOD.to_string(),
                body: body.clone(),
                deadline_ms: self.inner.config.call_timeout().as_millis() as u64,
                request_id: Uuid::new_v4().to_string(),
                txn: None,
            };
            if let Err(e) = self.inner.transport.invoke(endpoint, request).await {
                // At-least-once within a session only; a silo mid-failure
                // re-registers its subscriptions when it comes back.
                warn!(stream = %stream, endpoint = %endpoint, error = %e, "stream relay failed");
            }
        }
        Ok(())
    }

    /// Publish a typed event
    pub async fn publish_typed<M: Message>(&self, stream: &StreamId, event: &M) -> Result<()> {
        self.publish_stream(stream, codec::encode(event)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{
        eventually, CounterGrain, CounterProbe, CounterValue, TestCluster,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn counter_identity(n: u128) -> GrainIdentity {
        GrainIdentity::guid("counter", uuid::Uuid::from_u128(n))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn thousand_concurrent_increments_count_exactly() {
        let probe = CounterProbe::default();
        let registration_probe = probe.clone();
        let cluster = TestCluster::start(
            3,
            |_| {},
            move || {
                vec![CounterGrain::registration(
                    "counter",
                    registration_probe.clone(),
                )]
            },
        )
        .await;

        let identity = counter_identity(42);
        let mut joins = Vec::new();
        for n in 0..1000usize {
            let runtime = cluster.runtime(n % 3);
            let identity = identity.clone();
            joins.push(tokio::spawn(async move {
                runtime
                    .invoke_typed::<_, CounterValue>(
                        &identity,
                        "incr",
                        &CounterValue { value: 0 },
                    )
                    .await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let value: CounterValue = cluster
            .runtime(0)
            .invoke_typed(&identity, "get", &CounterValue { value: 0 })
            .await
            .unwrap();
        assert_eq!(value.value, 1000);
        // Turns never overlapped anywhere in the cluster
        assert_eq!(probe.max_overlap.load(Ordering::SeqCst), 1);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_activation_is_collected_and_recreated() {
        let probe = CounterProbe::default();
        let registration_probe = probe.clone();
        let cluster = TestCluster::start(
            1,
            |config| config.runtime.idle_timeout_secs = 1,
            move || {
                vec![CounterGrain::registration(
                    "counter",
                    registration_probe.clone(),
                )]
            },
        )
        .await;

        let identity = counter_identity(7);
        let runtime = cluster.runtime(0);
        let _: CounterValue = runtime
            .invoke_typed(&identity, "incr", &CounterValue { value: 0 })
            .await
            .unwrap();
        assert_eq!(probe.activations.load(Ordering::SeqCst), 1);

        // Let idle GC collect the activation, then call again
        tokio::time::sleep(StdDuration::from_millis(2500)).await;
        let value: CounterValue = runtime
            .invoke_typed(&identity, "incr", &CounterValue { value: 0 })
            .await
            .unwrap();

        // State survived the collection; a fresh activation served the call
        assert_eq!(value.value, 2);
        assert_eq!(probe.activations.load(Ordering::SeqCst), 2);

        cluster.stop().await;
    }

    struct WorkerGrain {
        instance: usize,
    }

    #[async_trait]
    impl Grain for WorkerGrain {
        async fn handle(&mut self, _ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
            match call.method.as_str() {
                "whoami" => Ok(codec::encode(&CounterValue {
                    value: self.instance as u64,
                })),
                other => Err(Error::BadRequest(format!("unknown method {other:?}"))),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stateless_workers_load_balance_within_bound() {
        let instances = Arc::new(AtomicUsize::new(0));
        let registration_instances = instances.clone();
        let cluster = TestCluster::start(
            1,
            |_| {},
            move || {
                let instances = registration_instances.clone();
                vec![GrainRegistration::stateless_worker(
                    "item-roller",
                    3,
                    move |_| WorkerGrain {
                        instance: instances.fetch_add(1, Ordering::SeqCst),
                    },
                )]
            },
        )
        .await;

        let identity = GrainIdentity::text("item-roller", "pool");
        let runtime = cluster.runtime(0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..12 {
            let value: CounterValue = runtime
                .invoke_typed(&identity, "whoami", &CounterValue { value: 0 })
                .await
                .unwrap();
            seen.insert(value.value);
        }

        // Round-robin used more than one worker but stayed within the bound
        assert!(seen.len() > 1, "expected load balancing, saw {seen:?}");
        assert!(seen.len() <= 3);
        assert!(instances.load(Ordering::SeqCst) <= 3);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn killed_silo_fails_over_with_last_committed_state() {
        let probe = CounterProbe::default();
        let registration_probe = probe.clone();
        let mut cluster = TestCluster::start(
            3,
            |_| {},
            move || {
                vec![CounterGrain::registration(
                    "counter",
                    registration_probe.clone(),
                )]
            },
        )
        .await;

        // Pick an identity and find which silo owns it
        let identity = counter_identity(1337);
        let owner = cluster.runtime(0).directory().locate(&identity).unwrap();
        let owner_index = (0..3)
            .find(|i| {
                cluster.silos[*i]
                    .as_ref()
                    .is_some_and(|s| s.endpoint() == owner.endpoint)
            })
            .expect("owner is one of the silos");
        let caller_index = (0..3).find(|i| *i != owner_index).unwrap();
        let caller = cluster.runtime(caller_index);

        for _ in 0..5 {
            let _: CounterValue = caller
                .invoke_typed(&identity, "incr", &CounterValue { value: 0 })
                .await
                .unwrap();
        }

        cluster.kill(owner_index).await;

        // Survivors must vote the silo dead, re-elect an owner, and read
        // the last committed state
        let value = eventually(StdDuration::from_secs(20), || {
            let caller = caller.clone();
            let identity = identity.clone();
            async move {
                caller
                    .invoke_typed::<_, CounterValue>(&identity, "get", &CounterValue { value: 0 })
                    .await
            }
        })
        .await
        .unwrap();
        assert_eq!(value.value, 5);

        // And the re-homed activation accepts writes
        let value: CounterValue = caller
            .invoke_typed(&identity, "incr", &CounterValue { value: 0 })
            .await
            .unwrap();
        assert_eq!(value.value, 6);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_shutdown_rehomes_activations() {
        let probe = CounterProbe::default();
        let registration_probe = probe.clone();
        let mut cluster = TestCluster::start(
            2,
            |_| {},
            move || {
                vec![CounterGrain::registration(
                    "counter",
                    registration_probe.clone(),
                )]
            },
        )
        .await;

        // Whichever silo owns the identity gets shut down; the other calls
        let identity = counter_identity(4242);
        let owner = cluster.runtime(0).directory().locate(&identity).unwrap();
        let owner_index = (0..2)
            .find(|i| {
                cluster.silos[*i]
                    .as_ref()
                    .is_some_and(|s| s.endpoint() == owner.endpoint)
            })
            .expect("owner is one of the silos");
        let caller = cluster.runtime(1 - owner_index);

        for _ in 0..3 {
            let _: CounterValue = caller
                .invoke_typed(&identity, "incr", &CounterValue { value: 0 })
                .await
                .unwrap();
        }

        cluster.shutdown(owner_index).await.unwrap();

        // A clean shutdown marks the row dead immediately; no voting needed
        let value = eventually(StdDuration::from_secs(10), || {
            let caller = caller.clone();
            let identity = identity.clone();
            async move {
                caller
                    .invoke_typed::<_, CounterValue>(&identity, "get", &CounterValue { value: 0 })
                    .await
            }
        })
        .await
        .unwrap();
        assert_eq!(value.value, 3);

        cluster.stop().await;
    }

    struct TimerGrain {
        ticks: u64,
    }

    #[async_trait]
    impl Grain for TimerGrain {
        async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
            ctx.register_timer(
                "tick",
                StdDuration::from_millis(100),
                Some(StdDuration::from_millis(100)),
            );
            Ok(())
        }

        async fn handle(&mut self, _ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
            match call.method.as_str() {
                "read" => Ok(codec::encode(&CounterValue { value: self.ticks })),
                other => Err(Error::BadRequest(format!("unknown method {other:?}"))),
            }
        }

        async fn on_timer(&mut self, _ctx: &mut GrainContext, _timer: &str) -> Result<()> {
            self.ticks += 1;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_timers_fire_on_the_turn_loop() {
        let cluster = TestCluster::start(
            1,
            |_| {},
            || vec![GrainRegistration::new("ticker", |_| TimerGrain { ticks: 0 })],
        )
        .await;

        let identity = GrainIdentity::text("ticker", "t1");
        let runtime = cluster.runtime(0);
        // First call creates the activation and starts the timer
        let _: CounterValue = runtime
            .invoke_typed(&identity, "read", &CounterValue { value: 0 })
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(650)).await;
        let value: CounterValue = runtime
            .invoke_typed(&identity, "read", &CounterValue { value: 0 })
            .await
            .unwrap();
        assert!(value.value >= 2, "expected several ticks, got {}", value.value);

        cluster.stop().await;
    }

    struct ReminderCounterGrain {
        state: Option<crate::runtime::grain::PersistentState<crate::testkit::CounterState>>,
    }

    #[async_trait]
    impl Grain for ReminderCounterGrain {
        async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
            self.state = Some(crate::runtime::grain::PersistentState::load(ctx).await?);
            ctx.register_reminder("decay", chrono::Utc::now(), 1).await?;
            Ok(())
        }

        async fn handle(&mut self, _ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
            match call.method.as_str() {
                "read" => Ok(codec::encode(&CounterValue {
                    value: self.state.as_ref().unwrap().get().value,
                })),
                other => Err(Error::BadRequest(format!("unknown method {other:?}"))),
            }
        }

        async fn on_reminder(&mut self, ctx: &mut GrainContext, _reminder: &str) -> Result<()> {
            let state = self.state.as_mut().unwrap();
            state.get_mut().value += 1;
            state.save(ctx).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reminders_fire_from_the_durable_table() {
        let cluster = TestCluster::start(
            1,
            |_| {},
            || {
                vec![GrainRegistration::new("decaying", |_| {
                    ReminderCounterGrain { state: None }
                })]
            },
        )
        .await;

        let identity = GrainIdentity::guid("decaying", uuid::Uuid::from_u128(5));
        let runtime = cluster.runtime(0);
        // Activate; the grain registers its reminder
        let _: CounterValue = runtime
            .invoke_typed(&identity, "read", &CounterValue { value: 0 })
            .await
            .unwrap();

        let value = eventually(StdDuration::from_secs(10), || {
            let runtime = runtime.clone();
            let identity = identity.clone();
            async move {
                let value: CounterValue = runtime
                    .invoke_typed(&identity, "read", &CounterValue { value: 0 })
                    .await?;
                if value.value >= 1 {
                    Ok(value)
                } else {
                    Err(Error::transient("reminder not fired yet"))
                }
            }
        })
        .await
        .unwrap();
        assert!(value.value >= 1);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streams_fan_out_across_silos() {
        let cluster = TestCluster::start(2, |_| {}, Vec::new).await;

        let stream = StreamId::new("trade", "offers");
        let mut subscription = cluster.runtime(1).subscribe_stream(&stream).await.unwrap();

        cluster
            .runtime(0)
            .publish_typed(
                &stream,
                &CounterValue { value: 99 },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(StdDuration::from_secs(5), subscription.next())
            .await
            .expect("event within deadline")
            .expect("stream open");
        let value: CounterValue = event.decode().unwrap();
        assert_eq!(value.value, 99);

        cluster.stop().await;
    }
}
