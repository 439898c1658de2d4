//! Test scaffolding: single-process clusters over in-memory backends
//!
//! Builds real silos wired to a shared in-memory membership table, grain
//! store, reminder store, and in-process transport, so cluster behavior
//! (placement, failover, transactions) is exercised end to end without
//! Postgres, Redis, or sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::InMemoryMembershipTable;
use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::grain::{Grain, GrainCall, GrainContext, GrainRegistration, PersistentState};
use crate::runtime::transport::InProcessNetwork;
use crate::runtime::{RuntimeHandle, Silo, SiloBuilder};
use crate::storage::{MemoryGrainStorage, MemoryReminderStore};

/// Shared backends plus the running silos of one test cluster
pub(crate) struct TestCluster {
    pub membership: Arc<InMemoryMembershipTable>,
    pub storage: Arc<MemoryGrainStorage>,
    pub reminders: Arc<MemoryReminderStore>,
    pub network: Arc<InProcessNetwork>,
    pub silos: Vec<Option<Silo>>,
    next_port: u16,
    configure: Arc<dyn Fn(&mut Config) + Send + Sync>,
    register: Arc<dyn Fn() -> Vec<GrainRegistration> + Send + Sync>,
}

impl TestCluster {
    /// Start `count` silos sharing in-memory backends. `configure` tweaks
    /// each silo's config; `register` produces the grain registrations
    /// every silo hosts.
    pub async fn start(
        count: usize,
        configure: impl Fn(&mut Config) + Send + Sync + 'static,
        register: impl Fn() -> Vec<GrainRegistration> + Send + Sync + 'static,
    ) -> TestCluster {
        let mut cluster = TestCluster {
            membership: Arc::new(InMemoryMembershipTable::new()),
            storage: Arc::new(MemoryGrainStorage::new()),
            reminders: Arc::new(MemoryReminderStore::new()),
            network: InProcessNetwork::new(),
            silos: Vec::new(),
            next_port: 7100,
            configure: Arc::new(configure),
            register: Arc::new(register),
        };
        for _ in 0..count {
            cluster.spawn_silo().await.expect("test silo starts");
        }
        cluster.wait_for_convergence().await;
        cluster
    }

    /// Wait until every running silo's view contains every running silo,
    /// so tests start from a converged ring
    pub async fn wait_for_convergence(&self) {
        let expected = self.silos.iter().flatten().count();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let converged = self
                .silos
                .iter()
                .flatten()
                .all(|silo| silo.runtime().directory().view().members.len() == expected);
            if converged {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster views did not converge"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn test_config(&mut self) -> Config {
        let mut config = Config::default();
        config.silo.deployment_id = "test".to_string();
        config.silo.port = self.next_port;
        self.next_port += 1;
        // Fast cluster dynamics for tests
        config.cluster.heartbeat_secs = 1;
        config.cluster.missed_heartbeats = 3;
        config.runtime.call_timeout_secs = 10;
        config.runtime.reminder_scan_secs = 1;
        (self.configure)(&mut config);
        config
    }

    /// Add one more silo to the cluster
    pub async fn spawn_silo(&mut self) -> Result<usize> {
        let config = self.test_config();
        let silo = SiloBuilder::new(config)
            .with_membership_table(self.membership.clone())
            .with_storage(self.storage.clone())
            .with_reminder_store(self.reminders.clone())
            .with_in_process_network(self.network.clone());
        let silo = (self.register)()
            .into_iter()
            .fold(silo, |builder, registration| builder.register(registration))
            .start()
            .await?;
        self.silos.push(Some(silo));
        Ok(self.silos.len() - 1)
    }

    /// Runtime handle of silo `index`
    pub fn runtime(&self, index: usize) -> RuntimeHandle {
        self.silos[index]
            .as_ref()
            .expect("silo still running")
            .runtime()
    }

    /// First silo still running
    pub fn any_runtime(&self) -> RuntimeHandle {
        self.silos
            .iter()
            .flatten()
            .next()
            .expect("at least one silo running")
            .runtime()
    }

    /// Abrupt crash of silo `index`: no membership updates, peers must
    /// detect the loss by suspect voting
    pub async fn kill(&mut self, index: usize) {
        if let Some(silo) = self.silos[index].take() {
            silo.kill().await;
        }
    }

    /// Graceful shutdown of silo `index`
    pub async fn shutdown(&mut self, index: usize) -> Result<()> {
        match self.silos[index].take() {
            Some(silo) => silo.shutdown().await,
            None => Ok(()),
        }
    }

    /// Tear the whole cluster down
    pub async fn stop(mut self) {
        for index in 0..self.silos.len() {
            let _ = self.shutdown(index).await;
        }
    }
}

/// Poll `attempt` until it succeeds or `within` elapses
pub(crate) async fn eventually<T, F, Fut>(within: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let deadline = tokio::time::Instant::now() + within;
    let mut last_error = Error::transient("never attempted");
    while tokio::time::Instant::now() < deadline {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e,
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(last_error)
}

// ============================================================================
// Shared test grains
// ============================================================================

/// Persisted counter state
#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct CounterState {
    #[prost(uint64, tag = "1")]
    pub value: u64,
}

/// Counter request/response
#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct CounterValue {
    #[prost(uint64, tag = "1")]
    pub value: u64,
}

/// Cluster-wide probe shared by every silo's counter registration
#[derive(Clone, Default)]
pub(crate) struct CounterProbe {
    /// `on_activate` calls across the whole cluster
    pub activations: Arc<AtomicUsize>,
    /// Turns currently executing anywhere in the cluster
    pub in_turn: Arc<AtomicUsize>,
    /// Highest overlap ever observed; must stay at one
    pub max_overlap: Arc<AtomicUsize>,
}

/// Persistent counter grain used by placement and failover tests
pub(crate) struct CounterGrain {
    state: Option<PersistentState<CounterState>>,
    probe: CounterProbe,
}

impl CounterGrain {
    pub fn registration(type_name: &str, probe: CounterProbe) -> GrainRegistration {
        GrainRegistration::new(type_name.to_string(), move |_| CounterGrain {
            state: None,
            probe: probe.clone(),
        })
    }
}

#[async_trait]
impl Grain for CounterGrain {
    async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
        self.probe.activations.fetch_add(1, Ordering::SeqCst);
        self.state = Some(PersistentState::load(ctx).await?);
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        let overlap = self.probe.in_turn.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_overlap.fetch_max(overlap, Ordering::SeqCst);
        // Make overlap observable if turn isolation ever broke
        tokio::time::sleep(Duration::from_micros(100)).await;

        let state = self.state.as_mut().expect("state loaded");
        let result = match call.method.as_str() {
            "incr" => {
                state.get_mut().value += 1;
                state.save(ctx).await?;
                Ok(codec::encode(&CounterValue {
                    value: state.get().value,
                }))
            }
            "get" => Ok(codec::encode(&CounterValue {
                value: state.get().value,
            })),
            other => Err(Error::BadRequest(format!("unknown counter method {other:?}"))),
        };

        self.probe.in_turn.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
