//! Silo lifecycle
//!
//! [`SiloBuilder`] assembles one worker node in the order the cluster
//! contract requires: persistence first, then grain type registration,
//! the membership insert, startup tasks, and only then the external
//! listener. A startup-task failure is fatal: the silo marks itself dead
//! and the join aborts.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::membership::{MembershipTable, SiloStatus};
use crate::cluster::sql::{ensure_membership_schema, SqlMembershipTable};
use crate::cluster::{GrainDirectory, InMemoryMembershipTable, MembershipService};
use crate::config::Config;
use crate::error::Result;
use crate::ratelimit::{RateLimitConfigGrain, RateLimitingConfiguration, RATE_LIMIT_CONFIG_GRAIN};
use crate::runtime::catalog::ActivationCatalog;
use crate::runtime::grain::GrainRegistration;
use crate::runtime::reminders::ReminderService;
use crate::runtime::startup::StartupTask;
use crate::runtime::transport::{
    self, InProcessNetwork, InProcessTransport, SiloTransport, TcpTransport,
};
use crate::runtime::{RuntimeHandle, RuntimeInner};
use crate::session::{ConnectionTicketGrain, CONNECTION_TICKET_GRAIN};
use crate::storage::{
    ensure_storage_schema, GrainStorage, MemoryGrainStorage, MemoryReminderStore, ReminderStore,
    SqlGrainStorage, SqlReminderStore,
};
use crate::streams::{StreamBroker, SubscriptionDirectoryGrain, SUBSCRIPTION_DIRECTORY_GRAIN};
use crate::txn::{TransactionCoordinatorGrain, TXN_COORDINATOR_GRAIN};

/// Builder for one silo
pub struct SiloBuilder {
    config: Config,
    registrations: Vec<GrainRegistration>,
    startup_tasks: Vec<Box<dyn StartupTask>>,
    membership_table: Option<Arc<dyn MembershipTable>>,
    storage: Option<Arc<dyn GrainStorage>>,
    reminder_store: Option<Arc<dyn ReminderStore>>,
    network: Option<Arc<InProcessNetwork>>,
    rate_limit_defaults: RateLimitingConfiguration,
}

impl SiloBuilder {
    /// Start building a silo from configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registrations: Vec::new(),
            startup_tasks: Vec::new(),
            membership_table: None,
            storage: None,
            reminder_store: None,
            network: None,
            rate_limit_defaults: RateLimitingConfiguration::builtin_defaults(),
        }
    }

    /// Register an application grain type
    pub fn register(mut self, registration: GrainRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Append a startup task; tasks run in declared order
    pub fn with_startup_task(mut self, task: impl StartupTask) -> Self {
        self.startup_tasks.push(Box::new(task));
        self
    }

    /// Use a specific membership table (tests, single-process clusters)
    pub fn with_membership_table(mut self, table: Arc<dyn MembershipTable>) -> Self {
        self.membership_table = Some(table);
        self
    }

    /// Use a specific grain state store
    pub fn with_storage(mut self, storage: Arc<dyn GrainStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a specific reminder store
    pub fn with_reminder_store(mut self, store: Arc<dyn ReminderStore>) -> Self {
        self.reminder_store = Some(store);
        self
    }

    /// Run silo-to-silo traffic over an in-process network instead of TCP
    pub fn with_in_process_network(mut self, network: Arc<InProcessNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Override the first-boot rate-limit configuration
    pub fn with_rate_limit_defaults(mut self, defaults: RateLimitingConfiguration) -> Self {
        self.rate_limit_defaults = defaults;
        self
    }

    /// Bring the silo up: persistence, registration, membership join,
    /// startup tasks, external listener.
    pub async fn start(self) -> Result<Silo> {
        let config = self.config.clone();
        let cancel = CancellationToken::new();

        // Persistence providers: explicit overrides win, then the SQL
        // store from configuration, then in-memory for single-process use
        let mut storage = self.storage;
        let mut reminder_store = self.reminder_store;
        let mut membership_table = self.membership_table;
        if let Some(sql) = &config.storage {
            if storage.is_none() || reminder_store.is_none() || membership_table.is_none() {
                let pool = crate::storage::sql::create_pool(sql).await?;
                ensure_storage_schema(&pool).await?;
                ensure_membership_schema(&pool).await?;
                storage = storage.or_else(|| Some(Arc::new(SqlGrainStorage::new(pool.clone()))));
                reminder_store =
                    reminder_store.or_else(|| Some(Arc::new(SqlReminderStore::new(pool.clone()))));
                membership_table =
                    membership_table.or_else(|| Some(Arc::new(SqlMembershipTable::new(pool))));
            }
        }
        let storage = storage.unwrap_or_else(|| {
            warn!("no SQL store configured; grain state is in-memory and volatile");
            Arc::new(MemoryGrainStorage::new())
        });
        let reminder_store =
            reminder_store.unwrap_or_else(|| Arc::new(MemoryReminderStore::new()));
        let membership_table = membership_table.unwrap_or_else(|| {
            warn!("no SQL store configured; membership roster is in-memory and volatile");
            Arc::new(InMemoryMembershipTable::new())
        });

        // Grain type registration: application types plus the built-ins
        // every silo hosts
        let mut registrations = self.registrations;
        {
            let txn_config = config.transactions.clone();
            registrations.push(GrainRegistration::new(TXN_COORDINATOR_GRAIN, move |_| {
                TransactionCoordinatorGrain::new(txn_config.clone())
            }));
        }
        registrations.push(GrainRegistration::new(SUBSCRIPTION_DIRECTORY_GRAIN, |_| {
            SubscriptionDirectoryGrain::new()
        }));
        {
            let defaults = self.rate_limit_defaults.clone();
            registrations.push(GrainRegistration::new(RATE_LIMIT_CONFIG_GRAIN, move |_| {
                RateLimitConfigGrain::new(defaults.clone())
            }));
        }
        {
            let session_config = config.session.clone();
            registrations.push(GrainRegistration::new(CONNECTION_TICKET_GRAIN, move |_| {
                ConnectionTicketGrain::new(session_config.clone())
            }));
        }

        // Membership insert: the row appears in `joining` status
        let membership = MembershipService::join(
            membership_table,
            config.silo.deployment_id.clone(),
            config.cluster.clone(),
            config.silo.endpoint(),
            config.silo.silo_name(),
            config.silo.proxy_port,
        )
        .await?;

        let transport: Arc<dyn SiloTransport> = match &self.network {
            Some(network) => Arc::new(InProcessTransport::new(network.clone())),
            None => Arc::new(TcpTransport::new()),
        };
        let catalog = Arc::new(ActivationCatalog::new(registrations, cancel.child_token()));
        let directory = GrainDirectory::new(
            membership.local_address().clone(),
            membership.view_receiver(),
        );
        let runtime = RuntimeHandle::new(RuntimeInner {
            service_id: config.silo.deployment_id.clone(),
            config: config.runtime.clone(),
            directory,
            storage,
            reminder_store,
            broker: StreamBroker::default(),
            transport,
            catalog,
            registered_streams: dashmap::DashSet::new(),
        });

        // Heartbeats and view refresh run from here on
        tokio::spawn(membership.clone().run(cancel.child_token()));

        membership.set_status(SiloStatus::Active).await?;

        // Startup tasks gate external traffic; any failure aborts the join
        for task in &self.startup_tasks {
            info!(task = task.name(), "running startup task");
            if let Err(e) = task.run(&runtime).await {
                error!(task = task.name(), error = %e, "startup task failed, aborting silo join");
                let _ = membership.set_status(SiloStatus::Dead).await;
                cancel.cancel();
                return Err(e);
            }
        }

        // Open the external listener last
        let endpoint = config.silo.endpoint();
        match &self.network {
            Some(network) => {
                network.register(endpoint.clone(), runtime.invocation_handler());
            }
            None => {
                let listener = TcpListener::bind(&endpoint).await?;
                info!(endpoint = %endpoint, "silo listener open");
                tokio::spawn(transport::serve(
                    listener,
                    runtime.invocation_handler(),
                    cancel.child_token(),
                ));
            }
        }

        // Reminder delivery
        tokio::spawn(ReminderService::new(runtime.clone()).run(cancel.child_token()));

        // Eviction watchdog: a dead membership row terminates the silo
        {
            let evicted = membership.evicted_token();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                evicted.cancelled().await;
                cancel.cancel();
            });
        }

        info!(silo = %membership.local_address(), "silo started");
        Ok(Silo {
            runtime,
            membership,
            network: self.network,
            endpoint,
            cancel,
        })
    }
}

/// One running worker node
pub struct Silo {
    runtime: RuntimeHandle,
    membership: Arc<MembershipService>,
    network: Option<Arc<InProcessNetwork>>,
    endpoint: String,
    cancel: CancellationToken,
}

impl Silo {
    /// Handle for invoking grains hosted by this cluster
    pub fn runtime(&self) -> RuntimeHandle {
        self.runtime.clone()
    }

    /// This silo's silo-to-silo endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Token observed by every subsystem of this silo
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until SIGTERM/SIGINT (or eviction), then shut down gracefully
    pub async fn run(self) -> Result<()> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = shutdown_signal() => info!("shutdown signal received"),
            _ = cancel.cancelled() => warn!("silo cancelled internally"),
        }
        self.shutdown().await
    }

    /// Graceful shutdown: leave the ring, drain activations, mark dead
    pub async fn shutdown(self) -> Result<()> {
        info!(endpoint = %self.endpoint, "silo shutting down");
        if let Err(e) = self.membership.set_status(SiloStatus::ShuttingDown).await {
            warn!(error = %e, "could not announce shutdown");
        }
        if let Some(network) = &self.network {
            network.deregister(&self.endpoint);
        }
        self.runtime.catalog().shutdown();
        if let Err(e) = self.membership.set_status(SiloStatus::Dead).await {
            warn!(error = %e, "could not mark membership row dead");
        }
        self.cancel.cancel();
        info!("silo shutdown complete");
        Ok(())
    }

    /// Abrupt termination without membership updates: the cluster must
    /// detect the loss via suspect voting. For chaos tooling and tests.
    pub async fn kill(self) {
        warn!(endpoint = %self.endpoint, "silo killed");
        if let Some(network) = &self.network {
            network.deregister(&self.endpoint);
        }
        self.cancel.cancel();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
