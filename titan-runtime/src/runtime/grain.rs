//! Grain trait, activation context, and persistent state handle

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{self, GrainState};
use crate::error::{Error, Result};
use crate::identity::GrainIdentity;
use crate::runtime::RuntimeHandle;
use crate::storage::{GrainStorage, ReminderEntry};

/// Transaction scope attached to a call enrolled in a coordinator-driven
/// transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnContext {
    /// Transaction id, also the coordinator grain's key
    pub txid: Uuid,
    /// Snapshot read timestamp in microseconds since the epoch
    pub read_ts: u64,
}

/// One inbound message for a grain turn
#[derive(Debug, Clone)]
pub struct GrainCall {
    /// Method selector
    pub method: String,
    /// Encoded request body
    pub body: Vec<u8>,
    /// Transaction scope, when the call is part of one
    pub txn: Option<TxnContext>,
}

impl GrainCall {
    /// Build a call with an encoded body
    pub fn new(method: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            body,
            txn: None,
        }
    }

    /// Build a call carrying a typed request
    pub fn typed<M: prost::Message>(method: impl Into<String>, request: &M) -> Self {
        Self::new(method, codec::encode(request))
    }

    /// Decode the body as a typed request
    pub fn request<M: prost::Message + Default>(&self) -> Result<M> {
        codec::decode(&self.body)
    }

    /// The transaction scope, or an application error when the method
    /// requires one
    pub fn require_txn(&self) -> Result<TxnContext> {
        self.txn
            .ok_or_else(|| Error::Application(format!("{} requires a transaction", self.method)))
    }
}

/// A virtual actor hosted by the runtime.
///
/// Turns are strictly serialized: the runtime never overlaps two handler
/// invocations for the same activation, so `&mut self` state needs no
/// further synchronization. Re-entrancy is disallowed; a call cycle back
/// into an activation that is awaiting one of its own calls will queue
/// behind the current turn and deadlock. Design call graphs accordingly.
#[async_trait]
pub trait Grain: Send + 'static {
    /// Runs before the first turn. Failure rejects every queued message
    /// and destroys the activation.
    async fn on_activate(&mut self, _ctx: &mut GrainContext) -> Result<()> {
        Ok(())
    }

    /// Process one call and produce the encoded response
    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>>;

    /// A registered timer fired; runs on the activation's turn loop
    async fn on_timer(&mut self, _ctx: &mut GrainContext, _timer: &str) -> Result<()> {
        Ok(())
    }

    /// A persistent reminder fired
    async fn on_reminder(&mut self, _ctx: &mut GrainContext, _reminder: &str) -> Result<()> {
        Ok(())
    }

    /// Runs once when the activation is destroyed (idle GC, shutdown, or a
    /// hard error)
    async fn on_deactivate(&mut self, _ctx: &mut GrainContext) -> Result<()> {
        Ok(())
    }
}

/// Placement policy for a grain type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Exactly one activation per identity cluster-wide
    Single,
    /// Up to `max_local` interchangeable activations per silo, round-robin
    /// delivery, no affinity between calls
    StatelessWorker {
        /// Per-silo activation bound
        max_local: usize,
    },
}

type Factory = Box<dyn Fn(&GrainIdentity) -> Box<dyn Grain> + Send + Sync>;

/// A grain type known to the silo
pub struct GrainRegistration {
    /// Registered type name, the first half of every identity
    pub type_name: String,
    /// Placement policy
    pub placement: Placement,
    factory: Factory,
}

impl GrainRegistration {
    /// Register a single-activation grain type
    pub fn new<F, G>(type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&GrainIdentity) -> G + Send + Sync + 'static,
        G: Grain,
    {
        Self {
            type_name: type_name.into(),
            placement: Placement::Single,
            factory: Box::new(move |identity| Box::new(factory(identity))),
        }
    }

    /// Register a stateless-worker grain type with a per-silo bound
    pub fn stateless_worker<F, G>(
        type_name: impl Into<String>,
        max_local: usize,
        factory: F,
    ) -> Self
    where
        F: Fn(&GrainIdentity) -> G + Send + Sync + 'static,
        G: Grain,
    {
        Self {
            type_name: type_name.into(),
            placement: Placement::StatelessWorker {
                max_local: max_local.max(1),
            },
            factory: Box::new(move |identity| Box::new(factory(identity))),
        }
    }

    pub(crate) fn create(&self, identity: &GrainIdentity) -> Box<dyn Grain> {
        (self.factory)(identity)
    }
}

/// Commands a turn may issue against its own activation; applied by the
/// turn loop between turns
#[derive(Debug)]
pub(crate) enum ActivationCommand {
    RegisterTimer {
        name: String,
        due_in: Duration,
        period: Option<Duration>,
    },
    CancelTimer {
        name: String,
    },
    Deactivate,
}

/// Per-activation view of the runtime passed into every grain hook
pub struct GrainContext {
    identity: GrainIdentity,
    runtime: RuntimeHandle,
    commands: mpsc::UnboundedSender<ActivationCommand>,
}

impl GrainContext {
    pub(crate) fn new(
        identity: GrainIdentity,
        runtime: RuntimeHandle,
        commands: mpsc::UnboundedSender<ActivationCommand>,
    ) -> Self {
        Self {
            identity,
            runtime,
            commands,
        }
    }

    /// This activation's identity
    pub fn identity(&self) -> &GrainIdentity {
        &self.identity
    }

    /// The hosting runtime, for calls to other grains and streams
    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Deployment-wide storage namespace
    pub fn service_id(&self) -> &str {
        self.runtime.service_id()
    }

    /// The grain state store
    pub fn storage(&self) -> &Arc<dyn GrainStorage> {
        self.runtime.storage()
    }

    /// Register (or reschedule) a named timer on this activation's turn
    /// loop. One-shot when `period` is `None`.
    pub fn register_timer(&self, name: impl Into<String>, due_in: Duration, period: Option<Duration>) {
        let _ = self.commands.send(ActivationCommand::RegisterTimer {
            name: name.into(),
            due_in,
            period,
        });
    }

    /// Cancel a named timer
    pub fn cancel_timer(&self, name: impl Into<String>) {
        let _ = self.commands.send(ActivationCommand::CancelTimer { name: name.into() });
    }

    /// Destroy this activation after the current turn completes
    pub fn deactivate(&self) {
        let _ = self.commands.send(ActivationCommand::Deactivate);
    }

    /// Register a persistent reminder that survives silo restarts
    pub async fn register_reminder(
        &self,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        period_secs: u64,
    ) -> Result<()> {
        let entry = ReminderEntry::new(self.identity.clone(), name, start_time, period_secs);
        self.runtime
            .reminder_store()
            .upsert(self.service_id(), &entry)
            .await
    }

    /// Remove a persistent reminder
    pub async fn unregister_reminder(&self, name: &str) -> Result<()> {
        self.runtime
            .reminder_store()
            .remove(self.service_id(), &self.identity, name)
            .await
    }
}

/// Versioned persistent state handle for a grain.
///
/// Loads through the persistence provider on activation, tracks the
/// stored version, and writes with optimistic concurrency. A save that
/// fails with a version conflict must be treated as fatal for the
/// activation: under single-activation it means the store was modified
/// out-of-band, and during failover races it means this activation lost.
pub struct PersistentState<S: GrainState> {
    state: S,
    version: Option<u64>,
    /// Whether a payload (not just a tombstone) existed at load time
    existed: bool,
}

impl<S: GrainState> PersistentState<S> {
    /// Load state for the context's identity, defaulting when absent
    pub async fn load(ctx: &GrainContext) -> Result<Self> {
        let stored = ctx
            .storage()
            .read(ctx.service_id(), ctx.identity())
            .await?;
        let existed = stored.payload.is_some();
        let state = match &stored.payload {
            Some(bytes) => codec::decode(bytes)?,
            None => S::default(),
        };
        Ok(Self {
            state,
            version: stored.version,
            existed,
        })
    }

    /// Read access to the state
    pub fn get(&self) -> &S {
        &self.state
    }

    /// Mutable access; mutations are in-process until [`save`](Self::save)
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Replace the whole state
    pub fn set(&mut self, state: S) {
        self.state = state;
    }

    /// Whether a payload existed when this handle was loaded
    pub fn record_existed(&self) -> bool {
        self.existed
    }

    /// The stored version this handle is based on
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Persist the current state with optimistic concurrency
    pub async fn save(&mut self, ctx: &GrainContext) -> Result<()> {
        let payload = codec::encode(&self.state);
        let version = ctx
            .storage()
            .write(ctx.service_id(), ctx.identity(), payload, self.version)
            .await?;
        self.version = Some(version);
        self.existed = true;
        Ok(())
    }

    /// Clear the stored payload and reset to defaults
    pub async fn clear(&mut self, ctx: &GrainContext) -> Result<()> {
        let version = ctx
            .storage()
            .clear(ctx.service_id(), ctx.identity(), self.version)
            .await?;
        self.version = Some(version);
        self.state = S::default();
        self.existed = false;
        Ok(())
    }
}
