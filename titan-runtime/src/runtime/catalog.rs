//! Per-silo activation catalog
//!
//! Holds the mailboxes of every live activation on this silo. Single
//! placement keeps at most one activation per identity; stateless-worker
//! placement keeps a bounded pool per identity with round-robin delivery.
//! Activations remove themselves on exit (idle GC, hard error, shutdown),
//! and a delivery that races such an exit recreates the activation once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::GrainIdentity;
use crate::runtime::activation::{
    spawn_activation, ActivationHandle, ActivationMessage, ActivationSpec,
};
use crate::runtime::grain::{GrainCall, GrainRegistration, Placement};
use crate::runtime::RuntimeHandle;

struct WorkerPool {
    handles: Vec<ActivationHandle>,
    next: AtomicUsize,
}

/// The catalog of live activations on one silo
pub struct ActivationCatalog {
    registrations: HashMap<String, Arc<GrainRegistration>>,
    single: DashMap<GrainIdentity, ActivationHandle>,
    workers: DashMap<GrainIdentity, Arc<WorkerPool>>,
    cancel: CancellationToken,
}

impl ActivationCatalog {
    /// Build a catalog from the silo's registered grain types
    pub fn new(registrations: Vec<GrainRegistration>, cancel: CancellationToken) -> Self {
        let registrations = registrations
            .into_iter()
            .map(|r| (r.type_name.clone(), Arc::new(r)))
            .collect();
        Self {
            registrations,
            single: DashMap::new(),
            workers: DashMap::new(),
            cancel,
        }
    }

    /// Whether a grain type is registered on this silo
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.registrations.contains_key(type_name)
    }

    /// Count of live single-placement activations (stateless workers not
    /// included)
    pub fn activation_count(&self) -> usize {
        self.single.len()
    }

    /// Deliver a call to the local activation for `identity`, creating it
    /// on first use
    pub async fn invoke_local(
        self: &Arc<Self>,
        runtime: &RuntimeHandle,
        identity: &GrainIdentity,
        call: GrainCall,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        // One recreate attempt covers the race with idle GC
        for _ in 0..2 {
            let handle = self.handle_for(runtime, identity)?;
            let (reply_tx, reply_rx) = oneshot::channel();
            let message = ActivationMessage::Invoke {
                call: call.clone(),
                deadline,
                reply: reply_tx,
            };
            if handle.send(message).await.is_err() {
                self.forget(identity, handle.activation_id);
                continue;
            }
            return match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::transient(format!(
                    "activation {identity} dropped before replying"
                ))),
            };
        }
        Err(Error::transient(format!(
            "could not deliver to activation {identity}"
        )))
    }

    /// Deliver a reminder tick, creating the activation if needed
    pub async fn deliver_reminder(
        self: &Arc<Self>,
        runtime: &RuntimeHandle,
        identity: &GrainIdentity,
        name: &str,
    ) -> Result<()> {
        for _ in 0..2 {
            let handle = self.handle_for(runtime, identity)?;
            let message = ActivationMessage::Reminder {
                name: name.to_string(),
            };
            if handle.send(message).await.is_err() {
                self.forget(identity, handle.activation_id);
                continue;
            }
            return Ok(());
        }
        Err(Error::transient(format!(
            "could not deliver reminder to {identity}"
        )))
    }

    fn handle_for(
        self: &Arc<Self>,
        runtime: &RuntimeHandle,
        identity: &GrainIdentity,
    ) -> Result<ActivationHandle> {
        let registration = self
            .registrations
            .get(&identity.grain_type)
            .ok_or_else(|| {
                Error::Internal(format!("grain type {:?} not registered", identity.grain_type))
            })?
            .clone();

        match registration.placement {
            Placement::Single => {
                let entry = self
                    .single
                    .entry(identity.clone())
                    .or_insert_with(|| self.spawn(runtime, &registration, identity));
                Ok(entry.value().clone())
            }
            Placement::StatelessWorker { max_local } => {
                let pool = self
                    .workers
                    .entry(identity.clone())
                    .or_insert_with(|| {
                        let handles = (0..max_local)
                            .map(|_| self.spawn_worker(runtime, &registration, identity))
                            .collect();
                        Arc::new(WorkerPool {
                            handles,
                            next: AtomicUsize::new(0),
                        })
                    })
                    .clone();
                let index = pool.next.fetch_add(1, Ordering::Relaxed) % pool.handles.len();
                Ok(pool.handles[index].clone())
            }
        }
    }

    fn spawn(
        self: &Arc<Self>,
        runtime: &RuntimeHandle,
        registration: &Arc<GrainRegistration>,
        identity: &GrainIdentity,
    ) -> ActivationHandle {
        let catalog = Arc::downgrade(self);
        let spec = ActivationSpec {
            identity: identity.clone(),
            grain: registration.create(identity),
            idle_timeout: runtime.config().idle_timeout(),
            mailbox_capacity: runtime.config().mailbox_capacity,
            cancel: self.cancel.child_token(),
        };
        debug!(grain = %identity, "creating activation");
        spawn_activation(runtime.clone(), spec, move |identity, activation_id| {
            if let Some(catalog) = catalog.upgrade() {
                catalog.forget(identity, activation_id);
            }
        })
    }

    fn spawn_worker(
        self: &Arc<Self>,
        runtime: &RuntimeHandle,
        registration: &Arc<GrainRegistration>,
        identity: &GrainIdentity,
    ) -> ActivationHandle {
        let catalog = Arc::downgrade(self);
        let spec = ActivationSpec {
            identity: identity.clone(),
            grain: registration.create(identity),
            idle_timeout: runtime.config().idle_timeout(),
            mailbox_capacity: runtime.config().mailbox_capacity,
            cancel: self.cancel.child_token(),
        };
        spawn_activation(runtime.clone(), spec, move |identity, _activation_id| {
            // Workers leave as a set; drop the pool when any member exits
            if let Some(catalog) = catalog.upgrade() {
                catalog.workers.remove(identity);
            }
        })
    }

    /// Drop a catalog entry if it still refers to the given activation
    fn forget(&self, identity: &GrainIdentity, activation_id: u64) {
        self.single
            .remove_if(identity, |_, handle| handle.activation_id == activation_id);
    }

    /// Ask every live activation to drain and stop
    pub fn shutdown(&self) {
        for entry in self.single.iter() {
            entry.value().try_send(ActivationMessage::Stop);
        }
        for pool in self.workers.iter() {
            for handle in &pool.value().handles {
                handle.try_send(ActivationMessage::Stop);
            }
        }
        self.cancel.cancel();
        self.single.clear();
        self.workers.clear();
    }
}
