//! Grain persistence provider
//!
//! State blobs outlive activations; they are the system of record. Every
//! write is guarded by a monotonic version: it succeeds only when the
//! caller's expected version equals the stored one (both absent for a
//! first insert), and leaves `expected + 1` behind. Clearing writes a
//! tombstone (null payload, version + 1) so the optimistic chain survives
//! clear-then-recreate cycles.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::identity::GrainIdentity;

pub use memory::{MemoryGrainStorage, MemoryReminderStore};
pub use sql::{ensure_storage_schema, SqlGrainStorage, SqlReminderStore};

/// What a read returns: the payload (absent for tombstones and unwritten
/// identities) and the stored version (absent only when never written)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    /// Serialized state blob; `None` for tombstones
    pub payload: Option<Vec<u8>>,
    /// Current version; `None` when no row exists
    pub version: Option<u64>,
}

impl StoredState {
    /// Whether any row exists for the identity
    pub fn exists(&self) -> bool {
        self.version.is_some()
    }
}

/// Versioned grain state store
#[async_trait]
pub trait GrainStorage: Send + Sync + 'static {
    /// Read the current payload and version for an identity
    async fn read(&self, service_id: &str, identity: &GrainIdentity) -> Result<StoredState>;

    /// Write a payload if `expected` matches the stored version; returns
    /// the new version. Fails with [`Error::VersionConflict`] otherwise.
    ///
    /// [`Error::VersionConflict`]: crate::error::Error::VersionConflict
    async fn write(
        &self,
        service_id: &str,
        identity: &GrainIdentity,
        payload: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64>;

    /// Replace the row with a tombstone under the same optimistic rule;
    /// returns the tombstone's version
    async fn clear(
        &self,
        service_id: &str,
        identity: &GrainIdentity,
        expected: Option<u64>,
    ) -> Result<u64>;
}

/// One persistent reminder registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderEntry {
    /// Grain the reminder fires into
    pub identity: GrainIdentity,
    /// Reminder name, unique per grain
    pub name: String,
    /// First due time
    pub start_time: DateTime<Utc>,
    /// Repeat period in seconds; 0 means one-shot
    pub period_secs: u64,
    /// Routing hash of the identity, for owner-range scans
    pub grain_hash: u32,
    /// Bumped on every upsert, making re-registration idempotent
    pub version: i64,
}

impl ReminderEntry {
    /// Build a registration due first at `start_time`
    pub fn new(
        identity: GrainIdentity,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        period_secs: u64,
    ) -> Self {
        let grain_hash = identity.routing_hash();
        Self {
            identity,
            name: name.into(),
            start_time,
            period_secs,
            grain_hash,
            version: 0,
        }
    }

    /// The next due time at or after `now`
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.start_time > now {
            return Some(self.start_time);
        }
        if self.period_secs == 0 {
            // One-shot whose start already passed: due immediately
            return Some(now);
        }
        let elapsed = (now - self.start_time).num_seconds().max(0) as u64;
        let periods = elapsed / self.period_secs + 1;
        Some(self.start_time + chrono::Duration::seconds((periods * self.period_secs) as i64))
    }
}

/// Durable reminder registrations, keyed `(service-id, grain, name)`
#[async_trait]
pub trait ReminderStore: Send + Sync + 'static {
    /// Insert or update a registration; the stored version is bumped
    async fn upsert(&self, service_id: &str, entry: &ReminderEntry) -> Result<()>;

    /// Delete a registration; absent rows are a no-op
    async fn remove(&self, service_id: &str, identity: &GrainIdentity, name: &str) -> Result<()>;

    /// Read all registrations for a deployment
    async fn read_all(&self, service_id: &str) -> Result<Vec<ReminderEntry>>;
}

/// Current wall time, alias kept so tests and stores stamp rows the same way
pub(crate) fn modified_now() -> DateTime<Utc> {
    Utc::now()
}
