//! Reminder delivery service
//!
//! Each silo periodically scans the durable reminder table and fires the
//! registrations whose grain it currently owns under the placement ring.
//! Registrations persist across silo restarts; fire bookkeeping does not,
//! so a reminder whose due time passed during an outage fires once on the
//! next scan rather than being lost.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identity::GrainIdentity;
use crate::runtime::RuntimeHandle;
use crate::storage::ReminderEntry;

/// Scans the reminder table and delivers due ticks to owned grains
pub struct ReminderService {
    runtime: RuntimeHandle,
    scan_period: Duration,
    next_fire: DashMap<(GrainIdentity, String), DateTime<Utc>>,
}

impl ReminderService {
    /// Create a service scanning at the configured period
    pub fn new(runtime: RuntimeHandle) -> Self {
        let scan_period = Duration::from_secs(runtime.config().reminder_scan_secs.max(1));
        Self {
            runtime,
            scan_period,
            next_fire: DashMap::new(),
        }
    }

    /// Run the scan loop until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticks = interval(self.scan_period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }
            if let Err(e) = self.scan().await {
                warn!(error = %e, "reminder scan failed");
            }
        }
    }

    /// One pass over the table: fire everything owned and due
    pub async fn scan(&self) -> Result<()> {
        let entries = self
            .runtime
            .reminder_store()
            .read_all(self.runtime.service_id())
            .await?;
        let now = Utc::now();

        // Forget bookkeeping for registrations that no longer exist or
        // that moved to another owner
        self.next_fire.retain(|(identity, name), _| {
            entries
                .iter()
                .any(|e| &e.identity == identity && &e.name == name)
                && self.runtime.directory().owns(identity)
        });

        for entry in entries {
            if !self.runtime.directory().owns(&entry.identity) {
                continue;
            }
            let key = (entry.identity.clone(), entry.name.clone());
            let due = self
                .next_fire
                .get(&key)
                .map(|d| *d)
                .unwrap_or_else(|| initial_due(&entry, now));

            if now < due {
                continue;
            }

            debug!(grain = %entry.identity, reminder = %entry.name, "firing reminder");
            if let Err(e) = self
                .runtime
                .deliver_reminder(&entry.identity, &entry.name)
                .await
            {
                warn!(grain = %entry.identity, reminder = %entry.name, error = %e,
                    "reminder delivery failed, will retry next scan");
                continue;
            }

            if entry.period_secs == 0 {
                // One-shot: consumed
                self.next_fire.remove(&key);
                if let Err(e) = self
                    .runtime
                    .reminder_store()
                    .remove(self.runtime.service_id(), &entry.identity, &entry.name)
                    .await
                {
                    warn!(error = %e, "could not remove fired one-shot reminder");
                }
            } else if let Some(next) = entry.next_due(now) {
                self.next_fire.insert(key, next);
            }
        }
        Ok(())
    }
}

/// First due time after this silo starts tracking a registration: overdue
/// registrations fire immediately, future ones wait for their start
fn initial_due(entry: &ReminderEntry, now: DateTime<Utc>) -> DateTime<Utc> {
    if entry.start_time <= now {
        now
    } else {
        entry.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overdue_registrations_fire_immediately() {
        let identity = GrainIdentity::guid("season", uuid::Uuid::new_v4());
        let now = Utc::now();
        let entry = ReminderEntry::new(
            identity,
            "rollover",
            now - chrono::Duration::seconds(3600),
            86_400,
        );
        assert_eq!(initial_due(&entry, now), now);
    }

    #[test]
    fn future_registrations_wait_for_start() {
        let identity = GrainIdentity::guid("season", uuid::Uuid::new_v4());
        let now = Utc::now();
        let start = now + chrono::Duration::seconds(600);
        let entry = ReminderEntry::new(identity, "rollover", start, 86_400);
        assert_eq!(initial_due(&entry, now), start);
    }
}
