//! Membership service: heartbeats, suspect voting, view publication
//!
//! Each silo runs one membership service. It writes `i-am-alive` on a
//! fixed period, republishes the cluster view from every roster read,
//! votes against silos whose heartbeats are overdue, and self-terminates
//! when its own row turns dead or when it cannot heartbeat for the
//! eviction grace window.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::directory::ClusterView;
use crate::cluster::membership::{MembershipEntry, MembershipTable, SiloAddress, SiloStatus};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};

/// How many times a version-CAS write is retried before giving up
const CAS_ATTEMPTS: usize = 10;

/// Whether an entry's heartbeat is overdue at `now`
fn overdue(entry: &MembershipEntry, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
    let age = now - entry.i_am_alive_time;
    age > ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::MAX)
}

/// Per-silo membership service
pub struct MembershipService {
    table: Arc<dyn MembershipTable>,
    deployment_id: String,
    config: ClusterConfig,
    local: SiloAddress,
    view_tx: watch::Sender<ClusterView>,
    /// Cancelled when this silo must terminate (evicted or declared dead)
    evicted: CancellationToken,
}

impl MembershipService {
    /// Insert this silo's row in `joining` status and return the running
    /// service. The generation is derived from the current roster so it is
    /// strictly greater than any prior incarnation of the endpoint.
    pub async fn join(
        table: Arc<dyn MembershipTable>,
        deployment_id: String,
        config: ClusterConfig,
        endpoint: String,
        silo_name: String,
        proxy_port: u16,
    ) -> Result<Arc<Self>> {
        let mut local = None;
        for _ in 0..CAS_ATTEMPTS {
            let snapshot = table.read_all(&deployment_id).await?;
            let generation = snapshot.next_generation(&endpoint);
            let silo = SiloAddress {
                endpoint: endpoint.clone(),
                generation,
            };
            let entry = MembershipEntry {
                silo: silo.clone(),
                silo_name: silo_name.clone(),
                host_name: hostname(),
                status: SiloStatus::Joining,
                proxy_port,
                start_time: Utc::now(),
                i_am_alive_time: Utc::now(),
                suspect_times: Vec::new(),
            };
            if table
                .insert_entry(&deployment_id, entry, &snapshot.version)
                .await?
            {
                info!(silo = %silo, "joined membership table");
                local = Some(silo);
                break;
            }
            debug!("membership insert lost a version race, retrying");
        }
        let local = local
            .ok_or_else(|| Error::Internal("could not insert membership row".to_string()))?;

        // Retire dead rows of this endpoint's earlier incarnations
        for _ in 0..CAS_ATTEMPTS {
            let snapshot = table.read_all(&deployment_id).await?;
            let Some(stale) = snapshot.entries.iter().find(|e| {
                e.silo.endpoint == local.endpoint
                    && e.silo.generation < local.generation
                    && e.status == SiloStatus::Dead
            }) else {
                break;
            };
            let mut retired = stale.clone();
            retired.status = SiloStatus::Defunct;
            table
                .update_entry(&deployment_id, retired, &snapshot.version)
                .await?;
        }

        let (view_tx, _) = watch::channel(ClusterView::default());
        let service = Arc::new(Self {
            table,
            deployment_id,
            config,
            local,
            view_tx,
            evicted: CancellationToken::new(),
        });
        service.refresh_view().await?;
        Ok(service)
    }

    /// This silo's incarnation
    pub fn local_address(&self) -> &SiloAddress {
        &self.local
    }

    /// Subscribe to cluster view updates
    pub fn view_receiver(&self) -> watch::Receiver<ClusterView> {
        self.view_tx.subscribe()
    }

    /// Token cancelled when the silo has been evicted and must terminate
    pub fn evicted_token(&self) -> CancellationToken {
        self.evicted.clone()
    }

    /// Move this silo's row to a new status through the version protocol
    pub async fn set_status(&self, status: SiloStatus) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let snapshot = self.table.read_all(&self.deployment_id).await?;
            let Some(mut entry) = snapshot.entry(&self.local).cloned() else {
                return Err(Error::Internal(format!(
                    "own membership row missing for {}",
                    self.local
                )));
            };
            entry.status = status;
            entry.i_am_alive_time = Utc::now();
            if self
                .table
                .update_entry(&self.deployment_id, entry, &snapshot.version)
                .await?
            {
                info!(silo = %self.local, status = %status, "membership status updated");
                self.refresh_view().await?;
                return Ok(());
            }
        }
        Err(Error::Internal("membership status update kept losing version races".into()))
    }

    /// Run the heartbeat/monitor loop until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut beat = interval(Duration::from_secs(self.config.heartbeat_secs));
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_successful_beat = Utc::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = beat.tick() => {}
            }

            match self
                .table
                .update_i_am_alive(&self.deployment_id, &self.local, Utc::now())
                .await
            {
                Ok(()) => last_successful_beat = Utc::now(),
                Err(e) => {
                    warn!(error = %e, "heartbeat write failed");
                    let silent = Utc::now() - last_successful_beat;
                    if silent
                        > ChronoDuration::seconds(self.config.eviction_grace_secs as i64)
                    {
                        // Peers have likely voted us dead by now; terminate
                        // rather than risk a split activation.
                        error!("could not heartbeat within the grace window, assuming eviction");
                        self.evicted.cancel();
                        return;
                    }
                    continue;
                }
            }

            if let Err(e) = self.monitor_peers().await {
                warn!(error = %e, "membership monitoring pass failed");
            }
            if self.evicted.is_cancelled() {
                return;
            }
        }
    }

    /// Read the roster, publish the view, vote on overdue peers, and
    /// self-terminate if our own row has been declared dead.
    async fn monitor_peers(&self) -> Result<()> {
        let snapshot = self.table.read_all(&self.deployment_id).await?;
        self.view_tx
            .send_replace(ClusterView::from_snapshot(&snapshot));

        match snapshot.entry(&self.local) {
            Some(own) if own.status.is_terminal() => {
                error!(silo = %self.local, "own membership row is dead, terminating");
                self.evicted.cancel();
                return Ok(());
            }
            None => {
                error!(silo = %self.local, "own membership row disappeared, terminating");
                self.evicted.cancel();
                return Ok(());
            }
            _ => {}
        }

        let now = Utc::now();
        let threshold = self.config.suspect_after();
        for entry in snapshot.entries.iter() {
            if entry.silo == self.local || !entry.status.is_active() {
                continue;
            }
            if !overdue(entry, now, threshold) {
                continue;
            }
            let already_voted = entry.suspect_times.iter().any(|v| v.voter == self.local);
            if already_voted && entry.distinct_suspectors() < self.config.suspect_quorum {
                continue;
            }
            self.vote_against(&snapshot.version, entry, now).await?;
        }
        Ok(())
    }

    async fn vote_against(
        &self,
        version: &crate::cluster::membership::TableVersion,
        entry: &MembershipEntry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut updated = entry.clone();
        updated.add_suspect_vote(self.local.clone(), now);

        if updated.distinct_suspectors() >= self.config.suspect_quorum {
            warn!(
                silo = %updated.silo,
                suspectors = updated.distinct_suspectors(),
                "suspect quorum reached, declaring silo dead"
            );
            updated.status = SiloStatus::Dead;
        } else {
            warn!(silo = %updated.silo, "voting silo as suspect");
        }

        // A lost race just means another silo advanced the table first; the
        // next monitoring pass re-reads and re-evaluates.
        if self
            .table
            .update_entry(&self.deployment_id, updated, version)
            .await?
        {
            self.refresh_view().await?;
        }
        Ok(())
    }

    async fn refresh_view(&self) -> Result<()> {
        let snapshot = self.table.read_all(&self.deployment_id).await?;
        self.view_tx
            .send_replace(ClusterView::from_snapshot(&snapshot));
        Ok(())
    }
}

/// Single-silo vote helper used by tests and by out-of-band tooling: the
/// quorum decision given a set of suspicion votes.
pub fn quorum_reached(entry: &MembershipEntry, quorum: usize) -> bool {
    entry.distinct_suspectors() >= quorum
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::{test_entry, InMemoryMembershipTable};

    fn service_config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_secs: 5,
            missed_heartbeats: 3,
            suspect_quorum: 2,
            eviction_grace_secs: 30,
        }
    }

    async fn join(
        table: &Arc<InMemoryMembershipTable>,
        endpoint: &str,
    ) -> Arc<MembershipService> {
        let service = MembershipService::join(
            table.clone() as Arc<dyn MembershipTable>,
            "dep".to_string(),
            service_config(),
            endpoint.to_string(),
            format!("test-{endpoint}"),
            0,
        )
        .await
        .unwrap();
        service.set_status(SiloStatus::Active).await.unwrap();
        service
    }

    #[test]
    fn overdue_uses_three_heartbeats() {
        let config = service_config();
        let mut entry = test_entry("a:1", 1, SiloStatus::Active);
        let now = Utc::now();

        entry.i_am_alive_time = now - ChronoDuration::seconds(10);
        assert!(!overdue(&entry, now, config.suspect_after()));

        entry.i_am_alive_time = now - ChronoDuration::seconds(16);
        assert!(overdue(&entry, now, config.suspect_after()));
    }

    #[tokio::test]
    async fn two_votes_declare_a_silo_dead() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let a = join(&table, "a:1").await;
        let b = join(&table, "b:1").await;
        let _c = join(&table, "c:1").await;

        // Stop c's heartbeats by backdating its i-am-alive column
        let stale = Utc::now() - ChronoDuration::seconds(120);
        let snapshot = table.read_all("dep").await.unwrap();
        let c_addr = snapshot
            .entries
            .iter()
            .find(|e| e.silo.endpoint == "c:1")
            .unwrap()
            .silo
            .clone();
        table.update_i_am_alive("dep", &c_addr, stale).await.unwrap();

        // First voter only suspects
        a.monitor_peers().await.unwrap();
        let snapshot = table.read_all("dep").await.unwrap();
        let c_entry = snapshot.entry(&c_addr).unwrap();
        assert_eq!(c_entry.status, SiloStatus::Active);
        assert_eq!(c_entry.distinct_suspectors(), 1);

        // Second distinct voter reaches quorum
        b.monitor_peers().await.unwrap();
        let snapshot = table.read_all("dep").await.unwrap();
        let c_entry = snapshot.entry(&c_addr).unwrap();
        assert_eq!(c_entry.status, SiloStatus::Dead);
        assert!(quorum_reached(c_entry, 2));
    }

    #[tokio::test]
    async fn dead_row_triggers_self_termination() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let a = join(&table, "a:1").await;

        // Simulate the rest of the cluster declaring us dead
        let snapshot = table.read_all("dep").await.unwrap();
        let mut own = snapshot.entry(a.local_address()).unwrap().clone();
        own.status = SiloStatus::Dead;
        assert!(table
            .update_entry("dep", own, &snapshot.version)
            .await
            .unwrap());

        a.monitor_peers().await.unwrap();
        assert!(a.evicted_token().is_cancelled());
    }

    #[tokio::test]
    async fn view_tracks_status_changes() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let a = join(&table, "a:1").await;
        let mut rx = a.view_receiver();

        assert_eq!(rx.borrow_and_update().members.len(), 1);

        let _b = join(&table, "b:1").await;
        a.monitor_peers().await.unwrap();
        assert_eq!(rx.borrow_and_update().members.len(), 2);

        a.set_status(SiloStatus::ShuttingDown).await.unwrap();
        assert_eq!(rx.borrow_and_update().members.len(), 1);
    }
}
