//! Cluster membership table
//!
//! Every silo owns exactly one row per `(deployment, endpoint, generation)`
//! and all row changes go through an insert/update-if-version-matches
//! protocol against a single membership-version record per deployment.
//! Readers use that version to detect a stale cached view.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// Silo lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Row inserted, startup tasks not yet complete
    Joining,
    /// Serving traffic
    Active,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Declared dead by suspect quorum or clean shutdown
    Dead,
    /// Terminal; kept only as history for the endpoint's generations
    Defunct,
}

impl SiloStatus {
    /// Whether the silo participates in the placement ring
    pub fn is_active(self) -> bool {
        self == SiloStatus::Active
    }

    /// Whether the status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, SiloStatus::Dead | SiloStatus::Defunct)
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "joining"),
            Self::Active => write!(f, "active"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Dead => write!(f, "dead"),
            Self::Defunct => write!(f, "defunct"),
        }
    }
}

impl std::str::FromStr for SiloStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "joining" => Ok(Self::Joining),
            "active" => Ok(Self::Active),
            "shutting-down" => Ok(Self::ShuttingDown),
            "dead" => Ok(Self::Dead),
            "defunct" => Ok(Self::Defunct),
            other => Err(crate::error::Error::Decode(format!(
                "unknown silo status {other:?}"
            ))),
        }
    }
}

/// Identity of a silo incarnation: endpoint plus monotonic generation.
///
/// Re-joining the same endpoint always uses a strictly greater generation,
/// so `(deployment, endpoint, generation)` stays unique forever.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// `host:port` for silo-to-silo traffic
    pub endpoint: String,
    /// Boot incarnation, strictly increasing per endpoint
    pub generation: i64,
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.generation)
    }
}

/// One suspicion vote against a silo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectVote {
    /// The silo that failed to observe liveness
    pub voter: SiloAddress,
    /// When the vote was cast
    pub at: DateTime<Utc>,
}

/// One membership row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// Silo incarnation this row describes
    pub silo: SiloAddress,
    /// Human-readable silo name
    pub silo_name: String,
    /// Host machine name
    pub host_name: String,
    /// Current lifecycle status
    pub status: SiloStatus,
    /// Port announced to gateways
    pub proxy_port: u16,
    /// Process start time
    pub start_time: DateTime<Utc>,
    /// Last heartbeat write
    pub i_am_alive_time: DateTime<Utc>,
    /// Accumulated suspicion votes
    pub suspect_times: Vec<SuspectVote>,
}

impl MembershipEntry {
    /// Count of distinct silos currently suspecting this one
    pub fn distinct_suspectors(&self) -> usize {
        let mut voters: Vec<&SiloAddress> = self.suspect_times.iter().map(|v| &v.voter).collect();
        voters.sort_by(|a, b| (&a.endpoint, a.generation).cmp(&(&b.endpoint, b.generation)));
        voters.dedup();
        voters.len()
    }

    /// Record a suspicion vote, replacing any earlier vote from the same voter
    pub fn add_suspect_vote(&mut self, voter: SiloAddress, at: DateTime<Utc>) {
        self.suspect_times.retain(|v| v.voter != voter);
        self.suspect_times.push(SuspectVote { voter, at });
    }
}

/// The per-deployment membership-version record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVersion {
    /// Monotonic version, bumped on every successful row change
    pub version: i64,
    /// Wall time of the last bump
    pub stamp: DateTime<Utc>,
}

impl TableVersion {
    /// The version of an empty table
    pub fn initial() -> Self {
        Self {
            version: 0,
            stamp: Utc::now(),
        }
    }

    /// The version a successful write leaves behind
    pub fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            stamp: Utc::now(),
        }
    }
}

/// A consistent read of the whole roster
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    /// Table version at read time
    pub version: TableVersion,
    /// All rows for the deployment, every generation included
    pub entries: Vec<MembershipEntry>,
}

impl MembershipSnapshot {
    /// The generation a re-joining silo must use for `endpoint`: strictly
    /// greater than any recorded one, and never behind wall time so
    /// restarts after table wipes still move forward.
    pub fn next_generation(&self, endpoint: &str) -> i64 {
        let max_seen = self
            .entries
            .iter()
            .filter(|e| e.silo.endpoint == endpoint)
            .map(|e| e.silo.generation)
            .max()
            .unwrap_or(0);
        max_seen.max(Utc::now().timestamp() - 1) + 1
    }

    /// Entries currently in `Active` status
    pub fn active_entries(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.entries.iter().filter(|e| e.status.is_active())
    }

    /// Find the row for a specific incarnation
    pub fn entry(&self, silo: &SiloAddress) -> Option<&MembershipEntry> {
        self.entries.iter().find(|e| &e.silo == silo)
    }
}

/// Shared membership store.
///
/// `insert_entry`/`update_entry` return `Ok(false)` when the caller's
/// observed table version is stale; the caller re-reads and retries.
/// `update_i_am_alive` intentionally bypasses the version protocol: the
/// heartbeat column is a liveness signal, not roster state.
#[async_trait]
pub trait MembershipTable: Send + Sync + 'static {
    /// Read all rows plus the membership version
    async fn read_all(&self, deployment_id: &str) -> Result<MembershipSnapshot>;

    /// Insert a new row if `expected` still matches the table version
    async fn insert_entry(
        &self,
        deployment_id: &str,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool>;

    /// Replace an existing row if `expected` still matches the table version
    async fn update_entry(
        &self,
        deployment_id: &str,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool>;

    /// Overwrite the heartbeat column for one silo
    async fn update_i_am_alive(
        &self,
        deployment_id: &str,
        silo: &SiloAddress,
        when: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Default)]
struct DeploymentRows {
    version: Option<TableVersion>,
    rows: HashMap<(String, i64), MembershipEntry>,
}

/// In-memory membership table for tests and single-process clusters
#[derive(Default)]
pub struct InMemoryMembershipTable {
    deployments: RwLock<HashMap<String, DeploymentRows>>,
}

impl InMemoryMembershipTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipTable for InMemoryMembershipTable {
    async fn read_all(&self, deployment_id: &str) -> Result<MembershipSnapshot> {
        let deployments = self.deployments.read().await;
        let snapshot = match deployments.get(deployment_id) {
            Some(state) => MembershipSnapshot {
                version: state.version.clone().unwrap_or_else(TableVersion::initial),
                entries: state.rows.values().cloned().collect(),
            },
            None => MembershipSnapshot {
                version: TableVersion::initial(),
                entries: Vec::new(),
            },
        };
        Ok(snapshot)
    }

    async fn insert_entry(
        &self,
        deployment_id: &str,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool> {
        let mut deployments = self.deployments.write().await;
        let state = deployments.entry(deployment_id.to_string()).or_default();
        let current = state.version.clone().unwrap_or_else(TableVersion::initial);
        if current.version != expected.version {
            return Ok(false);
        }
        let key = (entry.silo.endpoint.clone(), entry.silo.generation);
        if state.rows.contains_key(&key) {
            return Ok(false);
        }
        state.rows.insert(key, entry);
        state.version = Some(current.next());
        Ok(true)
    }

    async fn update_entry(
        &self,
        deployment_id: &str,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool> {
        let mut deployments = self.deployments.write().await;
        let state = deployments.entry(deployment_id.to_string()).or_default();
        let current = state.version.clone().unwrap_or_else(TableVersion::initial);
        if current.version != expected.version {
            return Ok(false);
        }
        let key = (entry.silo.endpoint.clone(), entry.silo.generation);
        if !state.rows.contains_key(&key) {
            return Ok(false);
        }
        state.rows.insert(key, entry);
        state.version = Some(current.next());
        Ok(true)
    }

    async fn update_i_am_alive(
        &self,
        deployment_id: &str,
        silo: &SiloAddress,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let mut deployments = self.deployments.write().await;
        if let Some(state) = deployments.get_mut(deployment_id) {
            let key = (silo.endpoint.clone(), silo.generation);
            if let Some(row) = state.rows.get_mut(&key) {
                row.i_am_alive_time = when;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_entry(endpoint: &str, generation: i64, status: SiloStatus) -> MembershipEntry {
    MembershipEntry {
        silo: SiloAddress {
            endpoint: endpoint.to_string(),
            generation,
        },
        silo_name: format!("test-{endpoint}"),
        host_name: "localhost".to_string(),
        status,
        proxy_port: 0,
        start_time: Utc::now(),
        i_am_alive_time: Utc::now(),
        suspect_times: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_bumps_version() {
        let table = InMemoryMembershipTable::new();
        let snapshot = table.read_all("dep").await.unwrap();
        assert_eq!(snapshot.version.version, 0);

        let ok = table
            .insert_entry(
                "dep",
                test_entry("10.0.0.1:7001", 1, SiloStatus::Joining),
                &snapshot.version,
            )
            .await
            .unwrap();
        assert!(ok);

        let snapshot = table.read_all("dep").await.unwrap();
        assert_eq!(snapshot.version.version, 1);
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let table = InMemoryMembershipTable::new();
        let v0 = table.read_all("dep").await.unwrap().version;

        assert!(table
            .insert_entry("dep", test_entry("a:1", 1, SiloStatus::Joining), &v0)
            .await
            .unwrap());

        // Second writer still holding v0 loses the race
        assert!(!table
            .insert_entry("dep", test_entry("b:1", 1, SiloStatus::Joining), &v0)
            .await
            .unwrap());

        let v1 = table.read_all("dep").await.unwrap().version;
        assert!(table
            .insert_entry("dep", test_entry("b:1", 1, SiloStatus::Joining), &v1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_incarnation_is_rejected() {
        let table = InMemoryMembershipTable::new();
        let v = table.read_all("dep").await.unwrap().version;
        assert!(table
            .insert_entry("dep", test_entry("a:1", 7, SiloStatus::Joining), &v)
            .await
            .unwrap());

        let v = table.read_all("dep").await.unwrap().version;
        assert!(!table
            .insert_entry("dep", test_entry("a:1", 7, SiloStatus::Joining), &v)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn heartbeat_write_skips_version_protocol() {
        let table = InMemoryMembershipTable::new();
        let v = table.read_all("dep").await.unwrap().version;
        let entry = test_entry("a:1", 1, SiloStatus::Active);
        let silo = entry.silo.clone();
        table.insert_entry("dep", entry, &v).await.unwrap();

        let before = table.read_all("dep").await.unwrap();
        let when = Utc::now() + chrono::Duration::seconds(60);
        table.update_i_am_alive("dep", &silo, when).await.unwrap();

        let after = table.read_all("dep").await.unwrap();
        assert_eq!(after.version.version, before.version.version);
        assert_eq!(after.entries[0].i_am_alive_time, when);
    }

    #[test]
    fn next_generation_is_strictly_greater() {
        let now = Utc::now().timestamp();
        let snapshot = MembershipSnapshot {
            version: TableVersion::initial(),
            entries: vec![
                test_entry("a:1", now + 100, SiloStatus::Dead),
                test_entry("a:1", now + 50, SiloStatus::Defunct),
                test_entry("b:1", now + 500, SiloStatus::Active),
            ],
        };
        assert_eq!(snapshot.next_generation("a:1"), now + 101);
        // Unknown endpoints start from wall time
        assert!(snapshot.next_generation("c:1") >= now);
    }

    #[test]
    fn suspect_votes_deduplicate_by_voter() {
        let mut entry = test_entry("a:1", 1, SiloStatus::Active);
        let voter1 = SiloAddress {
            endpoint: "b:1".into(),
            generation: 1,
        };
        let voter2 = SiloAddress {
            endpoint: "c:1".into(),
            generation: 1,
        };

        entry.add_suspect_vote(voter1.clone(), Utc::now());
        entry.add_suspect_vote(voter1, Utc::now());
        assert_eq!(entry.distinct_suspectors(), 1);

        entry.add_suspect_vote(voter2, Utc::now());
        assert_eq!(entry.distinct_suspectors(), 2);
    }
}
