//! In-memory storage backends for tests and single-process clusters

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::identity::GrainIdentity;
use crate::storage::{GrainStorage, ReminderEntry, ReminderStore, StoredState};

#[derive(Debug, Clone)]
struct StateRow {
    payload: Option<Vec<u8>>,
    version: u64,
    #[allow(dead_code)]
    modified_on: DateTime<Utc>,
}

/// In-memory grain state store with full optimistic-version semantics
#[derive(Default)]
pub struct MemoryGrainStorage {
    rows: Mutex<HashMap<(String, GrainIdentity), StateRow>>,
}

impl MemoryGrainStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrainStorage for MemoryGrainStorage {
    async fn read(&self, service_id: &str, identity: &GrainIdentity) -> Result<StoredState> {
        let rows = self.rows.lock().await;
        Ok(match rows.get(&(service_id.to_string(), identity.clone())) {
            Some(row) => StoredState {
                payload: row.payload.clone(),
                version: Some(row.version),
            },
            None => StoredState::default(),
        })
    }

    async fn write(
        &self,
        service_id: &str,
        identity: &GrainIdentity,
        payload: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let key = (service_id.to_string(), identity.clone());
        let stored = rows.get(&key).map(|r| r.version);
        if stored != expected {
            return Err(Error::VersionConflict { expected, stored });
        }
        let version = expected.unwrap_or(0) + 1;
        rows.insert(
            key,
            StateRow {
                payload: Some(payload),
                version,
                modified_on: Utc::now(),
            },
        );
        Ok(version)
    }

    async fn clear(
        &self,
        service_id: &str,
        identity: &GrainIdentity,
        expected: Option<u64>,
    ) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let key = (service_id.to_string(), identity.clone());
        let stored = rows.get(&key).map(|r| r.version);
        if stored != expected {
            return Err(Error::VersionConflict { expected, stored });
        }
        let version = expected.unwrap_or(0) + 1;
        rows.insert(
            key,
            StateRow {
                payload: None,
                version,
                modified_on: Utc::now(),
            },
        );
        Ok(version)
    }
}

/// In-memory reminder store
#[derive(Default)]
pub struct MemoryReminderStore {
    rows: Mutex<HashMap<(String, GrainIdentity, String), ReminderEntry>>,
}

impl MemoryReminderStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReminderStore for MemoryReminderStore {
    async fn upsert(&self, service_id: &str, entry: &ReminderEntry) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let key = (
            service_id.to_string(),
            entry.identity.clone(),
            entry.name.clone(),
        );
        let version = rows.get(&key).map(|e| e.version + 1).unwrap_or(1);
        let mut stored = entry.clone();
        stored.version = version;
        rows.insert(key, stored);
        Ok(())
    }

    async fn remove(&self, service_id: &str, identity: &GrainIdentity, name: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.remove(&(
            service_id.to_string(),
            identity.clone(),
            name.to_string(),
        ));
        Ok(())
    }

    async fn read_all(&self, service_id: &str) -> Result<Vec<ReminderEntry>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|((sid, _, _), _)| sid == service_id)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn identity() -> GrainIdentity {
        GrainIdentity::guid("character", Uuid::from_u128(7))
    }

    #[tokio::test]
    async fn first_write_requires_absent_row() {
        let store = MemoryGrainStorage::new();
        let id = identity();

        let v = store.write("svc", &id, b"one".to_vec(), None).await.unwrap();
        assert_eq!(v, 1);

        // A second first-write against the now-existing row conflicts
        let err = store
            .write("svc", &id, b"two".to_vec(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: None,
                stored: Some(1)
            }
        ));
    }

    #[tokio::test]
    async fn versions_advance_by_one() {
        let store = MemoryGrainStorage::new();
        let id = identity();

        let v1 = store.write("svc", &id, b"a".to_vec(), None).await.unwrap();
        let v2 = store
            .write("svc", &id, b"b".to_vec(), Some(v1))
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let state = store.read("svc", &id).await.unwrap();
        assert_eq!(state.payload.as_deref(), Some(b"b".as_ref()));
        assert_eq!(state.version, Some(2));
    }

    #[tokio::test]
    async fn concurrent_writers_race_exactly_one_wins() {
        let store = Arc::new(MemoryGrainStorage::new());
        let id = identity();
        store.write("svc", &id, b"base".to_vec(), None).await.unwrap();

        let a = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.write("svc", &id, b"a".to_vec(), Some(1)).await })
        };
        let b = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.write("svc", &id, b"b".to_vec(), Some(1)).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::VersionConflict { .. })))
            .count();
        assert_eq!((wins, conflicts), (1, 1));
        assert_eq!(
            results.iter().find_map(|r| r.as_ref().ok()).copied(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn clear_leaves_a_tombstone_in_the_version_chain() {
        let store = MemoryGrainStorage::new();
        let id = identity();

        let v1 = store.write("svc", &id, b"a".to_vec(), None).await.unwrap();
        let v2 = store.clear("svc", &id, Some(v1)).await.unwrap();
        assert_eq!(v2, 2);

        let state = store.read("svc", &id).await.unwrap();
        assert_eq!(state.payload, None);
        assert_eq!(state.version, Some(2));

        // Recreation continues the chain from the tombstone version
        let v3 = store
            .write("svc", &id, b"again".to_vec(), Some(v2))
            .await
            .unwrap();
        assert_eq!(v3, 3);
    }

    #[tokio::test]
    async fn service_ids_are_isolated_namespaces() {
        let store = MemoryGrainStorage::new();
        let id = identity();
        store.write("alpha", &id, b"a".to_vec(), None).await.unwrap();

        let other = store.read("beta", &id).await.unwrap();
        assert!(!other.exists());
    }

    #[tokio::test]
    async fn reminder_upsert_is_idempotent_and_versioned() {
        let store = MemoryReminderStore::new();
        let id = identity();
        let entry = ReminderEntry::new(id.clone(), "decay", Utc::now(), 3600);

        store.upsert("svc", &entry).await.unwrap();
        store.upsert("svc", &entry).await.unwrap();

        let all = store.read_all("svc").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 2);

        store.remove("svc", &id, "decay").await.unwrap();
        assert!(store.read_all("svc").await.unwrap().is_empty());
    }

    #[test]
    fn next_due_walks_whole_periods() {
        let start = Utc::now() - chrono::Duration::seconds(250);
        let entry = ReminderEntry::new(identity(), "tick", start, 100);
        let due = entry.next_due(Utc::now()).unwrap();
        let offset = (due - start).num_seconds();
        assert_eq!(offset, 300);
    }
}
