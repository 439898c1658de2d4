//! Postgres grain state and reminder stores
//!
//! One table holds every grain's state blob, keyed by the hashed identity
//! plus the full identity tuple (hash columns exist purely for index
//! efficiency; collisions are resolved by the remaining key columns).
//! The optimistic-version rules live in three named queries so operators
//! can audit exactly which statements touch the system of record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::identity::{fnv1a32, GrainIdentity, GrainKey};
use crate::storage::{modified_now, GrainStorage, ReminderEntry, ReminderStore, StoredState};

const CREATE_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS titan_grain_state (
    grain_id_hash              INT         NOT NULL,
    grain_id_n0                BIGINT      NOT NULL,
    grain_id_n1                BIGINT      NOT NULL,
    grain_type_hash            INT         NOT NULL,
    grain_type_string          TEXT        NOT NULL,
    grain_id_extension_string  TEXT        NOT NULL DEFAULT '',
    grain_key_kind             SMALLINT    NOT NULL,
    service_id                 TEXT        NOT NULL,
    payload_binary             BYTEA,
    modified_on                TIMESTAMPTZ NOT NULL,
    version                    BIGINT      NOT NULL,
    PRIMARY KEY (grain_id_hash, grain_id_n0, grain_id_n1, grain_type_hash,
                 grain_type_string, grain_id_extension_string, service_id)
)
"#;

const CREATE_REMINDER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS titan_reminders (
    service_id                 TEXT        NOT NULL,
    grain_type_string          TEXT        NOT NULL,
    grain_id_n0                BIGINT      NOT NULL,
    grain_id_n1                BIGINT      NOT NULL,
    grain_id_extension_string  TEXT        NOT NULL DEFAULT '',
    grain_key_kind             SMALLINT    NOT NULL,
    reminder_name              TEXT        NOT NULL,
    start_time                 TIMESTAMPTZ NOT NULL,
    period_secs                BIGINT      NOT NULL,
    grain_hash                 INT         NOT NULL,
    version                    BIGINT      NOT NULL,
    PRIMARY KEY (service_id, grain_type_string, grain_id_n0, grain_id_n1,
                 grain_id_extension_string, reminder_name)
)
"#;

/// The named queries implementing the Read/Write/Clear contract.
///
/// Key strings are stable; tooling may look statements up by name.
pub const NAMED_QUERIES: &[(&str, &str)] = &[
    (
        "read-state",
        r#"
SELECT payload_binary, version
FROM titan_grain_state
WHERE grain_id_hash = $1 AND grain_id_n0 = $2 AND grain_id_n1 = $3
  AND grain_type_hash = $4 AND grain_type_string = $5
  AND grain_id_extension_string = $6 AND service_id = $7
"#,
    ),
    (
        "insert-state",
        r#"
INSERT INTO titan_grain_state
    (grain_id_hash, grain_id_n0, grain_id_n1, grain_type_hash, grain_type_string,
     grain_id_extension_string, grain_key_kind, service_id, payload_binary, modified_on, version)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1)
ON CONFLICT (grain_id_hash, grain_id_n0, grain_id_n1, grain_type_hash,
             grain_type_string, grain_id_extension_string, service_id) DO NOTHING
"#,
    ),
    (
        "update-state",
        r#"
UPDATE titan_grain_state
SET payload_binary = $8, modified_on = $9, version = version + 1
WHERE grain_id_hash = $1 AND grain_id_n0 = $2 AND grain_id_n1 = $3
  AND grain_type_hash = $4 AND grain_type_string = $5
  AND grain_id_extension_string = $6 AND service_id = $7
  AND version = $10
"#,
    ),
];

/// Look up a named query by its stable key
pub fn named_query(name: &str) -> Option<&'static str> {
    NAMED_QUERIES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, sql)| *sql)
}

const UPSERT_REMINDER: &str = r#"
INSERT INTO titan_reminders
    (service_id, grain_type_string, grain_id_n0, grain_id_n1, grain_id_extension_string,
     grain_key_kind, reminder_name, start_time, period_secs, grain_hash, version)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1)
ON CONFLICT (service_id, grain_type_string, grain_id_n0, grain_id_n1,
             grain_id_extension_string, reminder_name)
DO UPDATE SET start_time = EXCLUDED.start_time,
              period_secs = EXCLUDED.period_secs,
              version = titan_reminders.version + 1
"#;

const DELETE_REMINDER: &str = r#"
DELETE FROM titan_reminders
WHERE service_id = $1 AND grain_type_string = $2 AND grain_id_n0 = $3
  AND grain_id_n1 = $4 AND grain_id_extension_string = $5 AND reminder_name = $6
"#;

const READ_REMINDERS: &str = r#"
SELECT grain_type_string, grain_id_n0, grain_id_n1, grain_id_extension_string,
       grain_key_kind, reminder_name, start_time, period_secs, grain_hash, version
FROM titan_reminders
WHERE service_id = $1
"#;

/// Create the grain-state and reminder tables if they do not exist
pub async fn ensure_storage_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_STATE_TABLE).execute(pool).await?;
    sqlx::query(CREATE_REMINDER_TABLE).execute(pool).await?;
    Ok(())
}

/// Create a Postgres connection pool with retry logic.
///
/// Uses exponential backoff between attempts, mirroring the Redis pool
/// construction path.
pub async fn create_pool(config: &StorageConfig) -> Result<PgPool> {
    let mut attempt = 0u32;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await;

        match result {
            Ok(pool) => {
                tracing::info!(
                    max_connections = config.max_connections,
                    "SQL connection pool created"
                );
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to SQL store after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e.into());
                }
                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "SQL connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct IdentityKey {
    hash: i32,
    n0: i64,
    n1: i64,
    type_hash: i32,
    type_string: String,
    extension: String,
    kind: i16,
}

fn identity_key(identity: &GrainIdentity) -> IdentityKey {
    let (n0, n1) = identity.key.words();
    IdentityKey {
        hash: identity.routing_hash() as i32,
        n0,
        n1,
        type_hash: fnv1a32(identity.grain_type.as_bytes()) as i32,
        type_string: identity.grain_type.clone(),
        extension: identity.key.extension().unwrap_or_default().to_string(),
        kind: i16::from(identity.key.kind_tag()),
    }
}

/// Postgres grain state store
pub struct SqlGrainStorage {
    pool: PgPool,
}

impl SqlGrainStorage {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn stored_version(
        &self,
        service_id: &str,
        key: &IdentityKey,
    ) -> Result<Option<u64>> {
        let row = sqlx::query(named_query("read-state").expect("named query registered"))
            .bind(key.hash)
            .bind(key.n0)
            .bind(key.n1)
            .bind(key.type_hash)
            .bind(&key.type_string)
            .bind(&key.extension)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }

    /// Shared guts of write and clear: insert at version 1 when the caller
    /// expects no row, otherwise a version-guarded update.
    async fn put(
        &self,
        service_id: &str,
        identity: &GrainIdentity,
        payload: Option<Vec<u8>>,
        expected: Option<u64>,
    ) -> Result<u64> {
        let key = identity_key(identity);
        let now = modified_now();

        let affected = match expected {
            None => {
                sqlx::query(named_query("insert-state").expect("named query registered"))
                    .bind(key.hash)
                    .bind(key.n0)
                    .bind(key.n1)
                    .bind(key.type_hash)
                    .bind(&key.type_string)
                    .bind(&key.extension)
                    .bind(key.kind)
                    .bind(service_id)
                    .bind(payload)
                    .bind(now)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            Some(version) => {
                sqlx::query(named_query("update-state").expect("named query registered"))
                    .bind(key.hash)
                    .bind(key.n0)
                    .bind(key.n1)
                    .bind(key.type_hash)
                    .bind(&key.type_string)
                    .bind(&key.extension)
                    .bind(service_id)
                    .bind(payload)
                    .bind(now)
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
        };

        if affected == 1 {
            return Ok(expected.unwrap_or(0) + 1);
        }

        let stored = self.stored_version(service_id, &key).await?;
        Err(Error::VersionConflict { expected, stored })
    }
}

#[async_trait]
impl GrainStorage for SqlGrainStorage {
    async fn read(&self, service_id: &str, identity: &GrainIdentity) -> Result<StoredState> {
        let key = identity_key(identity);
        let row = sqlx::query(named_query("read-state").expect("named query registered"))
            .bind(key.hash)
            .bind(key.n0)
            .bind(key.n1)
            .bind(key.type_hash)
            .bind(&key.type_string)
            .bind(&key.extension)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => StoredState {
                payload: row.try_get::<Option<Vec<u8>>, _>("payload_binary")?,
                version: Some(row.try_get::<i64, _>("version")? as u64),
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
        self.put(service_id, identity, Some(payload), expected).await
    }

    async fn clear(
        &self,
        service_id: &str,
        identity: &GrainIdentity,
        expected: Option<u64>,
    ) -> Result<u64> {
        self.put(service_id, identity, None, expected).await
    }
}

/// Postgres reminder store
pub struct SqlReminderStore {
    pool: PgPool,
}

impl SqlReminderStore {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReminderStore for SqlReminderStore {
    async fn upsert(&self, service_id: &str, entry: &ReminderEntry) -> Result<()> {
        let key = identity_key(&entry.identity);
        sqlx::query(UPSERT_REMINDER)
            .bind(service_id)
            .bind(&key.type_string)
            .bind(key.n0)
            .bind(key.n1)
            .bind(&key.extension)
            .bind(key.kind)
            .bind(&entry.name)
            .bind(entry.start_time)
            .bind(entry.period_secs as i64)
            .bind(entry.grain_hash as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, service_id: &str, identity: &GrainIdentity, name: &str) -> Result<()> {
        let key = identity_key(identity);
        sqlx::query(DELETE_REMINDER)
            .bind(service_id)
            .bind(&key.type_string)
            .bind(key.n0)
            .bind(key.n1)
            .bind(&key.extension)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_all(&self, service_id: &str) -> Result<Vec<ReminderEntry>> {
        let rows = sqlx::query(READ_REMINDERS)
            .bind(service_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let kind = row.try_get::<i16, _>("grain_key_kind")? as u8;
                let extension: String = row.try_get("grain_id_extension_string")?;
                let key = GrainKey::from_parts(
                    kind,
                    row.try_get("grain_id_n0")?,
                    row.try_get("grain_id_n1")?,
                    if extension.is_empty() {
                        None
                    } else {
                        Some(extension)
                    },
                )?;
                Ok(ReminderEntry {
                    identity: GrainIdentity {
                        grain_type: row.try_get("grain_type_string")?,
                        key,
                    },
                    name: row.try_get("reminder_name")?,
                    start_time: row.try_get::<DateTime<Utc>, _>("start_time")?,
                    period_secs: row.try_get::<i64, _>("period_secs")? as u64,
                    grain_hash: row.try_get::<i32, _>("grain_hash")? as u32,
                    version: row.try_get("version")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_queries_resolve_by_key() {
        assert!(named_query("read-state").is_some());
        assert!(named_query("insert-state").is_some());
        assert!(named_query("update-state").is_some());
        assert!(named_query("drop-state").is_none());
    }

    #[test]
    fn identity_key_splits_guid_into_words() {
        let id = uuid::Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let identity = GrainIdentity::compound("inventory", id, "season-7");
        let key = identity_key(&identity);

        assert_eq!(key.n0, 0x0102_0304_0506_0708_u64 as i64);
        assert_eq!(key.n1, 0x090a_0b0c_0d0e_0f10_u64 as i64);
        assert_eq!(key.extension, "season-7");
        assert_eq!(key.kind, 3);
        assert_eq!(key.hash, identity.routing_hash() as i32);
    }
}
