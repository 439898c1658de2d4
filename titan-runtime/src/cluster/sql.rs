//! Postgres-backed membership table
//!
//! The durable roster lives in two tables: one row per silo incarnation
//! and one membership-version row per deployment. Every roster mutation
//! runs inside a transaction that compare-and-swaps the version row, so
//! concurrent writers holding a stale version fail cleanly with `false`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool, Row};

use crate::cluster::membership::{
    MembershipEntry, MembershipSnapshot, MembershipTable, SiloAddress, SiloStatus, SuspectVote,
    TableVersion,
};
use crate::error::Result;

const CREATE_MEMBERSHIP_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS titan_membership (
    deployment_id    TEXT        NOT NULL,
    endpoint         TEXT        NOT NULL,
    generation       BIGINT      NOT NULL,
    silo_name        TEXT        NOT NULL,
    host_name        TEXT        NOT NULL,
    status           TEXT        NOT NULL,
    proxy_port       INT         NOT NULL,
    start_time       TIMESTAMPTZ NOT NULL,
    i_am_alive_time  TIMESTAMPTZ NOT NULL,
    suspect_times    JSONB       NOT NULL DEFAULT '[]',
    PRIMARY KEY (deployment_id, endpoint, generation)
)
"#;

const CREATE_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS titan_membership_version (
    deployment_id  TEXT PRIMARY KEY,
    version        BIGINT      NOT NULL,
    stamp          TIMESTAMPTZ NOT NULL
)
"#;

const ENSURE_VERSION_ROW: &str = r#"
INSERT INTO titan_membership_version (deployment_id, version, stamp)
VALUES ($1, 0, $2)
ON CONFLICT (deployment_id) DO NOTHING
"#;

const READ_VERSION: &str = r#"
SELECT version, stamp FROM titan_membership_version WHERE deployment_id = $1
"#;

const BUMP_VERSION: &str = r#"
UPDATE titan_membership_version
SET version = version + 1, stamp = $3
WHERE deployment_id = $1 AND version = $2
"#;

const READ_ROWS: &str = r#"
SELECT endpoint, generation, silo_name, host_name, status, proxy_port,
       start_time, i_am_alive_time, suspect_times
FROM titan_membership
WHERE deployment_id = $1
"#;

const INSERT_ROW: &str = r#"
INSERT INTO titan_membership
    (deployment_id, endpoint, generation, silo_name, host_name, status,
     proxy_port, start_time, i_am_alive_time, suspect_times)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (deployment_id, endpoint, generation) DO NOTHING
"#;

const UPDATE_ROW: &str = r#"
UPDATE titan_membership
SET status = $4, i_am_alive_time = $5, suspect_times = $6
WHERE deployment_id = $1 AND endpoint = $2 AND generation = $3
"#;

const UPDATE_I_AM_ALIVE: &str = r#"
UPDATE titan_membership
SET i_am_alive_time = $4
WHERE deployment_id = $1 AND endpoint = $2 AND generation = $3
"#;

/// Create the membership tables if they do not exist
pub async fn ensure_membership_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_MEMBERSHIP_TABLE).execute(pool).await?;
    sqlx::query(CREATE_VERSION_TABLE).execute(pool).await?;
    Ok(())
}

/// Postgres membership table
pub struct SqlMembershipTable {
    pool: PgPool,
}

impl SqlMembershipTable {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_version_row(&self, deployment_id: &str) -> Result<()> {
        sqlx::query(ENSURE_VERSION_ROW)
            .bind(deployment_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<MembershipEntry> {
    let status: String = row.try_get("status")?;
    let suspects: Json<Vec<SuspectVote>> = row.try_get("suspect_times")?;
    Ok(MembershipEntry {
        silo: SiloAddress {
            endpoint: row.try_get("endpoint")?,
            generation: row.try_get("generation")?,
        },
        silo_name: row.try_get("silo_name")?,
        host_name: row.try_get("host_name")?,
        status: status.parse::<SiloStatus>()?,
        proxy_port: row.try_get::<i32, _>("proxy_port")? as u16,
        start_time: row.try_get("start_time")?,
        i_am_alive_time: row.try_get("i_am_alive_time")?,
        suspect_times: suspects.0,
    })
}

#[async_trait]
impl MembershipTable for SqlMembershipTable {
    async fn read_all(&self, deployment_id: &str) -> Result<MembershipSnapshot> {
        self.ensure_version_row(deployment_id).await?;

        let version_row = sqlx::query(READ_VERSION)
            .bind(deployment_id)
            .fetch_one(&self.pool)
            .await?;
        let version = TableVersion {
            version: version_row.try_get("version")?,
            stamp: version_row.try_get::<DateTime<Utc>, _>("stamp")?,
        };

        let rows = sqlx::query(READ_ROWS)
            .bind(deployment_id)
            .fetch_all(&self.pool)
            .await?;
        let entries = rows
            .iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok(MembershipSnapshot { version, entries })
    }

    async fn insert_entry(
        &self,
        deployment_id: &str,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool> {
        self.ensure_version_row(deployment_id).await?;
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(BUMP_VERSION)
            .bind(deployment_id)
            .bind(expected.version)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        if bumped.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let inserted = sqlx::query(INSERT_ROW)
            .bind(deployment_id)
            .bind(&entry.silo.endpoint)
            .bind(entry.silo.generation)
            .bind(&entry.silo_name)
            .bind(&entry.host_name)
            .bind(entry.status.to_string())
            .bind(i32::from(entry.proxy_port))
            .bind(entry.start_time)
            .bind(entry.i_am_alive_time)
            .bind(Json(&entry.suspect_times))
            .execute(&mut *tx)
            .await?;
        if inserted.rows_affected() != 1 {
            // (deployment, endpoint, generation) already used
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn update_entry(
        &self,
        deployment_id: &str,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(BUMP_VERSION)
            .bind(deployment_id)
            .bind(expected.version)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        if bumped.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let updated = sqlx::query(UPDATE_ROW)
            .bind(deployment_id)
            .bind(&entry.silo.endpoint)
            .bind(entry.silo.generation)
            .bind(entry.status.to_string())
            .bind(entry.i_am_alive_time)
            .bind(Json(&entry.suspect_times))
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn update_i_am_alive(
        &self,
        deployment_id: &str,
        silo: &SiloAddress,
        when: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(UPDATE_I_AM_ALIVE)
            .bind(deployment_id)
            .bind(&silo.endpoint)
            .bind(silo.generation)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
