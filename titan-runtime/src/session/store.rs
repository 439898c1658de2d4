//! Redis-backed session ticket store
//!
//! Sessions live under `{prefix}:{ticket}` with a TTL matching their
//! expiry and are mirrored in a per-user set `{prefix}:user:{user-id}`
//! whose TTL carries a five-minute grace over the session lifetime.
//! Validation applies sliding expiration bounded by an absolute cap of
//! `created_at + 2 × lifetime`. Records are JSON: operators inspect this
//! keyspace directly.

use std::ops::DerefMut;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deadpool_redis::Pool as RedisPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::ticket::generate_ticket;

/// TTL grace on the per-user index beyond the session lifetime
const USER_SET_GRACE_SECS: i64 = 300;

/// One authenticated session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque bearer ticket
    pub ticket_id: String,
    /// Authenticated user
    pub user_id: Uuid,
    /// Identity provider that authenticated the user
    pub provider: String,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Creation time; anchors the absolute expiry cap
    pub created_at: DateTime<Utc>,
    /// Current expiry
    pub expires_at: DateTime<Utc>,
    /// Last successful validation
    pub last_activity_at: DateTime<Utc>,
    /// Whether the session carries admin privileges
    #[serde(default)]
    pub is_admin: bool,
}

impl SessionRecord {
    /// Whether the session grants a role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Sliding-expiration bound: `now + sliding`, capped at
/// `created_at + 2 × lifetime`.
///
/// The 2× absolute cap is intentional and load-bearing: without it a
/// continuously-active session never expires.
pub(crate) fn bounded_expiry(
    created_at: DateTime<Utc>,
    lifetime: ChronoDuration,
    sliding: ChronoDuration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let slid = now + sliding;
    let cap = created_at + lifetime * 2;
    slid.min(cap)
}

/// Shared session store over the gateway Redis pool
#[derive(Clone)]
pub struct SessionStore {
    pool: RedisPool,
    config: SessionConfig,
}

impl SessionStore {
    /// Create a store with the deployment's session tuning
    pub fn new(pool: RedisPool, config: SessionConfig) -> Self {
        Self { pool, config }
    }

    fn session_key(&self, ticket: &str) -> String {
        format!("{}:{}", self.config.key_prefix, ticket)
    }

    fn user_key(&self, user_id: &Uuid) -> String {
        format!("{}:user:{}", self.config.key_prefix, user_id)
    }

    fn lifetime(&self, is_admin: bool) -> ChronoDuration {
        let minutes = if is_admin {
            self.config.admin_lifetime_minutes
        } else {
            self.config.lifetime_minutes
        };
        ChronoDuration::minutes(minutes as i64)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::transient(format!("redis pool unavailable for sessions: {e}")))
    }

    /// Create a session for an authenticated user and return its record
    pub async fn create(
        &self,
        user_id: Uuid,
        provider: impl Into<String>,
        roles: Vec<String>,
        is_admin: bool,
    ) -> Result<SessionRecord> {
        let now = Utc::now();
        let lifetime = self.lifetime(is_admin);
        let record = SessionRecord {
            ticket_id: generate_ticket(),
            user_id,
            provider: provider.into(),
            roles,
            created_at: now,
            expires_at: now + lifetime,
            last_activity_at: now,
            is_admin,
        };

        let serialized = serde_json::to_string(&record)
            .map_err(|e| Error::Internal(format!("session serialization: {e}")))?;
        let mut conn = self.connection().await?;

        let _: () = redis::cmd("SET")
            .arg(self.session_key(&record.ticket_id))
            .arg(serialized)
            .arg("EX")
            .arg(lifetime.num_seconds())
            .query_async(conn.deref_mut())
            .await?;

        let user_key = self.user_key(&user_id);
        let _: () = redis::cmd("SADD")
            .arg(&user_key)
            .arg(&record.ticket_id)
            .query_async(conn.deref_mut())
            .await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&user_key)
            .arg(lifetime.num_seconds() + USER_SET_GRACE_SECS)
            .query_async(conn.deref_mut())
            .await?;

        if self.config.max_sessions_per_user > 0 {
            self.enforce_session_limit(&mut conn, &user_id).await?;
        }

        debug!(user = %user_id, is_admin, "session created");
        Ok(record)
    }

    /// Validate a ticket and apply sliding expiration. Fails with an auth
    /// error for unknown or expired tickets.
    pub async fn validate(&self, ticket: &str) -> Result<SessionRecord> {
        let mut conn = self.connection().await?;
        let key = self.session_key(ticket);

        let serialized: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(conn.deref_mut())
            .await?;
        let Some(serialized) = serialized else {
            return Err(Error::Unauthorized("unknown or expired ticket".into()));
        };

        let mut record: SessionRecord = match serde_json::from_str(&serialized) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "undecodable session record, deleting");
                let _: () = redis::cmd("DEL").arg(&key).query_async(conn.deref_mut()).await?;
                return Err(Error::Unauthorized("invalid session record".into()));
            }
        };

        let now = Utc::now();
        if record.expires_at <= now {
            // TTL should have reaped this; clean up and reject
            let _: () = redis::cmd("DEL").arg(&key).query_async(conn.deref_mut()).await?;
            let _: () = redis::cmd("SREM")
                .arg(self.user_key(&record.user_id))
                .arg(ticket)
                .query_async(conn.deref_mut())
                .await?;
            return Err(Error::Unauthorized("ticket expired".into()));
        }

        let lifetime = self.lifetime(record.is_admin);
        let sliding = ChronoDuration::minutes(self.config.sliding_minutes as i64);
        let new_expiry = bounded_expiry(record.created_at, lifetime, sliding, now);

        if new_expiry > record.expires_at {
            record.expires_at = new_expiry;
            record.last_activity_at = now;
            let serialized = serde_json::to_string(&record)
                .map_err(|e| Error::Internal(format!("session serialization: {e}")))?;
            let ttl = (new_expiry - now).num_seconds().max(1);
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(serialized)
                .arg("EX")
                .arg(ttl)
                .query_async(conn.deref_mut())
                .await?;
        }

        Ok(record)
    }

    /// Invalidate one ticket
    pub async fn invalidate(&self, ticket: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = self.session_key(ticket);

        let serialized: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(conn.deref_mut())
            .await?;
        if let Some(serialized) = serialized {
            if let Ok(record) = serde_json::from_str::<SessionRecord>(&serialized) {
                let _: () = redis::cmd("SREM")
                    .arg(self.user_key(&record.user_id))
                    .arg(ticket)
                    .query_async(conn.deref_mut())
                    .await?;
            }
        }
        let _: () = redis::cmd("DEL").arg(&key).query_async(conn.deref_mut()).await?;
        Ok(())
    }

    /// Invalidate every session a user holds; returns how many were dropped
    pub async fn invalidate_user(&self, user_id: &Uuid) -> Result<usize> {
        let mut conn = self.connection().await?;
        let user_key = self.user_key(user_id);

        let tickets: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&user_key)
            .query_async(conn.deref_mut())
            .await?;
        if !tickets.is_empty() {
            let keys: Vec<String> = tickets.iter().map(|t| self.session_key(t)).collect();
            let _: () = redis::cmd("DEL")
                .arg(&keys)
                .query_async(conn.deref_mut())
                .await?;
        }
        let _: () = redis::cmd("DEL")
            .arg(&user_key)
            .query_async(conn.deref_mut())
            .await?;

        info!(user = %user_id, count = tickets.len(), "all user sessions invalidated");
        Ok(tickets.len())
    }

    /// Enumerate sessions with `(skip, take)` paging over the scan order.
    ///
    /// User-index keys are excluded; vanished or undecodable records are
    /// skipped rather than failing the page.
    pub async fn list(&self, skip: usize, take: usize) -> Result<Vec<SessionRecord>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*", self.config.key_prefix);
        let user_marker = format!("{}:user:", self.config.key_prefix);

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(conn.deref_mut())
                .await?;
            keys.extend(batch.into_iter().filter(|k| !k.starts_with(&user_marker)));
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let page: Vec<String> = keys.into_iter().skip(skip).take(take).collect();
        if page.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&page)
            .query_async(conn.deref_mut())
            .await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|v| serde_json::from_str(&v).ok())
            .collect())
    }

    /// Drop expired members from the user's set, then evict the oldest
    /// sessions by creation time until within the configured limit
    async fn enforce_session_limit(
        &self,
        conn: &mut deadpool_redis::Connection,
        user_id: &Uuid,
    ) -> Result<()> {
        let user_key = self.user_key(user_id);
        let tickets: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&user_key)
            .query_async(conn.deref_mut())
            .await?;
        if tickets.len() <= self.config.max_sessions_per_user {
            return Ok(());
        }

        let keys: Vec<String> = tickets.iter().map(|t| self.session_key(t)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(conn.deref_mut())
            .await?;

        let mut live: Vec<SessionRecord> = Vec::new();
        for (ticket, value) in tickets.iter().zip(values) {
            match value.and_then(|v| serde_json::from_str::<SessionRecord>(&v).ok()) {
                Some(record) => live.push(record),
                None => {
                    // Expired under us; drop the dangling index entry
                    let _: () = redis::cmd("SREM")
                        .arg(&user_key)
                        .arg(ticket)
                        .query_async(conn.deref_mut())
                        .await?;
                }
            }
        }

        live.sort_by_key(|r| r.created_at);
        while live.len() > self.config.max_sessions_per_user {
            let oldest = live.remove(0);
            let _: () = redis::cmd("DEL")
                .arg(self.session_key(&oldest.ticket_id))
                .query_async(conn.deref_mut())
                .await?;
            let _: () = redis::cmd("SREM")
                .arg(&user_key)
                .arg(&oldest.ticket_id)
                .query_async(conn.deref_mut())
                .await?;
            debug!(user = %user_id, "evicted oldest session over per-user limit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_extends_but_never_past_twice_lifetime() {
        let lifetime = ChronoDuration::minutes(30);
        let sliding = ChronoDuration::minutes(30);
        let created = Utc::now();

        // Fresh session: sliding wins
        let e1 = bounded_expiry(created, lifetime, sliding, created);
        assert_eq!(e1, created + ChronoDuration::minutes(30));

        // Validated continuously, expiry keeps moving forward...
        let e2 = bounded_expiry(created, lifetime, sliding, created + ChronoDuration::minutes(20));
        assert_eq!(e2, created + ChronoDuration::minutes(50));

        // ...but never beyond created + 60 minutes
        let e3 = bounded_expiry(created, lifetime, sliding, created + ChronoDuration::minutes(45));
        assert_eq!(e3, created + ChronoDuration::minutes(60));
        let e4 = bounded_expiry(created, lifetime, sliding, created + ChronoDuration::minutes(59));
        assert_eq!(e4, created + ChronoDuration::minutes(60));
    }

    #[test]
    fn cap_already_reached_does_not_extend() {
        let lifetime = ChronoDuration::minutes(30);
        let sliding = ChronoDuration::minutes(30);
        let created = Utc::now();
        let near_cap = created + ChronoDuration::minutes(60);

        let expiry = bounded_expiry(created, lifetime, sliding, near_cap);
        assert_eq!(expiry, near_cap);
    }

    #[test]
    fn session_record_roles() {
        let record = SessionRecord {
            ticket_id: "t".into(),
            user_id: Uuid::new_v4(),
            provider: "password".into(),
            roles: vec!["player".into(), "moderator".into()],
            created_at: Utc::now(),
            expires_at: Utc::now(),
            last_activity_at: Utc::now(),
            is_admin: false,
        };
        assert!(record.has_role("moderator"));
        assert!(!record.has_role("admin"));
    }

    #[test]
    fn record_json_tolerates_missing_optional_fields() {
        let json = r#"{
            "ticket_id": "abc",
            "user_id": "550e8400-e29b-41d4-a716-446655440000",
            "provider": "password",
            "created_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-01T00:30:00Z",
            "last_activity_at": "2026-01-01T00:00:00Z"
        }"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert!(record.roles.is_empty());
        assert!(!record.is_admin);
    }
}
