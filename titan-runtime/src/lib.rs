//! # titan-runtime
//!
//! Virtual-actor runtime for the Titan game backend. A cluster of worker
//! nodes ("silos") hosts single-threaded, location-transparent actors
//! ("grains") keyed by identity, with persistent versioned state,
//! cross-grain ACID transactions, pub/sub streams, and the admission
//! layer that fronts it all: Redis-backed rate limiting and session
//! tickets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use titan_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config)?;
//!
//!     // Build and run a silo
//!     let silo = SiloBuilder::new(config)
//!         .register(GrainRegistration::new("item-definitions", |_| {
//!             titan_runtime::registry::RegistryGrain::new()
//!         }))
//!         .start()
//!         .await?;
//!
//!     silo.run().await
//! }
//! ```

pub mod client;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod observability;
pub mod ratelimit;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod streams;
pub mod txn;

#[cfg(test)]
pub(crate) mod testkit;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{
        bearer_ticket, optional_session_auth, partition_key, rate_limit, remote_ip,
        require_admin, session_auth, AuthContext, GrainClient,
    };
    pub use crate::cluster::{
        ClusterView, GrainDirectory, InMemoryMembershipTable, MembershipService, MembershipTable,
        SiloAddress, SiloStatus,
    };
    pub use crate::codec::GrainState;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::identity::{GrainIdentity, GrainKey};
    pub use crate::observability::init_tracing;
    pub use crate::ratelimit::{
        RateLimitDecision, RateLimitPolicy, RateLimitRule, RateLimiter,
        RateLimitingConfiguration,
    };
    pub use crate::registry::{RegistryEntry, RegistryGrain, RegistryReaderGrain, RegistrySeedTask};
    pub use crate::runtime::{
        Grain, GrainCall, GrainContext, GrainRegistration, PersistentState, Placement,
        RuntimeHandle, Silo, SiloBuilder, StartupTask, TxnContext,
    };
    pub use crate::session::{SessionRecord, SessionStore};
    pub use crate::storage::{GrainStorage, MemoryGrainStorage, ReminderStore};
    pub use crate::streams::{StreamBroker, StreamId};
    pub use crate::txn::{run_transaction, TransactionalState, TxnStep};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export the async runtime and trait support
    pub use async_trait::async_trait;
    pub use tokio;

    // Re-export time and id utilities
    pub use chrono::{DateTime, Duration as ChronoDuration, Utc};
    pub use uuid::Uuid;

    // Re-export serde and prost for state and seed types
    pub use prost;
    pub use serde::{Deserialize, Serialize};
}
