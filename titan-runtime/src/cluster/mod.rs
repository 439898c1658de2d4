//! Cluster membership and grain placement
//!
//! [`membership`] is the shared roster with its version protocol,
//! [`heartbeat`] keeps it current and votes on failures, and
//! [`directory`] turns the resulting view into deterministic grain
//! placement.

pub mod directory;
pub mod heartbeat;
pub mod membership;
pub mod sql;

pub use directory::{ClusterView, GrainDirectory, RingMember};
pub use heartbeat::MembershipService;
pub use membership::{
    InMemoryMembershipTable, MembershipEntry, MembershipSnapshot, MembershipTable, SiloAddress,
    SiloStatus, SuspectVote, TableVersion,
};
