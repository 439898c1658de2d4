//! Grain directory: identity → hosting silo
//!
//! Placement is deterministic: the identity's routing hash selects a silo
//! from the ring of `active` silos, so every node with the same membership
//! view resolves the same owner without coordination. The owning silo is
//! the only one allowed to register an activation; calls landing on a
//! non-owner are rejected with a transient error and retried by the caller
//! against a refreshed view.

use tokio::sync::watch;

use crate::cluster::membership::{MembershipSnapshot, SiloAddress};
use crate::error::{Error, Result};
use crate::identity::{fnv1a32, GrainIdentity};

/// One silo's position on the placement ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingMember {
    /// Silo incarnation
    pub address: SiloAddress,
    /// Proxy port announced to gateways
    pub proxy_port: u16,
    /// Ring point derived from the incarnation string
    pub point: u32,
}

/// An immutable view of the active cluster, ordered as a hash ring
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    /// Membership table version this view was built from
    pub version: i64,
    /// Active silos sorted by ring point
    pub members: Vec<RingMember>,
}

impl ClusterView {
    /// Build a view from a membership snapshot, keeping only active silos
    pub fn from_snapshot(snapshot: &MembershipSnapshot) -> Self {
        let mut members: Vec<RingMember> = snapshot
            .active_entries()
            .map(|entry| RingMember {
                point: fnv1a32(entry.silo.to_string().as_bytes()),
                proxy_port: entry.proxy_port,
                address: entry.silo.clone(),
            })
            .collect();
        members.sort_by_key(|m| (m.point, m.address.generation));
        Self {
            version: snapshot.version.version,
            members,
        }
    }

    /// Whether the view has no active silos
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `address` is active in this view
    pub fn contains(&self, address: &SiloAddress) -> bool {
        self.members.iter().any(|m| &m.address == address)
    }

    /// Ring successor of `hash`: the first member at or past the point,
    /// wrapping to the first member
    pub fn owner_of(&self, hash: u32) -> Option<&RingMember> {
        if self.members.is_empty() {
            return None;
        }
        self.members
            .iter()
            .find(|m| m.point >= hash)
            .or_else(|| self.members.first())
    }
}

/// Resolves grain identities to hosting silos against the live view
#[derive(Clone)]
pub struct GrainDirectory {
    local: SiloAddress,
    view_rx: watch::Receiver<ClusterView>,
}

impl GrainDirectory {
    /// Create a directory bound to this silo's identity and view feed
    pub fn new(local: SiloAddress, view_rx: watch::Receiver<ClusterView>) -> Self {
        Self { local, view_rx }
    }

    /// This silo's address
    pub fn local_address(&self) -> &SiloAddress {
        &self.local
    }

    /// Snapshot of the current cluster view
    pub fn view(&self) -> ClusterView {
        self.view_rx.borrow().clone()
    }

    /// Resolve the hosting silo for `identity`.
    ///
    /// Fails transient while no silo is active (cluster still forming, or
    /// between a death declaration and the view refresh).
    pub fn locate(&self, identity: &GrainIdentity) -> Result<SiloAddress> {
        let view = self.view_rx.borrow();
        view.owner_of(identity.routing_hash())
            .map(|m| m.address.clone())
            .ok_or_else(|| Error::transient(format!("no active silo to host {identity}")))
    }

    /// Whether this silo owns `identity` under the current view
    pub fn owns(&self, identity: &GrainIdentity) -> bool {
        self.view_rx
            .borrow()
            .owner_of(identity.routing_hash())
            .map(|m| m.address == self.local)
            .unwrap_or(false)
    }
}
