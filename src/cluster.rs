//! The cluster coordinator collaborator: ownership resolution, singleton
//! election, and membership notifications.
//!
//! Membership, gossip, and leader election are out of scope; this crate only
//! consumes their results. [`StaticCoordinator`] is the single-process
//! stand-in: one node that owns every key and is the designated singleton
//! leader, sufficient for tests and single-node runs.

use std::fmt;

use tokio::sync::watch;

/// Reference to a cluster node, as resolved by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef(String);

impl NodeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The consumed surface of the external cluster coordinator.
///
/// The ownership table is eventually consistent: during rebalancing,
/// `resolve_owner` may transiently disagree between nodes. Callers drop
/// undeliverable messages and rely on their retry layers.
pub trait ClusterCoordinator: Send + Sync {
    /// This process's own node.
    fn local_node(&self) -> NodeRef;

    /// The node currently owning `key` (an entity id or tag key).
    fn resolve_owner(&self, key: &str) -> NodeRef;

    /// Join the election for the named singleton `role`.
    ///
    /// The returned channel holds `true` while this node is the leader;
    /// leadership changes are observed via `changed()`.
    fn elect_singleton(&self, role: &str) -> watch::Receiver<bool>;

    /// Notifications of membership changes (an opaque epoch that increments
    /// whenever the member set changes).
    fn membership_changes(&self) -> watch::Receiver<u64>;
}

/// Single-process coordinator: every key is owned locally and leadership is
/// statically designated.
pub struct StaticCoordinator {
    node: NodeRef,
    leadership: watch::Sender<bool>,
    membership: watch::Sender<u64>,
}

impl StaticCoordinator {
    /// A coordinator whose node owns everything and holds every singleton role.
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_leadership(node, true)
    }

    /// A coordinator with explicit initial leadership, for driving
    /// leadership-change scenarios in tests.
    pub fn with_leadership(node: impl Into<String>, leader: bool) -> Self {
        let (leadership, _) = watch::channel(leader);
        let (membership, _) = watch::channel(0);
        Self {
            node: NodeRef::new(node),
            leadership,
            membership,
        }
    }

    /// Grant or revoke singleton leadership.
    pub fn set_leader(&self, leader: bool) {
        let _ = self.leadership.send(leader);
    }

    /// Simulate a membership change.
    pub fn bump_membership(&self) {
        self.membership.send_modify(|epoch| *epoch += 1);
    }
}

impl ClusterCoordinator for StaticCoordinator {
    fn local_node(&self) -> NodeRef {
        self.node.clone()
    }

    fn resolve_owner(&self, _key: &str) -> NodeRef {
        self.node.clone()
    }

    fn elect_singleton(&self, _role: &str) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    fn membership_changes(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }
}
