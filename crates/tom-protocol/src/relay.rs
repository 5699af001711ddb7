/// Relay selection for ToM protocol.
///
/// Chooses the best relay node based on network topology: role,
/// online status, and last-seen timestamp.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use crate::types::NodeId;

/// Maximum relay depth for path selection.
pub const MAX_RELAY_DEPTH: usize = 4;

// ── Peer topology info ─────────────────────────────────────────────────

/// Role a node plays in the network (assigned dynamically by the role manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Regular participant — sends/receives messages, no forwarding duty.
    Client,
    /// Relay-capable — forwards messages for others, counted toward the
    /// network's relay quota.
    Relay,
    /// Eligible to hold backup entries for offline peers.
    Backup,
    /// Present in topology but excluded from relay/backup duty (e.g. a
    /// resource-constrained device).
    Observer,
}

/// Current status of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Online,
    Offline,
    /// Recently seen but may be transitioning.
    Stale,
}

/// Information about a known peer in the network topology.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: NodeId,
    /// Display name as last announced by the peer.
    pub username: String,
    /// Every role this node currently serves (client, relay, backup, observer).
    pub roles: HashSet<PeerRole>,
    pub status: PeerStatus,
    /// Unix ms timestamp of last observed activity.
    pub last_seen: u64,
    /// Other nodes this peer is known to be reachable through (relay chain
    /// hints gathered from gossip), most recent first.
    pub reachable_via: Vec<NodeId>,
}

impl PeerInfo {
    /// Build a peer record with a single role and no extra metadata — the
    /// common case for tests and for bootstrap entries added before the
    /// peer has announced itself.
    pub fn new(node_id: NodeId, role: PeerRole, status: PeerStatus, last_seen: u64) -> Self {
        Self {
            node_id,
            username: String::new(),
            roles: HashSet::from([role]),
            status,
            last_seen,
            reachable_via: Vec::new(),
        }
    }

    pub fn has_role(&self, role: PeerRole) -> bool {
        self.roles.contains(&role)
    }

    /// A single representative role for display/scoring contexts that
    /// expect one role per peer — relay takes precedence, since relay duty
    /// is the quota-managed, performance-relevant one.
    pub fn primary_role(&self) -> PeerRole {
        for role in [PeerRole::Relay, PeerRole::Backup, PeerRole::Observer, PeerRole::Client] {
            if self.roles.contains(&role) {
                return role;
            }
        }
        PeerRole::Client
    }
}

// ── Network topology ───────────────────────────────────────────────────

/// Snapshot of known network topology — peers and their roles/status.
///
/// Updated by the discovery layer (gossip). The RelaySelector reads
/// this to make routing decisions.
#[derive(Debug, Default)]
pub struct Topology {
    peers: HashMap<NodeId, PeerInfo>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a peer.
    pub fn upsert(&mut self, info: PeerInfo) {
        self.peers.insert(info.node_id, info);
    }

    /// Remove a peer.
    pub fn remove(&mut self, node_id: &NodeId) {
        self.peers.remove(node_id);
    }

    /// Get info for a specific peer.
    pub fn get(&self, node_id: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(node_id)
    }

    /// Get mutable info for a specific peer (used by RoleManager to update roles).
    pub fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(node_id)
    }

    /// All known peers.
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All online relay-capable peers, sorted by most recently seen.
    pub fn online_relays(&self) -> Vec<&PeerInfo> {
        let mut relays: Vec<&PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.has_role(PeerRole::Relay) && p.status == PeerStatus::Online)
            .collect();
        relays.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        relays
    }
}

// ── Relay selection ────────────────────────────────────────────────────

/// Why a particular relay was selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReason {
    /// Most recently seen online relay.
    MostRecent,
    /// Only available relay.
    OnlyOption,
    /// Alternate after primary failed.
    Alternate,
    /// No relay available.
    NoRelayAvailable,
}

/// Result of relay selection.
#[derive(Debug)]
pub struct RelaySelection {
    pub relay_id: Option<NodeId>,
    pub reason: SelectionReason,
}

/// Selects the best relay for message routing.
///
/// Pure logic — reads topology, returns a selection. No I/O.
pub struct RelaySelector {
    self_id: NodeId,
}

impl RelaySelector {
    pub fn new(self_id: NodeId) -> Self {
        Self { self_id }
    }

    /// Select the best relay to reach `target`.
    ///
    /// Filters: must be a relay, must be online, must not be self or target.
    /// Prefers the most recently seen relay.
    pub fn select_best(
        &self,
        target: NodeId,
        topology: &Topology,
    ) -> RelaySelection {
        self.select_best_excluding(target, topology, &[])
    }

    /// Select the best relay, excluding specific nodes (e.g., failed relays).
    pub fn select_best_excluding(
        &self,
        target: NodeId,
        topology: &Topology,
        exclude: &[NodeId],
    ) -> RelaySelection {
        let candidates: Vec<&PeerInfo> = topology
            .online_relays()
            .into_iter()
            .filter(|p| {
                p.node_id != self.self_id
                    && p.node_id != target
                    && !exclude.contains(&p.node_id)
            })
            .collect();

        match candidates.len() {
            0 => RelaySelection {
                relay_id: None,
                reason: SelectionReason::NoRelayAvailable,
            },
            1 => RelaySelection {
                relay_id: Some(candidates[0].node_id),
                reason: SelectionReason::OnlyOption,
            },
            _ => RelaySelection {
                relay_id: Some(candidates[0].node_id), // Already sorted by last_seen desc
                reason: SelectionReason::MostRecent,
            },
        }
    }

    /// Select an alternate relay after a failure.
    pub fn select_alternate(
        &self,
        target: NodeId,
        topology: &Topology,
        failed: &[NodeId],
    ) -> RelaySelection {
        let selection = self.select_best_excluding(target, topology, failed);
        if selection.relay_id.is_some() {
            RelaySelection {
                relay_id: selection.relay_id,
                reason: SelectionReason::Alternate,
            }
        } else {
            selection
        }
    }

    /// Build a relay chain to reach `target`, most-recently-seen relay
    /// first, capped at `MAX_RELAY_DEPTH` hops.
    ///
    /// Topology carries no per-peer reachability graph — every online relay
    /// is assumed globally reachable — so this orders distinct relays by
    /// recency rather than running a real shortest-path search over edges.
    /// A single-hop path (one relay) remains the common case; longer chains
    /// only matter once a router-level retry needs to route around a relay
    /// that failed to forward.
    pub fn select_path(
        &self,
        target: NodeId,
        topology: &Topology,
    ) -> Vec<NodeId> {
        topology
            .online_relays()
            .into_iter()
            .filter(|p| p.node_id != self.self_id && p.node_id != target)
            .take(MAX_RELAY_DEPTH)
            .map(|p| p.node_id)
            .collect()
    }
}
