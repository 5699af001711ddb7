/// Role manager — derives each peer's relay role from topology so that
/// every observer independently reaches the same assignment.
///
/// Relay promotion/demotion is driven by a population-relative quota, not
/// an absolute contribution-score threshold: the number of relay-role peers
/// is kept within `[ceil(N/3) - 1, ceil(N/2)]` of the known peer count `N`.
/// Contribution scores rank *which* peers fill or vacate that quota; they
/// never gate it on their own, so no node is permanently excluded or
/// permanently entitled.
use std::collections::HashMap;

use crate::relay::{PeerRole, Topology};
use crate::types::NodeId;

use super::scoring::ContributionMetrics;

/// Actions the runtime should execute after a role evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleAction {
    /// A remote peer was promoted to Relay in topology.
    Promoted { node_id: NodeId, score: f64 },
    /// A remote peer was demoted to Client in topology.
    Demoted { node_id: NodeId, score: f64 },
    /// Our local role changed.
    LocalRoleChanged { new_role: PeerRole },
}

/// Lower/upper bound on the number of relay-role peers for a population
/// of size `n`: `[ceil(n/3) - 1, ceil(n/2)]`.
fn relay_quota(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let low = n.div_ceil(3).saturating_sub(1);
    let high = n.div_ceil(2);
    (low, high)
}

/// Manages contribution scores and role transitions.
pub struct RoleManager {
    local_id: NodeId,
    scores: HashMap<NodeId, ContributionMetrics>,
}

impl RoleManager {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            scores: HashMap::new(),
        }
    }

    /// Record a successful relay by a node.
    pub fn record_relay(&mut self, node_id: NodeId, now: u64) {
        self.scores
            .entry(node_id)
            .or_insert_with(|| ContributionMetrics::new(now))
            .record_relay(now);
    }

    /// Record a relay failure for a node.
    pub fn record_relay_failure(&mut self, node_id: NodeId, now: u64) {
        self.scores
            .entry(node_id)
            .or_insert_with(|| ContributionMetrics::new(now))
            .record_relay_failure(now);
    }

    /// Get the current contribution score for a node.
    pub fn score(&self, node_id: &NodeId, now: u64) -> f64 {
        self.scores
            .get(node_id)
            .map(|m| m.score(now))
            .unwrap_or(0.0)
    }

    /// Record bytes relayed by a peer.
    pub fn record_bytes_relayed(&mut self, node_id: NodeId, bytes: u64, now: u64) {
        let metrics = self
            .scores
            .entry(node_id)
            .or_insert_with(|| ContributionMetrics::new(now));
        metrics.bytes_relayed += bytes;
        metrics.last_activity = now;
    }

    /// Record bytes received from network (for calculating give/take ratio).
    pub fn record_bytes_received(&mut self, node_id: NodeId, bytes: u64, now: u64) {
        let metrics = self
            .scores
            .entry(node_id)
            .or_insert_with(|| ContributionMetrics::new(now));
        metrics.bytes_received += bytes;
    }

    /// Remove all metrics for a departed node.
    pub fn remove_node(&mut self, node_id: &NodeId) {
        self.scores.remove(node_id);
    }

    /// Get complete metrics snapshot for a peer (debug/observability).
    pub fn get_metrics(
        &self,
        node_id: &NodeId,
        topology: &Topology,
        now: u64,
    ) -> Option<super::RoleMetrics> {
        let metrics = self.scores.get(node_id)?;
        let peer_info = topology.get(node_id)?;

        let total_attempts = metrics.messages_relayed + metrics.relay_failures;
        let success_rate = if total_attempts > 0 {
            metrics.messages_relayed as f64 / total_attempts as f64
        } else {
            1.0
        };

        let bandwidth_ratio = if metrics.bytes_received > 0 {
            metrics.bytes_relayed as f64 / metrics.bytes_received as f64
        } else if metrics.bytes_relayed > 0 {
            1.0
        } else {
            0.0
        };

        Some(super::RoleMetrics {
            node_id: *node_id,
            role: peer_info.primary_role(),
            score: self.score(node_id, now),
            relay_count: metrics.messages_relayed,
            relay_failures: metrics.relay_failures,
            success_rate,
            bytes_relayed: metrics.bytes_relayed,
            bytes_received: metrics.bytes_received,
            bandwidth_ratio,
            uptime_hours: metrics.total_uptime_ms as f64 / 3_600_000.0,
            first_seen: metrics.first_seen,
            last_activity: metrics.last_activity,
        })
    }

    /// Get all peers with their scores (debug/dashboard).
    pub fn get_all_scores(
        &self,
        topology: &Topology,
        now: u64,
    ) -> Vec<(NodeId, f64, PeerRole)> {
        topology
            .peers()
            .filter_map(|peer| {
                let score = self.score(&peer.node_id, now);
                Some((peer.node_id, score, peer.primary_role()))
            })
            .collect()
    }

    /// Evaluate the whole population and bring the relay count back inside
    /// quota, promoting the highest-scoring clients or demoting the
    /// lowest-scoring relays as needed.
    ///
    /// Returns a list of actions (promotions, demotions, local role change).
    /// The runtime executes these actions and surfaces events to the application.
    pub fn evaluate(&self, topology: &mut Topology, now: u64) -> Vec<RoleAction> {
        let n = topology.len();
        let (low, high) = relay_quota(n);
        let relay_count = topology
            .peers()
            .filter(|p| p.has_role(PeerRole::Relay))
            .count();

        let mut actions = Vec::new();

        if relay_count < low {
            let mut candidates: Vec<(NodeId, f64)> = topology
                .peers()
                .filter(|p| !p.has_role(PeerRole::Relay))
                .map(|p| (p.node_id, self.score(&p.node_id, now)))
                .collect();
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            for (node_id, score) in candidates.into_iter().take(low - relay_count) {
                if let Some(peer) = topology.get_mut(&node_id) {
                    peer.roles.insert(PeerRole::Relay);
                }
                actions.push(if node_id == self.local_id {
                    RoleAction::LocalRoleChanged {
                        new_role: PeerRole::Relay,
                    }
                } else {
                    RoleAction::Promoted { node_id, score }
                });
            }
        } else if relay_count > high {
            let mut candidates: Vec<(NodeId, f64)> = topology
                .peers()
                .filter(|p| p.has_role(PeerRole::Relay))
                .map(|p| (p.node_id, self.score(&p.node_id, now)))
                .collect();
            candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            for (node_id, score) in candidates.into_iter().take(relay_count - high) {
                if let Some(peer) = topology.get_mut(&node_id) {
                    peer.roles.remove(&PeerRole::Relay);
                    peer.roles.insert(PeerRole::Client);
                }
                actions.push(if node_id == self.local_id {
                    RoleAction::LocalRoleChanged {
                        new_role: PeerRole::Client,
                    }
                } else {
                    RoleAction::Demoted { node_id, score }
                });
            }
        }

        actions
    }
}
