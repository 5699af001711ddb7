/// DirectPathManager — opportunistic upgrade of relayed conversations to a
/// direct transport, and transparent degradation on failure.
///
/// Pure state machine: the runtime tells it when a relayed exchange
/// succeeded or a peer went offline; it tracks per-peer availability and
/// backoff, and the runtime consults it before every send.
use std::collections::HashMap;

use crate::types::NodeId;

/// Exponential backoff schedule before retrying a direct connection,
/// capped at the last step.
const BACKOFF_STEPS_MS: [u64; 3] = [1_000, 2_000, 4_000];

/// Whether a peer is reachable directly or only through a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    RelayOnly,
    DirectAvailable,
}

/// Events surfaced to the application when a peer's direct reachability changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectPathEvent {
    Lost { peer: NodeId },
    Restored { peer: NodeId },
}

struct PeerState {
    availability: Availability,
    backoff_step: usize,
    next_retry_at: u64,
}

impl PeerState {
    fn fresh() -> Self {
        Self {
            availability: Availability::RelayOnly,
            backoff_step: 0,
            next_retry_at: 0,
        }
    }
}

/// Tracks direct-path availability per peer.
pub struct DirectPathManager {
    peers: HashMap<NodeId, PeerState>,
}

impl DirectPathManager {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// A relayed exchange with `peer` just succeeded — the peer is now a
    /// candidate for a direct upgrade attempt. Marks it available on the
    /// first success; re-marking an already-available peer is a no-op.
    pub fn record_relayed_success(&mut self, peer: NodeId, now: u64) -> Option<DirectPathEvent> {
        let state = self.peers.entry(peer).or_insert_with(PeerState::fresh);
        if state.availability == Availability::DirectAvailable {
            return None;
        }
        state.availability = Availability::DirectAvailable;
        state.backoff_step = 0;
        state.next_retry_at = now;
        Some(DirectPathEvent::Restored { peer })
    }

    /// The transport-level connection to `peer` dropped — degrade to
    /// relay-only and arm the next backoff step. The cooldown is set before
    /// any wait elapses, so a peer that just failed is not retried on the
    /// very next tick.
    pub fn mark_lost(&mut self, peer: NodeId, now: u64) -> Option<DirectPathEvent> {
        let state = self.peers.entry(peer).or_insert_with(PeerState::fresh);
        let was_available = state.availability == Availability::DirectAvailable;

        state.availability = Availability::RelayOnly;
        let step = BACKOFF_STEPS_MS[state.backoff_step.min(BACKOFF_STEPS_MS.len() - 1)];
        state.next_retry_at = now + step;
        state.backoff_step = (state.backoff_step + 1).min(BACKOFF_STEPS_MS.len() - 1);

        if was_available {
            Some(DirectPathEvent::Lost { peer })
        } else {
            None
        }
    }

    /// Whether `peer` currently has a direct channel open.
    pub fn is_direct_available(&self, peer: &NodeId) -> bool {
        matches!(
            self.peers.get(peer).map(|s| s.availability),
            Some(Availability::DirectAvailable)
        )
    }

    /// Forget everything known about a peer (on explicit departure).
    pub fn remove(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }
}

impl Default for DirectPathManager {
    fn default() -> Self {
        Self::new()
    }
}
