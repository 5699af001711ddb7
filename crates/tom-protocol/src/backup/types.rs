/// Backup types for the ToM "virus backup" system.
///
/// Messages for offline recipients self-replicate across backup nodes,
/// and self-delete when delivered or after 24h TTL.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

// ── Constants ────────────────────────────────────────────────────────────

/// Maximum TTL: 24 hours (design decision #2 — non-negotiable).
pub const MAX_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Default TTL (same as max).
pub const DEFAULT_TTL_MS: u64 = MAX_TTL_MS;

/// Cleanup interval (60 seconds). Caller uses this as timer interval.
pub const CLEANUP_INTERVAL_MS: u64 = 60_000;

/// Viability check interval (30 seconds).
pub const VIABILITY_CHECK_INTERVAL_MS: u64 = 30_000;

/// Viability score at or below which replication is triggered.
pub const REPLICATION_THRESHOLD: u8 = 30;

/// Viability score at or below which self-deletion is triggered.
pub const DELETION_THRESHOLD: u8 = 10;

/// Maximum replicas per message.
pub const MAX_REPLICAS: usize = 5;

/// Query timeout (30 seconds).
pub const QUERY_TIMEOUT_MS: u64 = 30_000;

/// Query debounce window (5 seconds).
pub const QUERY_DEBOUNCE_MS: u64 = 5_000;

// ── Types ────────────────────────────────────────────────────────────────

/// A backed-up message held for an offline recipient.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    /// Original message ID (from Envelope).
    pub message_id: String,
    /// Encrypted payload bytes (opaque — we never decrypt).
    pub payload: Vec<u8>,
    /// Who this message is for.
    pub recipient_id: NodeId,
    /// Who sent the original message.
    pub sender_id: NodeId,
    /// When we stored this backup (Unix ms).
    pub stored_at: u64,
    /// Absolute expiry time (Unix ms). Hard limit: stored_at + MAX_TTL_MS.
    pub expires_at: u64,
    /// Viability score (0–100). Drives replication/deletion decisions.
    pub viability_score: u8,
    /// Nodes that have confirmed replicas.
    pub replicated_to: HashSet<NodeId>,
}

impl BackupEntry {
    /// Create a new backup entry.
    pub fn new(
        message_id: String,
        payload: Vec<u8>,
        recipient_id: NodeId,
        sender_id: NodeId,
        now: u64,
        ttl_ms: Option<u64>,
    ) -> Self {
        let ttl = ttl_ms.unwrap_or(DEFAULT_TTL_MS).min(MAX_TTL_MS);
        Self {
            message_id,
            payload,
            recipient_id,
            sender_id,
            stored_at: now,
            expires_at: now + ttl,
            viability_score: 100,
            replicated_to: HashSet::new(),
        }
    }

    /// Whether this entry has expired.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Remaining TTL in ms (0 if expired).
    pub fn remaining_ttl(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Number of confirmed replicas.
    pub fn replica_count(&self) -> usize {
        self.replicated_to.len()
    }
}

/// Events emitted by the backup system.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    /// A new message was stored for backup.
    MessageStored {
        message_id: String,
        recipient_id: NodeId,
    },

    /// A message expired (TTL exceeded).
    MessageExpired {
        message_id: String,
        recipient_id: NodeId,
    },

    /// A message was delivered (recipient confirmed).
    MessageDelivered {
        message_id: String,
        recipient_id: NodeId,
    },

    /// Viability dropped — replication needed (score <= 30%).
    ReplicationNeeded {
        message_id: String,
        recipient_id: NodeId,
        score: u8,
    },

    /// Viability critical — self-deletion recommended (score <= 10%).
    SelfDeleteRecommended {
        message_id: String,
        recipient_id: NodeId,
        score: u8,
    },

    /// Message was successfully replicated to another node.
    MessageReplicated {
        message_id: String,
        target_node: NodeId,
    },
}

/// Payload for replication requests between backup nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPayload {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub recipient_id: NodeId,
    pub sender_id: NodeId,
    pub expires_at: u64,
    pub viability_score: u8,
    pub replicated_to: Vec<NodeId>,
}

/// Actions returned by the backup system for the caller to execute.
#[derive(Debug, Clone)]
pub enum BackupAction {
    /// Send a replication request to a specific node.
    Replicate {
        target: NodeId,
        payload: ReplicationPayload,
    },

    /// Broadcast delivery confirmation to all backup nodes.
    ConfirmDelivery {
        message_ids: Vec<String>,
        recipient_id: NodeId,
        /// Replica holders to notify, captured before the entries were removed.
        targets: Vec<NodeId>,
    },

    /// Query network for pending messages for a recipient.
    QueryPending {
        recipient_id: NodeId,
    },

    /// Emit an event (for the application layer).
    Event(BackupEvent),
}

/// Wire payload for a pending-messages query. Carries no body — the
/// envelope's `to` field already names the recipient being queried for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupQueryPayload {}

/// Wire payload answering a `BackupQueryPayload` with the message IDs held
/// for the queried recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupQueryResponsePayload {
    pub message_ids: Vec<String>,
}

/// Wire payload confirming delivery so backup holders can drop their copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfirmDeliveryPayload {
    pub message_ids: Vec<String>,
}

/// Wire payload acknowledging a single replication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReplicateAckPayload {
    pub message_id: String,
}

/// Host factors used to compute viability score.
#[derive(Debug, Clone, Copy)]
pub struct HostFactors {
    /// Connection stability (0–100).
    pub stability: u8,
    /// Bandwidth capacity (0–100).
    pub bandwidth: u8,
    /// Contribution score (0–100).
    pub contribution: u8,
}

impl Default for HostFactors {
    fn default() -> Self {
        Self {
            stability: 50,
            bandwidth: 50,
            contribution: 50,
        }
    }
}
