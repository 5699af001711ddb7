/// Message lifecycle tracker for ToM protocol.
///
/// Tracks the status pipeline: Pending → Sent → Relayed → Delivered → Read.
/// Status is monotonically increasing — no regression allowed.
///
/// Pure logic, no I/O. The caller feeds events (ACKs, read receipts),
/// the tracker updates status and reports transitions.
use std::collections::HashMap;
use std::time::Instant;

use crate::types::{MessageStatus, NodeId};

/// Maximum number of tracked messages (DoS protection).
const MAX_TRACKED: usize = 10_000;

/// Maximum age for a tracked message before it's considered stuck (24h).
const MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// A status transition event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub message_id: String,
    pub previous: MessageStatus,
    pub current: MessageStatus,
}

/// Internal tracking entry for a single message.
#[derive(Debug, Clone)]
struct TrackedMessage {
    status: MessageStatus,
    #[allow(dead_code)] // Used for future monitoring/queries
    to: NodeId,
    created: Instant,
}

/// Tracks message lifecycle from send to read receipt.
///
/// Feed it events from the Router (ACKs, read receipts) and it
/// returns status transitions that the application can display.
pub struct MessageTracker {
    messages: HashMap<String, TrackedMessage>,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// Start tracking a new outgoing message.
    ///
    /// Returns `None` if at capacity (caller should decide: drop oldest or reject).
    pub fn track(&mut self, message_id: String, to: NodeId) -> Option<StatusChange> {
        if self.messages.len() >= MAX_TRACKED {
            self.evict_expired();
            if self.messages.len() >= MAX_TRACKED {
                return None; // Still at capacity
            }
        }

        self.messages.insert(
            message_id.clone(),
            TrackedMessage {
                status: MessageStatus::Pending,
                to,
                created: Instant::now(),
            },
        );

        Some(StatusChange {
            message_id,
            previous: MessageStatus::Pending,
            current: MessageStatus::Pending,
        })
    }

    /// Mark a message as sent (transport confirmed it left this node).
    pub fn mark_sent(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, MessageStatus::Sent)
    }

    /// Mark a message as relayed (relay ACK received).
    pub fn mark_relayed(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, MessageStatus::Relayed)
    }

    /// Mark a message as delivered (recipient ACK received).
    pub fn mark_delivered(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, MessageStatus::Delivered)
    }

    /// Mark a message as read (read receipt received).
    pub fn mark_read(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, MessageStatus::Read)
    }

    /// Get the current status of a tracked message.
    pub fn status(&self, message_id: &str) -> Option<MessageStatus> {
        self.messages.get(message_id).map(|m| m.status)
    }

    /// Number of currently tracked messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove a message from tracking (e.g., after Read or after TTL expiry).
    pub fn remove(&mut self, message_id: &str) -> bool {
        self.messages.remove(message_id).is_some()
    }

    /// Evict messages older than MAX_AGE_SECS.
    pub fn evict_expired(&mut self) {
        let cutoff = std::time::Duration::from_secs(MAX_AGE_SECS);
        let now = Instant::now();
        self.messages
            .retain(|_, m| now.duration_since(m.created) < cutoff);
    }

    // ── Internal ───────────────────────────────────────────────────────

    /// Advance a message to a new status. Only forward transitions are allowed.
    fn advance(&mut self, message_id: &str, new_status: MessageStatus) -> Option<StatusChange> {
        let entry = self.messages.get_mut(message_id)?;

        // Monotonic: only advance, never regress
        if new_status <= entry.status {
            return None;
        }

        let previous = entry.status;
        entry.status = new_status;

        Some(StatusChange {
            message_id: message_id.to_string(),
            previous,
            current: new_status,
        })
    }
}

impl Default for MessageTracker {
    fn default() -> Self {
        Self::new()
    }
}
