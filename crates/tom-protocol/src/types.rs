use serde::{Deserialize, Serialize};

pub use crate::identity::NodeId;

/// Message type — determines how the protocol handles the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Chat,
    Ack,
    ReadReceipt,
    Heartbeat,
    // Presence and role gossip
    PresenceJoin,
    PresenceLeave,
    RoleAssign,
    /// Bootstrap-signaling-only envelope type; the core never interprets
    /// the payload, it only forwards it through the external signaling
    /// collaborator (see the abstract Transport/signaling contract).
    Signal,
    // Group lifecycle
    GroupCreate,
    GroupCreated,
    GroupInvite,
    GroupJoin,
    GroupSync,
    GroupMessage,
    GroupLeave,
    // Group broadcasts (hub → members)
    GroupMemberJoined,
    GroupMemberLeft,
    GroupHubMigration,
    GroupDeliveryAck,
    GroupReadReceipt,
    GroupHubHeartbeat,
    // Backup
    BackupStore,
    BackupDeliver,
    BackupReplicate,
    BackupReplicateAck,
    BackupQuery,
    BackupQueryResponse,
    BackupConfirmDelivery,
    // Network
    PeerAnnounce,
}

/// Delivery status pipeline for a message.
///
/// Follows the progression: Pending -> Sent -> Relayed -> Delivered -> Read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending = 0,
    Sent = 1,
    Relayed = 2,
    Delivered = 3,
    Read = 4,
}

/// Maximum relay depth (hops) for a message.
pub const MAX_TTL: u32 = 4;

/// Default TTL for new envelopes.
pub const DEFAULT_TTL: u32 = 4;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}
