use crate::envelope::Envelope;
use crate::tracker::StatusChange;
use crate::types::NodeId;

use super::{DeliveredMessage, ProtocolEvent};

/// Intent produced by `RuntimeState`'s pure logic.
///
/// Every handle_* / tick_* method returns `Vec<RuntimeEffect>`. The event
/// loop is the only place these get executed, via the transport + channels.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Send an envelope to its first hop (relay or direct).
    SendEnvelope(Envelope),

    /// Send an envelope to a specific node (explicit hop).
    SendEnvelopeTo {
        target: NodeId,
        envelope: Envelope,
    },

    /// Deliver a decrypted, verified message to the application.
    DeliverMessage(DeliveredMessage),

    /// Notify a status change (pending -> sent -> relayed -> delivered -> read).
    StatusChange(StatusChange),

    /// Emit a protocol-level event (peer offline, group created, etc.).
    Emit(ProtocolEvent),

    /// Try to send; if the transport fails, run the fallback plan instead.
    /// Used for automatic backup when a peer is offline.
    SendWithBackupFallback {
        envelope: Envelope,
        on_success: Vec<RuntimeEffect>,
        on_failure: Vec<RuntimeEffect>,
    },

    /// Try `envelope`'s first hop; on transport failure, retry once via
    /// `alternate` (a different relay, or a relay path after a failed
    /// direct attempt) before surfacing the error. `alternate` carries a
    /// fresh envelope id — it is a distinct send attempt, not a retry of
    /// the same one.
    SendWithReroute {
        envelope: Envelope,
        alternate: Option<Envelope>,
    },
}
