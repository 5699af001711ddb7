/// Protocol-level errors for ToM.
///
/// Adds protocol-specific variants (crypto, routing, serialization) on
/// top of the abstract transport's own failure mode. Each variant maps
/// onto one of the wire-visible error codes in `TomProtocolError::code`.
#[derive(Debug, thiserror::Error)]
pub enum TomProtocolError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("peer unreachable: {node_id}")]
    PeerUnreachable { node_id: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("relay rejected message: {reason}")]
    RelayRejected { reason: String },

    #[error("signaling timeout")]
    SignalingTimeout,

    #[error("identity missing or unusable: {0}")]
    Identity(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}

impl TomProtocolError {
    /// The wire-visible error code for this failure, per the external
    /// error taxonomy (`TRANSPORT_FAILED`, `PEER_UNREACHABLE`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            TomProtocolError::Transport(_) => "TRANSPORT_FAILED",
            TomProtocolError::PeerUnreachable { .. } => "PEER_UNREACHABLE",
            TomProtocolError::SignalingTimeout => "SIGNALING_TIMEOUT",
            TomProtocolError::InvalidEnvelope { .. } => "INVALID_ENVELOPE",
            TomProtocolError::Identity(_) => "IDENTITY_MISSING",
            TomProtocolError::RelayRejected { .. } => "RELAY_REJECTED",
            TomProtocolError::Crypto(_) => "CRYPTO_FAILED",
            TomProtocolError::InvalidSignature => "CRYPTO_FAILED",
            TomProtocolError::Serialization(_) | TomProtocolError::Deserialization(_) => {
                "INVALID_ENVELOPE"
            }
            TomProtocolError::InvalidNodeId(_) => "INVALID_ENVELOPE",
        }
    }
}

impl From<rmp_serde::encode::Error> for TomProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TomProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TomProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TomProtocolError::Deserialization(e.to_string())
    }
}
