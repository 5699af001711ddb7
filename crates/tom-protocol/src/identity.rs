//! Node identity — Ed25519 keypair, `NodeId`, and on-disk persistence.
//!
//! A `NodeId` is the hex encoding of a 32-byte Ed25519 public key. It is
//! self-contained: derivable from key material alone, with no dependency
//! on any particular transport's addressing scheme.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TomProtocolError;

/// Network identity — hex encoding of an Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32-byte Ed25519 public key.
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Derive the `NodeId` for a given Ed25519 verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "NodeId({}...)", &hex[..12])
    }
}

impl FromStr for NodeId {
    type Err = TomProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(TomProtocolError::InvalidNodeId(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_pair =
                std::str::from_utf8(chunk).map_err(|_| TomProtocolError::InvalidNodeId(s.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_pair, 16)
                .map_err(|_| TomProtocolError::InvalidNodeId(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A node's long-lived Ed25519 identity: keypair plus derived `NodeId`.
pub struct Identity {
    node_id: NodeId,
    signing_key: SigningKey,
}

/// On-disk representation — hex-encoded public/secret key, per the
/// persistence contract: generate once, persist verbatim, never rotate.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    public_key: String,
    secret_key: String,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let node_id = NodeId::from_verifying_key(&signing_key.verifying_key());
        Self {
            node_id,
            signing_key,
        }
    }

    /// Build an identity from a known 32-byte Ed25519 secret key seed.
    pub fn from_secret_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let node_id = NodeId::from_verifying_key(&signing_key.verifying_key());
        Self {
            node_id,
            signing_key,
        }
    }

    /// This node's identity.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The 32-byte secret key seed, needed to sign envelopes and derive
    /// X25519 keys for encryption.
    pub fn secret_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Load an identity from disk, or generate and persist one if absent.
    ///
    /// Matches the persistence contract: load verbatim on subsequent
    /// launches, never rotate.
    pub fn load_or_generate(path: &Path) -> Result<Self, TomProtocolError> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    /// Load an identity previously persisted by [`Identity::save`].
    pub fn load(path: &Path) -> Result<Self, TomProtocolError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| TomProtocolError::Identity(format!("read identity file: {e}")))?;
        let file: IdentityFile = serde_json::from_str(&data)
            .map_err(|e| TomProtocolError::Identity(format!("parse identity file: {e}")))?;

        let secret_bytes = hex_decode(&file.secret_key)
            .map_err(|_| TomProtocolError::Identity("malformed secret_key hex".into()))?;
        let seed: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| TomProtocolError::Identity("secret_key must be 32 bytes".into()))?;

        let identity = Self::from_secret_seed(seed);

        let expected_public = identity.node_id.to_string();
        if expected_public != file.public_key {
            return Err(TomProtocolError::Identity(
                "identity file public_key does not match secret_key".into(),
            ));
        }

        Ok(identity)
    }

    /// Persist this identity as `{publicKey, secretKey}` hex JSON.
    pub fn save(&self, path: &Path) -> Result<(), TomProtocolError> {
        let file = IdentityFile {
            public_key: self.node_id.to_string(),
            secret_key: hex_encode(&self.secret_seed()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| TomProtocolError::Identity(format!("serialize identity file: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TomProtocolError::Identity(format!("create identity dir: {e}")))?;
        }
        std::fs::write(path, json)
            .map_err(|e| TomProtocolError::Identity(format!("write identity file: {e}")))?;
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    s.as_bytes()
        .chunks(2)
        .map(|chunk| {
            let pair = std::str::from_utf8(chunk).map_err(|_| ())?;
            u8::from_str_radix(pair, 16).map_err(|_| ())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u8) -> Identity {
        Identity::from_secret_seed([seed; 32])
    }

    #[test]
    fn node_id_roundtrips_through_display_and_parse() {
        let id = seeded(1).node_id();
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        let parsed: NodeId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn node_id_rejects_short_strings() {
        let result: Result<NodeId, _> = "abc123".parse();
        assert!(result.is_err());
    }

    #[test]
    fn node_id_rejects_non_hex() {
        let bad = "z".repeat(64);
        let result: Result<NodeId, _> = bad.parse();
        assert!(result.is_err());
    }

    #[test]
    fn same_seed_same_node_id() {
        assert_eq!(seeded(7).node_id(), seeded(7).node_id());
    }

    #[test]
    fn different_seed_different_node_id() {
        assert_ne!(seeded(7).node_id(), seeded(8).node_id());
    }

    #[test]
    fn serde_roundtrip() {
        let id = seeded(3).node_id();
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = seeded(42);
        original.save(&path).unwrap();

        let loaded = Identity::load(&path).unwrap();
        assert_eq!(loaded.node_id(), original.node_id());
        assert_eq!(loaded.secret_seed(), original.secret_seed());
    }

    #[test]
    fn load_or_generate_persists_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn load_rejects_tampered_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = seeded(5);
        identity.save(&path).unwrap();

        let mut file: IdentityFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        file.public_key = "f".repeat(64);
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        assert!(Identity::load(&path).is_err());
    }
}
