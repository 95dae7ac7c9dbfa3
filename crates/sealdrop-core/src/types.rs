//! Core data types for Sealdrop

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte BLAKE3 hash
pub type ContentHash = [u8; 32];

/// Protocol role of an engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Generates connection links, initiates the handshake, sends the file
    Host,
    /// Joins through a link, receives the file
    Peer,
}

impl Role {
    /// The role on the other end of the session
    pub fn remote(&self) -> Role {
        match self {
            Role::Host => Role::Peer,
            Role::Peer => Role::Host,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "HOST",
            Role::Peer => "PEER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Idle,
    Signaling,
    HandshakeSynSent,
    HandshakeSynRcvd,
    KeyExchange,
    KeyConfirming,
    Established,
    MetaSent,
    Transferring,
    Paused,
    Closed,
}

impl ProtocolState {
    /// True once key confirmation succeeded and the session is still open
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            ProtocolState::Established
                | ProtocolState::MetaSent
                | ProtocolState::Transferring
                | ProtocolState::Paused
        )
    }

    /// True while a file is moving (or paused mid-file)
    pub fn is_transfer_active(&self) -> bool {
        matches!(
            self,
            ProtocolState::MetaSent | ProtocolState::Transferring | ProtocolState::Paused
        )
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Idle => "IDLE",
            ProtocolState::Signaling => "SIGNALING",
            ProtocolState::HandshakeSynSent => "HANDSHAKE_SYN_SENT",
            ProtocolState::HandshakeSynRcvd => "HANDSHAKE_SYN_RCVD",
            ProtocolState::KeyExchange => "KEY_EXCHANGE",
            ProtocolState::KeyConfirming => "KEY_CONFIRMING",
            ProtocolState::Established => "ESTABLISHED",
            ProtocolState::MetaSent => "META_SENT",
            ProtocolState::Transferring => "TRANSFERRING",
            ProtocolState::Paused => "PAUSED",
            ProtocolState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// File announcement carried by `META`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Index of the file within the announcement (always 0)
    pub id: u32,
    /// Original filename
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// MIME type, empty when unknown
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

/// Session fingerprint shown to both users for out-of-band comparison
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub ContentHash);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hash_to_hex(&self.0)
    }

    /// Short grouped form for reading aloud, e.g. `3fa1 09bc 77d2 e410`
    pub fn short(&self) -> String {
        self.to_hex()[..16]
            .as_bytes()
            .chunks(4)
            .map(|group| String::from_utf8_lossy(group).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Helper to format a content hash as hex string
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into a content hash
pub fn hex_to_hash(s: &str) -> Result<ContentHash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_format() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "\"HOST\"");
        assert_eq!(Role::Peer.remote(), Role::Host);
        assert_eq!(Role::Host.to_string(), "HOST");
    }

    #[test]
    fn test_file_meta_type_field() {
        let meta = FileMeta {
            id: 0,
            name: "a.txt".to_string(),
            size: 12,
            mime_type: "text/plain".to_string(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "text/plain");

        let parsed: FileMeta =
            serde_json::from_str(r#"{"id":0,"name":"b","size":1}"#).unwrap();
        assert_eq!(parsed.mime_type, "");
    }

    #[test]
    fn test_hex_hash_roundtrip_rejects_short() {
        let hash = [7u8; 32];
        assert_eq!(hex_to_hash(&hash_to_hex(&hash)).unwrap(), hash);
        assert!(hex_to_hash("abcd").is_err());
    }

    #[test]
    fn test_fingerprint_short_form() {
        let fp = Fingerprint([0xab; 32]);
        assert_eq!(fp.short(), "abab abab abab abab");
        assert_eq!(fp.to_hex().len(), 64);
    }

    #[test]
    fn test_state_groups() {
        assert!(ProtocolState::Paused.is_established());
        assert!(!ProtocolState::KeyConfirming.is_established());
        assert!(ProtocolState::MetaSent.is_transfer_active());
        assert!(!ProtocolState::Closed.is_transfer_active());
    }
}
