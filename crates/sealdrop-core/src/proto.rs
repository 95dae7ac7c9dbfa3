//! Control-channel message definitions
//!
//! Every control message is a JSON object tagged by `t`. Before session
//! keys exist they travel as plain JSON; afterwards they are wrapped in
//! [`Sequenced`] and encrypted with the control key.

use crate::{FileMeta, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// HOST opens the handshake
    Syn {
        ver: String,
        /// Hex nonce for the peer to sign
        nonce: String,
        /// HOST identity key, base64url
        pubkey: String,
    },
    /// PEER answers with its own nonce and a signature over HOST's nonce
    SynAck {
        nonce: String,
        nonce_ack: String,
        pubkey: String,
        sig: String,
    },
    /// HOST signs PEER's nonce
    Ack { nonce_ack: String, sig: String },
    /// Ephemeral X25519 key, signed by the identity key
    KeyEx { key: String, sig: String },
    KeyConfirm { mac: String },
    Meta {
        files: Vec<FileMeta>,
        #[serde(rename = "chunkSize")]
        chunk_size: u64,
    },
    Request {
        #[serde(rename = "chunkId")]
        chunk_id: u64,
    },
    ChunkHash {
        #[serde(rename = "chunkId")]
        chunk_id: u64,
        hash: String,
    },
    ChunkAck {
        #[serde(rename = "chunkId")]
        chunk_id: u64,
    },
    Pause,
    Resume,
    Cancel,
    Fin { hash: String },
    FinAck,
}

impl ControlMessage {
    /// Wire opcode, for logging
    pub fn opcode(&self) -> &'static str {
        match self {
            ControlMessage::Syn { .. } => "SYN",
            ControlMessage::SynAck { .. } => "SYN_ACK",
            ControlMessage::Ack { .. } => "ACK",
            ControlMessage::KeyEx { .. } => "KEY_EX",
            ControlMessage::KeyConfirm { .. } => "KEY_CONFIRM",
            ControlMessage::Meta { .. } => "META",
            ControlMessage::Request { .. } => "REQUEST",
            ControlMessage::ChunkHash { .. } => "CHUNK_HASH",
            ControlMessage::ChunkAck { .. } => "CHUNK_ACK",
            ControlMessage::Pause => "PAUSE",
            ControlMessage::Resume => "RESUME",
            ControlMessage::Cancel => "CANCEL",
            ControlMessage::Fin { .. } => "FIN",
            ControlMessage::FinAck => "FIN_ACK",
        }
    }

    /// Encode as plaintext JSON
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode plaintext JSON
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// A control message with its sequence number, as sealed once keys exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequenced {
    pub seq: u64,
    #[serde(flatten)]
    pub message: ControlMessage,
}

impl Sequenced {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_opcode_tags() {
        let value = serde_json::to_value(ControlMessage::SynAck {
            nonce: "aa".into(),
            nonce_ack: "bb".into(),
            pubkey: "pk".into(),
            sig: "s".into(),
        })
        .unwrap();
        assert_eq!(value["t"], "SYN_ACK");
        assert_eq!(value["nonce_ack"], "bb");

        let value = serde_json::to_value(ControlMessage::Request { chunk_id: 4 }).unwrap();
        assert_eq!(value, json!({"t": "REQUEST", "chunkId": 4}));

        let value = serde_json::to_value(ControlMessage::FinAck).unwrap();
        assert_eq!(value, json!({"t": "FIN_ACK"}));
    }

    #[test]
    fn test_meta_wire_shape() {
        let meta = ControlMessage::Meta {
            files: vec![FileMeta {
                id: 0,
                name: "report.pdf".into(),
                size: 1024,
                mime_type: "application/pdf".into(),
            }],
            chunk_size: 256,
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["t"], "META");
        assert_eq!(value["chunkSize"], 256);
        assert_eq!(value["files"][0]["type"], "application/pdf");
        assert_eq!(ControlMessage::from_bytes(&meta.to_bytes().unwrap()).unwrap(), meta);
    }

    #[test]
    fn test_sequenced_flattens_seq() {
        let sealed = Sequenced {
            seq: 7,
            message: ControlMessage::ChunkAck { chunk_id: 2 },
        };
        let value = serde_json::to_value(&sealed).unwrap();
        assert_eq!(value, json!({"seq": 7, "t": "CHUNK_ACK", "chunkId": 2}));

        let parsed = Sequenced::from_bytes(br#"{"t":"PAUSE","seq":3}"#).unwrap();
        assert_eq!(parsed.seq, 3);
        assert_eq!(parsed.message, ControlMessage::Pause);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(ControlMessage::from_bytes(br#"{"t":"HELLO"}"#).is_err());
        assert!(ControlMessage::from_bytes(b"not json").is_err());
        assert!(Sequenced::from_bytes(br#"{"t":"PAUSE"}"#).is_err());
    }
}
