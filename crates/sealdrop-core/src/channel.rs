//! Secure channel: framing, encryption and replay protection
//!
//! Holds the session keys and the two sequence counters. Control frames are
//! plaintext until [`SecureChannel::install`] is called; after that every
//! control frame is a sealed [`Sequenced`] message whose `seq` must strictly
//! increase. Data frames are always sealed with the data key.

use crate::crypto::{self, SessionKeys};
use crate::proto::{ControlMessage, Sequenced};
use crate::{ErrorCode, ProtocolError};

#[derive(Debug, Default)]
pub struct SecureChannel {
    keys: Option<SessionKeys>,
    seq_local: u64,
    seq_remote: u64,
}

impl SecureChannel {
    /// Plaintext framing, both sequence counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the control channel to encrypted framing
    pub fn install(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
        self.seq_local = 0;
        self.seq_remote = 0;
    }

    pub fn is_encrypted(&self) -> bool {
        self.keys.is_some()
    }

    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    /// Drop the keys; they are zeroized on drop
    pub fn clear(&mut self) {
        self.keys = None;
    }

    /// Frame an outbound control message
    pub fn seal_control(&mut self, message: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
        let Some(keys) = &self.keys else {
            return message
                .to_bytes()
                .map_err(|e| ProtocolError::new(ErrorCode::CtrlErr, e.to_string()));
        };

        self.seq_local += 1;
        let plaintext = Sequenced {
            seq: self.seq_local,
            message: message.clone(),
        }
        .to_bytes()
        .map_err(|e| ProtocolError::new(ErrorCode::CtrlErr, e.to_string()))?;

        crypto::encrypt(keys.control_key(), &plaintext)
            .map_err(|e| ProtocolError::new(ErrorCode::EncryptErr, e.to_string()))
    }

    /// Unframe an inbound control message, enforcing strictly increasing `seq`
    pub fn open_control(&mut self, frame: &[u8]) -> Result<ControlMessage, ProtocolError> {
        let Some(keys) = &self.keys else {
            return ControlMessage::from_bytes(frame).map_err(|e| {
                ProtocolError::new(ErrorCode::CtrlErr, format!("malformed control message: {}", e))
            });
        };

        let plaintext = crypto::decrypt(keys.control_key(), frame)
            .map_err(|e| ProtocolError::new(ErrorCode::CtrlErr, e.to_string()))?;
        let sealed = Sequenced::from_bytes(&plaintext).map_err(|e| {
            ProtocolError::new(ErrorCode::CtrlErr, format!("malformed control message: {}", e))
        })?;

        if sealed.seq <= self.seq_remote {
            return Err(ProtocolError::new(
                ErrorCode::CtrlErr,
                format!(
                    "replayed control message: seq {} after {}",
                    sealed.seq, self.seq_remote
                ),
            ));
        }
        self.seq_remote = sealed.seq;

        Ok(sealed.message)
    }

    pub fn seal_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| ProtocolError::new(ErrorCode::EncryptErr, "no session keys"))?;
        crypto::encrypt(keys.data_key(), plaintext)
            .map_err(|e| ProtocolError::new(ErrorCode::EncryptErr, e.to_string()))
    }

    pub fn open_data(&self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| ProtocolError::new(ErrorCode::DecryptErr, "no session keys"))?;
        crypto::decrypt(keys.data_key(), frame)
            .map_err(|e| ProtocolError::new(ErrorCode::DecryptErr, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralKeyPair;

    fn linked() -> (SecureChannel, SecureChannel) {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let (a_pub, b_pub) = (a.public_bytes(), b.public_bytes());
        let mut left = SecureChannel::new();
        let mut right = SecureChannel::new();
        left.install(a.agree(&b_pub).unwrap());
        right.install(b.agree(&a_pub).unwrap());
        (left, right)
    }

    #[test]
    fn test_plaintext_before_keys() {
        let mut channel = SecureChannel::new();
        let frame = channel.seal_control(&ControlMessage::Pause).unwrap();
        assert_eq!(frame, br#"{"t":"PAUSE"}"#);
        assert_eq!(channel.open_control(&frame).unwrap(), ControlMessage::Pause);
        assert!(channel.seal_data(b"x").is_err());
    }

    #[test]
    fn test_sealed_control_roundtrip() {
        let (mut left, mut right) = linked();
        for id in 0..3 {
            let frame = left
                .seal_control(&ControlMessage::ChunkAck { chunk_id: id })
                .unwrap();
            assert!(serde_json::from_slice::<serde_json::Value>(&frame).is_err());
            assert_eq!(
                right.open_control(&frame).unwrap(),
                ControlMessage::ChunkAck { chunk_id: id }
            );
        }
    }

    #[test]
    fn test_replayed_control_rejected() {
        let (mut left, mut right) = linked();
        let first = left.seal_control(&ControlMessage::Pause).unwrap();
        let second = left.seal_control(&ControlMessage::Resume).unwrap();

        right.open_control(&second).unwrap();
        let err = right.open_control(&first).unwrap_err();
        assert_eq!(err.code, ErrorCode::CtrlErr);
        let err = right.open_control(&second).unwrap_err();
        assert_eq!(err.code, ErrorCode::CtrlErr);
    }

    #[test]
    fn test_plaintext_rejected_once_encrypted() {
        let (_, mut right) = linked();
        let err = right.open_control(br#"{"t":"PAUSE"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::CtrlErr);
    }

    #[test]
    fn test_data_tamper_is_decrypt_error() {
        let (left, right) = linked();
        let mut frame = left.seal_data(b"payload").unwrap();
        assert_eq!(right.open_data(&frame).unwrap(), b"payload");

        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(right.open_data(&frame).unwrap_err().code, ErrorCode::DecryptErr);
    }

    #[test]
    fn test_clear_drops_keys() {
        let (mut left, _) = linked();
        assert!(left.is_encrypted());
        left.clear();
        assert!(!left.is_encrypted());
        assert!(left.seal_data(b"x").is_err());
    }
}
