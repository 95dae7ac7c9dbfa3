//! Authenticated handshake
//!
//! ```text
//! HOST                                   PEER
//!  |-- SYN {ver, nonce_h, pk_h} ---------->|  pk_h must match the link
//!  |<- SYN_ACK {nonce_p, nonce_h, pk_p,   -|
//!  |            sig_p(nonce_h)}            |
//!  |-- ACK {nonce_p, sig_h(nonce_p)} ----->|
//!  |-- KEY_EX {eph_h, sig_h(..nonce_p)} -->|
//!  |<- KEY_EX {eph_p, sig_p(..nonce_h)} --|
//!  |<========= KEY_CONFIRM (sealed) ======>|
//! ```
//!
//! Messages that arrive in a state that does not expect them are ignored.

use crate::crypto::{self, b64_decode, b64_encode, EphemeralKeyPair};
use crate::identity::{decode_public_key, verify_b64};
use crate::proto::ControlMessage;
use crate::session::{Event, Session};
use crate::{ErrorCode, ProtocolError, ProtocolState, Role, PROTOCOL_VERSION};
use tracing::{debug, info};

type HandshakeResult = std::result::Result<(), ProtocolError>;

fn crypto_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::new(ErrorCode::CryptoErr, e.to_string())
}

/// Bytes signed over an ephemeral key: `"KEY_EX" | key | nonce`
fn key_ex_transcript(key: &[u8], nonce: &str) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(6 + key.len() + nonce.len());
    transcript.extend_from_slice(b"KEY_EX");
    transcript.extend_from_slice(key);
    transcript.extend_from_slice(nonce.as_bytes());
    transcript
}

/// Both channels are up; HOST opens with `SYN`
pub(crate) fn on_channel_open(s: &mut Session) -> HandshakeResult {
    if s.state != ProtocolState::Signaling {
        debug!("Ignoring channel open in state {}", s.state);
        return Ok(());
    }
    if s.role == Role::Peer {
        debug!("Channels open, waiting for SYN");
        return Ok(());
    }

    let nonce = crypto::handshake_nonce().map_err(crypto_err)?;
    s.local_nonce = Some(nonce.clone());
    s.send_control(ControlMessage::Syn {
        ver: PROTOCOL_VERSION.to_string(),
        nonce,
        pubkey: s.identity.public_key_b64(),
    })?;
    s.set_state(ProtocolState::HandshakeSynSent);
    Ok(())
}

pub(crate) fn on_syn(s: &mut Session, ver: &str, nonce: String, pubkey: &str) -> HandshakeResult {
    if s.role == Role::Host {
        return Err(ProtocolError::new(
            ErrorCode::ProtoErr,
            "HOST received SYN",
        ));
    }
    if s.state != ProtocolState::Signaling {
        debug!("Ignoring SYN in state {}", s.state);
        return Ok(());
    }
    if ver != PROTOCOL_VERSION {
        return Err(ProtocolError::new(
            ErrorCode::ProtoErr,
            format!("unsupported protocol version {}", ver),
        ));
    }

    let Some(expected) = s.expected_host_key else {
        return Err(ProtocolError::new(ErrorCode::ProtoErr, "no host key bound to this session"));
    };
    let offered = decode_public_key(pubkey).map_err(|_| {
        ProtocolError::new(ErrorCode::MitmAlert, "SYN carries an undecodable host key")
    })?;
    if offered != expected {
        return Err(ProtocolError::new(
            ErrorCode::MitmAlert,
            "host key does not match the connection link",
        ));
    }

    let local_nonce = crypto::handshake_nonce().map_err(crypto_err)?;
    let sig = s.identity.sign_b64(nonce.as_bytes());
    s.remote_key = Some(offered);
    s.remote_nonce = Some(nonce.clone());
    s.local_nonce = Some(local_nonce.clone());

    s.send_control(ControlMessage::SynAck {
        nonce: local_nonce,
        nonce_ack: nonce,
        pubkey: s.identity.public_key_b64(),
        sig,
    })?;
    s.set_state(ProtocolState::HandshakeSynRcvd);
    Ok(())
}

pub(crate) fn on_syn_ack(
    s: &mut Session,
    nonce: String,
    nonce_ack: &str,
    pubkey: &str,
    sig: &str,
) -> HandshakeResult {
    if s.role != Role::Host || s.state != ProtocolState::HandshakeSynSent {
        debug!("Ignoring SYN_ACK in state {}", s.state);
        return Ok(());
    }
    if s.local_nonce.as_deref() != Some(nonce_ack) {
        return Err(ProtocolError::new(
            ErrorCode::AuthErr,
            "SYN_ACK does not echo our nonce",
        ));
    }

    let peer_key = decode_public_key(pubkey)
        .map_err(|_| ProtocolError::new(ErrorCode::AuthErr, "SYN_ACK carries an undecodable key"))?;
    if !verify_b64(&peer_key, nonce_ack.as_bytes(), sig) {
        return Err(ProtocolError::new(
            ErrorCode::AuthErr,
            "peer signature over our nonce is invalid",
        ));
    }

    let sig = s.identity.sign_b64(nonce.as_bytes());
    s.remote_key = Some(peer_key);
    s.remote_nonce = Some(nonce.clone());
    s.send_control(ControlMessage::Ack {
        nonce_ack: nonce,
        sig,
    })?;

    begin_key_exchange(s)
}

pub(crate) fn on_ack(s: &mut Session, nonce_ack: &str, sig: &str) -> HandshakeResult {
    if s.role != Role::Peer || s.state != ProtocolState::HandshakeSynRcvd {
        debug!("Ignoring ACK in state {}", s.state);
        return Ok(());
    }
    if s.local_nonce.as_deref() != Some(nonce_ack) {
        return Err(ProtocolError::new(
            ErrorCode::AuthErr,
            "ACK does not echo our nonce",
        ));
    }
    let Some(host_key) = s.expected_host_key else {
        return Err(ProtocolError::new(ErrorCode::ProtoErr, "no host key bound to this session"));
    };
    if !verify_b64(&host_key, nonce_ack.as_bytes(), sig) {
        return Err(ProtocolError::new(
            ErrorCode::AuthErr,
            "host signature over our nonce is invalid",
        ));
    }

    begin_key_exchange(s)
}

/// Generate the ephemeral key and send it, signed and bound to the remote nonce
fn begin_key_exchange(s: &mut Session) -> HandshakeResult {
    let Some(remote_nonce) = s.remote_nonce.clone() else {
        return Err(ProtocolError::new(ErrorCode::ProtoErr, "key exchange without remote nonce"));
    };

    let ephemeral = EphemeralKeyPair::generate();
    let public = ephemeral.public_bytes();
    let sig = s.identity.sign_b64(&key_ex_transcript(&public, &remote_nonce));
    s.ephemeral = Some(ephemeral);

    s.set_state(ProtocolState::KeyExchange);
    s.send_control(ControlMessage::KeyEx {
        key: b64_encode(&public),
        sig,
    })
}

pub(crate) fn on_key_ex(s: &mut Session, key: &str, sig: &str) -> HandshakeResult {
    if s.state != ProtocolState::KeyExchange {
        debug!("Ignoring KEY_EX in state {}", s.state);
        return Ok(());
    }
    let (Some(remote_key), Some(local_nonce)) = (s.remote_key, s.local_nonce.as_deref()) else {
        return Err(ProtocolError::new(ErrorCode::ProtoErr, "KEY_EX before authentication"));
    };

    let remote_public = b64_decode(key).map_err(crypto_err)?;
    if !verify_b64(&remote_key, &key_ex_transcript(&remote_public, local_nonce), sig) {
        return Err(ProtocolError::new(
            ErrorCode::MitmAlert,
            "ephemeral key is not signed by the authenticated identity",
        ));
    }

    let Some(ephemeral) = s.ephemeral.take() else {
        return Err(ProtocolError::new(ErrorCode::CryptoErr, "no local ephemeral key"));
    };
    let keys = ephemeral.agree(&remote_public).map_err(crypto_err)?;
    let mac = crypto::key_confirmation(keys.validation_key(), s.role).map_err(crypto_err)?;
    s.channel.install(keys);
    debug!("Session keys derived, control channel encrypted");

    s.set_state(ProtocolState::KeyConfirming);
    s.send_control(ControlMessage::KeyConfirm {
        mac: b64_encode(&mac),
    })
}

pub(crate) fn on_key_confirm(s: &mut Session, mac: &str) -> HandshakeResult {
    if s.state != ProtocolState::KeyConfirming {
        debug!("Ignoring KEY_CONFIRM in state {}", s.state);
        return Ok(());
    }
    let (Some(keys), Some(remote_key)) = (s.channel.keys(), s.remote_key) else {
        return Err(ProtocolError::new(ErrorCode::SecErr, "no session keys to confirm"));
    };

    let tag = b64_decode(mac)
        .map_err(|_| ProtocolError::new(ErrorCode::SecErr, "undecodable confirmation MAC"))?;
    if !crypto::verify_key_confirmation(keys.validation_key(), s.role.remote(), &tag) {
        return Err(ProtocolError::new(
            ErrorCode::SecErr,
            "key confirmation failed",
        ));
    }

    let fingerprint = crypto::fingerprint(&s.identity.public_key(), &remote_key);
    s.fingerprint = Some(fingerprint);
    s.handshake_timer.cancel();
    s.set_state(ProtocolState::Established);
    info!("Session established, fingerprint {}", fingerprint.short());

    s.emit(Event::Fingerprint(fingerprint));
    s.emit(Event::Connected);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ex_transcript_layout() {
        let transcript = key_ex_transcript(&[1, 2, 3], "ab");
        assert_eq!(transcript, b"KEY_EX\x01\x02\x03ab");
    }
}
