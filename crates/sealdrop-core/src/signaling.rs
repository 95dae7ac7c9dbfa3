//! Signaling messages and remote-candidate buffering
//!
//! Session descriptions and ICE candidates are relayed between the two
//! engines by the caller. Candidates that arrive before the remote
//! description is applied are queued and flushed in arrival order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Candidate type from the `typ` attribute (`host`, `srflx`, `relay`, ...)
    pub fn kind(&self) -> Option<&str> {
        let mut fields = self.candidate.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "typ" {
                return fields.next();
            }
        }
        None
    }
}

/// A message relayed over the out-of-band signaling path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMessage {
    Sdp(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalMessage {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Tracks whether the remote description is set and buffers early candidates
#[derive(Debug, Default)]
pub struct SignalingState {
    remote_set: bool,
    queue: VecDeque<IceCandidate>,
}

impl SignalingState {
    /// Nothing applied, nothing queued
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the remote description applied and hand back queued candidates
    pub fn on_remote_description(&mut self) -> Vec<IceCandidate> {
        self.remote_set = true;
        self.queue.drain(..).collect()
    }

    /// Returns the candidate if it can be applied now, otherwise queues it
    pub fn on_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_set {
            Some(candidate)
        } else {
            tracing::debug!("Queueing candidate until remote description is set");
            self.queue.push_back(candidate);
            None
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
