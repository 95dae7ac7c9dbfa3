//! Network path diagnostic
//!
//! Looks at the ICE candidates gathered during a short window and guesses
//! whether a VPN or system proxy is hiding the local interfaces. The result
//! is advisory and only used for user messaging.

use sealdrop_core::IceCandidate;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// How long the probe collects candidates
pub const PROBE_WINDOW: Duration = Duration::from_millis(1500);

/// Candidate counts by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub total: usize,
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateSummary {
    pub fn from_candidates<'a>(candidates: impl IntoIterator<Item = &'a IceCandidate>) -> Self {
        let mut summary = Self::default();
        for candidate in candidates {
            summary.add(candidate);
        }
        summary
    }

    fn add(&mut self, candidate: &IceCandidate) {
        self.total += 1;
        match candidate.kind() {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => {}
        }
    }

    /// No candidates at all (UDP blocked), or a public mapping with no
    /// local interface behind it
    pub fn suspect_interference(&self) -> bool {
        self.total == 0 || (self.srflx > 0 && self.host == 0)
    }
}

/// true = VPN/proxy interference suspected
pub fn classify(candidates: &[IceCandidate]) -> bool {
    CandidateSummary::from_candidates(candidates).suspect_interference()
}

/// Collect candidates from `rx` until `window` elapses or the sender is
/// dropped, then summarize them
pub async fn probe(rx: &mut mpsc::UnboundedReceiver<IceCandidate>, window: Duration) -> CandidateSummary {
    let deadline = Instant::now() + window;
    let mut summary = CandidateSummary::default();

    loop {
        tokio::select! {
            candidate = rx.recv() => match candidate {
                Some(candidate) => {
                    debug!("Probe saw {:?} candidate", candidate.kind());
                    summary.add(&candidate);
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    summary
}
