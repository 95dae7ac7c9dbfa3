//! In-process transfer between a HOST and a PEER engine.
//!
//! Both engines run on the current task over the in-memory transport. The
//! driver plays the part of the signaling relay and the UI: it forwards
//! signals, offers the file once the host is connected and writes verified
//! chunks through a [`FileSink`].

use crate::config::Config;
use crate::sink::FileSink;
use anyhow::{bail, Result};
use sealdrop_core::link::generate_link;
use sealdrop_core::transport::memory::MemoryTransport;
use sealdrop_core::{Engine, Event, FileSource, Fingerprint, Identity, ProtocolError, Role};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Relay payload embedded in loopback links
const LOOPBACK_RELAY: &[u8] = b"memory://loopback";

/// Outcome of a verified loopback transfer
#[derive(Debug)]
pub struct LoopbackReport {
    /// Final path of the received file
    pub output: PathBuf,
    /// Size of the file on disk
    pub bytes: u64,
    /// Verified chunks written
    pub chunks: u64,
    /// Session fingerprint as the PEER saw it
    pub fingerprint: Option<Fingerprint>,
    /// BLAKE3 of the written file, hex
    pub content_hash: String,
}

/// Send `source` from `host_identity` to a fresh PEER and write it to `output`.
///
/// `on_progress` sees the receiver's `(transferred, total)` counters.
pub async fn send_local(
    config: &Config,
    host_identity: Identity,
    source: FileSource,
    output: &Path,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<LoopbackReport> {
    if host_identity.role() != Role::Host {
        bail!("loopback sender must use a HOST identity");
    }

    let link = generate_link(Some(&host_identity), LOOPBACK_RELAY, config.link.expiry_secs)?;
    let (host_transport, peer_transport) = MemoryTransport::pair();

    let (host, host_handle, mut host_events) =
        Engine::new(config.host_engine_config(host_identity)?, host_transport)?;
    let (peer, peer_handle, mut peer_events) = Engine::new(
        config.peer_engine_config(Identity::generate(Role::Peer), link)?,
        peer_transport,
    )?;

    let mut sink = Some(FileSink::create(output).await?);
    info!(
        "Loopback transfer of {} ({} bytes)",
        source.meta().name,
        source.size()
    );

    let relay = async {
        let mut source = Some(source);
        let mut fingerprint = None;
        let mut content_hash = None;
        let mut chunks = 0u64;
        let mut failure: Option<ProtocolError> = None;
        let (mut host_done, mut peer_done) = (false, false);

        while !(host_done && peer_done) {
            tokio::select! {
                event = host_events.recv(), if !host_done => match event {
                    Some(Event::Signal(signal)) => {
                        let _ = peer_handle.handle_signal(signal);
                    }
                    Some(Event::Connected) => {
                        if let Some(source) = source.take() {
                            if let Err(e) = host_handle.send_file(source).await {
                                warn!("Could not offer file: {}", e);
                                let _ = host_handle.close();
                            }
                        }
                    }
                    Some(Event::Error(e)) => {
                        failure.get_or_insert(e);
                    }
                    Some(other) => debug!("host: {:?}", other),
                    None => host_done = true,
                },
                event = peer_events.recv(), if !peer_done => match event {
                    Some(Event::Signal(signal)) => {
                        let _ = host_handle.handle_signal(signal);
                    }
                    Some(Event::Fingerprint(fp)) => fingerprint = Some(fp),
                    Some(Event::Progress { transferred, total }) => on_progress(transferred, total),
                    Some(Event::Chunk(bytes)) => {
                        chunks += 1;
                        if let Some(out) = sink.as_mut() {
                            if let Err(e) = out.write_chunk(&bytes).await {
                                warn!("Write failed: {}", e);
                                let _ = peer_handle.cancel();
                            }
                        }
                    }
                    Some(Event::FileVerified(true)) => {
                        if let Some(out) = sink.take() {
                            content_hash = Some(out.commit().await);
                        }
                    }
                    Some(Event::Error(e)) => {
                        failure.get_or_insert(e);
                    }
                    Some(other) => debug!("peer: {:?}", other),
                    None => peer_done = true,
                },
            }
        }
        (fingerprint, content_hash, chunks, failure)
    };

    let ((), (), (fingerprint, content_hash, chunks, failure)) =
        tokio::join!(host.run(), peer.run(), relay);

    if let Some(out) = sink.take() {
        out.discard().await;
    }
    if let Some(e) = failure {
        bail!("transfer failed: {}", e);
    }
    let Some(content_hash) = content_hash else {
        bail!("transfer ended before the file was verified");
    };
    let content_hash = content_hash?;
    let bytes = tokio::fs::metadata(output).await?.len();

    Ok(LoopbackReport {
        output: output.to_path_buf(),
        bytes,
        chunks,
        fingerprint,
        content_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.transfer.chunk_size = 32 * 1024;
        config.transfer.slice_size = 8 * 1024;
        config
    }

    #[tokio::test]
    async fn test_loopback_writes_identical_file() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("copy.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let source = FileSource::from_bytes("data.bin", "", data.clone());

        let mut last = (0, 0);
        let report = send_local(
            &small_config(),
            Identity::generate(Role::Host),
            source,
            &output,
            |done, total| last = (done, total),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert_eq!(report.bytes, 100_000);
        assert_eq!(report.chunks, 4);
        assert_eq!(last, (100_000, 100_000));
        assert!(report.fingerprint.is_some());
        assert_eq!(report.content_hash, blake3::hash(&data).to_hex().to_string());
    }

    #[tokio::test]
    async fn test_loopback_rejects_peer_identity() {
        let dir = TempDir::new().unwrap();
        let result = send_local(
            &small_config(),
            Identity::generate(Role::Peer),
            FileSource::from_bytes("x", "", b"x".to_vec()),
            &dir.path().join("x"),
            |_, _| {},
        )
        .await;
        assert!(result.is_err());
    }
}
