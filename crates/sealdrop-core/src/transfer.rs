//! Chunked file transfer
//!
//! The file is split into chunks of `chunk_size` bytes and every chunk is
//! streamed as sealed slices of at most `slice_size` bytes. The receiver
//! verifies each chunk against the sender's `CHUNK_HASH` before asking for
//! the next one, and the whole file against `FIN`.
//!
//! Chunk `n` covers `[n * chunk_size, min((n + 1) * chunk_size, size))`.
//! Chunk `n + 1` is never started before chunk `n` is acknowledged.

use crate::proto::ControlMessage;
use crate::session::{Event, Session};
use crate::types::{hash_to_hex, hex_to_hash};
use crate::{
    Error, ErrorCode, FileMeta, ProtocolError, ProtocolState, Result, Role, BACKPRESSURE_POLL,
    BUFFER_THRESHOLD, CHUNK_SIZE, MAX_RETRIES, SLICE_SIZE, TIMEOUT_HANDSHAKE, TIMEOUT_IDLE,
};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for one engine instance
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: u64,
    pub slice_size: u64,
    /// Data-channel buffered bytes above which slice production waits
    pub buffer_threshold: usize,
    /// Hash mismatches tolerated per chunk
    pub max_retries: u32,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backpressure_poll: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            slice_size: SLICE_SIZE,
            buffer_threshold: BUFFER_THRESHOLD,
            max_retries: MAX_RETRIES,
            idle_timeout: TIMEOUT_IDLE,
            handshake_timeout: TIMEOUT_HANDSHAKE,
            backpressure_poll: BACKPRESSURE_POLL,
        }
    }
}

impl TransferSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.slice_size == 0 {
            return Err(Error::Config("chunk and slice sizes must be non-zero".to_string()));
        }
        if self.slice_size > self.chunk_size {
            return Err(Error::Config(format!(
                "slice size {} exceeds chunk size {}",
                self.slice_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Number of chunks a file of `size` bytes is split into
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// Byte range `[start, end)` of chunk `chunk_id`
pub fn chunk_range(chunk_id: u64, size: u64, chunk_size: u64) -> (u64, u64) {
    let start = chunk_id.saturating_mul(chunk_size).min(size);
    let end = start.saturating_add(chunk_size).min(size);
    (start, end)
}

/// The next read the sender wants performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRequest {
    pub chunk_id: u64,
    /// Identifies the chunk attempt; a restart invalidates older reads
    pub generation: u64,
    pub offset: u64,
    pub len: u64,
}

/// A chunk being pushed by the sender
pub(crate) struct ChunkPush {
    pub(crate) chunk_id: u64,
    pub(crate) generation: u64,
    pub(crate) offset: u64,
    pub(crate) end: u64,
    pub(crate) chunk_hasher: blake3::Hasher,
    /// Whole-file hash including this chunk's bytes so far
    pub(crate) file_hasher: blake3::Hasher,
    /// `CHUNK_HASH` has been sent
    pub(crate) sealed: bool,
}

/// HOST-side transfer state
pub(crate) struct SendState {
    pub(crate) meta: FileMeta,
    pub(crate) chunk_size: u64,
    /// Whole-file hash over acknowledged chunks only
    pub(crate) file_hasher: blake3::Hasher,
    /// First chunk not yet acknowledged
    pub(crate) next_chunk: u64,
    pub(crate) push: Option<ChunkPush>,
    pub(crate) generation: u64,
    pub(crate) fin_sent: bool,
}

impl SendState {
    pub(crate) fn new(meta: FileMeta, chunk_size: u64) -> Self {
        Self {
            meta,
            chunk_size,
            file_hasher: blake3::Hasher::new(),
            next_chunk: 0,
            push: None,
            generation: 0,
            fin_sent: false,
        }
    }

    fn start_chunk(&mut self, chunk_id: u64) {
        let (start, end) = chunk_range(chunk_id, self.meta.size, self.chunk_size);
        self.generation += 1;
        self.push = Some(ChunkPush {
            chunk_id,
            generation: self.generation,
            offset: start,
            end,
            chunk_hasher: blake3::Hasher::new(),
            file_hasher: self.file_hasher.clone(),
            sealed: false,
        });
    }

    fn is_past_end(&self, chunk_id: u64) -> bool {
        chunk_id.saturating_mul(self.chunk_size) >= self.meta.size
    }
}

/// PEER-side transfer state
#[derive(Default)]
pub(crate) struct RecvState {
    pub(crate) meta: Option<FileMeta>,
    pub(crate) chunk_size: u64,
    pub(crate) chunk_id: u64,
    pub(crate) buffer: Vec<u8>,
    pub(crate) chunk_hasher: blake3::Hasher,
    pub(crate) file_hasher: blake3::Hasher,
    /// Bytes in verified chunks
    pub(crate) confirmed: u64,
    pub(crate) retries: u32,
}

impl RecvState {
    fn expected_chunk_len(&self) -> u64 {
        let size = self.meta.as_ref().map(|m| m.size).unwrap_or(0);
        let (start, end) = chunk_range(self.chunk_id, size, self.chunk_size);
        end - start
    }

    fn total(&self) -> u64 {
        self.meta.as_ref().map(|m| m.size).unwrap_or(0)
    }
}

fn finalize_hex(hasher: &blake3::Hasher) -> String {
    hash_to_hex(hasher.finalize().as_bytes())
}

fn hashes_match(local: &blake3::Hasher, remote_hex: &str) -> bool {
    match hex_to_hash(remote_hex) {
        Ok(remote) => blake3::Hash::from(remote) == local.finalize(),
        Err(_) => false,
    }
}

// Sender

/// Announce the file and wait for `REQUEST{0}`
pub(crate) fn send_file(s: &mut Session, meta: FileMeta) -> Result<()> {
    if s.role != Role::Host {
        return Err(Error::Config("only HOST can send files".to_string()));
    }
    if s.state != ProtocolState::Established {
        return Err(Error::Config(format!(
            "cannot send a file in state {}",
            s.state
        )));
    }

    info!(
        "Offering {} ({} bytes, {} chunks)",
        meta.name,
        meta.size,
        chunk_count(meta.size, s.settings.chunk_size)
    );
    let chunk_size = s.settings.chunk_size;
    s.sender = Some(SendState::new(meta.clone(), chunk_size));
    s.send_control(ControlMessage::Meta {
        files: vec![meta],
        chunk_size,
    })?;
    s.set_state(ProtocolState::MetaSent);
    Ok(())
}

pub(crate) fn on_request(s: &mut Session, chunk_id: u64) -> std::result::Result<(), ProtocolError> {
    if !s.state.is_transfer_active() {
        debug!("Ignoring REQUEST in state {}", s.state);
        return Ok(());
    }
    let Some(sender) = s.sender.as_mut() else {
        return Ok(());
    };

    if sender.is_past_end(chunk_id) {
        return send_fin(s);
    }

    if sender.push.as_ref().is_some_and(|p| p.chunk_id == chunk_id) {
        warn!("Chunk {} re-requested, resending from its first byte", chunk_id);
    }
    sender.next_chunk = chunk_id;
    sender.start_chunk(chunk_id);

    if s.state != ProtocolState::Paused {
        s.set_state(ProtocolState::Transferring);
        s.idle_timer.arm(s.settings.idle_timeout);
    }
    Ok(())
}

pub(crate) fn on_chunk_ack(s: &mut Session, chunk_id: u64) -> std::result::Result<(), ProtocolError> {
    let Some(sender) = s.sender.as_mut() else {
        return Ok(());
    };
    if !sender
        .push
        .as_ref()
        .is_some_and(|p| p.sealed && p.chunk_id == chunk_id)
    {
        debug!("Ignoring CHUNK_ACK for chunk {}", chunk_id);
        return Ok(());
    }
    let Some(push) = sender.push.take() else {
        return Ok(());
    };

    sender.file_hasher = push.file_hasher;
    sender.next_chunk = chunk_id + 1;
    debug!("Chunk {} acknowledged", chunk_id);

    if sender.is_past_end(sender.next_chunk) {
        send_fin(s)
    } else {
        sender.start_chunk(sender.next_chunk);
        Ok(())
    }
}

fn send_fin(s: &mut Session) -> std::result::Result<(), ProtocolError> {
    let Some(sender) = s.sender.as_mut() else {
        return Ok(());
    };
    sender.push = None;
    sender.fin_sent = true;
    let hash = finalize_hex(&sender.file_hasher);
    info!("All chunks acknowledged, sending FIN");
    s.send_control(ControlMessage::Fin { hash })
}

pub(crate) fn on_fin_ack(s: &mut Session) -> std::result::Result<(), ProtocolError> {
    if !s.sender.as_ref().is_some_and(|sender| sender.fin_sent) {
        debug!("Ignoring FIN_ACK before FIN");
        return Ok(());
    }
    info!("Receiver verified the file");
    s.emit(Event::FileVerified(true));
    s.close_connection();
    Ok(())
}

/// PAUSE from the receiver: stop producing slices where we are
pub(crate) fn on_pause(s: &mut Session) -> std::result::Result<(), ProtocolError> {
    if matches!(s.state, ProtocolState::MetaSent | ProtocolState::Transferring) {
        info!("Transfer paused by receiver");
        s.set_state(ProtocolState::Paused);
        s.idle_timer.cancel();
    }
    Ok(())
}

/// RESUME from the receiver: continue from the exact offset
pub(crate) fn on_resume(s: &mut Session) -> std::result::Result<(), ProtocolError> {
    if s.state == ProtocolState::Paused {
        info!("Transfer resumed by receiver");
        s.set_state(ProtocolState::Transferring);
        s.idle_timer.arm(s.settings.idle_timeout);
    }
    Ok(())
}

/// The slice the sender should read next, if any
pub(crate) fn next_slice(s: &Session) -> Option<SliceRequest> {
    if s.role != Role::Host || s.state != ProtocolState::Transferring {
        return None;
    }
    let push = s.sender.as_ref()?.push.as_ref()?;
    if push.sealed || push.offset >= push.end {
        return None;
    }
    Some(SliceRequest {
        chunk_id: push.chunk_id,
        generation: push.generation,
        offset: push.offset,
        len: (push.end - push.offset).min(s.settings.slice_size),
    })
}

/// Apply a completed read. The session may have moved on while the read
/// was in progress, so the request is checked against the current chunk.
pub(crate) fn on_slice_read(
    s: &mut Session,
    request: SliceRequest,
    result: Result<Bytes>,
) -> std::result::Result<(), ProtocolError> {
    if s.state != ProtocolState::Transferring {
        debug!("Discarding slice read in state {}", s.state);
        return Ok(());
    }
    let Some(sender) = s.sender.as_mut() else {
        return Ok(());
    };
    let Some(push) = sender.push.as_mut().filter(|p| {
        !p.sealed && p.generation == request.generation && p.offset == request.offset
    }) else {
        debug!("Discarding stale slice read at offset {}", request.offset);
        return Ok(());
    };

    let bytes = result.map_err(|e| ProtocolError::new(ErrorCode::ReadErr, e.to_string()))?;
    if bytes.len() as u64 != request.len {
        return Err(ProtocolError::new(
            ErrorCode::ReadErr,
            format!("short read: wanted {} bytes, got {}", request.len, bytes.len()),
        ));
    }

    push.chunk_hasher.update(&bytes);
    push.file_hasher.update(&bytes);
    push.offset += request.len;
    let finished = push.offset == push.end;
    let chunk_hash = finished.then(|| finalize_hex(&push.chunk_hasher));
    if finished {
        push.sealed = true;
    }
    let transferred = push.offset;
    let total = sender.meta.size;

    let frame = s.channel.seal_data(&bytes)?;
    s.push_data(frame);
    s.idle_timer.arm(s.settings.idle_timeout);
    s.emit(Event::Progress { transferred, total });

    if let Some(hash) = chunk_hash {
        debug!("Chunk {} sent", request.chunk_id);
        s.send_control(ControlMessage::ChunkHash {
            chunk_id: request.chunk_id,
            hash,
        })?;
    }
    Ok(())
}

// Receiver

pub(crate) fn on_meta(
    s: &mut Session,
    files: Vec<FileMeta>,
    chunk_size: u64,
) -> std::result::Result<(), ProtocolError> {
    if s.role != Role::Peer || s.state != ProtocolState::Established {
        debug!("Ignoring META in state {}", s.state);
        return Ok(());
    }
    let Some(meta) = files.into_iter().next() else {
        return Err(ProtocolError::new(ErrorCode::ProtoErr, "META without a file"));
    };
    if chunk_size == 0 {
        return Err(ProtocolError::new(ErrorCode::ProtoErr, "META with zero chunk size"));
    }

    info!("Receiving {} ({} bytes)", meta.name, meta.size);
    s.receiver = RecvState {
        meta: Some(meta),
        chunk_size,
        ..RecvState::default()
    };
    s.send_control(ControlMessage::Request { chunk_id: 0 })?;
    s.set_state(ProtocolState::Transferring);
    s.idle_timer.arm(s.settings.idle_timeout);
    Ok(())
}

pub(crate) fn on_data(s: &mut Session, frame: &[u8]) -> std::result::Result<(), ProtocolError> {
    if s.role != Role::Peer
        || !matches!(s.state, ProtocolState::Transferring | ProtocolState::Paused)
    {
        debug!("Ignoring data frame in state {}", s.state);
        return Ok(());
    }

    let plaintext = s.channel.open_data(frame)?;
    let receiver = &mut s.receiver;
    if (receiver.buffer.len() + plaintext.len()) as u64 > receiver.expected_chunk_len() {
        return Err(ProtocolError::new(
            ErrorCode::DataErr,
            format!("chunk {} overflowed its expected size", receiver.chunk_id),
        ));
    }

    receiver.chunk_hasher.update(&plaintext);
    receiver.buffer.extend_from_slice(&plaintext);
    let transferred = receiver.confirmed + receiver.buffer.len() as u64;
    let total = receiver.total();

    if s.state == ProtocolState::Transferring {
        s.idle_timer.arm(s.settings.idle_timeout);
    }
    s.emit(Event::Progress { transferred, total });
    Ok(())
}

pub(crate) fn on_chunk_hash(
    s: &mut Session,
    chunk_id: u64,
    hash: &str,
) -> std::result::Result<(), ProtocolError> {
    if s.role != Role::Peer
        || !matches!(s.state, ProtocolState::Transferring | ProtocolState::Paused)
    {
        debug!("Ignoring CHUNK_HASH in state {}", s.state);
        return Ok(());
    }
    let max_retries = s.settings.max_retries;
    let receiver = &mut s.receiver;
    if chunk_id != receiver.chunk_id {
        debug!(
            "Ignoring CHUNK_HASH for chunk {} while on chunk {}",
            chunk_id, receiver.chunk_id
        );
        return Ok(());
    }

    if hashes_match(&receiver.chunk_hasher, hash) {
        let chunk = Bytes::from(std::mem::take(&mut receiver.buffer));
        receiver.file_hasher.update(&chunk);
        receiver.confirmed += chunk.len() as u64;
        receiver.chunk_id += 1;
        receiver.chunk_hasher = blake3::Hasher::new();
        receiver.retries = 0;
        debug!("Chunk {} verified", chunk_id);

        s.emit(Event::Chunk(chunk));
        return s.send_control(ControlMessage::ChunkAck { chunk_id });
    }

    receiver.retries += 1;
    let mismatch = ProtocolError::new(
        ErrorCode::ChunkHashMismatch,
        format!("chunk {} failed verification ({} of {})", chunk_id, receiver.retries, max_retries),
    );
    if receiver.retries > max_retries {
        return Err(ProtocolError::new(
            ErrorCode::MaxRetries,
            format!("chunk {} failed verification {} times", chunk_id, receiver.retries),
        ));
    }

    receiver.buffer.clear();
    receiver.chunk_hasher = blake3::Hasher::new();
    s.fail(mismatch);
    s.send_control(ControlMessage::Request { chunk_id })
}

pub(crate) fn on_fin(s: &mut Session, hash: &str) -> std::result::Result<(), ProtocolError> {
    if s.role != Role::Peer
        || !matches!(s.state, ProtocolState::Transferring | ProtocolState::Paused)
    {
        debug!("Ignoring FIN in state {}", s.state);
        return Ok(());
    }
    let receiver = &s.receiver;
    if receiver.confirmed != receiver.total() {
        return Err(ProtocolError::new(
            ErrorCode::FileHashMismatch,
            format!(
                "FIN after {} of {} bytes",
                receiver.confirmed,
                receiver.total()
            ),
        ));
    }
    if !hashes_match(&receiver.file_hasher, hash) {
        return Err(ProtocolError::new(
            ErrorCode::FileHashMismatch,
            "whole-file hash does not match",
        ));
    }

    info!("File verified ({} bytes)", receiver.confirmed);
    s.send_control(ControlMessage::FinAck)?;
    s.emit(Event::FileVerified(true));
    s.close_connection();
    Ok(())
}

/// Receiver-side `pause()`
pub(crate) fn pause(s: &mut Session) -> Result<()> {
    if s.role != Role::Peer {
        return Err(Error::Config("only the receiver can pause".to_string()));
    }
    if s.state != ProtocolState::Transferring {
        return Err(Error::Config(format!("cannot pause in state {}", s.state)));
    }
    s.send_control(ControlMessage::Pause)?;
    s.set_state(ProtocolState::Paused);
    s.idle_timer.cancel();
    Ok(())
}

/// Receiver-side `resume()`
pub(crate) fn resume(s: &mut Session) -> Result<()> {
    if s.role != Role::Peer {
        return Err(Error::Config("only the receiver can resume".to_string()));
    }
    if s.state != ProtocolState::Paused {
        return Err(Error::Config(format!("cannot resume in state {}", s.state)));
    }
    s.send_control(ControlMessage::Resume)?;
    s.set_state(ProtocolState::Transferring);
    s.idle_timer.arm(s.settings.idle_timeout);
    Ok(())
}
