//! Per-session protocol context
//!
//! `Session` performs no I/O. Inputs (transport frames, timer expiry, user
//! commands, completed reads) go in through its methods and the resulting
//! outbound frames and events are queued as [`Effect`]s for the engine to
//! apply. All mutation happens through one `&mut Session`, so there is a
//! single writer per session.

use crate::channel::SecureChannel;
use crate::crypto::EphemeralKeyPair;
use crate::proto::ControlMessage;
use crate::signaling::SignalMessage;
use crate::timer::Deadline;
use crate::transfer::{self, RecvState, SendState, SliceRequest, TransferSettings};
use crate::{
    handshake, Error, ErrorCode, FileMeta, Fingerprint, Identity, ProtocolError, ProtocolState,
    Result, Role,
};
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Notifications delivered to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Relay to the remote engine over the signaling path
    Signal(SignalMessage),
    Connected,
    /// Compare out of band to rule out interception
    Fingerprint(Fingerprint),
    Progress { transferred: u64, total: u64 },
    /// A verified chunk, in order
    Chunk(Bytes),
    FileVerified(bool),
    Error(ProtocolError),
    /// The connection dropped; a new session could resume from `chunk_id`
    ReconnectNeeded { chunk_id: u64 },
    Closed,
}

/// Work for the engine to carry out
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Control(Vec<u8>),
    Data(Vec<u8>),
    Emit(Event),
    CloseTransport,
}

pub struct Session {
    pub(crate) role: Role,
    pub(crate) state: ProtocolState,
    pub(crate) identity: Identity,
    /// PEER: host key taken from the connection link
    pub(crate) expected_host_key: Option<VerifyingKey>,
    pub(crate) remote_key: Option<VerifyingKey>,
    pub(crate) local_nonce: Option<String>,
    pub(crate) remote_nonce: Option<String>,
    pub(crate) ephemeral: Option<EphemeralKeyPair>,
    pub(crate) channel: SecureChannel,
    pub(crate) fingerprint: Option<Fingerprint>,
    pub(crate) settings: TransferSettings,
    pub(crate) sender: Option<SendState>,
    pub(crate) receiver: RecvState,
    pub(crate) handshake_timer: Deadline,
    pub(crate) idle_timer: Deadline,
    effects: Vec<Effect>,
}

impl Session {
    /// A PEER session needs the host key from its connection link
    pub fn new(
        identity: Identity,
        expected_host_key: Option<VerifyingKey>,
        settings: TransferSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let role = identity.role();
        if role == Role::Peer && expected_host_key.is_none() {
            return Err(Error::Config(
                "PEER session requires the host key from a connection link".to_string(),
            ));
        }

        Ok(Self {
            role,
            state: ProtocolState::Idle,
            identity,
            expected_host_key,
            remote_key: None,
            local_nonce: None,
            remote_nonce: None,
            ephemeral: None,
            channel: SecureChannel::new(),
            fingerprint: None,
            settings,
            sender: None,
            receiver: RecvState::default(),
            handshake_timer: Deadline::new(),
            idle_timer: Deadline::new(),
            effects: Vec::new(),
        })
    }

    /// Taken from the identity at construction
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// No further input has any effect once this is true
    pub fn is_closed(&self) -> bool {
        self.state == ProtocolState::Closed
    }

    /// Set once session keys are confirmed
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// Transfer parameters fixed for the life of the session
    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_timer.deadline()
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_timer.deadline()
    }

    /// Drain queued effects in the order they were produced
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Enter signaling and start the handshake deadline
    pub fn start(&mut self) {
        if self.state != ProtocolState::Idle {
            return;
        }
        info!("Starting {} session", self.role);
        self.set_state(ProtocolState::Signaling);
        self.handshake_timer.arm(self.settings.handshake_timeout);
    }

    // Transport inputs

    pub fn on_channel_open(&mut self) {
        let result = handshake::on_channel_open(self);
        self.settle(result);
    }

    pub fn on_control(&mut self, frame: &[u8]) {
        if self.is_closed() {
            return;
        }
        let message = match self.channel.open_control(frame) {
            Ok(message) => message,
            Err(e) => return self.fail(e),
        };
        debug!("<- {}", message.opcode());

        // Inbound control traffic counts as sender activity
        if self.role == Role::Host && self.idle_timer.is_armed() {
            self.idle_timer.arm(self.settings.idle_timeout);
        }

        let result = self.dispatch(message);
        self.settle(result);
    }

    fn dispatch(&mut self, message: ControlMessage) -> std::result::Result<(), ProtocolError> {
        match message {
            ControlMessage::Syn { ver, nonce, pubkey } => handshake::on_syn(self, &ver, nonce, &pubkey),
            ControlMessage::SynAck {
                nonce,
                nonce_ack,
                pubkey,
                sig,
            } => handshake::on_syn_ack(self, nonce, &nonce_ack, &pubkey, &sig),
            ControlMessage::Ack { nonce_ack, sig } => handshake::on_ack(self, &nonce_ack, &sig),
            ControlMessage::KeyEx { key, sig } => handshake::on_key_ex(self, &key, &sig),
            ControlMessage::KeyConfirm { mac } => handshake::on_key_confirm(self, &mac),
            ControlMessage::Meta { files, chunk_size } => transfer::on_meta(self, files, chunk_size),
            ControlMessage::Request { chunk_id } => self.host_only(|s| transfer::on_request(s, chunk_id)),
            ControlMessage::ChunkHash { chunk_id, hash } => transfer::on_chunk_hash(self, chunk_id, &hash),
            ControlMessage::ChunkAck { chunk_id } => self.host_only(|s| transfer::on_chunk_ack(s, chunk_id)),
            ControlMessage::Pause => self.host_only(transfer::on_pause),
            ControlMessage::Resume => self.host_only(transfer::on_resume),
            ControlMessage::Fin { hash } => transfer::on_fin(self, &hash),
            ControlMessage::FinAck => self.host_only(transfer::on_fin_ack),
            ControlMessage::Cancel => {
                if self.state.is_established() {
                    info!("Remote cancelled the transfer");
                    self.force_close(ProtocolError::new(ErrorCode::UserCancel, "cancelled by remote"));
                }
                Ok(())
            }
        }
    }

    fn host_only(
        &mut self,
        handler: impl FnOnce(&mut Self) -> std::result::Result<(), ProtocolError>,
    ) -> std::result::Result<(), ProtocolError> {
        if self.role != Role::Host {
            debug!("Ignoring sender-bound message on {}", self.role);
            return Ok(());
        }
        handler(self)
    }

    pub fn on_data(&mut self, frame: &[u8]) {
        if self.is_closed() {
            return;
        }
        let result = transfer::on_data(self, frame);
        self.settle(result);
    }

    /// The transport dropped underneath us
    pub fn on_transport_closed(&mut self) {
        if self.is_closed() {
            return;
        }
        let chunk_id = self.next_chunk_id();
        warn!("Connection lost, next chunk {}", chunk_id);
        self.emit(Event::ReconnectNeeded { chunk_id });
        self.force_close(ProtocolError::new(ErrorCode::PcConnLost, "peer connection lost"));
    }

    pub fn on_handshake_timeout(&mut self) {
        self.handshake_timer.cancel();
        if self.is_closed() || self.state.is_established() {
            return;
        }
        self.force_close(ProtocolError::new(
            ErrorCode::TimeoutHandshake,
            format!("handshake stalled in {}", self.state),
        ));
    }

    pub fn on_idle_timeout(&mut self) {
        self.idle_timer.cancel();
        if self.is_closed() {
            return;
        }
        self.force_close(ProtocolError::new(
            ErrorCode::TimeoutIdle,
            format!("no transfer activity for {:?}", self.settings.idle_timeout),
        ));
    }

    // Sender pump

    /// The next slice the sender wants read
    pub fn next_slice(&self) -> Option<SliceRequest> {
        transfer::next_slice(self)
    }

    /// Feed back a completed read for `request`
    pub fn on_slice_read(&mut self, request: SliceRequest, result: Result<Bytes>) {
        if self.is_closed() {
            return;
        }
        let result = transfer::on_slice_read(self, request, result);
        self.settle(result);
    }

    // User commands

    pub fn send_file(&mut self, meta: FileMeta) -> Result<()> {
        let result = transfer::send_file(self, meta);
        self.settle_command(result)
    }

    pub fn pause(&mut self) -> Result<()> {
        let result = transfer::pause(self);
        self.settle_command(result)
    }

    pub fn resume(&mut self) -> Result<()> {
        let result = transfer::resume(self);
        self.settle_command(result)
    }

    /// Abort the transfer and tell the remote side
    pub fn cancel(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.state.is_established() {
            let _ = self.send_control(ControlMessage::Cancel);
        }
        self.force_close(ProtocolError::new(ErrorCode::UserCancel, "cancelled"));
    }

    /// Shut the session down at the user's request
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.state.is_transfer_active() {
            let _ = self.send_control(ControlMessage::Cancel);
        }
        self.force_close(ProtocolError::new(ErrorCode::UserAbort, "closed by user"));
    }

    /// Report a fault; fatal codes tear the session down
    pub fn fail(&mut self, error: ProtocolError) {
        if self.is_closed() {
            return;
        }
        if !error.code.is_fatal() {
            warn!("{}", error);
            return;
        }
        self.force_close(error);
    }

    // Internals shared with the handlers

    fn settle(&mut self, result: std::result::Result<(), ProtocolError>) {
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn settle_command(&mut self, result: Result<()>) -> Result<()> {
        if let Err(Error::Protocol(e)) = &result {
            self.fail(e.clone());
        }
        result
    }

    pub(crate) fn set_state(&mut self, state: ProtocolState) {
        if self.state != state {
            debug!("{} -> {}", self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.effects.push(Effect::Emit(event));
    }

    pub(crate) fn send_control(&mut self, message: ControlMessage) -> std::result::Result<(), ProtocolError> {
        debug!("-> {}", message.opcode());
        let frame = self.channel.seal_control(&message)?;
        self.effects.push(Effect::Control(frame));
        Ok(())
    }

    pub(crate) fn push_data(&mut self, frame: Vec<u8>) {
        self.effects.push(Effect::Data(frame));
    }

    /// First chunk the receiver has not confirmed
    pub(crate) fn next_chunk_id(&self) -> u64 {
        match self.role {
            Role::Peer => self.receiver.chunk_id,
            Role::Host => self.sender.as_ref().map(|s| s.next_chunk).unwrap_or(0),
        }
    }

    /// Emit exactly one error, then close
    pub(crate) fn force_close(&mut self, error: ProtocolError) {
        if self.is_closed() {
            return;
        }
        let error = error.with_chunk(self.next_chunk_id());
        if error.code.is_security() {
            warn!("Security failure, closing: {}", error);
        } else {
            warn!("Closing session: {}", error);
        }
        self.emit(Event::Error(error));
        self.close_connection();
    }

    /// Tear down keys, timers and the transport
    pub(crate) fn close_connection(&mut self) {
        if self.is_closed() {
            return;
        }
        self.set_state(ProtocolState::Closed);
        self.channel.clear();
        self.ephemeral = None;
        self.handshake_timer.cancel();
        self.idle_timer.cancel();
        self.effects.push(Effect::CloseTransport);
        self.emit(Event::Closed);
    }
}
