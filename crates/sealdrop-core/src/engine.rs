//! Async driver for one session
//!
//! The engine owns the [`Session`], the transport and the file being sent,
//! and serializes user commands, transport events and timer expiry through
//! a single `select!` loop. Callers talk to it through an [`EngineHandle`]
//! and receive [`Event`]s on an unbounded channel.
//!
//! ```ignore
//! let (engine, handle, mut events) = Engine::new(EngineConfig::host(identity), transport)?;
//! tokio::join!(engine.run(), async {
//!     while let Some(event) = events.recv().await { /* relay signals, show progress */ }
//! });
//! ```

use crate::session::{Effect, Event, Session};
use crate::signaling::{SdpKind, SignalMessage, SignalingState};
use crate::source::FileSource;
use crate::timer;
use crate::transfer::{SliceRequest, TransferSettings};
use crate::transport::{Transport, TransportEvent};
use crate::{
    ConnectionLink, Error, ErrorCode, Identity, ProtocolError, Result, Role, DEFAULT_ICE_SERVERS,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

/// Construction parameters for an [`Engine`]
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Long-term identity; its role decides HOST or PEER
    pub identity: Option<Identity>,
    /// Required for PEER
    pub connection_link: Option<String>,
    pub transfer: TransferSettings,
    /// STUN/TURN URLs for the transport; must not be empty
    pub ice_servers: Vec<String>,
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn check_ice_servers(servers: &[String]) -> Result<()> {
    if servers.is_empty() {
        return Err(Error::Config("no ICE servers configured".to_string()));
    }
    for url in servers {
        let known = ["stun:", "stuns:", "turn:", "turns:"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !known {
            return Err(Error::Config(format!("unsupported ICE server URL: {}", url)));
        }
    }
    Ok(())
}

impl EngineConfig {
    pub fn host(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            connection_link: None,
            transfer: TransferSettings::default(),
            ice_servers: default_ice_servers(),
        }
    }

    pub fn peer(identity: Identity, connection_link: impl Into<String>) -> Self {
        Self {
            identity: Some(identity),
            connection_link: Some(connection_link.into()),
            transfer: TransferSettings::default(),
            ice_servers: default_ice_servers(),
        }
    }

    pub fn with_transfer(mut self, transfer: TransferSettings) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }
}

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    SendFile(FileSource, Reply),
    Pause(Reply),
    Resume(Reply),
    Cancel,
    Close,
    Signal(SignalMessage),
}

/// Cloneable handle for driving a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    fn notify(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineStopped)
    }

    /// Offer a file (HOST, once established)
    pub async fn send_file(&self, source: FileSource) -> Result<()> {
        self.request(|reply| Command::SendFile(source, reply)).await
    }

    /// Ask the sender to stop (PEER)
    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    pub fn cancel(&self) -> Result<()> {
        self.notify(Command::Cancel)
    }

    pub fn close(&self) -> Result<()> {
        self.notify(Command::Close)
    }

    /// Deliver a signaling message from the remote side
    pub fn handle_signal(&self, message: SignalMessage) -> Result<()> {
        self.notify(Command::Signal(message))
    }
}

pub struct Engine<T: Transport> {
    session: Session,
    transport: T,
    signaling: SignalingState,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    events: mpsc::UnboundedSender<Event>,
    source: Option<FileSource>,
    pump_at: Instant,
}

impl<T: Transport> Engine<T> {
    /// Validate the configuration and build an engine over `transport`.
    ///
    /// A PEER's link is checked here, before the transport is touched. The
    /// ICE server list is then validated and handed to the transport.
    pub fn new(
        config: EngineConfig,
        mut transport: T,
    ) -> Result<(Self, EngineHandle, mpsc::UnboundedReceiver<Event>)> {
        let identity = config
            .identity
            .ok_or_else(|| Error::Config("identity is not loaded".to_string()))?;

        let expected_host_key = match identity.role() {
            Role::Host => None,
            Role::Peer => {
                let link = config
                    .connection_link
                    .ok_or_else(|| Error::Config("PEER requires a connection link".to_string()))?;
                let link = ConnectionLink::parse(&link)?;
                debug!("Link valid until {}", link.expiry);
                Some(link.host_public_key)
            }
        };

        check_ice_servers(&config.ice_servers)?;
        let session = Session::new(identity, expected_host_key, config.transfer)?;
        transport.configure_ice(&config.ice_servers)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let engine = Self {
            session,
            transport,
            signaling: SignalingState::new(),
            commands: command_rx,
            commands_open: true,
            events: event_tx,
            source: None,
            pump_at: Instant::now(),
        };
        let handle = EngineHandle {
            commands: command_tx,
        };
        Ok((engine, handle, event_rx))
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    /// Run the session until it closes
    pub async fn run(mut self) {
        self.start().await;
        self.apply_effects().await;

        while !self.session.is_closed() {
            let slice = self.session.next_slice();
            let handshake_at = self.session.handshake_deadline();
            let idle_at = self.session.idle_deadline();

            tokio::select! {
                biased;

                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All handles dropped");
                        self.commands_open = false;
                    }
                },
                event = self.transport.next_event() => self.handle_transport_event(event),
                _ = timer::wait(handshake_at) => self.session.on_handshake_timeout(),
                _ = timer::wait(idle_at) => self.session.on_idle_timeout(),
                _ = tokio::time::sleep_until(self.pump_at), if slice.is_some() => {
                    if let Some(request) = slice {
                        self.pump(request).await;
                    }
                }
            }

            self.apply_effects().await;
        }

        info!("{} engine stopped", self.session.role());
    }

    async fn start(&mut self) {
        self.session.start();
        if self.session.role() != Role::Host {
            return;
        }
        match self.transport.create_offer().await {
            Ok(offer) => self
                .session
                .emit(Event::Signal(SignalMessage::Sdp(offer))),
            Err(e) => self.session.fail(signal_err(e)),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendFile(source, reply) => {
                let result = self.session.send_file(source.meta().clone());
                if result.is_ok() {
                    self.source = Some(source);
                    self.pump_at = Instant::now();
                }
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.session.pause());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.session.resume());
            }
            Command::Cancel => self.session.cancel(),
            Command::Close => self.session.close(),
            Command::Signal(message) => {
                if self.session.is_closed() {
                    return;
                }
                if let Err(e) = self.handle_signal(message).await {
                    self.session.fail(e);
                }
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) -> std::result::Result<(), ProtocolError> {
        match message {
            SignalMessage::Sdp(description) => {
                let is_offer = description.kind == SdpKind::Offer;
                self.transport
                    .set_remote_description(description)
                    .await
                    .map_err(signal_err)?;
                for candidate in self.signaling.on_remote_description() {
                    self.transport
                        .add_ice_candidate(candidate)
                        .await
                        .map_err(signal_err)?;
                }
                if is_offer {
                    let answer = self.transport.create_answer().await.map_err(signal_err)?;
                    self.session.emit(Event::Signal(SignalMessage::Sdp(answer)));
                }
            }
            SignalMessage::Candidate(candidate) => {
                if let Some(candidate) = self.signaling.on_candidate(candidate) {
                    self.transport
                        .add_ice_candidate(candidate)
                        .await
                        .map_err(signal_err)?;
                }
            }
        }
        Ok(())
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::LocalCandidate(candidate)) => self
                .session
                .emit(Event::Signal(SignalMessage::Candidate(candidate))),
            Some(TransportEvent::ChannelOpen) => self.session.on_channel_open(),
            Some(TransportEvent::Control(frame)) => self.session.on_control(&frame),
            Some(TransportEvent::Data(frame)) => self.session.on_data(&frame),
            Some(TransportEvent::Closed) | None => self.session.on_transport_closed(),
        }
    }

    /// Produce one slice, or back off while the data channel is congested
    async fn pump(&mut self, request: SliceRequest) {
        let settings = self.session.settings();
        let buffered = self.transport.data_buffered_amount();
        if buffered > settings.buffer_threshold {
            debug!("Data channel holds {} bytes, backing off", buffered);
            self.pump_at = Instant::now() + settings.backpressure_poll;
            return;
        }

        let result = match self.source.as_mut() {
            Some(source) => source.read_range(request.offset, request.len).await,
            None => Err(Error::Config("no file source".to_string())),
        };
        self.session.on_slice_read(request, result);
        self.pump_at = Instant::now();
    }

    async fn apply_effects(&mut self) {
        loop {
            let effects = self.session.take_effects();
            if effects.is_empty() {
                return;
            }
            for effect in effects {
                match effect {
                    Effect::Control(frame) => {
                        if let Err(e) = self.transport.send_control(frame).await {
                            self.session
                                .fail(ProtocolError::new(ErrorCode::CtrlErr, e.to_string()));
                        }
                    }
                    Effect::Data(frame) => {
                        if let Err(e) = self.transport.send_data(frame).await {
                            self.session
                                .fail(ProtocolError::new(ErrorCode::DataErr, e.to_string()));
                        }
                    }
                    Effect::Emit(event) => {
                        let _ = self.events.send(event);
                    }
                    Effect::CloseTransport => {
                        self.transport.close().await;
                        self.source = None;
                    }
                }
            }
        }
    }
}

fn signal_err(e: Error) -> ProtocolError {
    ProtocolError::new(ErrorCode::SignalErr, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::generate_link;
    use crate::transport::memory::MemoryTransport;

    #[test]
    fn test_missing_identity_rejected() {
        let (transport, _) = MemoryTransport::pair();
        let result = Engine::new(EngineConfig::default(), transport);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_peer_requires_link() {
        let (_, transport) = MemoryTransport::pair();
        let config = EngineConfig {
            identity: Some(Identity::generate(Role::Peer)),
            ..EngineConfig::default()
        };
        assert!(matches!(Engine::new(config, transport), Err(Error::Config(_))));
    }

    #[test]
    fn test_ice_servers_required() {
        let host = || EngineConfig::host(Identity::generate(Role::Host));

        let (transport, _) = MemoryTransport::pair();
        let result = Engine::new(host().with_ice_servers(Vec::new()), transport);
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("ICE")));

        let (transport, _) = MemoryTransport::pair();
        let result = Engine::new(host().with_ice_servers(vec!["http://x".to_string()]), transport);
        assert!(matches!(result, Err(Error::Config(_))));

        let (transport, _) = MemoryTransport::pair();
        let servers = vec!["turn:turn.example:3478".to_string()];
        assert!(Engine::new(host().with_ice_servers(servers), transport).is_ok());
    }

    #[test]
    fn test_peer_rejects_invalid_link() {
        let (_, transport) = MemoryTransport::pair();
        let config = EngineConfig::peer(Identity::generate(Role::Peer), "v1.bogus");
        assert!(matches!(Engine::new(config, transport), Err(Error::LinkInvalid(_))));
    }

    #[test]
    fn test_peer_accepts_valid_link() {
        let host = Identity::generate(Role::Host);
        let link = generate_link(Some(&host), b"relay", 60).unwrap();
        let (_, transport) = MemoryTransport::pair();
        let (engine, _handle, _events) =
            Engine::new(EngineConfig::peer(Identity::generate(Role::Peer), link), transport).unwrap();
        assert_eq!(engine.role(), Role::Peer);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_engine() {
        let (transport, _) = MemoryTransport::pair();
        let (engine, handle, _events) =
            Engine::new(EngineConfig::host(Identity::generate(Role::Host)), transport).unwrap();
        drop(engine);
        assert!(matches!(handle.pause().await, Err(Error::EngineStopped)));
        assert!(matches!(handle.cancel(), Err(Error::EngineStopped)));
    }
}
