//! Shared driver for engine-level tests over the in-memory transport

#![allow(dead_code)]

use sealdrop_core::link::generate_link;
use sealdrop_core::transport::memory::{LinkBreaker, MemoryTransport};
use sealdrop_core::{
    Engine, EngineConfig, EngineHandle, ErrorCode, Event, FileSource, Identity, Role,
    TransferSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

pub struct Endpoint {
    pub engine: Engine<MemoryTransport>,
    pub handle: EngineHandle,
    pub events: UnboundedReceiver<Event>,
}

pub struct Pair {
    pub host: Endpoint,
    pub peer: Endpoint,
    pub host_identity: Identity,
    pub pressure: Arc<AtomicUsize>,
    pub breaker: LinkBreaker,
}

/// Small chunks so multi-chunk files stay cheap
pub fn small_settings() -> TransferSettings {
    TransferSettings {
        chunk_size: 64 * 1024,
        slice_size: 16 * 1024,
        ..TransferSettings::default()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

pub fn pair(settings: TransferSettings) -> Pair {
    build(settings, None, |_| {})
}

/// Build a host/peer pair. `link_signer` overrides the identity that signs
/// the peer's link; `tweak` adjusts the host transport before it is moved.
pub fn build(
    settings: TransferSettings,
    link_signer: Option<Identity>,
    tweak: impl FnOnce(&mut MemoryTransport),
) -> Pair {
    let host_identity = Identity::generate(Role::Host);
    let signer = link_signer.unwrap_or_else(|| host_identity.clone());
    let link = generate_link(Some(&signer), b"memory://relay", 300).unwrap();

    let (mut host_transport, peer_transport) = MemoryTransport::pair();
    tweak(&mut host_transport);
    let pressure = host_transport.pressure_gauge();
    let breaker = host_transport.breaker();

    let (engine, handle, events) = Engine::new(
        EngineConfig::host(host_identity.clone()).with_transfer(settings.clone()),
        host_transport,
    )
    .unwrap();
    let host = Endpoint {
        engine,
        handle,
        events,
    };

    let (engine, handle, events) = Engine::new(
        EngineConfig::peer(Identity::generate(Role::Peer), link).with_transfer(settings),
        peer_transport,
    )
    .unwrap();
    let peer = Endpoint {
        engine,
        handle,
        events,
    };

    Pair {
        host,
        peer,
        host_identity,
        pressure,
        breaker,
    }
}

/// What the relay does in response to a peer event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pause,
    Resume,
    Cancel,
    Close,
    Wait(Duration),
    Sever,
    ReleasePressure,
    /// Release the pressure gauge later without blocking the relay
    ReleasePressureAfter(Duration),
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub host: Vec<Event>,
    pub peer: Vec<Event>,
    /// Time from start to the peer's first progress event
    pub first_progress: Option<Duration>,
}

impl Outcome {
    pub fn received(&self) -> Vec<u8> {
        self.peer
            .iter()
            .filter_map(|e| match e {
                Event::Chunk(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn chunks(&self) -> usize {
        self.peer.iter().filter(|e| matches!(e, Event::Chunk(_))).count()
    }

    pub fn host_errors(&self) -> Vec<ErrorCode> {
        error_codes(&self.host)
    }

    pub fn peer_errors(&self) -> Vec<ErrorCode> {
        error_codes(&self.peer)
    }
}

pub fn error_codes(events: &[Event]) -> Vec<ErrorCode> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Error(err) => Some(err.code),
            _ => None,
        })
        .collect()
}

pub fn count(events: &[Event], wanted: &Event) -> usize {
    events.iter().filter(|e| *e == wanted).count()
}

/// Run both engines to completion, relaying signals and sending `file`
/// once the host is connected
pub async fn run(
    pair: Pair,
    file: Option<FileSource>,
    on_peer: impl FnMut(&Event) -> Vec<Action>,
) -> Outcome {
    drive(pair, file, true, on_peer).await
}

/// Run both engines without relaying signaling
pub async fn run_unsignaled(pair: Pair) -> Outcome {
    drive(pair, None, false, |_| Vec::new()).await
}

async fn drive(
    pair: Pair,
    file: Option<FileSource>,
    relay_signals: bool,
    mut on_peer: impl FnMut(&Event) -> Vec<Action>,
) -> Outcome {
    let Pair {
        host,
        peer,
        pressure,
        breaker,
        ..
    } = pair;
    let host_handle = host.handle.clone();
    let peer_handle = peer.handle.clone();
    let (mut host_events, mut peer_events) = (host.events, peer.events);

    let relay = async move {
        let start = Instant::now();
        let mut file = file;
        let mut outcome = Outcome::default();
        let (mut host_done, mut peer_done) = (false, false);

        while !(host_done && peer_done) {
            tokio::select! {
                event = host_events.recv(), if !host_done => {
                    let Some(event) = event else {
                        host_done = true;
                        continue;
                    };
                    match &event {
                        Event::Signal(signal) if relay_signals => {
                            let _ = peer_handle.handle_signal(signal.clone());
                        }
                        Event::Connected => {
                            if let Some(source) = file.take() {
                                host_handle.send_file(source).await.unwrap();
                            }
                        }
                        _ => {}
                    }
                    outcome.host.push(event);
                }
                event = peer_events.recv(), if !peer_done => {
                    let Some(event) = event else {
                        peer_done = true;
                        continue;
                    };
                    match &event {
                        Event::Signal(signal) if relay_signals => {
                            let _ = host_handle.handle_signal(signal.clone());
                        }
                        Event::Progress { .. } if outcome.first_progress.is_none() => {
                            outcome.first_progress = Some(start.elapsed());
                        }
                        _ => {}
                    }

                    for action in on_peer(&event) {
                        match action {
                            Action::Pause => peer_handle.pause().await.unwrap(),
                            Action::Resume => peer_handle.resume().await.unwrap(),
                            Action::Cancel => peer_handle.cancel().unwrap(),
                            Action::Close => peer_handle.close().unwrap(),
                            Action::Wait(duration) => tokio::time::sleep(duration).await,
                            Action::Sever => breaker.sever(),
                            Action::ReleasePressure => pressure.store(0, Ordering::SeqCst),
                            Action::ReleasePressureAfter(delay) => {
                                let pressure = pressure.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    pressure.store(0, Ordering::SeqCst);
                                });
                            }
                        }
                    }
                    outcome.peer.push(event);
                }
            }
        }
        outcome
    };

    let ((), (), outcome) = tokio::join!(host.engine.run(), peer.engine.run(), relay);
    outcome
}
