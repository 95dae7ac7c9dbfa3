//! Transport abstraction for the two-channel peer connection
//!
//! The engine needs an ordered, reliable pair of channels (control and
//! data) plus the offer/answer and candidate plumbing used to set them up.
//! This trait keeps the protocol independent of any particular WebRTC
//! stack; [`memory::MemoryTransport`] links two engines in-process.

use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate to relay to the remote side
    LocalCandidate(IceCandidate),
    /// Both channels are open
    ChannelOpen,
    /// A control-channel frame
    Control(Vec<u8>),
    /// A data-channel frame
    Data(Vec<u8>),
    /// The connection dropped
    Closed,
}

/// Transport trait for the peer connection
///
/// `next_event` is polled inside a `select!` and must be cancel safe.
/// Control and data frames must be delivered in the order they were sent,
/// including relative to each other.
#[allow(async_fn_in_trait)]
pub trait Transport: Send {
    /// Use these STUN/TURN servers for candidate gathering. Called once,
    /// before any description is created.
    fn configure_ice(&mut self, servers: &[String]) -> Result<()>;

    /// Create a local offer and apply it as the local description
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    /// Create a local answer to the applied remote offer
    async fn create_answer(&mut self) -> Result<SessionDescription>;

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; requires the remote description
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    async fn send_control(&mut self, frame: Vec<u8>) -> Result<()>;

    async fn send_data(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Bytes queued on the data channel but not yet delivered
    fn data_buffered_amount(&self) -> usize;

    /// Wait for the next event; `None` once the transport is finished
    async fn next_event(&mut self) -> Option<TransportEvent>;

    async fn close(&mut self);
}

pub mod memory {
    //! In-process transport linking two endpoints

    use super::*;
    use crate::signaling::SdpKind;
    use crate::Error;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Everything travels on one queue per direction so control and data
    /// keep their relative order.
    #[derive(Debug)]
    enum Wire {
        Ready,
        Control(Vec<u8>),
        Data(Vec<u8>),
        Close,
    }

    type DataTamper = Box<dyn FnMut(usize, &mut Vec<u8>) + Send>;

    pub struct MemoryTransport {
        name: &'static str,
        outbound: mpsc::UnboundedSender<Wire>,
        inbound: mpsc::UnboundedReceiver<Wire>,
        pending: VecDeque<TransportEvent>,
        local_set: bool,
        remote_set: bool,
        ready_sent: bool,
        remote_ready: bool,
        open: bool,
        closed: bool,
        /// Data bytes we sent that the remote has not consumed
        in_flight_out: Arc<AtomicUsize>,
        /// Data bytes the remote sent that we have not consumed
        in_flight_in: Arc<AtomicUsize>,
        /// Extra buffered bytes reported on top of the real count
        pressure: Arc<AtomicUsize>,
        data_sent: usize,
        tamper: Option<DataTamper>,
        ice_servers: Vec<String>,
    }

    impl MemoryTransport {
        /// Two connected endpoints; the first is conventionally the HOST side
        pub fn pair() -> (Self, Self) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let a_to_b = Arc::new(AtomicUsize::new(0));
            let b_to_a = Arc::new(AtomicUsize::new(0));

            let a = Self::new("host", a_tx, b_rx, a_to_b.clone(), b_to_a.clone());
            let b = Self::new("peer", b_tx, a_rx, b_to_a, a_to_b);
            (a, b)
        }

        fn new(
            name: &'static str,
            outbound: mpsc::UnboundedSender<Wire>,
            inbound: mpsc::UnboundedReceiver<Wire>,
            in_flight_out: Arc<AtomicUsize>,
            in_flight_in: Arc<AtomicUsize>,
        ) -> Self {
            Self {
                name,
                outbound,
                inbound,
                pending: VecDeque::new(),
                local_set: false,
                remote_set: false,
                ready_sent: false,
                remote_ready: false,
                open: false,
                closed: false,
                in_flight_out,
                in_flight_in,
                pressure: Arc::new(AtomicUsize::new(0)),
                data_sent: 0,
                tamper: None,
                ice_servers: Vec::new(),
            }
        }

        /// Gauge added to [`Transport::data_buffered_amount`], for simulating
        /// a congested data channel
        pub fn pressure_gauge(&self) -> Arc<AtomicUsize> {
            self.pressure.clone()
        }

        /// Rewrite outbound data frames before they hit the wire. The
        /// closure gets the frame's index and the sealed frame bytes.
        pub fn set_data_tamper(&mut self, tamper: impl FnMut(usize, &mut Vec<u8>) + Send + 'static) {
            self.tamper = Some(Box::new(tamper));
        }

        /// Servers passed to [`Transport::configure_ice`]. Nothing is
        /// gathered from them; candidates are always loopback.
        pub fn ice_servers(&self) -> &[String] {
            &self.ice_servers
        }

        /// A handle that can sever the link from outside the engine
        pub fn breaker(&self) -> LinkBreaker {
            LinkBreaker {
                outbound: self.outbound.clone(),
            }
        }

        fn push(&self, wire: Wire) -> Result<()> {
            self.outbound
                .send(wire)
                .map_err(|_| Error::Transport(format!("{}: remote endpoint is gone", self.name)))
        }

        fn local_candidate(&mut self) {
            let octet = if self.name == "host" { 2 } else { 3 };
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.{} 5000{} typ host",
                octet, octet, octet
            ));
            self.pending.push_back(TransportEvent::LocalCandidate(candidate));
        }

        fn maybe_ready(&mut self) -> Result<()> {
            if self.local_set && self.remote_set && !self.ready_sent {
                self.ready_sent = true;
                self.push(Wire::Ready)?;
            }
            self.maybe_open();
            Ok(())
        }

        fn maybe_open(&mut self) {
            if !self.open && self.ready_sent && self.remote_ready {
                self.open = true;
                tracing::debug!("{}: channels open", self.name);
                self.pending.push_back(TransportEvent::ChannelOpen);
            }
        }

        fn ensure_open(&self) -> Result<()> {
            if self.closed {
                return Err(Error::Transport(format!("{}: transport closed", self.name)));
            }
            if !self.open {
                return Err(Error::Transport(format!("{}: channels not open", self.name)));
            }
            Ok(())
        }
    }

    impl Transport for MemoryTransport {
        fn configure_ice(&mut self, servers: &[String]) -> Result<()> {
            if self.local_set {
                return Err(Error::Transport("ICE servers set after negotiation began".to_string()));
            }
            tracing::debug!("{}: {} ICE server(s)", self.name, servers.len());
            self.ice_servers = servers.to_vec();
            Ok(())
        }

        async fn create_offer(&mut self) -> Result<SessionDescription> {
            if self.local_set {
                return Err(Error::Transport("local description already set".to_string()));
            }
            self.local_set = true;
            self.local_candidate();
            self.maybe_ready()?;
            Ok(SessionDescription::offer(format!("v=0 o={} memory", self.name)))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription> {
            if !self.remote_set {
                return Err(Error::Transport("no remote offer to answer".to_string()));
            }
            self.local_set = true;
            self.local_candidate();
            self.maybe_ready()?;
            Ok(SessionDescription::answer(format!("v=0 o={} memory", self.name)))
        }

        async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
            if description.kind == SdpKind::Answer && !self.local_set {
                return Err(Error::Transport("answer received without a local offer".to_string()));
            }
            self.remote_set = true;
            self.maybe_ready()
        }

        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
            if !self.remote_set {
                return Err(Error::Transport(
                    "candidate added before remote description".to_string(),
                ));
            }
            tracing::trace!("{}: added candidate {}", self.name, candidate.candidate);
            Ok(())
        }

        async fn send_control(&mut self, frame: Vec<u8>) -> Result<()> {
            self.ensure_open()?;
            self.push(Wire::Control(frame))
        }

        async fn send_data(&mut self, mut frame: Vec<u8>) -> Result<()> {
            self.ensure_open()?;
            if let Some(tamper) = self.tamper.as_mut() {
                tamper(self.data_sent, &mut frame);
            }
            self.data_sent += 1;
            self.in_flight_out.fetch_add(frame.len(), Ordering::SeqCst);
            self.push(Wire::Data(frame))
        }

        fn data_buffered_amount(&self) -> usize {
            self.in_flight_out.load(Ordering::SeqCst) + self.pressure.load(Ordering::SeqCst)
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            loop {
                if let Some(event) = self.pending.pop_front() {
                    return Some(event);
                }
                if self.closed {
                    return None;
                }

                match self.inbound.recv().await {
                    Some(Wire::Ready) => {
                        self.remote_ready = true;
                        self.maybe_open();
                    }
                    Some(Wire::Control(frame)) => return Some(TransportEvent::Control(frame)),
                    Some(Wire::Data(frame)) => {
                        self.in_flight_in.fetch_sub(frame.len(), Ordering::SeqCst);
                        return Some(TransportEvent::Data(frame));
                    }
                    Some(Wire::Close) | None => {
                        self.closed = true;
                        return Some(TransportEvent::Closed);
                    }
                }
            }
        }

        async fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            let _ = self.outbound.send(Wire::Close);
        }
    }

    /// Severs a [`MemoryTransport`] link: the remote endpoint sees `Closed`
    #[derive(Clone)]
    pub struct LinkBreaker {
        outbound: mpsc::UnboundedSender<Wire>,
    }

    impl LinkBreaker {
        pub fn sever(&self) {
            let _ = self.outbound.send(Wire::Close);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::signaling::SignalMessage;

        async fn connect() -> (MemoryTransport, MemoryTransport) {
            let (mut host, mut peer) = MemoryTransport::pair();
            let offer = host.create_offer().await.unwrap();
            peer.set_remote_description(offer).await.unwrap();
            let answer = peer.create_answer().await.unwrap();
            host.set_remote_description(answer).await.unwrap();
            (host, peer)
        }

        async fn skip_candidate(transport: &mut MemoryTransport) {
            match transport.next_event().await {
                Some(TransportEvent::LocalCandidate(c)) => {
                    let relayed = SignalMessage::Candidate(c);
                    assert!(relayed.to_json().unwrap().contains("typ host"));
                }
                other => panic!("expected local candidate, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_ice_servers_fixed_before_offer() {
            let (mut host, _peer) = MemoryTransport::pair();
            let servers = vec!["stun:stun.example:3478".to_string()];
            host.configure_ice(&servers).unwrap();
            assert_eq!(host.ice_servers(), servers.as_slice());

            host.create_offer().await.unwrap();
            assert!(host.configure_ice(&servers).is_err());
        }

        #[tokio::test]
        async fn test_channels_open_after_both_descriptions() {
            let (mut host, mut peer) = connect().await;
            skip_candidate(&mut host).await;
            skip_candidate(&mut peer).await;
            assert_eq!(host.next_event().await, Some(TransportEvent::ChannelOpen));
            assert_eq!(peer.next_event().await, Some(TransportEvent::ChannelOpen));
        }

        #[tokio::test]
        async fn test_send_before_open_fails() {
            let (mut host, _peer) = MemoryTransport::pair();
            assert!(host.send_control(b"x".to_vec()).await.is_err());
        }

        #[tokio::test]
        async fn test_candidate_requires_remote_description() {
            let (_host, mut peer) = MemoryTransport::pair();
            assert!(peer.add_ice_candidate(IceCandidate::new("c")).await.is_err());
        }

        #[tokio::test]
        async fn test_control_and_data_keep_order() {
            let (mut host, mut peer) = connect().await;
            skip_candidate(&mut host).await;
            host.next_event().await;
            skip_candidate(&mut peer).await;
            peer.next_event().await;

            host.send_control(b"c1".to_vec()).await.unwrap();
            host.send_data(b"d1".to_vec()).await.unwrap();
            host.send_control(b"c2".to_vec()).await.unwrap();
            assert_eq!(host.data_buffered_amount(), 2);

            assert_eq!(peer.next_event().await, Some(TransportEvent::Control(b"c1".to_vec())));
            assert_eq!(peer.next_event().await, Some(TransportEvent::Data(b"d1".to_vec())));
            assert_eq!(peer.next_event().await, Some(TransportEvent::Control(b"c2".to_vec())));
            assert_eq!(host.data_buffered_amount(), 0);

            host.pressure_gauge().store(100, Ordering::SeqCst);
            assert_eq!(host.data_buffered_amount(), 100);
        }

        #[tokio::test]
        async fn test_close_reaches_remote() {
            let (mut host, mut peer) = connect().await;
            skip_candidate(&mut peer).await;
            peer.next_event().await;

            host.close().await;
            assert_eq!(peer.next_event().await, Some(TransportEvent::Closed));
            assert_eq!(peer.next_event().await, None);
        }

        #[tokio::test]
        async fn test_breaker_severs_link() {
            let (host, mut peer) = MemoryTransport::pair();
            host.breaker().sever();
            assert_eq!(peer.next_event().await, Some(TransportEvent::Closed));
        }
    }
}
