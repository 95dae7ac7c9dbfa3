//! Sealdrop Core - protocol engine for authenticated P2P file transfer
//!
//! This crate provides the identity and connection-link scheme, the
//! handshake state machine, the secure channel, and the chunked transfer
//! engine that run on top of an ordered, reliable two-channel transport.

pub mod channel;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod link;
pub mod proto;
pub mod session;
pub mod signaling;
pub mod source;
pub mod timer;
pub mod transfer;
pub mod transport;
pub mod types;

pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{Error, ErrorCode, ProtocolError, Result};
pub use identity::Identity;
pub use link::{generate_link, ConnectionLink};
pub use session::{Event, Session};
pub use signaling::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
pub use source::FileSource;
pub use transfer::TransferSettings;
pub use transport::{Transport, TransportEvent};
pub use types::*;

use std::time::Duration;

/// Protocol version carried in links and `SYN`
pub const PROTOCOL_VERSION: &str = "v1";

/// Default chunk size: 16 MiB
pub const CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default slice size: 1 MiB
pub const SLICE_SIZE: u64 = 1024 * 1024;

/// Outstanding data-channel bytes above which the sender stops reading
pub const BUFFER_THRESHOLD: usize = 16 * 1024 * 1024;

/// Hash mismatches tolerated per chunk before the transfer is abandoned
pub const MAX_RETRIES: u32 = 5;

/// Handshake must reach `ESTABLISHED` within this window
pub const TIMEOUT_HANDSHAKE: Duration = Duration::from_secs(60);

/// Maximum gap without transfer activity
pub const TIMEOUT_IDLE: Duration = Duration::from_secs(30);

/// STUN server used when the caller configures none of its own
pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Poll interval while the data channel is above the buffer threshold
pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(50);
