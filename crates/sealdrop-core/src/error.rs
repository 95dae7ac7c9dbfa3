//! Error types for Sealdrop

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid connection link: {0}")]
    LinkInvalid(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engine is no longer running")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level fault codes surfaced through [`ProtocolError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SignalErr,
    CtrlErr,
    DataErr,
    CryptoErr,
    ProtoErr,
    MitmAlert,
    AuthErr,
    SecErr,
    ReadErr,
    EncryptErr,
    DecryptErr,
    /// A single chunk failed verification but is still within its retry budget
    ChunkHashMismatch,
    MaxRetries,
    FileHashMismatch,
    TimeoutHandshake,
    TimeoutIdle,
    PcConnLost,
    UserAbort,
    UserCancel,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SignalErr => "SIGNAL_ERR",
            ErrorCode::CtrlErr => "CTRL_ERR",
            ErrorCode::DataErr => "DATA_ERR",
            ErrorCode::CryptoErr => "CRYPTO_ERR",
            ErrorCode::ProtoErr => "PROTO_ERR",
            ErrorCode::MitmAlert => "MITM_ALERT",
            ErrorCode::AuthErr => "AUTH_ERR",
            ErrorCode::SecErr => "SEC_ERR",
            ErrorCode::ReadErr => "READ_ERR",
            ErrorCode::EncryptErr => "ENCRYPT_ERR",
            ErrorCode::DecryptErr => "DECRYPT_ERR",
            ErrorCode::ChunkHashMismatch => "CHUNK_HASH_MISMATCH",
            ErrorCode::MaxRetries => "MAX_RETRIES",
            ErrorCode::FileHashMismatch => "FILE_HASH_MISMATCH",
            ErrorCode::TimeoutHandshake => "TIMEOUT_HANDSHAKE",
            ErrorCode::TimeoutIdle => "TIMEOUT_IDLE",
            ErrorCode::PcConnLost => "PC_CONN_LOST",
            ErrorCode::UserAbort => "USER_ABORT",
            ErrorCode::UserCancel => "USER_CANCEL",
        }
    }

    /// Whether a fault with this code tears the session down.
    ///
    /// Only a chunk mismatch inside its retry budget is recoverable; it is
    /// handled by re-requesting the chunk and never reaches the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCode::ChunkHashMismatch)
    }

    /// Authentication failures are never retried and hint at interception
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            ErrorCode::MitmAlert | ErrorCode::AuthErr | ErrorCode::SecErr
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session fault: code, message and the recovery context
///
/// `next_chunk_id` is the first chunk the receiver has not confirmed, so a
/// new session can resume from there.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    pub next_chunk_id: Option<u64>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            next_chunk_id: None,
        }
    }

    /// Attach the recovery chunk id
    pub fn with_chunk(mut self, chunk_id: u64) -> Self {
        self.next_chunk_id = Some(chunk_id);
        self
    }
}
