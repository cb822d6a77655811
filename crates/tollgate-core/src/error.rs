//! Error types for tollgate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("payment unavailable: {0}")]
    PaymentUnavailable(String),

    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session limit exceeded for peer {0}")]
    SessionLimitExceeded(String),

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u32 },

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
