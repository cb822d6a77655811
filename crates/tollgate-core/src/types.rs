//! Core data types for tollgate

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 32-byte BLAKE3 content address
pub type ContentHash = [u8; 32];

/// Stable identifier of a remote peer (public key string)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new PeerId from a string
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Get the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log output
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::InvalidData("empty peer identity".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection lifecycle state of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Which side of a transfer a session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRole {
    Requester,
    Provider,
}

/// Payment progress within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    None,
    ProofSubmitted,
    Verified,
    Settled,
}

/// A peer visible within the liveness window
#[derive(Debug, Clone)]
pub struct OnlineUser {
    pub identity: PeerId,
    /// Unix timestamp of last inbound traffic
    pub last_seen: u64,
}

/// Durable per-peer bandwidth counters
///
/// Accumulate-only: every field is monotonically non-decreasing except
/// `last_seen`, which tracks the most recent update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerBandwidthStats {
    pub identity: String,
    pub events_sent: u64,
    pub events_received: u64,
    pub blobs_sent: u64,
    pub blobs_received: u64,
    pub event_bytes_sent: u64,
    pub event_bytes_received: u64,
    pub blob_bytes_sent: u64,
    pub blob_bytes_received: u64,
    pub last_seen: u64,
}

/// Helper to format a content hash as hex string
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into a content hash
pub fn hex_to_hash(s: &str) -> Result<ContentHash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}
