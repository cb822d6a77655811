//! Tollgate Core - Shared types, wire protocol, and boundary traits
//!
//! This crate provides the fundamental building blocks for the tollgate
//! payment-gated P2P blob distribution layer: the control-message codec,
//! the chunk frame codec, the pricing engine, and the transport and wallet
//! boundaries the stateful peer layer is built on.

pub mod channel;
pub mod chunk;
pub mod error;
pub mod pricing;
pub mod proto;
pub mod types;
pub mod wallet;

pub use channel::{Channel, ChannelEvent, ChannelSender, Transport};
pub use error::{Error, Result};
pub use proto::PaymentMode;
pub use types::*;
pub use wallet::Wallet;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Chunk payload size: 16 KiB per framed chunk, final chunk may be shorter
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Binary chunk frame header: request id (u32 BE) + chunk index (u32 BE)
pub const CHUNK_HEADER_LEN: usize = 8;

/// How long a session may sit in Offered before it is aborted
pub const BLOB_ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// How long a session may sit in Transferring before it is aborted
pub const TRANSFER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
