//! Control-message definitions for the blob transfer protocol
//!
//! These are manually defined prost messages, avoiding the need for
//! protoc at build time. Control messages travel on the reliable ordered
//! control channel; binary chunks use the raw frame codec in `chunk`.

use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all control messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request id correlating the envelope with a transfer session
    #[prost(uint32, tag = "2")]
    pub request_id: u32,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 11, 12, 13, 100")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    BlobReq(BlobReq),
    #[prost(message, tag = "11")]
    BlobRes(BlobRes),
    #[prost(message, tag = "12")]
    BlobAck(BlobAck),
    #[prost(message, tag = "13")]
    BlobOk(BlobOk),
    #[prost(message, tag = "100")]
    ErrorResponse(ErrorResponse),
}

/// Payment timing relative to the transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum PaymentMode {
    /// Proof of payment required before any chunk is sent
    Prepay = 0,
    /// Transfer runs on trust, settled after verification
    Postpay = 1,
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepay => write!(f, "prepay"),
            Self::Postpay => write!(f, "postpay"),
        }
    }
}

/// Requester -> provider: ask for a blob by content hash
#[derive(Clone, PartialEq, Message)]
pub struct BlobReq {
    /// Content hash of the requested blob (32 bytes)
    #[prost(bytes, tag = "1")]
    pub hash: Vec<u8>,
    /// Expected size if known, 0 otherwise
    #[prost(uint64, tag = "2")]
    pub size_hint: u64,
    /// Payment timing the requester prefers
    #[prost(enumeration = "PaymentMode", tag = "3")]
    pub payment_preference: i32,
}

/// Bandwidth price quote attached to a BlobRes
#[derive(Clone, PartialEq, Message)]
pub struct PaymentTerms {
    #[prost(enumeration = "PaymentMode", tag = "1")]
    pub mode: i32,
    /// Price in smallest currency unit
    #[prost(uint64, tag = "2")]
    pub amount: u64,
    /// Currency unit, e.g. "sat"
    #[prost(string, tag = "3")]
    pub unit: String,
    /// Pricing basis: rate per GiB the quote was computed from
    #[prost(uint64, tag = "4")]
    pub rate: u64,
    /// Pricing basis: payload size the quote was computed from
    #[prost(uint64, tag = "5")]
    pub size_bytes: u64,
    /// Accepted payment methods, e.g. "lightning", "cashu"
    #[prost(string, repeated, tag = "6")]
    pub methods: Vec<String>,
}

/// Provider -> requester: transfer offer with size and optional price
#[derive(Clone, PartialEq, Message)]
pub struct BlobRes {
    /// Exact blob size in bytes
    #[prost(uint64, tag = "1")]
    pub size: u64,
    /// ceil(size / CHUNK_SIZE)
    #[prost(uint32, tag = "2")]
    pub chunk_count: u32,
    /// Absent when the provider serves content free of charge
    #[prost(message, optional, tag = "3")]
    pub payment_terms: Option<PaymentTerms>,
}

/// Requester -> provider: accept or decline the offer
#[derive(Clone, PartialEq, Message)]
pub struct BlobAck {
    #[prost(bool, tag = "1")]
    pub accept: bool,
    /// Required for prepay: payment preimage or token
    #[prost(string, optional, tag = "2")]
    pub payment_proof: Option<String>,
}

/// Requester -> provider: verification result after reassembly
#[derive(Clone, PartialEq, Message)]
pub struct BlobOk {
    /// Whether the recomputed content hash matched the requested one
    #[prost(bool, tag = "1")]
    pub verified: bool,
    /// The content hash the result refers to
    #[prost(bytes, tag = "2")]
    pub hash: Vec<u8>,
    /// For postpay: payment produced after successful verification
    #[prost(string, optional, tag = "3")]
    pub payment_token: Option<String>,
}

/// Typed failure answer to a control message
#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Error codes
pub mod error_codes {
    // Protocol errors (1xx)
    pub const INVALID_MESSAGE: u32 = 101;

    // Resource errors (2xx)
    pub const NOT_FOUND: u32 = 200;
    pub const LIMIT_EXCEEDED: u32 = 201;

    // Payment errors (3xx)
    pub const PAYMENT_REJECTED: u32 = 300;
}

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u32, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            request_id,
            payload: Some(payload),
        }
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

/// Helper functions to create common message types

pub fn blob_req(request_id: u32, hash: Vec<u8>, size_hint: u64, preference: PaymentMode) -> Envelope {
    Envelope::new(
        request_id,
        Payload::BlobReq(BlobReq {
            hash,
            size_hint,
            payment_preference: preference as i32,
        }),
    )
}

pub fn blob_res(
    request_id: u32,
    size: u64,
    chunk_count: u32,
    payment_terms: Option<PaymentTerms>,
) -> Envelope {
    Envelope::new(
        request_id,
        Payload::BlobRes(BlobRes {
            size,
            chunk_count,
            payment_terms,
        }),
    )
}

pub fn blob_ack(request_id: u32, accept: bool, payment_proof: Option<String>) -> Envelope {
    Envelope::new(
        request_id,
        Payload::BlobAck(BlobAck {
            accept,
            payment_proof,
        }),
    )
}

pub fn blob_ok(
    request_id: u32,
    verified: bool,
    hash: Vec<u8>,
    payment_token: Option<String>,
) -> Envelope {
    Envelope::new(
        request_id,
        Payload::BlobOk(BlobOk {
            verified,
            hash,
            payment_token,
        }),
    )
}

pub fn error_response(request_id: u32, code: u32, message: String) -> Envelope {
    Envelope::new(
        request_id,
        Payload::ErrorResponse(ErrorResponse { code, message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let original = blob_req(42, vec![1u8; 32], 50_000, PaymentMode::Postpay);
        let bytes = original.to_bytes();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(original.version, decoded.version);
        assert_eq!(original.request_id, decoded.request_id);
        match decoded.payload {
            Some(Payload::BlobReq(req)) => {
                assert_eq!(req.hash, vec![1u8; 32]);
                assert_eq!(req.size_hint, 50_000);
                assert_eq!(req.payment_preference, PaymentMode::Postpay as i32);
            }
            _ => panic!("expected BlobReq"),
        }
    }

    #[test]
    fn test_payment_terms_roundtrip() {
        let terms = PaymentTerms {
            mode: PaymentMode::Prepay as i32,
            amount: 21,
            unit: "sat".to_string(),
            rate: 100,
            size_bytes: 1 << 20,
            methods: vec!["lightning".to_string(), "cashu".to_string()],
        };
        let original = blob_res(7, 1 << 20, 64, Some(terms));
        let decoded = Envelope::from_bytes(&original.to_bytes()).unwrap();

        match decoded.payload {
            Some(Payload::BlobRes(res)) => {
                assert_eq!(res.size, 1 << 20);
                assert_eq!(res.chunk_count, 64);
                let terms = res.payment_terms.unwrap();
                assert_eq!(terms.amount, 21);
                assert_eq!(terms.unit, "sat");
                assert_eq!(terms.methods.len(), 2);
            }
            _ => panic!("expected BlobRes"),
        }
    }

    #[test]
    fn test_optional_fields_default_to_none() {
        let ack = blob_ack(1, true, None);
        let decoded = Envelope::from_bytes(&ack.to_bytes()).unwrap();
        match decoded.payload {
            Some(Payload::BlobAck(ack)) => {
                assert!(ack.accept);
                assert!(ack.payment_proof.is_none());
            }
            _ => panic!("expected BlobAck"),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = blob_ok(3, true, vec![2u8; 32], None);
        envelope.version = 99;
        let bytes = envelope.encode_to_vec();
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(Error::VersionMismatch { actual: 99, .. })
        ));
    }
}
