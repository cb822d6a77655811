//! Transfer session state machine
//!
//! One session per outstanding blob transfer, keyed by (peer, request id)
//! and owned exclusively by the peer's record. The session tracks chunk
//! reassembly, content verification, and payment gating; all I/O happens
//! in the manager, which drives the transitions below.
//!
//! Requested -> Offered -> Accepted -> Transferring -> Verifying
//!                                                  -> {Complete | Failed}
//!
//! A provider-side session starts directly in Offered after terms are
//! computed. Complete and Failed are terminal; the owning record drops
//! the session on either.

use bitvec::prelude::*;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tollgate_core::{
    chunk, hash_to_hex,
    proto::PaymentTerms,
    ContentHash, Error, PaymentMode, PaymentState, Result, TransferRole,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Offered,
    Accepted,
    Transferring,
    Verifying,
    Complete,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

pub struct TransferSession {
    pub request_id: u32,
    pub role: TransferRole,
    pub hash: ContentHash,
    pub size: u64,
    pub chunk_count: u32,
    pub payment_mode: PaymentMode,
    pub payment_state: PaymentState,
    pub state: SessionState,
    /// Abort the session when no progress has been made by this instant
    pub deadline: Instant,
    /// Terms quoted for this transfer (None when served free)
    pub terms: Option<PaymentTerms>,
    /// Caller-supplied price ceiling (requester side)
    pub budget: Option<u64>,

    /// Chunks received (requester) or sent (provider), by index
    chunks: BitVec,
    chunks_done: u32,
    /// Reassembly buffer (requester side)
    buffer: Vec<u8>,
    /// Resolves the pending request_blob call (requester side)
    completion: Option<oneshot::Sender<Result<Bytes>>>,

    ack_timeout: Duration,
    transfer_timeout: Duration,
}

impl TransferSession {
    /// Create the local side of an outgoing request
    pub fn new_requester(
        request_id: u32,
        hash: ContentHash,
        payment_mode: PaymentMode,
        budget: Option<u64>,
        completion: oneshot::Sender<Result<Bytes>>,
        ack_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            request_id,
            role: TransferRole::Requester,
            hash,
            size: 0,
            chunk_count: 0,
            payment_mode,
            payment_state: PaymentState::None,
            state: SessionState::Requested,
            deadline: Instant::now() + ack_timeout,
            terms: None,
            budget,
            chunks: BitVec::new(),
            chunks_done: 0,
            buffer: Vec::new(),
            completion: Some(completion),
            ack_timeout,
            transfer_timeout,
        }
    }

    /// Create the provider side for a fresh inbound request, already
    /// offered with computed terms
    pub fn new_provider(
        request_id: u32,
        hash: ContentHash,
        size: u64,
        terms: Option<PaymentTerms>,
        ack_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        let count = chunk::chunk_count(size);
        let payment_mode = terms
            .as_ref()
            .and_then(|t| PaymentMode::try_from(t.mode).ok())
            .unwrap_or(PaymentMode::Postpay);
        Self {
            request_id,
            role: TransferRole::Provider,
            hash,
            size,
            chunk_count: count,
            payment_mode,
            payment_state: PaymentState::None,
            state: SessionState::Offered,
            deadline: Instant::now() + ack_timeout,
            terms,
            budget: None,
            chunks: bitvec![0; count as usize],
            chunks_done: 0,
            buffer: Vec::new(),
            completion: None,
            ack_timeout,
            transfer_timeout,
        }
    }

    /// Amount quoted for this transfer, 0 when free
    pub fn quoted_amount(&self) -> u64 {
        self.terms.as_ref().map(|t| t.amount).unwrap_or(0)
    }

    /// Requester: apply a received offer. Validates the declared chunk
    /// count and allocates the reassembly buffer.
    pub fn handle_offer(
        &mut self,
        size: u64,
        chunk_count: u32,
        terms: Option<PaymentTerms>,
    ) -> Result<()> {
        if self.state != SessionState::Requested {
            return Err(Error::ProtocolViolation(format!(
                "offer in state {}",
                self.state
            )));
        }
        if chunk_count != chunk::chunk_count(size) {
            return Err(Error::ProtocolViolation(format!(
                "declared {} chunks for {} bytes",
                chunk_count, size
            )));
        }
        if let Some(t) = &terms {
            if PaymentMode::try_from(t.mode).is_err() {
                return Err(Error::ProtocolViolation("unknown payment mode".to_string()));
            }
        }
        self.size = size;
        self.chunk_count = chunk_count;
        self.chunks = bitvec![0; chunk_count as usize];
        self.buffer = vec![0u8; size as usize];
        // The offer may switch payment timing (e.g. a provider that only
        // trusts us for prepay); the offered mode is what applies.
        if let Some(t) = &terms {
            if let Ok(mode) = PaymentMode::try_from(t.mode) {
                self.payment_mode = mode;
            }
        }
        self.terms = terms;
        self.state = SessionState::Offered;
        self.deadline = Instant::now() + self.ack_timeout;
        Ok(())
    }

    /// Both sides: offer accepted, transfer about to start
    pub fn mark_accepted(&mut self) -> Result<()> {
        if self.state != SessionState::Offered {
            return Err(Error::ProtocolViolation(format!(
                "accept in state {}",
                self.state
            )));
        }
        self.state = SessionState::Accepted;
        self.deadline = Instant::now() + self.ack_timeout;
        Ok(())
    }

    /// Provider: start streaming chunks. Prepay transfers require the
    /// proof to have been verified first.
    pub fn begin_transfer(&mut self) -> Result<()> {
        if self.state != SessionState::Accepted {
            return Err(Error::ProtocolViolation(format!(
                "transfer start in state {}",
                self.state
            )));
        }
        if self.payment_mode == PaymentMode::Prepay
            && self.quoted_amount() > 0
            && self.payment_state == PaymentState::None
        {
            return Err(Error::PaymentRejected(
                "prepay transfer without verified proof".to_string(),
            ));
        }
        self.state = SessionState::Transferring;
        self.deadline = Instant::now() + self.transfer_timeout;
        Ok(())
    }

    /// Requester: store one received chunk. Returns true once every
    /// chunk has arrived and the session has moved to Verifying.
    ///
    /// Out-of-range and duplicate indices are discarded, not errors:
    /// the chunk lane may reorder and replay.
    pub fn accept_chunk(&mut self, index: u32, payload: &[u8]) -> Result<bool> {
        if self.role != TransferRole::Requester {
            return Err(Error::ProtocolViolation(
                "chunk received by provider-side session".to_string(),
            ));
        }
        match self.state {
            // Provider streams immediately after the ack; the first
            // chunk is what moves us out of Accepted.
            SessionState::Accepted => {
                if self.payment_mode == PaymentMode::Prepay
                    && self.quoted_amount() > 0
                    && self.payment_state == PaymentState::None
                {
                    return Err(Error::ProtocolViolation(
                        "chunk before payment proof".to_string(),
                    ));
                }
                self.state = SessionState::Transferring;
                self.deadline = Instant::now() + self.transfer_timeout;
            }
            SessionState::Transferring => {}
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "chunk in state {}",
                    other
                )));
            }
        }

        if index >= self.chunk_count {
            tracing::debug!("discarding out-of-range chunk index {}", index);
            return Ok(false);
        }
        if self.chunks[index as usize] {
            tracing::debug!("discarding duplicate chunk index {}", index);
            return Ok(false);
        }
        let expected = chunk::chunk_len(self.size, index);
        if payload.len() != expected {
            return Err(Error::ProtocolViolation(format!(
                "chunk {} has {} bytes, expected {}",
                index,
                payload.len(),
                expected
            )));
        }

        let offset = index as usize * tollgate_core::CHUNK_SIZE;
        self.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        self.chunks.set(index as usize, true);
        self.chunks_done += 1;

        if self.chunks_done == self.chunk_count {
            self.state = SessionState::Verifying;
            self.deadline = Instant::now() + self.ack_timeout;
            return Ok(true);
        }
        Ok(false)
    }

    /// Requester: recompute the content hash over the reassembled bytes.
    /// On mismatch the payload is discarded.
    pub fn verify(&mut self) -> Result<Bytes> {
        if self.state != SessionState::Verifying {
            return Err(Error::ProtocolViolation(format!(
                "verify in state {}",
                self.state
            )));
        }
        let data = std::mem::take(&mut self.buffer);
        if !chunk::verify_content(&data, &self.hash) {
            let actual = chunk::content_hash(&data);
            return Err(Error::HashMismatch {
                expected: hash_to_hex(&self.hash),
                actual: hash_to_hex(&actual),
            });
        }
        Ok(Bytes::from(data))
    }

    /// Provider: mark one chunk as sent. Once all are out, the session
    /// waits in Verifying for the requester's BlobOk.
    pub fn mark_sent(&mut self, index: u32) {
        if index >= self.chunk_count || self.chunks[index as usize] {
            return;
        }
        self.chunks.set(index as usize, true);
        self.chunks_done += 1;
        if self.chunks_done == self.chunk_count {
            self.state = SessionState::Verifying;
            self.deadline = Instant::now() + self.ack_timeout;
        }
    }

    /// Terminate successfully, resolving the pending request
    pub fn complete(&mut self, data: Bytes) {
        self.state = SessionState::Complete;
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(data));
        }
    }

    /// Terminate with an error, resolving the pending request
    pub fn fail(&mut self, err: Error) {
        self.state = SessionState::Failed;
        self.buffer = Vec::new();
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(err));
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Complete | SessionState::Failed)
    }

    pub fn deadline_expired(&self, now: Instant) -> bool {
        !self.is_terminal() && now >= self.deadline
    }

    /// The error a deadline expiry maps to. A prepay requester that
    /// never produced a proof before the ack timeout fails with
    /// PaymentUnavailable rather than a bare timeout.
    pub fn timeout_error(&self) -> Error {
        if self.role == TransferRole::Requester
            && self.payment_mode == PaymentMode::Prepay
            && self.payment_state == PaymentState::None
            && matches!(self.state, SessionState::Offered)
        {
            return Error::PaymentUnavailable(
                "no payment proof before ack timeout".to_string(),
            );
        }
        Error::Timeout(format!("session deadline in state {}", self.state))
    }
}
