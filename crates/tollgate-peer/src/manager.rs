//! Peer connection lifecycle and blob transfer orchestration
//!
//! The manager owns one record per remote identity, demultiplexes
//! inbound control messages and chunk frames to the owning transfer
//! session, and drives payment gating against the wallet boundary.
//! Signaling happens outside: both endpoints of a logical connection
//! call `connect` toward each other once the external layer has done
//! the offer/answer dance.

use crate::config::Config;
use crate::ledger::{now_secs, BandwidthLedger};
use crate::session::{SessionState, TransferSession};
use crate::store::BlobStore;
use bytes::Bytes;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tollgate_core::proto::{self, error_codes, Envelope, Payload, PaymentTerms};
use tollgate_core::{
    chunk, hash_to_hex, pricing, ChannelEvent, ChannelSender, ConnectionState, ContentHash,
    Error, OnlineUser, PaymentMode, PaymentState, PeerId, Result, Transport, TransferRole,
    Wallet,
};

/// How often session deadlines are checked
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Notification fanned out to subscribed listeners
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected(PeerId),
    ConnectionFailed(PeerId),
    Disconnected(PeerId),
    /// Inbound traffic bumped the peer's last-seen timestamp
    Presence(PeerId),
    SessionCompleted { peer: PeerId, request_id: u32 },
    SessionFailed { peer: PeerId, request_id: u32 },
}

type Listener = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// Request ids are scoped per (peer, direction): our outgoing requests
/// and the remote's incoming ones live in separate id spaces
type SessionKey = (TransferRole, u32);

/// One record per known remote identity
struct PeerRecord {
    state: ConnectionState,
    data_channel_ready: bool,
    last_seen_at: u64,
    sender: Option<ChannelSender>,
    sessions: HashMap<SessionKey, TransferSession>,
    next_request_id: u32,
    connect_waiters: Vec<oneshot::Sender<bool>>,
    reader: Option<JoinHandle<()>>,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            state: ConnectionState::New,
            data_channel_ready: false,
            last_seen_at: 0,
            sender: None,
            sessions: HashMap::new(),
            next_request_id: seed_request_id(),
            connect_waiters: Vec::new(),
            reader: None,
        }
    }

    /// Next request id unique among our currently-open requests to this
    /// peer: monotonically increasing with wraparound, skipping ids
    /// still in use. Zero is reserved.
    fn alloc_request_id(&mut self) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if id != 0 && !self.sessions.contains_key(&(TransferRole::Requester, id)) {
                return id;
            }
        }
    }
}

/// Request-id counters start at a random offset to avoid collisions
/// across restarts
fn seed_request_id() -> u32 {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        return 1;
    }
    u32::from_le_bytes(buf).max(1)
}

struct Settings {
    max_sessions_per_peer: usize,
    max_blob_size: u64,
    ack_timeout: Duration,
    transfer_timeout: Duration,
    liveness_window_secs: u64,
    rate_per_gb: u64,
    unit: String,
    methods: Vec<String>,
    max_rate_multiple: u64,
    serve_free: bool,
    cooldown: Duration,
    flush_interval: Duration,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            max_sessions_per_peer: config.transfer.max_sessions_per_peer,
            max_blob_size: config.transfer.max_blob_size,
            ack_timeout: Duration::from_secs(config.transfer.ack_timeout_secs),
            transfer_timeout: Duration::from_secs(config.transfer.transfer_timeout_secs),
            liveness_window_secs: config.presence.liveness_window_secs,
            rate_per_gb: config.pricing.rate_per_gb,
            unit: config.pricing.unit.clone(),
            methods: config.pricing.methods.clone(),
            max_rate_multiple: config.pricing.max_rate_multiple,
            serve_free: config.pricing.serve_free,
            cooldown: Duration::from_secs(config.pricing.cooldown_secs),
            flush_interval: Duration::from_secs(config.ledger.flush_interval_secs),
        }
    }
}

pub struct PeerManager<T: Transport, W: Wallet> {
    transport: T,
    wallet: W,
    store: Arc<BlobStore>,
    ledger: Arc<BandwidthLedger>,
    settings: Settings,
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    /// Requesters that stiffed a postpay transfer, with cooldown expiry
    cooldowns: Mutex<HashMap<PeerId, Instant>>,
}

impl<T: Transport + 'static, W: Wallet + 'static> PeerManager<T, W> {
    pub fn new(
        transport: T,
        wallet: W,
        store: Arc<BlobStore>,
        ledger: Arc<BandwidthLedger>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            wallet,
            store,
            ledger,
            settings: Settings::from(config),
            peers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background tasks: session deadline sweeper and
    /// periodic ledger flusher
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(SWEEP_INTERVAL).await;
                    mgr.sweep_deadlines();
                }
            })
        };
        let flusher = self.ledger.spawn_flusher(self.settings.flush_interval);
        vec![sweeper, flusher]
    }

    pub fn ledger(&self) -> &Arc<BandwidthLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Establish the data channel to a peer. Idempotent: an existing
    /// Connected record is returned untouched, and concurrent calls for
    /// the same identity share a single dial (single-flight).
    pub async fn connect(self: &Arc<Self>, peer: &PeerId) -> Result<()> {
        enum Plan {
            Ready,
            Wait(oneshot::Receiver<bool>),
            Dial,
        }

        let plan = {
            let mut peers = self.peers.lock().unwrap();
            let record = peers.entry(peer.clone()).or_insert_with(PeerRecord::new);
            match record.state {
                ConnectionState::Connected => Plan::Ready,
                ConnectionState::Connecting => {
                    let (tx, rx) = oneshot::channel();
                    record.connect_waiters.push(tx);
                    Plan::Wait(rx)
                }
                _ => {
                    record.state = ConnectionState::Connecting;
                    Plan::Dial
                }
            }
        };

        match plan {
            Plan::Ready => Ok(()),
            Plan::Wait(rx) => match rx.await {
                Ok(true) => Ok(()),
                _ => Err(Error::PeerUnreachable(peer.to_string())),
            },
            Plan::Dial => match self.transport.open_channel(peer).await {
                Ok(channel) => {
                    // Mark the record connected before the reader task can
                    // observe any inbound traffic
                    {
                        let mut peers = self.peers.lock().unwrap();
                        let record = peers.entry(peer.clone()).or_insert_with(PeerRecord::new);
                        record.state = ConnectionState::Connected;
                        record.data_channel_ready = true;
                        record.last_seen_at = now_secs();
                        record.sender = Some(channel.sender);
                        for waiter in record.connect_waiters.drain(..) {
                            let _ = waiter.send(true);
                        }
                    }
                    let reader =
                        tokio::spawn(Arc::clone(self).run_reader(peer.clone(), channel.events));
                    {
                        let mut peers = self.peers.lock().unwrap();
                        if let Some(record) = peers.get_mut(peer) {
                            record.reader = Some(reader);
                        }
                    }
                    self.ledger.touch(peer);
                    self.notify(&PeerEvent::Connected(peer.clone()));
                    tracing::info!("peer {} connected", peer.short());
                    Ok(())
                }
                Err(e) => {
                    {
                        let mut peers = self.peers.lock().unwrap();
                        if let Some(record) = peers.get_mut(peer) {
                            record.state = ConnectionState::Failed;
                            for waiter in record.connect_waiters.drain(..) {
                                let _ = waiter.send(false);
                            }
                        }
                    }
                    self.notify(&PeerEvent::ConnectionFailed(peer.clone()));
                    Err(Error::PeerUnreachable(format!("{}: {}", peer, e)))
                }
            },
        }
    }

    /// Tear the peer down, failing every active session with
    /// PeerDisconnected and releasing the channel
    pub fn disconnect(&self, peer: &PeerId) {
        self.teardown(peer, ConnectionState::Disconnected, true);
    }

    /// Count of peers currently connected
    pub fn connection_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
            .count()
    }

    /// Peers seen within the liveness window, for presence UIs
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let now = now_secs();
        let window = self.settings.liveness_window_secs;
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.last_seen_at > 0 && now.saturating_sub(r.last_seen_at) <= window)
            .map(|(id, r)| OnlineUser {
                identity: id.clone(),
                last_seen: r.last_seen_at,
            })
            .collect()
    }

    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.peers.lock().unwrap().get(peer).map(|r| r.state)
    }

    pub fn data_channel_ready(&self, peer: &PeerId) -> bool {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|r| r.data_channel_ready)
            .unwrap_or(false)
    }

    pub fn active_session_count(&self, peer: &PeerId) -> usize {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|r| r.sessions.len())
            .unwrap_or(0)
    }

    /// Register a listener invoked synchronously on every state change.
    /// A panicking listener is caught and logged, never propagated.
    pub fn subscribe(&self, listener: impl Fn(&PeerEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Request a blob from a peer and resolve with the verified payload
    pub async fn request_blob(
        self: &Arc<Self>,
        peer: &PeerId,
        hash: &ContentHash,
        size_hint: Option<u64>,
        mode: PaymentMode,
        budget: Option<u64>,
    ) -> Result<Bytes> {
        self.connect(peer).await?;

        let (tx, rx) = oneshot::channel();
        let (request_id, sender) = {
            let mut peers = self.peers.lock().unwrap();
            let record = peers
                .get_mut(peer)
                .ok_or_else(|| Error::PeerUnreachable(peer.to_string()))?;
            if record.state != ConnectionState::Connected {
                return Err(Error::PeerUnreachable(peer.to_string()));
            }
            if record.sessions.len() >= self.settings.max_sessions_per_peer {
                return Err(Error::SessionLimitExceeded(peer.to_string()));
            }
            let sender = record.sender.clone().ok_or(Error::ChannelClosed)?;
            let request_id = record.alloc_request_id();
            let session = TransferSession::new_requester(
                request_id,
                *hash,
                mode,
                budget,
                tx,
                self.settings.ack_timeout,
                self.settings.transfer_timeout,
            );
            record
                .sessions
                .insert((TransferRole::Requester, request_id), session);
            (request_id, sender)
        };

        tracing::debug!(
            "requesting blob {} from {} (request {}, {})",
            &hash_to_hex(hash)[..8],
            peer.short(),
            request_id,
            mode
        );

        let envelope = proto::blob_req(request_id, hash.to_vec(), size_hint.unwrap_or(0), mode);
        if let Err(e) = self.send_control(peer, &sender, envelope).await {
            self.remove_session(peer, TransferRole::Requester, request_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Demultiplex one inbound event to the owning session
    pub async fn route_inbound(self: &Arc<Self>, peer: &PeerId, event: ChannelEvent) {
        match event {
            ChannelEvent::Control(bytes) => {
                self.touch_inbound(peer, Some(bytes.len() as u64));
                match Envelope::from_bytes(&bytes) {
                    Ok(envelope) => self.dispatch_control(peer, envelope).await,
                    Err(e) => {
                        tracing::warn!("undecodable control message from {}: {}", peer.short(), e)
                    }
                }
            }
            ChannelEvent::Chunk(bytes) => {
                self.touch_inbound(peer, None);
                self.handle_chunk(peer, &bytes).await;
            }
            ChannelEvent::Closed => {
                self.teardown(peer, ConnectionState::Closed, false);
            }
        }
    }

    // ---- internals ----

    async fn run_reader(self: Arc<Self>, peer: PeerId, mut events: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            let closed = matches!(event, ChannelEvent::Closed);
            self.route_inbound(&peer, event).await;
            if closed {
                return;
            }
        }
        // Sender side dropped without an explicit close
        self.teardown(&peer, ConnectionState::Disconnected, false);
    }

    fn teardown(&self, peer: &PeerId, state: ConnectionState, abort_reader: bool) {
        let mut failed = Vec::new();
        let was_connected = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            let was_connected = record.state == ConnectionState::Connected;
            if let Some(reader) = record.reader.take() {
                if abort_reader {
                    reader.abort();
                }
            }
            record.sender = None;
            record.data_channel_ready = false;
            record.state = state;
            for waiter in record.connect_waiters.drain(..) {
                let _ = waiter.send(false);
            }
            for ((_, request_id), mut session) in record.sessions.drain() {
                session.fail(Error::PeerDisconnected(peer.to_string()));
                failed.push(request_id);
            }
            was_connected
        };
        for request_id in failed {
            self.notify(&PeerEvent::SessionFailed {
                peer: peer.clone(),
                request_id,
            });
        }
        if was_connected {
            tracing::info!("peer {} disconnected", peer.short());
            self.notify(&PeerEvent::Disconnected(peer.clone()));
        }
    }

    fn touch_inbound(&self, peer: &PeerId, control_len: Option<u64>) {
        {
            let mut peers = self.peers.lock().unwrap();
            if let Some(record) = peers.get_mut(peer) {
                record.last_seen_at = now_secs();
            }
        }
        match control_len {
            Some(n) => {
                self.ledger.record_event_received(peer, n);
                self.notify(&PeerEvent::Presence(peer.clone()));
            }
            None => self.ledger.touch(peer),
        }
    }

    async fn dispatch_control(self: &Arc<Self>, peer: &PeerId, envelope: Envelope) {
        let request_id = envelope.request_id;
        match envelope.payload {
            Some(Payload::BlobReq(req)) => self.handle_blob_req(peer, request_id, req).await,
            Some(Payload::BlobRes(res)) => self.handle_blob_res(peer, request_id, res).await,
            Some(Payload::BlobAck(ack)) => self.handle_blob_ack(peer, request_id, ack).await,
            Some(Payload::BlobOk(ok)) => self.handle_blob_ok(peer, request_id, ok).await,
            Some(Payload::ErrorResponse(err)) => {
                self.handle_error_response(peer, request_id, err)
            }
            None => tracing::warn!("empty control payload from {}", peer.short()),
        }
    }

    /// Provider side: a fresh BLOB_REQ opens an offered session
    async fn handle_blob_req(self: &Arc<Self>, peer: &PeerId, request_id: u32, req: proto::BlobReq) {
        let Some(sender) = self.sender_for(peer) else {
            return;
        };

        if req.hash.len() != 32 {
            self.send_error(peer, &sender, request_id, error_codes::INVALID_MESSAGE, "bad hash length")
                .await;
            return;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&req.hash);

        let preference =
            PaymentMode::try_from(req.payment_preference).unwrap_or(PaymentMode::Postpay);
        // Stiffed postpay requesters only get prepay terms while cooling down
        let mode = if preference == PaymentMode::Postpay && self.in_cooldown(peer) {
            PaymentMode::Prepay
        } else {
            preference
        };

        let blob = self.store.get(&hash);

        enum Decision {
            Offer { size: u64, chunk_count: u32, terms: Option<PaymentTerms> },
            Reject { code: u32, reason: &'static str },
        }

        let decision = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            if record.state != ConnectionState::Connected {
                return;
            }
            let key = (TransferRole::Provider, request_id);
            if record.sessions.contains_key(&key) {
                Decision::Reject {
                    code: error_codes::INVALID_MESSAGE,
                    reason: "request id already in use",
                }
            } else if record.sessions.len() >= self.settings.max_sessions_per_peer {
                Decision::Reject {
                    code: error_codes::LIMIT_EXCEEDED,
                    reason: "session limit reached",
                }
            } else {
                match &blob {
                    None => Decision::Reject {
                        code: error_codes::NOT_FOUND,
                        reason: "unknown blob",
                    },
                    Some(data) => {
                        let size = data.len() as u64;
                        let terms = if self.settings.serve_free {
                            None
                        } else {
                            Some(PaymentTerms {
                                mode: mode as i32,
                                amount: pricing::price(size, self.settings.rate_per_gb),
                                unit: self.settings.unit.clone(),
                                rate: self.settings.rate_per_gb,
                                size_bytes: size,
                                methods: self.settings.methods.clone(),
                            })
                        };
                        let session = TransferSession::new_provider(
                            request_id,
                            hash,
                            size,
                            terms.clone(),
                            self.settings.ack_timeout,
                            self.settings.transfer_timeout,
                        );
                        record.sessions.insert(key, session);
                        Decision::Offer {
                            size,
                            chunk_count: chunk::chunk_count(size),
                            terms,
                        }
                    }
                }
            }
        };

        match decision {
            Decision::Offer { size, chunk_count, terms } => {
                tracing::debug!(
                    "offering {} ({} bytes, {} chunks) to {}",
                    &hash_to_hex(&hash)[..8],
                    size,
                    chunk_count,
                    peer.short()
                );
                let envelope = proto::blob_res(request_id, size, chunk_count, terms);
                if self.send_control(peer, &sender, envelope).await.is_err() {
                    self.fail_and_remove(
                        peer,
                        TransferRole::Provider,
                        request_id,
                        Error::SendFailed("blob offer".to_string()),
                    );
                }
            }
            Decision::Reject { code, reason } => {
                tracing::debug!("rejecting request {} from {}: {}", request_id, peer.short(), reason);
                self.send_error(peer, &sender, request_id, code, reason).await;
            }
        }
    }

    /// Requester side: the provider's offer arrived
    async fn handle_blob_res(self: &Arc<Self>, peer: &PeerId, request_id: u32, res: proto::BlobRes) {
        enum Plan {
            Fail(Error),
            Decline(Error),
            AckNow,
            PayFirst(PaymentTerms),
        }

        let plan = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            let Some(session) = record
                .sessions
                .get_mut(&(TransferRole::Requester, request_id))
            else {
                tracing::debug!("offer for unknown request {} from {}", request_id, peer.short());
                return;
            };
            if res.size > self.settings.max_blob_size {
                Plan::Fail(Error::InvalidData(format!(
                    "offered blob of {} bytes exceeds limit",
                    res.size
                )))
            } else {
                match session.handle_offer(res.size, res.chunk_count, res.payment_terms) {
                    Err(e) => Plan::Fail(e),
                    Ok(()) => match &session.terms {
                        None => Plan::AckNow,
                        Some(terms) => {
                            let acceptable = pricing::within_budget(terms.amount, session.budget)
                                && pricing::quote_acceptable(
                                    terms.amount,
                                    session.size,
                                    self.settings.rate_per_gb,
                                    self.settings.max_rate_multiple,
                                );
                            if !acceptable {
                                Plan::Decline(Error::PaymentUnavailable(format!(
                                    "quote of {} {} exceeds budget or rate tolerance",
                                    terms.amount, terms.unit
                                )))
                            } else if session.payment_mode == PaymentMode::Prepay {
                                Plan::PayFirst(terms.clone())
                            } else {
                                Plan::AckNow
                            }
                        }
                    },
                }
            }
        };

        let Some(sender) = self.sender_for(peer) else {
            return;
        };

        match plan {
            Plan::Fail(e) => {
                self.fail_and_remove(peer, TransferRole::Requester, request_id, e);
            }
            Plan::Decline(e) => {
                let envelope = proto::blob_ack(request_id, false, None);
                let _ = self.send_control(peer, &sender, envelope).await;
                self.fail_and_remove(peer, TransferRole::Requester, request_id, e);
            }
            Plan::AckNow => {
                self.send_ack_and_arm(peer, &sender, request_id, None).await;
            }
            Plan::PayFirst(terms) => {
                // Bound the wallet call by the ack deadline so a hung
                // wallet cannot wedge the reader task
                let proof = tokio::time::timeout(
                    self.settings.ack_timeout,
                    self.wallet.proof_for_terms(&terms),
                )
                .await;
                match proof {
                    Ok(Ok(proof)) => {
                        self.send_ack_and_arm(peer, &sender, request_id, Some(proof)).await;
                    }
                    Ok(Err(e)) => {
                        // Abandon without sending the ack
                        tracing::debug!("no proof for request {}: {}", request_id, e);
                        self.fail_and_remove(
                            peer,
                            TransferRole::Requester,
                            request_id,
                            Error::PaymentUnavailable(e.to_string()),
                        );
                    }
                    Err(_) => {
                        self.fail_and_remove(
                            peer,
                            TransferRole::Requester,
                            request_id,
                            Error::PaymentUnavailable(
                                "no payment proof before ack timeout".to_string(),
                            ),
                        );
                    }
                }
            }
        }
    }

    /// Send the accepting BLOB_ACK and move the session to Accepted
    async fn send_ack_and_arm(
        self: &Arc<Self>,
        peer: &PeerId,
        sender: &ChannelSender,
        request_id: u32,
        proof: Option<String>,
    ) {
        let had_proof = proof.is_some();
        let envelope = proto::blob_ack(request_id, true, proof);
        if let Err(e) = self.send_control(peer, sender, envelope).await {
            self.fail_and_remove(peer, TransferRole::Requester, request_id, e);
            return;
        }
        let empty_blob = {
            let mut peers = self.peers.lock().unwrap();
            let Some(session) = peers
                .get_mut(peer)
                .and_then(|r| r.sessions.get_mut(&(TransferRole::Requester, request_id)))
            else {
                return;
            };
            if had_proof {
                session.payment_state = PaymentState::ProofSubmitted;
            }
            if session.mark_accepted().is_err() {
                return;
            }
            if session.chunk_count == 0 {
                session.state = SessionState::Verifying;
                true
            } else {
                false
            }
        };
        if empty_blob {
            self.finalize_verified(peer, request_id).await;
        }
    }

    /// Provider side: requester accepted or declined the offer
    async fn handle_blob_ack(self: &Arc<Self>, peer: &PeerId, request_id: u32, ack: proto::BlobAck) {
        enum Plan {
            Drop(Error),
            RejectProof(&'static str),
            Settle(String, u64),
            Start,
        }

        let plan = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            let Some(session) = record
                .sessions
                .get_mut(&(TransferRole::Provider, request_id))
            else {
                tracing::debug!("ack for unknown request {} from {}", request_id, peer.short());
                return;
            };
            if session.state != SessionState::Offered {
                Plan::Drop(Error::ProtocolViolation("out-of-sequence ack".to_string()))
            } else if !ack.accept {
                Plan::Drop(Error::PaymentUnavailable("requester declined offer".to_string()))
            } else if session.payment_mode == PaymentMode::Prepay && session.quoted_amount() > 0 {
                match ack.payment_proof {
                    Some(proof) => Plan::Settle(proof, session.quoted_amount()),
                    None => Plan::RejectProof("prepay ack without proof"),
                }
            } else {
                match session.mark_accepted() {
                    Ok(()) => Plan::Start,
                    Err(e) => Plan::Drop(e),
                }
            }
        };

        match plan {
            Plan::Drop(err) => {
                self.fail_and_remove(peer, TransferRole::Provider, request_id, err);
            }
            Plan::RejectProof(reason) => {
                self.fail_and_remove(
                    peer,
                    TransferRole::Provider,
                    request_id,
                    Error::PaymentRejected(reason.to_string()),
                );
                if let Some(sender) = self.sender_for(peer) {
                    self.send_error(peer, &sender, request_id, error_codes::PAYMENT_REJECTED, reason)
                        .await;
                }
            }
            Plan::Settle(proof, amount) => {
                let settled = tokio::time::timeout(
                    self.settings.ack_timeout,
                    self.wallet.verify_and_settle(&proof, amount),
                )
                .await
                .unwrap_or(Ok(false));
                match settled {
                    Ok(true) => {
                        let armed = {
                            let mut peers = self.peers.lock().unwrap();
                            let Some(session) = peers.get_mut(peer).and_then(|r| {
                                r.sessions.get_mut(&(TransferRole::Provider, request_id))
                            }) else {
                                return;
                            };
                            session.payment_state = PaymentState::Settled;
                            session.mark_accepted().is_ok()
                        };
                        if armed {
                            self.start_transfer(peer, request_id).await;
                        }
                    }
                    Ok(false) | Err(_) => {
                        self.fail_and_remove(
                            peer,
                            TransferRole::Provider,
                            request_id,
                            Error::PaymentRejected("proof did not settle".to_string()),
                        );
                        if let Some(sender) = self.sender_for(peer) {
                            self.send_error(
                                peer,
                                &sender,
                                request_id,
                                error_codes::PAYMENT_REJECTED,
                                "proof did not settle",
                            )
                            .await;
                        }
                    }
                }
            }
            Plan::Start => {
                self.start_transfer(peer, request_id).await;
            }
        }
    }

    /// Provider side: begin streaming chunks for an accepted session
    async fn start_transfer(self: &Arc<Self>, peer: &PeerId, request_id: u32) {
        let prepared = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            let sender = record.sender.clone();
            let Some(session) = record
                .sessions
                .get_mut(&(TransferRole::Provider, request_id))
            else {
                return;
            };
            match session.begin_transfer() {
                Ok(()) => sender.map(|s| (s, session.hash, session.size)),
                Err(e) => {
                    tracing::warn!("cannot start transfer {}: {}", request_id, e);
                    None
                }
            }
        };

        let Some((sender, hash, size)) = prepared else {
            self.fail_and_remove(
                peer,
                TransferRole::Provider,
                request_id,
                Error::SendFailed("transfer could not start".to_string()),
            );
            return;
        };

        let Some(data) = self.store.get(&hash) else {
            self.fail_and_remove(
                peer,
                TransferRole::Provider,
                request_id,
                Error::NotFound(hash_to_hex(&hash)),
            );
            if let Some(sender) = self.sender_for(peer) {
                self.send_error(peer, &sender, request_id, error_codes::NOT_FOUND, "blob evicted")
                    .await;
            }
            return;
        };

        tracing::debug!(
            "streaming {} bytes to {} for request {}",
            size,
            peer.short(),
            request_id
        );

        let mgr = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move {
            mgr.stream_chunks(peer, request_id, sender, data).await;
        });
    }

    async fn stream_chunks(
        self: Arc<Self>,
        peer: PeerId,
        request_id: u32,
        sender: ChannelSender,
        data: Bytes,
    ) {
        for (index, piece) in chunk::split_blob(&data).enumerate() {
            let index = index as u32;
            let frame = chunk::encode_frame(request_id, index, piece);
            if sender.send_chunk(frame.clone()).await.is_err()
                && sender.send_chunk(frame).await.is_err()
            {
                self.fail_and_remove(
                    &peer,
                    TransferRole::Provider,
                    request_id,
                    Error::SendFailed(format!("chunk {} to {}", index, peer.short())),
                );
                return;
            }
            let gone = {
                let mut peers = self.peers.lock().unwrap();
                match peers
                    .get_mut(&peer)
                    .and_then(|r| r.sessions.get_mut(&(TransferRole::Provider, request_id)))
                {
                    Some(session) => {
                        session.mark_sent(index);
                        false
                    }
                    None => true,
                }
            };
            if gone {
                return;
            }
        }
        self.ledger.record_blob_sent(&peer, data.len() as u64);
    }

    /// Provider side: requester reported the verification outcome
    async fn handle_blob_ok(self: &Arc<Self>, peer: &PeerId, request_id: u32, ok: proto::BlobOk) {
        enum Plan {
            Fail(Error),
            Complete,
            Settle(String, u64),
            Stiffed,
        }

        let plan = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            let Some(session) = record
                .sessions
                .get_mut(&(TransferRole::Provider, request_id))
            else {
                tracing::debug!("result for unknown request {} from {}", request_id, peer.short());
                return;
            };
            if !matches!(
                session.state,
                SessionState::Transferring | SessionState::Verifying
            ) {
                Plan::Fail(Error::ProtocolViolation("out-of-sequence result".to_string()))
            } else if !ok.verified {
                // No charge for postpay; the payload never checked out
                Plan::Fail(Error::InvalidData(
                    "requester reported failed verification".to_string(),
                ))
            } else if session.payment_mode == PaymentMode::Postpay && session.quoted_amount() > 0 {
                match ok.payment_token {
                    Some(token) => Plan::Settle(token, session.quoted_amount()),
                    None => Plan::Stiffed,
                }
            } else {
                Plan::Complete
            }
        };

        match plan {
            Plan::Fail(e) => self.fail_and_remove(peer, TransferRole::Provider, request_id, e),
            Plan::Complete => {
                self.complete_and_remove(peer, TransferRole::Provider, request_id, Bytes::new())
            }
            Plan::Settle(token, amount) => match tokio::time::timeout(
                self.settings.ack_timeout,
                self.wallet.verify_and_settle(&token, amount),
            )
            .await
            .unwrap_or(Ok(false))
            {
                Ok(true) => {
                    {
                        let mut peers = self.peers.lock().unwrap();
                        if let Some(session) = peers
                            .get_mut(peer)
                            .and_then(|r| r.sessions.get_mut(&(TransferRole::Provider, request_id)))
                        {
                            session.payment_state = PaymentState::Settled;
                        }
                    }
                    self.complete_and_remove(peer, TransferRole::Provider, request_id, Bytes::new());
                }
                Ok(false) | Err(_) => {
                    self.mark_cooldown(peer);
                    self.fail_and_remove(
                        peer,
                        TransferRole::Provider,
                        request_id,
                        Error::PaymentRejected("postpay token did not settle".to_string()),
                    );
                }
            },
            Plan::Stiffed => {
                self.mark_cooldown(peer);
                self.fail_and_remove(
                    peer,
                    TransferRole::Provider,
                    request_id,
                    Error::PaymentRejected("postpay result without token".to_string()),
                );
            }
        }
    }

    /// A typed error can target either direction; our own outgoing
    /// requests take precedence
    fn handle_error_response(&self, peer: &PeerId, request_id: u32, err: proto::ErrorResponse) {
        let mapped = match err.code {
            error_codes::NOT_FOUND => Error::NotFound(err.message),
            error_codes::LIMIT_EXCEEDED => Error::SessionLimitExceeded(peer.to_string()),
            error_codes::PAYMENT_REJECTED => Error::PaymentRejected(err.message),
            _ => Error::ProtocolViolation(err.message),
        };
        let role = {
            let peers = self.peers.lock().unwrap();
            match peers.get(peer) {
                Some(r) if r.sessions.contains_key(&(TransferRole::Requester, request_id)) => {
                    Some(TransferRole::Requester)
                }
                Some(r) if r.sessions.contains_key(&(TransferRole::Provider, request_id)) => {
                    Some(TransferRole::Provider)
                }
                _ => None,
            }
        };
        if let Some(role) = role {
            self.fail_and_remove(peer, role, request_id, mapped);
        }
    }

    /// Requester side: one chunk frame arrived
    async fn handle_chunk(self: &Arc<Self>, peer: &PeerId, frame: &[u8]) {
        let Ok((request_id, index, payload)) = chunk::decode_frame(frame) else {
            tracing::warn!("malformed chunk frame from {}", peer.short());
            return;
        };

        enum Plan {
            Ignore,
            Fail(Error),
            Finalize,
        }

        let plan = {
            let mut peers = self.peers.lock().unwrap();
            let Some(record) = peers.get_mut(peer) else {
                return;
            };
            let Some(session) = record
                .sessions
                .get_mut(&(TransferRole::Requester, request_id))
            else {
                tracing::trace!("chunk for unknown request {} from {}", request_id, peer.short());
                return;
            };
            match session.accept_chunk(index, payload) {
                Ok(true) => Plan::Finalize,
                Ok(false) => Plan::Ignore,
                Err(e) => Plan::Fail(e),
            }
        };

        match plan {
            Plan::Ignore => {}
            Plan::Fail(e) => self.fail_and_remove(peer, TransferRole::Requester, request_id, e),
            Plan::Finalize => self.finalize_verified(peer, request_id).await,
        }
    }

    /// Requester side: all chunks are in; verify, report, settle, resolve
    async fn finalize_verified(self: &Arc<Self>, peer: &PeerId, request_id: u32) {
        enum Verdict {
            Ok {
                data: Bytes,
                hash: ContentHash,
                postpay_terms: Option<PaymentTerms>,
            },
            Mismatch(Error, ContentHash),
        }

        let verdict = {
            let mut peers = self.peers.lock().unwrap();
            let Some(session) = peers
                .get_mut(peer)
                .and_then(|r| r.sessions.get_mut(&(TransferRole::Requester, request_id)))
            else {
                return;
            };
            match session.verify() {
                Ok(data) => {
                    let postpay_terms = if session.payment_mode == PaymentMode::Postpay
                        && session.quoted_amount() > 0
                    {
                        session.terms.clone()
                    } else {
                        None
                    };
                    Verdict::Ok {
                        data,
                        hash: session.hash,
                        postpay_terms,
                    }
                }
                Err(e) => Verdict::Mismatch(e, session.hash),
            }
        };

        let sender = self.sender_for(peer);

        match verdict {
            Verdict::Mismatch(e, hash) => {
                if let Some(sender) = sender {
                    let envelope = proto::blob_ok(request_id, false, hash.to_vec(), None);
                    let _ = self.send_control(peer, &sender, envelope).await;
                }
                self.fail_and_remove(peer, TransferRole::Requester, request_id, e);
            }
            Verdict::Ok {
                data,
                hash,
                postpay_terms,
            } => {
                let token = match postpay_terms {
                    Some(terms) => {
                        let produced = tokio::time::timeout(
                            self.settings.ack_timeout,
                            self.wallet.proof_for_terms(&terms),
                        )
                        .await
                        .unwrap_or(Err(Error::Timeout("postpay token".to_string())));
                        match produced {
                            Ok(token) => Some(token),
                            Err(e) => {
                                // Still report honest verification; the provider
                                // will treat the missing token as stiffing
                                tracing::warn!("postpay token unavailable: {}", e);
                                None
                            }
                        }
                    }
                    None => None,
                };
                if let Some(sender) = sender {
                    let envelope = proto::blob_ok(request_id, true, hash.to_vec(), token);
                    let _ = self.send_control(peer, &sender, envelope).await;
                }
                let size = data.len() as u64;
                self.complete_and_remove(peer, TransferRole::Requester, request_id, data);
                self.ledger.record_blob_received(peer, size);
            }
        }
    }

    fn sweep_deadlines(&self) {
        let now = Instant::now();
        let mut failed = Vec::new();
        {
            let mut peers = self.peers.lock().unwrap();
            for (peer, record) in peers.iter_mut() {
                let expired: Vec<SessionKey> = record
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.deadline_expired(now))
                    .map(|(key, _)| *key)
                    .collect();
                for key in expired {
                    if let Some(mut session) = record.sessions.remove(&key) {
                        let err = session.timeout_error();
                        tracing::debug!(
                            "session {} with {} expired in state {}: {}",
                            key.1,
                            peer.short(),
                            session.state,
                            err
                        );
                        session.fail(err);
                        failed.push((peer.clone(), key.1));
                    }
                }
            }
        }
        for (peer, request_id) in failed {
            self.notify(&PeerEvent::SessionFailed { peer, request_id });
        }
    }

    /// Send a control message, retrying once before giving up
    async fn send_control(
        &self,
        peer: &PeerId,
        sender: &ChannelSender,
        envelope: Envelope,
    ) -> Result<()> {
        let bytes = Bytes::from(envelope.to_bytes());
        let len = bytes.len() as u64;
        if sender.send_control(bytes.clone()).await.is_err() {
            tracing::debug!("control send to {} failed, retrying once", peer.short());
            sender.send_control(bytes).await?;
        }
        self.ledger.record_event_sent(peer, len);
        Ok(())
    }

    async fn send_error(
        &self,
        peer: &PeerId,
        sender: &ChannelSender,
        request_id: u32,
        code: u32,
        message: &str,
    ) {
        let envelope = proto::error_response(request_id, code, message.to_string());
        let _ = self.send_control(peer, sender, envelope).await;
    }

    fn sender_for(&self, peer: &PeerId) -> Option<ChannelSender> {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .and_then(|r| r.sender.clone())
    }

    fn remove_session(
        &self,
        peer: &PeerId,
        role: TransferRole,
        request_id: u32,
    ) -> Option<TransferSession> {
        self.peers
            .lock()
            .unwrap()
            .get_mut(peer)
            .and_then(|r| r.sessions.remove(&(role, request_id)))
    }

    fn fail_and_remove(&self, peer: &PeerId, role: TransferRole, request_id: u32, err: Error) {
        if let Some(mut session) = self.remove_session(peer, role, request_id) {
            tracing::debug!(
                "session {} with {} failed in state {}: {}",
                request_id,
                peer.short(),
                session.state,
                err
            );
            session.fail(err);
            self.notify(&PeerEvent::SessionFailed {
                peer: peer.clone(),
                request_id,
            });
        }
    }

    fn complete_and_remove(&self, peer: &PeerId, role: TransferRole, request_id: u32, data: Bytes) {
        if let Some(mut session) = self.remove_session(peer, role, request_id) {
            session.complete(data);
            self.notify(&PeerEvent::SessionCompleted {
                peer: peer.clone(),
                request_id,
            });
        }
    }

    fn in_cooldown(&self, peer: &PeerId) -> bool {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        match cooldowns.get(peer) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                cooldowns.remove(peer);
                false
            }
            None => false,
        }
    }

    fn mark_cooldown(&self, peer: &PeerId) {
        tracing::info!("marking {} untrusted for postpay", peer.short());
        self.cooldowns
            .lock()
            .unwrap()
            .insert(peer.clone(), Instant::now() + self.settings.cooldown);
    }

    /// Synchronous fan-out; a panicking listener is isolated and logged
    fn notify(&self, event: &PeerEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!("listener panicked handling {:?}", event);
            }
        }
    }
}
