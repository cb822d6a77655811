//! Integration tests for the tollgate peer layer
//!
//! Two real managers are wired together over the in-memory transport;
//! for protocol-edge tests a scripted remote drives one end of the
//! channel by hand.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tollgate_core::channel::memory::{MemoryEndpoint, MemoryHub};
use tollgate_core::proto::{self, Envelope, Payload};
use tollgate_core::wallet::mock::MockWallet;
use tollgate_core::{chunk, Channel, ChannelEvent, Error, PaymentMode, PeerId, Transport, Wallet};
use tollgate_peer::{BandwidthLedger, BlobStore, Config, PeerEvent, PeerManager};

type Manager = Arc<PeerManager<MemoryEndpoint, Arc<MockWallet>>>;

struct TestPeer {
    id: PeerId,
    manager: Manager,
    wallet: Arc<MockWallet>,
    _scratch: TempDir,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.transfer.ack_timeout_secs = 1;
    config.transfer.transfer_timeout_secs = 2;
    config
}

fn spawn_peer(hub: &Arc<MemoryHub>, name: &str, wallet: MockWallet, config: Config) -> TestPeer {
    let scratch = TempDir::new().unwrap();
    let wallet = Arc::new(wallet);
    let manager = PeerManager::new(
        hub.endpoint(name),
        Arc::clone(&wallet),
        Arc::new(BlobStore::new(scratch.path().join("blobs"))),
        Arc::new(BandwidthLedger::open_in_memory().unwrap()),
        &config,
    );
    manager.start();
    TestPeer {
        id: PeerId::new(name),
        manager,
        wallet,
        _scratch: scratch,
    }
}

fn patterned_blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// A 50,000-byte blob over postpay at 100 sat/GiB is 4 chunks and a
/// 1 sat quote, and completes with the ledger crediting the full byte
/// count on both sides.
#[tokio::test]
async fn test_postpay_transfer_end_to_end() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let data = patterned_blob(50_000);
    let hash = provider.manager.store().add_bytes(data.clone()).unwrap();
    assert_eq!(chunk::chunk_count(50_000), 4);

    provider.manager.connect(&requester.id).await.unwrap();

    let received = requester
        .manager
        .request_blob(&provider.id, &hash, Some(50_000), PaymentMode::Postpay, None)
        .await
        .unwrap();
    assert_eq!(&received[..], data.as_slice());

    let stats = requester.manager.ledger().get(&provider.id).unwrap();
    assert_eq!(stats.blobs_received, 1);
    assert_eq!(stats.blob_bytes_received, 50_000);

    settle_tasks().await;

    // Postpay settled on the provider at the quoted 1 sat
    let settlements = provider.wallet.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].1, 1);

    let stats = provider.manager.ledger().get(&requester.id).unwrap();
    assert_eq!(stats.blobs_sent, 1);
    assert_eq!(stats.blob_bytes_sent, 50_000);

    assert_eq!(requester.manager.active_session_count(&provider.id), 0);
    assert_eq!(provider.manager.active_session_count(&requester.id), 0);
}

/// Prepay settles before any chunk: the proof the requester's wallet
/// issued is the one the provider settles, and it happens before data
/// is acknowledged complete.
#[tokio::test]
async fn test_prepay_transfer_settles_before_data() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let data = patterned_blob(40_000);
    let hash = provider.manager.store().add_bytes(data.clone()).unwrap();

    provider.manager.connect(&requester.id).await.unwrap();

    let received = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Prepay, None)
        .await
        .unwrap();
    assert_eq!(&received[..], data.as_slice());

    let issued = requester.wallet.issued_proofs();
    assert_eq!(issued.len(), 1);

    settle_tasks().await;
    let settlements = provider.wallet.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].0, issued[0]);
}

/// A prepay requester whose wallet cannot produce a proof abandons the
/// session without acking, failing with PaymentUnavailable.
#[tokio::test]
async fn test_prepay_without_funds_fails_payment_unavailable() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    let requester = spawn_peer(&hub, "requester", MockWallet::broke(), test_config());

    let hash = provider
        .manager
        .store()
        .add_bytes(patterned_blob(10_000))
        .unwrap();

    provider.manager.connect(&requester.id).await.unwrap();

    let result = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Prepay, None)
        .await;
    assert!(matches!(result, Err(Error::PaymentUnavailable(_))));
    assert_eq!(requester.manager.active_session_count(&provider.id), 0);

    // The provider never saw a proof
    assert!(provider.wallet.settlements().is_empty());
}

/// A provider configured to serve free sends no terms and nothing is
/// paid on either side.
#[tokio::test]
async fn test_free_serving_skips_payment() {
    let hub = MemoryHub::new();
    let mut provider_config = test_config();
    provider_config.pricing.serve_free = true;
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), provider_config);
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let data = patterned_blob(20_000);
    let hash = provider.manager.store().add_bytes(data.clone()).unwrap();

    provider.manager.connect(&requester.id).await.unwrap();

    let received = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Postpay, None)
        .await
        .unwrap();
    assert_eq!(&received[..], data.as_slice());

    settle_tasks().await;
    assert!(requester.wallet.issued_proofs().is_empty());
    assert!(provider.wallet.settlements().is_empty());
}

/// Requesting an unknown hash maps the provider's typed error back to
/// NotFound on the requester.
#[tokio::test]
async fn test_unknown_blob_yields_not_found() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    provider.manager.connect(&requester.id).await.unwrap();

    let result = requester
        .manager
        .request_blob(&provider.id, &[7u8; 32], None, PaymentMode::Postpay, None)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

/// A quote over the caller's budget is declined with accept=false and
/// the provider session is dropped too.
#[tokio::test]
async fn test_quote_over_budget_is_declined() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let hash = provider
        .manager
        .store()
        .add_bytes(patterned_blob(30_000))
        .unwrap();

    provider.manager.connect(&requester.id).await.unwrap();

    let result = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Postpay, Some(0))
        .await;
    assert!(matches!(result, Err(Error::PaymentUnavailable(_))));

    settle_tasks().await;
    assert_eq!(provider.manager.active_session_count(&requester.id), 0);
}

/// A provider quoting far above the requester's expected rate is
/// rejected even without an explicit budget.
#[tokio::test]
async fn test_inflated_quote_rejected() {
    let hub = MemoryHub::new();
    let mut greedy = test_config();
    greedy.pricing.rate_per_gb = 1_000_000;
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), greedy);
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let hash = provider
        .manager
        .store()
        .add_bytes(patterned_blob(50_000))
        .unwrap();

    provider.manager.connect(&requester.id).await.unwrap();

    let result = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Postpay, None)
        .await;
    assert!(matches!(result, Err(Error::PaymentUnavailable(_))));
}

/// Disconnecting fails every in-flight session with PeerDisconnected
/// and empties the session table.
#[tokio::test]
async fn test_disconnect_fails_active_sessions() {
    let hub = MemoryHub::new();
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());
    // A registered endpoint that never answers
    let _silent = hub.endpoint("silent");
    let silent_id = PeerId::new("silent");

    let mgr = Arc::clone(&requester.manager);
    let pending = tokio::spawn(async move {
        mgr.request_blob(&silent_id, &[1u8; 32], None, PaymentMode::Postpay, None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        requester.manager.active_session_count(&PeerId::new("silent")),
        1
    );

    requester.manager.disconnect(&PeerId::new("silent"));

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::PeerDisconnected(_))));
    assert_eq!(
        requester.manager.active_session_count(&PeerId::new("silent")),
        0
    );
    assert_eq!(requester.manager.connection_count(), 0);
}

/// A peer that never responds trips the ack deadline.
#[tokio::test]
async fn test_unresponsive_peer_times_out() {
    let hub = MemoryHub::new();
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());
    let _silent = hub.endpoint("silent");

    let result = requester
        .manager
        .request_blob(
            &PeerId::new("silent"),
            &[2u8; 32],
            None,
            PaymentMode::Postpay,
            None,
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(
        requester.manager.active_session_count(&PeerId::new("silent")),
        0
    );
}

/// A wallet that never answers: the prepay session sits in Offered
/// until the ack deadline and fails with PaymentUnavailable, leaving no
/// session behind.
#[tokio::test]
async fn test_prepay_proof_never_arrives_times_out() {
    struct HangingWallet;

    impl Wallet for HangingWallet {
        fn proof_for_terms(
            &self,
            _terms: &tollgate_core::proto::PaymentTerms,
        ) -> impl std::future::Future<Output = tollgate_core::Result<String>> + Send {
            std::future::pending()
        }

        fn verify_and_settle(
            &self,
            _token: &str,
            _amount: u64,
        ) -> impl std::future::Future<Output = tollgate_core::Result<bool>> + Send {
            std::future::ready(Ok(true))
        }
    }

    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());

    let scratch = TempDir::new().unwrap();
    let requester = PeerManager::new(
        hub.endpoint("requester"),
        HangingWallet,
        Arc::new(BlobStore::new(scratch.path().join("blobs"))),
        Arc::new(BandwidthLedger::open_in_memory().unwrap()),
        &test_config(),
    );
    requester.start();

    let hash = provider
        .manager
        .store()
        .add_bytes(patterned_blob(8_000))
        .unwrap();
    provider
        .manager
        .connect(&PeerId::new("requester"))
        .await
        .unwrap();

    let result = requester
        .request_blob(&provider.id, &hash, None, PaymentMode::Prepay, None)
        .await;
    assert!(matches!(result, Err(Error::PaymentUnavailable(_))));
    assert_eq!(requester.active_session_count(&provider.id), 0);
}

/// Stiffing a postpay transfer (verified but no token) completes for
/// the requester, but the provider downgrades it to prepay-only while
/// the cooldown lasts.
#[tokio::test]
async fn test_postpay_stiffing_triggers_prepay_cooldown() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    // Broke wallet: receives fine, can never produce a proof or token
    let requester = spawn_peer(&hub, "requester", MockWallet::broke(), test_config());

    let data = patterned_blob(25_000);
    let hash = provider.manager.store().add_bytes(data.clone()).unwrap();

    provider.manager.connect(&requester.id).await.unwrap();

    // First transfer: data arrives and verifies, but no token follows
    let received = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Postpay, None)
        .await
        .unwrap();
    assert_eq!(&received[..], data.as_slice());

    settle_tasks().await;
    assert!(provider.wallet.settlements().is_empty());

    // Second postpay request is quoted prepay, which the broke wallet
    // cannot satisfy
    let result = requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Postpay, None)
        .await;
    assert!(matches!(result, Err(Error::PaymentUnavailable(_))));
}

/// Observer surface: connect and a completed transfer fan out events.
#[tokio::test]
async fn test_listener_sees_lifecycle_events() {
    let hub = MemoryHub::new();
    let provider = spawn_peer(&hub, "provider", MockWallet::new(), test_config());
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    requester.manager.subscribe(move |event| {
        let label = match event {
            PeerEvent::Connected(_) => "connected",
            PeerEvent::ConnectionFailed(_) => "connection-failed",
            PeerEvent::Disconnected(_) => "disconnected",
            PeerEvent::Presence(_) => "presence",
            PeerEvent::SessionCompleted { .. } => "session-completed",
            PeerEvent::SessionFailed { .. } => "session-failed",
        };
        sink.lock().unwrap().push(label.to_string());
    });

    let data = patterned_blob(5_000);
    let hash = provider.manager.store().add_bytes(data).unwrap();

    provider.manager.connect(&requester.id).await.unwrap();
    requester
        .manager
        .request_blob(&provider.id, &hash, None, PaymentMode::Postpay, None)
        .await
        .unwrap();

    let seen = events.lock().unwrap().clone();
    assert!(seen.contains(&"connected".to_string()));
    assert!(seen.contains(&"presence".to_string()));
    assert!(seen.contains(&"session-completed".to_string()));

    assert_eq!(requester.manager.connection_count(), 1);
    assert_eq!(requester.manager.online_users().len(), 1);
}

// ---- scripted-remote tests: one end of the channel driven by hand ----

async fn recv_control(channel: &mut Channel) -> Envelope {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), channel.events.recv())
            .await
            .expect("timed out waiting for control message")
            .expect("channel ended")
        {
            ChannelEvent::Control(bytes) => return Envelope::from_bytes(&bytes).unwrap(),
            ChannelEvent::Chunk(_) => continue,
            ChannelEvent::Closed => panic!("channel closed"),
        }
    }
}

/// Open the scripted remote's end of the channel to a manager that is
/// connecting toward `name`.
async fn scripted_channel(hub: &Arc<MemoryHub>, name: &str, toward: &str) -> Channel {
    hub.endpoint(name)
        .open_channel(&PeerId::new(toward))
        .await
        .unwrap()
}

/// Chunks delivered out of order reassemble to byte-identical content.
#[tokio::test]
async fn test_out_of_order_chunks_reassemble() {
    let hub = MemoryHub::new();
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let data = patterned_blob(50_000);
    let hash = chunk::content_hash(&data);
    let chunks: Vec<&[u8]> = chunk::split_blob(&data).collect();

    let mgr = Arc::clone(&requester.manager);
    let wanted = hash;
    let pending = tokio::spawn(async move {
        mgr.request_blob(
            &PeerId::new("scripted"),
            &wanted,
            None,
            PaymentMode::Postpay,
            None,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut remote = scripted_channel(&hub, "scripted", "requester").await;

    let req = recv_control(&mut remote).await;
    let request_id = req.request_id;
    assert!(matches!(req.payload, Some(Payload::BlobReq(_))));

    remote
        .sender
        .send_control(Bytes::from(
            proto::blob_res(request_id, data.len() as u64, 4, None).to_bytes(),
        ))
        .await
        .unwrap();

    let ack = recv_control(&mut remote).await;
    match ack.payload {
        Some(Payload::BlobAck(ack)) => assert!(ack.accept),
        other => panic!("expected ack, got {:?}", other.is_some()),
    }

    // Deliver chunks shuffled, with a duplicate and an out-of-range index
    for index in [2usize, 0, 3, 0, 1] {
        remote
            .sender
            .send_chunk(chunk::encode_frame(request_id, index as u32, chunks[index]))
            .await
            .unwrap();
    }
    remote
        .sender
        .send_chunk(chunk::encode_frame(request_id, 9, b"stray"))
        .await
        .unwrap();

    let ok = recv_control(&mut remote).await;
    match ok.payload {
        Some(Payload::BlobOk(ok)) => {
            assert!(ok.verified);
            assert_eq!(ok.hash, hash.to_vec());
        }
        other => panic!("expected result, got {:?}", other.is_some()),
    }

    let received = pending.await.unwrap().unwrap();
    assert_eq!(&received[..], data.as_slice());
}

/// Content that does not hash to the requested address is reported
/// verified=false and the request fails with HashMismatch.
#[tokio::test]
async fn test_hash_mismatch_reports_and_fails() {
    let hub = MemoryHub::new();
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let claimed = chunk::content_hash(b"the content that was promised");
    let wrong = patterned_blob(1_000);

    let mgr = Arc::clone(&requester.manager);
    let pending = tokio::spawn(async move {
        mgr.request_blob(
            &PeerId::new("scripted"),
            &claimed,
            None,
            PaymentMode::Postpay,
            None,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut remote = scripted_channel(&hub, "scripted", "requester").await;

    let req = recv_control(&mut remote).await;
    let request_id = req.request_id;

    remote
        .sender
        .send_control(Bytes::from(
            proto::blob_res(request_id, wrong.len() as u64, 1, None).to_bytes(),
        ))
        .await
        .unwrap();
    recv_control(&mut remote).await; // the accepting ack

    remote
        .sender
        .send_chunk(chunk::encode_frame(request_id, 0, &wrong))
        .await
        .unwrap();

    let ok = recv_control(&mut remote).await;
    match ok.payload {
        Some(Payload::BlobOk(ok)) => assert!(!ok.verified),
        other => panic!("expected result, got {:?}", other.is_some()),
    }

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::HashMismatch { .. })));
    assert_eq!(
        requester.manager.active_session_count(&PeerId::new("scripted")),
        0
    );
}

/// An offer whose declared chunk count disagrees with its size is a
/// protocol violation: the session fails, the connection survives.
#[tokio::test]
async fn test_bad_offer_fails_session_not_connection() {
    let hub = MemoryHub::new();
    let requester = spawn_peer(&hub, "requester", MockWallet::new(), test_config());

    let mgr = Arc::clone(&requester.manager);
    let pending = tokio::spawn(async move {
        mgr.request_blob(
            &PeerId::new("scripted"),
            &[3u8; 32],
            None,
            PaymentMode::Postpay,
            None,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut remote = scripted_channel(&hub, "scripted", "requester").await;

    let req = recv_control(&mut remote).await;
    // 50,000 bytes cannot be 3 chunks
    remote
        .sender
        .send_control(Bytes::from(
            proto::blob_res(req.request_id, 50_000, 3, None).to_bytes(),
        ))
        .await
        .unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));

    // The violation aborted the session, not the peer connection
    assert_eq!(requester.manager.connection_count(), 1);
}
