//! Data-channel transport abstraction
//!
//! This module abstracts over the underlying real-time transport (WebRTC
//! data channels, mixnet sockets, ...). Signaling (offer/answer/ICE
//! exchange) happens entirely outside this crate: the external layer
//! orchestrates both endpoints, and each side asks its `Transport` to open
//! the channel to the other.
//!
//! A channel carries two lanes mirroring the protocol split: control
//! messages on a reliable ordered lane, binary chunk frames on a chunk
//! lane. How a transport realizes the lanes (two data channels, message
//! type tags) is its own business; payloads are opaque bytes either way.

use crate::{types::PeerId, Error, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Event delivered by an open channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A control message (encoded envelope) on the reliable ordered lane
    Control(Bytes),
    /// A binary chunk frame (8-byte header + payload)
    Chunk(Bytes),
    /// The remote side closed the channel
    Closed,
}

/// Sending half of an open data channel
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<ChannelEvent>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::Sender<ChannelEvent>) -> Self {
        Self { tx }
    }

    /// Send a control message on the reliable ordered lane
    pub async fn send_control(&self, frame: Bytes) -> Result<()> {
        self.send(ChannelEvent::Control(frame)).await
    }

    /// Send a binary chunk frame
    pub async fn send_chunk(&self, frame: Bytes) -> Result<()> {
        self.send(ChannelEvent::Chunk(frame)).await
    }

    /// Signal an orderly close to the remote side
    pub async fn close(&self) {
        let _ = self.tx.send(ChannelEvent::Closed).await;
    }

    async fn send(&self, event: ChannelEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::SendFailed("channel closed".to_string()))
    }
}

/// An open bidirectional data channel to one peer
pub struct Channel {
    pub sender: ChannelSender,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Transport trait for opening data channels to peers
///
/// Implementations cover the real transport in production and the
/// in-memory hub below for tests and the loopback demo. Futures are
/// required to be Send so callers may drive connections from spawned
/// tasks.
pub trait Transport: Send + Sync {
    /// Open the data channel to `peer`. Resolves once the channel is
    /// usable; fails if the peer cannot be reached.
    fn open_channel(
        &self,
        peer: &PeerId,
    ) -> impl std::future::Future<Output = Result<Channel>> + Send;
}

pub mod memory {
    //! In-memory transport for tests and the loopback demo
    //!
    //! Both endpoints of a logical connection call `open_channel` toward
    //! each other (as the external signaling layer would make them do);
    //! the hub pairs the two calls up and hands each side one end of a
    //! cross-connected channel pair.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const CHANNEL_DEPTH: usize = 256;

    /// Create a cross-connected channel pair
    pub fn pair() -> (Channel, Channel) {
        let (tx_ab, rx_ab) = mpsc::channel(CHANNEL_DEPTH);
        let (tx_ba, rx_ba) = mpsc::channel(CHANNEL_DEPTH);
        (
            Channel {
                sender: ChannelSender::new(tx_ab),
                events: rx_ba,
            },
            Channel {
                sender: ChannelSender::new(tx_ba),
                events: rx_ab,
            },
        )
    }

    /// Hub pairing up `open_channel` calls between registered endpoints
    #[derive(Default)]
    pub struct MemoryHub {
        /// Channel ends created by the first opener, keyed by
        /// (creator, counterpart), waiting for the counterpart's open
        pending: Mutex<HashMap<(String, String), Channel>>,
    }

    impl MemoryHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport endpoint bound to a local identity
        pub fn endpoint(self: &Arc<Self>, local: impl Into<PeerId>) -> MemoryEndpoint {
            MemoryEndpoint {
                local: local.into(),
                hub: Arc::clone(self),
            }
        }

        fn open(&self, local: &PeerId, remote: &PeerId) -> Result<Channel> {
            if local == remote {
                return Err(Error::PeerUnreachable("cannot connect to self".to_string()));
            }
            let mut pending = self.pending.lock().unwrap();

            let theirs = (remote.as_str().to_string(), local.as_str().to_string());
            if let Some(channel) = pending.remove(&theirs) {
                return Ok(channel);
            }

            let (ours, counterpart) = pair();
            pending.insert(
                (local.as_str().to_string(), remote.as_str().to_string()),
                counterpart,
            );
            Ok(ours)
        }
    }

    /// Transport endpoint bound to one identity on a shared hub
    pub struct MemoryEndpoint {
        local: PeerId,
        hub: Arc<MemoryHub>,
    }

    impl MemoryEndpoint {
        pub fn local_id(&self) -> &PeerId {
            &self.local
        }
    }

    impl Transport for MemoryEndpoint {
        async fn open_channel(&self, peer: &PeerId) -> Result<Channel> {
            self.hub.open(&self.local, peer)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_pair_carries_both_lanes() {
            let (a, mut b) = pair();

            a.sender.send_control(Bytes::from_static(b"ctl")).await.unwrap();
            a.sender.send_chunk(Bytes::from_static(b"chk")).await.unwrap();

            match b.events.recv().await.unwrap() {
                ChannelEvent::Control(data) => assert_eq!(&data[..], b"ctl"),
                other => panic!("expected control, got {:?}", other),
            }
            match b.events.recv().await.unwrap() {
                ChannelEvent::Chunk(data) => assert_eq!(&data[..], b"chk"),
                other => panic!("expected chunk, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_hub_pairs_two_opens() {
            let hub = MemoryHub::new();
            let alice = hub.endpoint("alice");
            let bob = hub.endpoint("bob");

            let a_side = alice.open_channel(&PeerId::new("bob")).await.unwrap();
            let mut b_side = bob.open_channel(&PeerId::new("alice")).await.unwrap();

            a_side
                .sender
                .send_control(Bytes::from_static(b"hello"))
                .await
                .unwrap();
            match b_side.events.recv().await.unwrap() {
                ChannelEvent::Control(data) => assert_eq!(&data[..], b"hello"),
                other => panic!("expected control, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_drop_ends_event_stream() {
            let (a, mut b) = pair();
            drop(a);
            assert!(b.events.recv().await.is_none());
        }

        #[tokio::test]
        async fn test_self_connect_rejected() {
            let hub = MemoryHub::new();
            let alice = hub.endpoint("alice");
            assert!(alice.open_channel(&PeerId::new("alice")).await.is_err());
        }
    }
}
