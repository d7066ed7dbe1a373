//! End-to-end integration tests for Parley.
//!
//! Two or three `PeerNode`s share an in-memory signaling hub and loopback
//! network, so every test runs the whole stack: signaling, connection
//! negotiation, envelope sealing, dispatch and both protocols.
//!
//! Each test builds its own hub and network. No shared state, no test
//! ordering dependencies.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley_protocol::config::{NodeConfig, DEFAULT_CHANNEL_LABEL, DEFAULT_IDENTITY_STORAGE_KEY};
use parley_protocol::crypto::{
    CryptoError, KeyStore, MemoryKeyStore, SledKeyStore, StoredIdentity,
};
use parley_protocol::identity::PeerId;
use parley_protocol::network::ConnectionState;
use parley_protocol::secure::{LinkError, PeerLink};
use parley_protocol::signaling::MemorySignalingHub;
use parley_protocol::trade::{Asset, TradeEvent, TradeMessage, TradeStatus};
use parley_protocol::transfer::{chunk_count, TransferEvent, TransferStatus};
use parley_protocol::transport::{Frame, MemoryNetwork};
use parley_protocol::{NodeEvent, NodeEvents, PeerNode};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Peer {
    node: PeerNode,
    events: NodeEvents,
}

impl Peer {
    fn id(&self) -> PeerId {
        self.node.id().clone()
    }
}

fn spawn_with_store(
    hub: &MemorySignalingHub,
    net: &MemoryNetwork,
    id: &str,
    store: Arc<dyn KeyStore>,
) -> Peer {
    let peer_id = PeerId::from(id);
    let (signaling, signaling_rx) = hub.register(&peer_id);
    let (node, events) = PeerNode::start(
        peer_id,
        NodeConfig::default(),
        store,
        Arc::new(signaling),
        signaling_rx,
        Arc::new(net.clone()),
    )
    .expect("node should start");
    Peer { node, events }
}

fn spawn(hub: &MemorySignalingHub, net: &MemoryNetwork, id: &str) -> Peer {
    spawn_with_store(hub, net, id, Arc::new(MemoryKeyStore::new()))
}

/// Exchange public keys out of band.
fn introduce(a: &Peer, b: &Peer) {
    a.node
        .add_peer(&b.id(), &b.node.public_key().unwrap(), true)
        .unwrap();
    b.node
        .add_peer(&a.id(), &a.node.public_key().unwrap(), true)
        .unwrap();
}

async fn next_matching<T: std::fmt::Debug>(
    rx: &mut mpsc::Receiver<T>,
    mut pred: impl FnMut(&T) -> bool,
) -> T {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_protocol_channel(peer: &mut Peer) {
    next_matching(&mut peer.events.node, |e| {
        matches!(e, NodeEvent::ChannelOpened { label, .. } if label == DEFAULT_CHANNEL_LABEL)
    })
    .await;
}

/// Connect `a` to `b` and wait until both can send protocol traffic.
async fn link(a: &mut Peer, b: &mut Peer) {
    a.node.connect(&b.id()).await.unwrap();
    wait_protocol_channel(a).await;
    wait_protocol_channel(b).await;
}

async fn linked_pair() -> (Peer, Peer) {
    let hub = MemorySignalingHub::new();
    let net = MemoryNetwork::new();
    let mut alice = spawn(&hub, &net, "alice");
    let mut bob = spawn(&hub, &net, "bob");
    introduce(&alice, &bob);
    link(&mut alice, &mut bob).await;
    (alice, bob)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

// ---------------------------------------------------------------------------
// 1. Connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_twice_yields_one_connection() {
    let (alice, bob) = linked_pair().await;
    let first = alice.node.manager().get_connection(&bob.id()).unwrap();
    alice.node.connect(&bob.id()).await.unwrap();
    let second = alice.node.manager().get_connection(&bob.id()).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(alice.node.manager().connection_count(), 1);
    assert_eq!(bob.node.manager().connection_count(), 1);
    assert_eq!(first.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn sled_backed_identity_works_end_to_end() {
    let hub = MemorySignalingHub::new();
    let net = MemoryNetwork::new();
    let store = Arc::new(SledKeyStore::open_temporary().expect("temp sled store"));
    let mut alice = spawn_with_store(&hub, &net, "alice", store.clone());
    let mut bob = spawn(&hub, &net, "bob");
    introduce(&alice, &bob);
    link(&mut alice, &mut bob).await;

    let raw = store
        .load(DEFAULT_IDENTITY_STORAGE_KEY)
        .unwrap()
        .expect("identity persisted");
    assert_eq!(
        StoredIdentity::decode(&raw)
            .unwrap()
            .to_keypair()
            .exported_public_key(),
        alice.node.public_key().unwrap()
    );

    bob.node
        .trades()
        .propose(&alice.id(), Asset::new("BTC", 1), Asset::new("ETH", 15))
        .await
        .unwrap();
    next_matching(&mut alice.events.trades, |e| {
        matches!(e, TradeEvent::Requested { .. })
    })
    .await;
}

// ---------------------------------------------------------------------------
// 2. File Transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forty_thousand_byte_file_arrives_in_three_chunks() {
    let (mut alice, mut bob) = linked_pair().await;
    let data = payload(40_000);
    assert_eq!(chunk_count(40_000, 16_384), 3);

    let id = alice
        .node
        .transfers()
        .send_file(&bob.id(), "statement.pdf", "application/pdf", data.clone())
        .await
        .unwrap();

    let TransferEvent::Requested { transfer } = next_matching(&mut bob.events.transfers, |e| {
        matches!(e, TransferEvent::Requested { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(transfer.id, id);
    assert_eq!(transfer.total_size, 40_000);
    assert_eq!(transfer.total_chunks, 3);
    assert_eq!(transfer.file_name, "statement.pdf");

    bob.node.transfers().respond(id, true).await.unwrap();

    let TransferEvent::Completed { data: received, .. } =
        next_matching(&mut bob.events.transfers, |e| {
            matches!(e, TransferEvent::Completed { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(received.unwrap().as_ref(), data.as_slice());

    next_matching(&mut alice.events.transfers, |e| {
        matches!(e, TransferEvent::Completed { .. })
    })
    .await;

    let sent = alice.node.transfers().transfer(&id).unwrap();
    let got = bob.node.transfers().transfer(&id).unwrap();
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(got.status, TransferStatus::Completed);
    assert_eq!(got.transferred_chunks, 3);
}

#[tokio::test]
async fn large_file_survives_backpressure() {
    let (mut alice, mut bob) = linked_pair().await;
    // Many more chunks than the channel queue holds.
    let data = payload(16_384 * 200 + 5);

    let id = alice
        .node
        .transfers()
        .send_file(&bob.id(), "big.bin", "application/octet-stream", data.clone())
        .await
        .unwrap();
    next_matching(&mut bob.events.transfers, |e| {
        matches!(e, TransferEvent::Requested { .. })
    })
    .await;
    bob.node.transfers().respond(id, true).await.unwrap();

    let TransferEvent::Completed { data: received, .. } =
        next_matching(&mut bob.events.transfers, |e| {
            matches!(e, TransferEvent::Completed { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(received.unwrap().len(), data.len());

    next_matching(&mut alice.events.transfers, |e| {
        matches!(e, TransferEvent::Completed { .. })
    })
    .await;
    assert_eq!(
        alice.node.transfers().transfer(&id).unwrap().transferred_chunks,
        201
    );
}

#[tokio::test]
async fn disconnect_settles_in_flight_work_on_both_sides() {
    let (alice, mut bob) = linked_pair().await;

    let transfer_id = alice
        .node
        .transfers()
        .send_file(&bob.id(), "x.bin", "application/octet-stream", payload(100))
        .await
        .unwrap();
    let trade_id = alice
        .node
        .trades()
        .propose(&bob.id(), Asset::new("BTC", 2), Asset::new("ETH", 30))
        .await
        .unwrap();
    next_matching(&mut bob.events.transfers, |e| {
        matches!(e, TransferEvent::Requested { .. })
    })
    .await;
    next_matching(&mut bob.events.trades, |e| {
        matches!(e, TradeEvent::Requested { .. })
    })
    .await;

    assert!(alice.node.disconnect(&bob.id()).await);
    assert_eq!(
        alice.node.transfers().transfer(&transfer_id).unwrap().status,
        TransferStatus::Failed
    );
    assert_eq!(
        alice.node.trades().negotiation(&trade_id).unwrap().status,
        TradeStatus::Canceled
    );

    next_matching(&mut bob.events.node, |e| {
        matches!(e, NodeEvent::Disconnected { state, .. } if state.is_terminal())
    })
    .await;
    next_matching(&mut bob.events.transfers, |e| {
        matches!(e, TransferEvent::Failed { .. })
    })
    .await;
    assert_eq!(
        bob.node.transfers().transfer(&transfer_id).unwrap().status,
        TransferStatus::Failed
    );
    assert_eq!(
        bob.node.trades().negotiation(&trade_id).unwrap().status,
        TradeStatus::Canceled
    );
    assert_eq!(bob.node.manager().connection_count(), 0);
}

// ---------------------------------------------------------------------------
// 3. Encryption at the Edges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn frame_from_unregistered_peer_is_rejected_and_connection_survives() {
    let hub = MemorySignalingHub::new();
    let net = MemoryNetwork::new();
    let mut alice = spawn(&hub, &net, "alice");
    let mut bob = spawn(&hub, &net, "bob");
    // Only alice learns bob's key.
    alice
        .node
        .add_peer(&bob.id(), &bob.node.public_key().unwrap(), false)
        .unwrap();
    link(&mut alice, &mut bob).await;

    alice
        .node
        .trades()
        .propose(&bob.id(), Asset::new("BTC", 1), Asset::new("SOL", 400))
        .await
        .unwrap();

    let NodeEvent::FrameRejected { peer_id, error } =
        next_matching(&mut bob.events.node, |e| {
            matches!(e, NodeEvent::FrameRejected { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(peer_id, alice.id());
    assert!(matches!(
        error,
        LinkError::Crypto(CryptoError::UnknownPeer(ref p)) if *p == alice.id()
    ));
    assert!(bob.node.trades().negotiations().is_empty());

    let conn = bob.node.manager().get_connection(&alice.id()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    // Once bob registers alice, the next message gets through on the same
    // connection.
    bob.node
        .add_peer(&alice.id(), &alice.node.public_key().unwrap(), false)
        .unwrap();
    alice
        .node
        .trades()
        .propose(&bob.id(), Asset::new("BTC", 1), Asset::new("SOL", 400))
        .await
        .unwrap();
    next_matching(&mut bob.events.trades, |e| {
        matches!(e, TradeEvent::Requested { .. })
    })
    .await;
    assert_eq!(bob.node.trades().negotiations().len(), 1);
}

#[tokio::test]
async fn tampered_frame_is_rejected() {
    let (alice, mut bob) = linked_pair().await;

    let frame = alice
        .node
        .channel()
        .seal_chunk(&bob.id(), b"sixteen kib of something")
        .unwrap();
    let mut bytes = match frame {
        Frame::Binary(b) => b.to_vec(),
        other => panic!("expected binary frame, got {other:?}"),
    };
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    alice
        .node
        .manager()
        .send_async(
            &bob.id(),
            DEFAULT_CHANNEL_LABEL,
            Frame::Binary(Bytes::from(bytes)),
        )
        .await
        .unwrap();

    let NodeEvent::FrameRejected { error, .. } = next_matching(&mut bob.events.node, |e| {
        matches!(e, NodeEvent::FrameRejected { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert!(matches!(
        error,
        LinkError::Crypto(CryptoError::IntegrityMismatch)
    ));
    assert_eq!(
        bob.node
            .manager()
            .get_connection(&alice.id())
            .unwrap()
            .state(),
        ConnectionState::Connected
    );
}

// ---------------------------------------------------------------------------
// 4. Trade Negotiation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_trade_negotiation() {
    let (mut alice, mut bob) = linked_pair().await;

    let id = alice
        .node
        .trades()
        .propose(&bob.id(), Asset::new("BTC", 10_000), Asset::new("ETH", 250_000))
        .await
        .unwrap();

    let TradeEvent::Requested { negotiation } = next_matching(&mut bob.events.trades, |e| {
        matches!(e, TradeEvent::Requested { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(negotiation.id, id);
    assert_eq!(negotiation.offered_asset, Asset::new("BTC", 10_000));

    bob.node.trades().respond(&id, true).await.unwrap();
    next_matching(&mut alice.events.trades, |e| {
        matches!(e, TradeEvent::StatusChanged { status: TradeStatus::Accepted, .. })
    })
    .await;

    alice.node.trades().confirm(&id).await.unwrap();
    next_matching(&mut bob.events.trades, |e| {
        matches!(e, TradeEvent::StatusChanged { status: TradeStatus::Confirmed, .. })
    })
    .await;

    bob.node.trades().execute(&id, "0xdeadbeef").await.unwrap();
    next_matching(&mut alice.events.trades, |e| {
        matches!(e, TradeEvent::StatusChanged { status: TradeStatus::Executing, .. })
    })
    .await;

    alice.node.trades().complete(&id).await.unwrap();
    next_matching(&mut bob.events.trades, |e| {
        matches!(e, TradeEvent::StatusChanged { status: TradeStatus::Completed, .. })
    })
    .await;

    for peer in [&alice, &bob] {
        let n = peer.node.trades().negotiation(&id).unwrap();
        assert_eq!(n.status, TradeStatus::Completed);
        assert_eq!(n.txid.as_deref(), Some("0xdeadbeef"));
    }
}

#[tokio::test]
async fn out_of_order_completion_leaves_trade_requested() {
    let (mut alice, mut bob) = linked_pair().await;

    let id = alice
        .node
        .trades()
        .propose(&bob.id(), Asset::new("BTC", 1), Asset::new("ETH", 10))
        .await
        .unwrap();
    next_matching(&mut bob.events.trades, |e| {
        matches!(e, TradeEvent::Requested { .. })
    })
    .await;

    // Bob never responds, then sends a completion anyway.
    bob.node
        .channel()
        .send_message(
            &alice.id(),
            TradeMessage::TradeCompletion {
                trade_id: id.clone(),
            }
            .into(),
        )
        .await
        .unwrap();

    let TradeEvent::InvalidTransition {
        from, attempted, ..
    } = next_matching(&mut alice.events.trades, |e| {
        matches!(e, TradeEvent::InvalidTransition { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(from, TradeStatus::Requested);
    assert_eq!(attempted, TradeStatus::Completed);
    assert_eq!(
        alice.node.trades().negotiation(&id).unwrap().status,
        TradeStatus::Requested
    );
}

#[tokio::test]
async fn traffic_to_one_peer_does_not_touch_another() {
    let hub = MemorySignalingHub::new();
    let net = MemoryNetwork::new();
    let mut alice = spawn(&hub, &net, "alice");
    let mut bob = spawn(&hub, &net, "bob");
    let mut carol = spawn(&hub, &net, "carol");
    introduce(&alice, &bob);
    introduce(&alice, &carol);
    link(&mut alice, &mut bob).await;
    link(&mut alice, &mut carol).await;

    let to_bob = alice
        .node
        .trades()
        .propose(&bob.id(), Asset::new("BTC", 1), Asset::new("ETH", 10))
        .await
        .unwrap();
    let to_carol = alice
        .node
        .trades()
        .propose(&carol.id(), Asset::new("BTC", 2), Asset::new("ETH", 20))
        .await
        .unwrap();
    next_matching(&mut bob.events.trades, |e| matches!(e, TradeEvent::Requested { .. })).await;
    next_matching(&mut carol.events.trades, |e| matches!(e, TradeEvent::Requested { .. })).await;

    bob.node.trades().respond(&to_bob, false).await.unwrap();
    next_matching(&mut alice.events.trades, |e| {
        matches!(e, TradeEvent::StatusChanged { status: TradeStatus::Rejected, .. })
    })
    .await;

    assert_eq!(
        alice.node.trades().negotiation(&to_bob).unwrap().status,
        TradeStatus::Rejected
    );
    assert_eq!(
        alice.node.trades().negotiation(&to_carol).unwrap().status,
        TradeStatus::Requested
    );
    assert!(carol.node.trades().negotiation(&to_bob).is_none());
    assert_eq!(alice.node.manager().connection_count(), 2);
}
