//! # Connection Manager
//!
//! Owns the peer → [`Connection`] map and bridges the signaling relay to
//! connection operations. Callers see a small surface (`connect`, `send`,
//! `close_connection`) and a single [`ManagerEvent`] stream that merges
//! every connection's events, tagged with the peer they came from.
//!
//! ## Invariants
//!
//! - A `PeerId` maps to at most one live connection. `connect` on a peer
//!   that already has one is a no-op.
//! - Connections that reach `failed` or `closed` are removed from the map
//!   by their forwarding task. Removal compares `Arc` pointers so a stale
//!   task can never evict the connection that replaced it.
//!
//! ## Glare
//!
//! If both peers offer at once, the lexicographically smaller `PeerId` is
//! the designated offerer. The smaller side ignores the incoming offer and
//! waits for an answer to its own; the larger side drops its pending offer
//! and answers.
//!
//! "Pending" covers the whole window from admission until the peer's
//! description is applied, not only `have-local-offer`. An offer that lands
//! while `connect` is still opening the default channel is resolved by the
//! same rule, so neither side can end up waiting on an offer the other has
//! ignored.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::connection::{Connection, ConnectionError, ConnectionEvent, ConnectionState};
use crate::config::ManagerConfig;
use crate::identity::PeerId;
use crate::signaling::{SignalingError, SignalingEvent, SignalingTransport};
use crate::transport::{Frame, IceCandidate, SessionDescription, TransportFactory};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("refusing to connect to self")]
    SelfConnect,

    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),

    #[error("no connection to peer {0}")]
    NotConnected(PeerId),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Connected {
        peer_id: PeerId,
    },
    Disconnected {
        peer_id: PeerId,
        state: ConnectionState,
    },
    MessageReceived {
        peer_id: PeerId,
        label: String,
        payload: Frame,
    },
    ChannelOpened {
        peer_id: PeerId,
        label: String,
    },
    ChannelClosed {
        peer_id: PeerId,
        label: String,
    },
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Handle on the manager. Cheap to clone; all clones share one map.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    local_id: PeerId,
    config: ManagerConfig,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn TransportFactory>,
    connections: DashMap<PeerId, Arc<Connection>>,
    events: mpsc::Sender<ManagerEvent>,
    /// Serializes the check-then-insert on the map.
    admission: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        local_id: PeerId,
        config: ManagerConfig,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::Receiver<ManagerEvent>) {
        let (events, rx) = mpsc::channel(config.event_queue_capacity);
        let inner = Arc::new(ManagerInner {
            local_id,
            config,
            signaling,
            factory,
            connections: DashMap::new(),
            events,
            admission: Mutex::new(()),
        });
        (Self { inner }, rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn get_connection(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.inner.connections.get(peer_id).map(|c| c.value().clone())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    // -- Outbound ------------------------------------------------------------

    /// Open a connection to `peer_id`: default channel, offer, signaling.
    ///
    /// Returns once the offer is handed to the relay. Establishment is
    /// reported later as [`ManagerEvent::Connected`].
    pub async fn connect(&self, peer_id: &PeerId) -> Result<(), ManagerError> {
        if *peer_id == self.inner.local_id {
            return Err(ManagerError::SelfConnect);
        }

        let conn = {
            let _admission = self.inner.admission.lock();
            if self.inner.connections.contains_key(peer_id) {
                debug!(peer_id = %peer_id, "connect: connection already exists");
                return Ok(());
            }
            self.admit(peer_id)?
        };

        let result = async {
            conn.create_channel(&self.inner.config.default_channel, true)
                .await?;
            let offer = conn.create_offer().await?;
            if conn.is_closed() {
                // Replaced by an inbound offer while we were negotiating.
                return Ok(());
            }
            self.inner.signaling.send_offer(peer_id, &offer.sdp).await?;
            Ok::<_, ManagerError>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(peer_id = %peer_id, "offer sent");
                Ok(())
            }
            Err(_) if conn.is_closed() && self.get_connection(peer_id).is_some() => {
                debug!(peer_id = %peer_id, "pending offer superseded by inbound connection");
                Ok(())
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "connect failed");
                self.discard(peer_id, &conn).await;
                Err(e)
            }
        }
    }

    /// Queue `payload` on `label` of the connection to `peer_id`.
    pub fn send(&self, peer_id: &PeerId, label: &str, payload: Frame) -> Result<(), ManagerError> {
        let conn = self
            .get_connection(peer_id)
            .ok_or_else(|| ManagerError::NotConnected(peer_id.clone()))?;
        Ok(conn.send(label, payload)?)
    }

    /// Like [`send`](Self::send), waiting for queue capacity.
    pub async fn send_async(
        &self,
        peer_id: &PeerId,
        label: &str,
        payload: Frame,
    ) -> Result<(), ManagerError> {
        let conn = self
            .get_connection(peer_id)
            .ok_or_else(|| ManagerError::NotConnected(peer_id.clone()))?;
        Ok(conn.send_async(label, payload).await?)
    }

    /// Send the same frame to every connected peer. One result per peer.
    pub async fn broadcast(
        &self,
        label: &str,
        payload: Frame,
    ) -> Vec<(PeerId, Result<(), ManagerError>)> {
        let targets: Vec<(PeerId, Arc<Connection>)> = self
            .inner
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        join_all(targets.into_iter().map(|(peer_id, conn)| {
            let payload = payload.clone();
            async move {
                let result = conn.send_async(label, payload).await.map_err(Into::into);
                (peer_id, result)
            }
        }))
        .await
    }

    // -- Teardown ------------------------------------------------------------

    /// Close and forget the connection to `peer_id`. Returns whether one
    /// existed.
    pub async fn close_connection(&self, peer_id: &PeerId) -> bool {
        match self.inner.connections.remove(peer_id) {
            Some((_, conn)) => {
                conn.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let peers: Vec<PeerId> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let conns: Vec<Arc<Connection>> = peers
            .iter()
            .filter_map(|peer| self.inner.connections.remove(peer).map(|(_, c)| c))
            .collect();
        join_all(conns.iter().map(|c| c.close())).await;
        info!(closed = conns.len(), "all connections closed");
    }

    // -- Signaling -----------------------------------------------------------

    /// Apply one inbound signaling event.
    pub async fn handle_signal(&self, event: SignalingEvent) -> Result<(), ManagerError> {
        match event {
            SignalingEvent::Offer { from, sdp } => self.on_offer(from, sdp).await,
            SignalingEvent::Answer { from, sdp } => match self.get_connection(&from) {
                Some(conn) => {
                    conn.set_remote_description(&SessionDescription::answer(sdp))
                        .await?;
                    debug!(peer_id = %from, "answer applied");
                    Ok(())
                }
                None => {
                    debug!(peer_id = %from, "dropping answer for unknown peer");
                    Ok(())
                }
            },
            SignalingEvent::IceCandidate { from, candidate } => self.on_candidate(from, candidate).await,
        }
    }

    /// Feed `rx` into [`handle_signal`](Self::handle_signal) until it closes.
    pub fn spawn_signaling_loop(&self, mut rx: mpsc::Receiver<SignalingEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let from = event.from().clone();
                let kind = event.kind();
                if let Err(e) = manager.handle_signal(event).await {
                    warn!(peer_id = %from, kind, error = %e, "signaling event failed");
                }
            }
            debug!("signaling loop finished");
        })
    }

    async fn on_offer(&self, from: PeerId, sdp: String) -> Result<(), ManagerError> {
        if let Some(existing) = self.get_connection(&from) {
            // Our side is still offering if the peer has never described
            // itself to us, whether or not `create_offer` has run yet.
            let offering = !existing.has_remote_description() && !existing.is_closed();
            if offering && self.inner.local_id < from {
                info!(
                    peer_id = %from,
                    signaling = ?existing.signaling_state(),
                    "glare: keeping our offer, ignoring theirs"
                );
                return Ok(());
            }
            if !offering && existing.state() != ConnectionState::Disconnected {
                // Renegotiation is not supported; a stale or duplicate offer
                // must not tear down a live session.
                debug!(peer_id = %from, state = %existing.state(), "ignoring offer for live connection");
                return Ok(());
            }
            info!(
                peer_id = %from,
                state = %existing.state(),
                "replacing connection with inbound offer"
            );
            self.discard(&from, &existing).await;
        }

        let conn = {
            let _admission = self.inner.admission.lock();
            if let Some(raced) = self.get_connection(&from) {
                // Another task admitted this peer since we looked.
                debug!(peer_id = %from, "offer raced with a new connection, ignoring");
                drop(raced);
                return Ok(());
            }
            self.admit(&from)?
        };

        let result = async {
            conn.set_remote_description(&SessionDescription::offer(sdp))
                .await?;
            let answer = conn.create_answer().await?;
            self.inner.signaling.send_answer(&from, &answer.sdp).await?;
            Ok::<_, ManagerError>(())
        }
        .await;

        if let Err(e) = &result {
            warn!(peer_id = %from, error = %e, "failed to answer offer");
            self.discard(&from, &conn).await;
        } else {
            info!(peer_id = %from, "answer sent");
        }
        result
    }

    async fn on_candidate(&self, from: PeerId, candidate: IceCandidate) -> Result<(), ManagerError> {
        match self.get_connection(&from) {
            Some(conn) => Ok(conn.add_ice_candidate(candidate).await?),
            None => {
                debug!(peer_id = %from, "dropping ICE candidate for unknown peer");
                Ok(())
            }
        }
    }

    // -- Internals -----------------------------------------------------------

    /// Create, register and start forwarding for a new connection. The
    /// caller holds the admission lock.
    fn admit(&self, peer_id: &PeerId) -> Result<Arc<Connection>, ManagerError> {
        let max = self.inner.config.max_connections;
        if self.inner.connections.len() >= max {
            warn!(peer_id = %peer_id, max, "connection limit reached");
            return Err(ManagerError::TooManyConnections(max));
        }

        let (conn, events) = Connection::new(
            &self.inner.local_id,
            peer_id.clone(),
            self.inner.factory.as_ref(),
            &self.inner.config,
        );
        self.inner
            .connections
            .insert(peer_id.clone(), conn.clone());
        spawn_forwarder(
            Arc::downgrade(&self.inner),
            Arc::downgrade(&conn),
            peer_id.clone(),
            events,
        );
        Ok(conn)
    }

    /// Remove `conn` (only if it is still the registered one) and close it.
    async fn discard(&self, peer_id: &PeerId, conn: &Arc<Connection>) {
        self.inner
            .connections
            .remove_if(peer_id, |_, current| Arc::ptr_eq(current, conn));
        conn.close().await;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_id", &self.inner.local_id)
            .field("peers", &self.peers())
            .finish()
    }
}

/// Translate one connection's events into manager events until the
/// connection reaches a terminal state or goes away.
fn spawn_forwarder(
    inner: Weak<ManagerInner>,
    conn: Weak<Connection>,
    peer_id: PeerId,
    mut rx: mpsc::Receiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let outbound = match event {
                ConnectionEvent::StateChanged(ConnectionState::Connected) => {
                    info!(peer_id = %peer_id, "peer connected");
                    Some(ManagerEvent::Connected {
                        peer_id: peer_id.clone(),
                    })
                }
                ConnectionEvent::StateChanged(
                    state @ (ConnectionState::Disconnected
                    | ConnectionState::Failed
                    | ConnectionState::Closed),
                ) => {
                    if state.is_terminal() {
                        let removed = inner.connections.remove_if(&peer_id, |_, current| {
                            std::ptr::eq(Arc::as_ptr(current), conn.as_ptr())
                        });
                        if removed.is_some() {
                            debug!(peer_id = %peer_id, %state, "connection removed from manager");
                        }
                    }
                    info!(peer_id = %peer_id, %state, "peer disconnected");
                    Some(ManagerEvent::Disconnected {
                        peer_id: peer_id.clone(),
                        state,
                    })
                }
                ConnectionEvent::StateChanged(_) => None,
                ConnectionEvent::ChannelOpened(label) => Some(ManagerEvent::ChannelOpened {
                    peer_id: peer_id.clone(),
                    label,
                }),
                ConnectionEvent::ChannelClosed(label) => Some(ManagerEvent::ChannelClosed {
                    peer_id: peer_id.clone(),
                    label,
                }),
                ConnectionEvent::MessageReceived { label, payload } => {
                    Some(ManagerEvent::MessageReceived {
                        peer_id: peer_id.clone(),
                        label,
                        payload,
                    })
                }
                ConnectionEvent::LocalCandidate(candidate) => {
                    if let Err(e) = inner.signaling.send_ice_candidate(&peer_id, &candidate).await {
                        warn!(peer_id = %peer_id, error = %e, "failed to relay local candidate");
                    }
                    None
                }
                ConnectionEvent::IceStateChanged(ice) => {
                    trace!(peer_id = %peer_id, ?ice, "ICE state");
                    None
                }
                ConnectionEvent::SignalingStateChanged(state) => {
                    trace!(peer_id = %peer_id, %state, "signaling state");
                    None
                }
            };

            let terminal = matches!(
                &outbound,
                Some(ManagerEvent::Disconnected { state, .. }) if state.is_terminal()
            );
            if let Some(event) = outbound {
                if inner.events.send(event).await.is_err() {
                    trace!(peer_id = %peer_id, "manager event dropped, no listener");
                }
            }
            if terminal {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemorySignalingHub;
    use crate::transport::{MemoryNetwork, SessionDriver, TransportError, TransportEvent};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    // -----------------------------------------------------------------------
    // Test Helpers
    // -----------------------------------------------------------------------

    struct Node {
        manager: ConnectionManager,
        events: mpsc::Receiver<ManagerEvent>,
    }

    fn node(hub: &MemorySignalingHub, net: &MemoryNetwork, id: &str, config: ManagerConfig) -> Node {
        let (signaling, inbox) = hub.register(&id.into());
        let (manager, events) = ConnectionManager::new(
            id.into(),
            config,
            Arc::new(signaling),
            Arc::new(net.clone()),
        );
        manager.spawn_signaling_loop(inbox);
        Node { manager, events }
    }

    fn node_with_factory(
        hub: &MemorySignalingHub,
        id: &str,
        factory: Arc<dyn TransportFactory>,
    ) -> Node {
        let (signaling, inbox) = hub.register(&id.into());
        let (manager, events) =
            ConnectionManager::new(id.into(), ManagerConfig::default(), Arc::new(signaling), factory);
        manager.spawn_signaling_loop(inbox);
        Node { manager, events }
    }

    /// Memory transport whose `open_channel` waits until the gate has
    /// permits, holding `connect` before its offer exists.
    struct GatedFactory {
        net: MemoryNetwork,
        gate: Arc<Semaphore>,
    }

    struct GatedDriver {
        inner: Arc<dyn SessionDriver>,
        gate: Arc<Semaphore>,
    }

    impl TransportFactory for GatedFactory {
        fn create(
            &self,
            local: &PeerId,
            remote: &PeerId,
            events: mpsc::Sender<TransportEvent>,
        ) -> Arc<dyn SessionDriver> {
            Arc::new(GatedDriver {
                inner: self.net.create(local, remote, events),
                gate: self.gate.clone(),
            })
        }
    }

    #[async_trait]
    impl SessionDriver for GatedDriver {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            self.inner.create_offer().await
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            self.inner.create_answer().await
        }

        async fn set_local_description(
            &self,
            desc: &SessionDescription,
        ) -> Result<(), TransportError> {
            self.inner.set_local_description(desc).await
        }

        async fn set_remote_description(
            &self,
            desc: &SessionDescription,
        ) -> Result<(), TransportError> {
            self.inner.set_remote_description(desc).await
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
            self.inner.add_ice_candidate(candidate).await
        }

        async fn open_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError> {
            let _ = self.gate.acquire().await;
            self.inner.open_channel(label, ordered).await
        }

        async fn send(&self, label: &str, frame: Frame) -> Result<(), TransportError> {
            self.inner.send(label, frame).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    async fn wait_until<F>(mut cond: F)
    where
        F: FnMut() -> bool,
    {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    fn pair() -> (Node, Node) {
        let hub = MemorySignalingHub::new();
        let net = MemoryNetwork::new();
        (
            node(&hub, &net, "alice", ManagerConfig::default()),
            node(&hub, &net, "bob", ManagerConfig::default()),
        )
    }

    async fn next_matching<F>(events: &mut mpsc::Receiver<ManagerEvent>, mut pred: F) -> ManagerEvent
    where
        F: FnMut(&ManagerEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("manager events ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for manager event")
    }

    async fn wait_connected(node: &mut Node) {
        next_matching(&mut node.events, |e| matches!(e, ManagerEvent::Connected { .. })).await;
    }

    async fn wait_channel(node: &mut Node) {
        next_matching(&mut node.events, |e| {
            matches!(e, ManagerEvent::ChannelOpened { .. })
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // 1. Connect
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_establishes_both_sides() {
        let (mut alice, mut bob) = pair();
        alice.manager.connect(&"bob".into()).await.unwrap();

        wait_connected(&mut alice).await;
        wait_connected(&mut bob).await;
        assert_eq!(alice.manager.peers(), vec![PeerId::from("bob")]);
        assert_eq!(bob.manager.peers(), vec![PeerId::from("alice")]);
    }

    #[tokio::test]
    async fn test_connect_twice_keeps_one_connection() {
        let (alice, _bob) = pair();
        alice.manager.connect(&"bob".into()).await.unwrap();
        let first = alice.manager.get_connection(&"bob".into()).unwrap();
        alice.manager.connect(&"bob".into()).await.unwrap();
        let second = alice.manager.get_connection(&"bob".into()).unwrap();

        assert_eq!(alice.manager.connection_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_connect_to_self_is_rejected() {
        let (alice, _bob) = pair();
        assert_eq!(
            alice.manager.connect(&"alice".into()).await,
            Err(ManagerError::SelfConnect)
        );
    }

    #[tokio::test]
    async fn test_connection_cap_is_enforced() {
        let hub = MemorySignalingHub::new();
        let net = MemoryNetwork::new();
        let config = ManagerConfig {
            max_connections: 1,
            ..ManagerConfig::default()
        };
        let alice = node(&hub, &net, "alice", config);
        let _bob = node(&hub, &net, "bob", ManagerConfig::default());
        let _carol = node(&hub, &net, "carol", ManagerConfig::default());

        alice.manager.connect(&"bob".into()).await.unwrap();
        assert_eq!(
            alice.manager.connect(&"carol".into()).await,
            Err(ManagerError::TooManyConnections(1))
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_leaves_no_connection() {
        let (alice, _bob) = pair();
        let err = alice.manager.connect(&"nobody".into()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Signaling(SignalingError::Unreachable(_))));
        assert_eq!(alice.manager.connection_count(), 0);
    }

    // -----------------------------------------------------------------------
    // 2. Signaling edge cases
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_answer_and_candidate_for_unknown_peer_are_dropped() {
        let (alice, _bob) = pair();
        alice
            .manager
            .handle_signal(SignalingEvent::Answer {
                from: "mallory".into(),
                sdp: "v=0".into(),
            })
            .await
            .unwrap();
        alice
            .manager
            .handle_signal(SignalingEvent::IceCandidate {
                from: "mallory".into(),
                candidate: IceCandidate {
                    candidate: "candidate:0".into(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            })
            .await
            .unwrap();
        assert_eq!(alice.manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_simultaneous_connect_resolves_to_one_connection_each() {
        let (mut alice, mut bob) = pair();
        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");
        let (a, b) = tokio::join!(
            alice.manager.connect(&bob_id),
            bob.manager.connect(&alice_id)
        );
        a.unwrap();
        b.unwrap();

        wait_connected(&mut alice).await;
        wait_connected(&mut bob).await;
        assert_eq!(alice.manager.connection_count(), 1);
        assert_eq!(bob.manager.connection_count(), 1);
        assert_eq!(
            alice.manager.get_connection(&"bob".into()).unwrap().state(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_offer_before_local_offer_is_created_still_converges() {
        let hub = MemorySignalingHub::new();
        let net = MemoryNetwork::new();
        let gate = Arc::new(Semaphore::new(0));
        let mut alice = node(&hub, &net, "alice", ManagerConfig::default());
        let mut bob = node_with_factory(
            &hub,
            "bob",
            Arc::new(GatedFactory {
                net: net.clone(),
                gate: gate.clone(),
            }),
        );
        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");

        // Bob admits alice and stalls opening the default channel, so his
        // connection sits in `stable` with no offer yet.
        let bob_manager = bob.manager.clone();
        let target = alice_id.clone();
        let bob_connect = tokio::spawn(async move { bob_manager.connect(&target).await });
        wait_until(|| bob.manager.get_connection(&alice_id).is_some()).await;

        // Alice is the designated offerer, so bob must yield and answer.
        alice.manager.connect(&bob_id).await.unwrap();
        wait_until(|| {
            bob.manager
                .get_connection(&alice_id)
                .is_some_and(|conn| conn.has_remote_description())
        })
        .await;

        gate.add_permits(64);
        bob_connect.await.unwrap().unwrap();

        wait_connected(&mut alice).await;
        wait_connected(&mut bob).await;
        assert_eq!(alice.manager.connection_count(), 1);
        assert_eq!(bob.manager.connection_count(), 1);
        assert_eq!(
            bob.manager.get_connection(&alice_id).unwrap().state(),
            ConnectionState::Connected
        );
    }

    // -----------------------------------------------------------------------
    // 3. Messaging
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_delivers_message_event() {
        let (mut alice, mut bob) = pair();
        alice.manager.connect(&"bob".into()).await.unwrap();
        wait_channel(&mut alice).await;
        wait_channel(&mut bob).await;

        alice
            .manager
            .send(&"bob".into(), "parley", Frame::Text("hello".into()))
            .unwrap();
        let event = next_matching(&mut bob.events, |e| {
            matches!(e, ManagerEvent::MessageReceived { .. })
        })
        .await;
        match event {
            ManagerEvent::MessageReceived {
                peer_id,
                label,
                payload,
            } => {
                assert_eq!(peer_id, PeerId::from("alice"));
                assert_eq!(label, "parley");
                assert_eq!(payload, Frame::Text("hello".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (alice, _bob) = pair();
        assert_eq!(
            alice
                .manager
                .send(&"bob".into(), "parley", Frame::Text("x".into())),
            Err(ManagerError::NotConnected("bob".into()))
        );
    }

    #[tokio::test]
    async fn test_broadcast_reports_per_peer() {
        let hub = MemorySignalingHub::new();
        let net = MemoryNetwork::new();
        let mut alice = node(&hub, &net, "alice", ManagerConfig::default());
        let mut bob = node(&hub, &net, "bob", ManagerConfig::default());
        let mut carol = node(&hub, &net, "carol", ManagerConfig::default());

        alice.manager.connect(&"bob".into()).await.unwrap();
        alice.manager.connect(&"carol".into()).await.unwrap();
        wait_channel(&mut bob).await;
        wait_channel(&mut carol).await;
        wait_channel(&mut alice).await;
        wait_channel(&mut alice).await;

        let results = alice
            .manager
            .broadcast("parley", Frame::Text("all".into()))
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        for n in [&mut bob, &mut carol] {
            next_matching(&mut n.events, |e| {
                matches!(e, ManagerEvent::MessageReceived { .. })
            })
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // 4. Teardown
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_close_connection_notifies_remote_and_removes() {
        let (mut alice, mut bob) = pair();
        alice.manager.connect(&"bob".into()).await.unwrap();
        wait_connected(&mut alice).await;
        wait_connected(&mut bob).await;

        assert!(alice.manager.close_connection(&"bob".into()).await);
        assert!(!alice.manager.close_connection(&"bob".into()).await);
        assert_eq!(alice.manager.connection_count(), 0);

        let event = next_matching(&mut bob.events, |e| {
            matches!(e, ManagerEvent::Disconnected { state, .. } if state.is_terminal())
        })
        .await;
        assert!(matches!(
            event,
            ManagerEvent::Disconnected {
                state: ConnectionState::Failed,
                ..
            }
        ));
        // The forwarder removes the failed connection on bob's side.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bob.manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_empties_the_map() {
        let (alice, _bob) = pair();
        alice.manager.connect(&"bob".into()).await.unwrap();
        alice.manager.close_all().await;
        assert_eq!(alice.manager.connection_count(), 0);
    }
}
