//! # Connection
//!
//! One peer's session: negotiation state, labelled channels and the
//! translation of raw transport events into typed [`ConnectionEvent`]s.
//!
//! ```text
//!            checking            connected|completed
//!   new ───────────────► connecting ───────────────► connected
//!                                                     │     ▲
//!                                        disconnected │     │ connected
//!                                                     ▼     │
//!                                                  disconnected
//!
//!   any ──failed──► failed (terminal)      any ──close()/closed──► closed (terminal)
//! ```
//!
//! Connectivity is driven by the transport's ICE signal only. Application
//! traffic never moves the state machine, and once `failed` or `closed` is
//! reached later transport signals are ignored.
//!
//! ## Tasks
//!
//! A connection runs one event pump (transport events in, connection
//! events out) and one outbound pump per channel. [`Connection::send`] only
//! checks preconditions and pushes onto the channel's bounded queue; the
//! pump hands frames to the driver in order. A full queue is reported as
//! [`ConnectionError::Backpressure`] so callers can slow down or switch to
//! [`Connection::send_async`], which waits for room instead.
//!
//! Offer/answer calls are serialized by an async mutex held across the
//! driver's await points, so two tasks cannot interleave a negotiation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::config::ManagerConfig;
use crate::identity::PeerId;
use crate::transport::{
    Frame, IceCandidate, IceConnectionState, SdpKind, SessionDescription, SessionDriver,
    TransportError, TransportEvent, TransportFactory,
};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("channel {0:?} not found")]
    ChannelNotFound(String),

    #[error("channel {0:?} is not open")]
    ChannelNotOpen(String),

    #[error("outbound queue for channel {0:?} is full")]
    Backpressure(String),

    #[error("{operation} is not allowed in signaling state {state}")]
    InvalidSignalingState {
        operation: &'static str,
        state: SignalingState,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Recoverable: the transport may come back to `connected` on its own.
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl From<IceConnectionState> for ConnectionState {
    fn from(ice: IceConnectionState) -> Self {
        match ice {
            IceConnectionState::New => ConnectionState::New,
            IceConnectionState::Checking => ConnectionState::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => {
                ConnectionState::Connected
            }
            IceConnectionState::Disconnected => ConnectionState::Disconnected,
            IceConnectionState::Failed => ConnectionState::Failed,
            IceConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Offer/answer progress, with the WebRTC names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Everything a connection reports to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    SignalingStateChanged(SignalingState),
    IceStateChanged(IceConnectionState),
    ChannelOpened(String),
    ChannelClosed(String),
    MessageReceived { label: String, payload: Frame },
    LocalCandidate(IceCandidate),
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

struct Channel {
    label: String,
    ordered: bool,
    /// The transport reports the channel usable.
    transport_open: AtomicBool,
    /// Open as seen by callers: transport open and connection connected.
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl Channel {
    fn sender(&self) -> Result<mpsc::Sender<Frame>, ConnectionError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ConnectionError::ChannelNotOpen(self.label.clone()));
        }
        self.outbound
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::ChannelNotOpen(self.label.clone()))
    }

    fn try_enqueue(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.sender()?.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::Backpressure(self.label.clone()),
            TrySendError::Closed(_) => ConnectionError::ChannelNotOpen(self.label.clone()),
        })
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.sender()?
            .send(frame)
            .await
            .map_err(|_| ConnectionError::ChannelNotOpen(self.label.clone()))
    }
}

/// Caller-side view of one channel.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<Channel>,
}

impl ChannelHandle {
    pub fn label(&self) -> &str {
        &self.channel.label
    }

    pub fn ordered(&self) -> bool {
        self.channel.ordered
    }

    pub fn is_open(&self) -> bool {
        self.channel.open.load(Ordering::Acquire)
    }

    /// Same contract as [`Connection::send`].
    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.channel.try_enqueue(frame)
    }

    /// Same contract as [`Connection::send_async`].
    pub async fn send_async(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.channel.enqueue(frame).await
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label)
            .field("open", &self.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct Connection {
    peer_id: PeerId,
    created_at: DateTime<Utc>,
    driver: Arc<dyn SessionDriver>,
    state: RwLock<ConnectionState>,
    signaling_state: RwLock<SignalingState>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    /// Remote candidates that arrived before any remote description.
    pending_candidates: Mutex<Vec<IceCandidate>>,
    has_remote_description: AtomicBool,
    negotiation: tokio::sync::Mutex<()>,
    events: mpsc::Sender<ConnectionEvent>,
    channel_queue_capacity: usize,
}

impl Connection {
    /// Create a connection to `peer_id` and start its event pump.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        local_id: &PeerId,
        peer_id: PeerId,
        factory: &dyn TransportFactory,
        config: &ManagerConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>) {
        let (transport_tx, transport_rx) = mpsc::channel(config.event_queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
        let driver = factory.create(local_id, &peer_id, transport_tx);

        let conn = Arc::new(Self {
            peer_id,
            created_at: Utc::now(),
            driver,
            state: RwLock::new(ConnectionState::New),
            signaling_state: RwLock::new(SignalingState::Stable),
            channels: RwLock::new(HashMap::new()),
            pending_candidates: Mutex::new(Vec::new()),
            has_remote_description: AtomicBool::new(false),
            negotiation: tokio::sync::Mutex::new(()),
            events: events_tx,
            channel_queue_capacity: config.channel_queue_capacity.max(1),
        });
        Self::spawn_event_pump(Arc::downgrade(&conn), transport_rx);
        debug!(peer_id = %conn.peer_id, "connection created");
        (conn, events_rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn signaling_state(&self) -> SignalingState {
        *self.signaling_state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the peer's offer or answer has been applied. False for the
    /// whole offering side of a negotiation, including before the local
    /// offer exists.
    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description.load(Ordering::Acquire)
    }

    pub fn channel(&self, label: &str) -> Option<ChannelHandle> {
        self.channels
            .read()
            .get(label)
            .map(|channel| ChannelHandle {
                channel: channel.clone(),
            })
    }

    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.channels.read().keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn is_channel_open(&self, label: &str) -> bool {
        self.channel(label).is_some_and(|c| c.is_open())
    }

    // -- Channels -----------------------------------------------------------

    /// Declare a channel. Re-creating an existing label returns the existing
    /// handle.
    pub async fn create_channel(
        self: &Arc<Self>,
        label: &str,
        ordered: bool,
    ) -> Result<ChannelHandle, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if let Some(existing) = self.channel(label) {
            return Ok(existing);
        }
        let channel = self.ensure_channel(label, ordered);
        self.driver.open_channel(label, ordered).await?;
        Ok(ChannelHandle { channel })
    }

    fn ensure_channel(self: &Arc<Self>, label: &str, ordered: bool) -> Arc<Channel> {
        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(label) {
            return existing.clone();
        }

        let (tx, rx) = mpsc::channel(self.channel_queue_capacity);
        let channel = Arc::new(Channel {
            label: label.to_string(),
            ordered,
            transport_open: AtomicBool::new(false),
            open: AtomicBool::new(false),
            outbound: Mutex::new(Some(tx)),
        });
        channels.insert(label.to_string(), channel.clone());
        Self::spawn_outbound_pump(Arc::downgrade(self), label.to_string(), rx);
        channel
    }

    // -- Sending ------------------------------------------------------------

    /// Queue a frame on `label`.
    ///
    /// A synchronous precondition check: success means the frame is in the
    /// local queue, not that the peer has it.
    pub fn send(&self, label: &str, payload: Frame) -> Result<(), ConnectionError> {
        self.lookup(label)?.try_enqueue(payload)
    }

    /// Queue a frame on `label`, waiting for queue capacity.
    pub async fn send_async(&self, label: &str, payload: Frame) -> Result<(), ConnectionError> {
        let channel = self.lookup(label)?;
        channel.enqueue(payload).await
    }

    fn lookup(&self, label: &str) -> Result<Arc<Channel>, ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.channels
            .read()
            .get(label)
            .cloned()
            .ok_or_else(|| ConnectionError::ChannelNotFound(label.to_string()))
    }

    // -- Negotiation ----------------------------------------------------------

    /// Create an offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let _negotiating = self.negotiation.lock().await;
        self.expect_signaling("create_offer", SignalingState::Stable)?;

        let offer = self.driver.create_offer().await?;
        self.driver.set_local_description(&offer).await?;
        self.set_signaling_state(SignalingState::HaveLocalOffer).await;
        Ok(offer)
    }

    /// Create an answer to the applied remote offer and install it.
    pub async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let _negotiating = self.negotiation.lock().await;
        self.expect_signaling("create_answer", SignalingState::HaveRemoteOffer)?;

        let answer = self.driver.create_answer().await?;
        self.driver.set_local_description(&answer).await?;
        self.set_signaling_state(SignalingState::Stable).await;
        Ok(answer)
    }

    /// Apply the remote offer or answer, then any candidates that were
    /// waiting for it.
    pub async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), ConnectionError> {
        let _negotiating = self.negotiation.lock().await;
        let next = match desc.kind {
            SdpKind::Offer => {
                self.expect_signaling("set_remote_description(offer)", SignalingState::Stable)?;
                SignalingState::HaveRemoteOffer
            }
            SdpKind::Answer => {
                self.expect_signaling(
                    "set_remote_description(answer)",
                    SignalingState::HaveLocalOffer,
                )?;
                SignalingState::Stable
            }
        };

        self.driver.set_remote_description(desc).await?;
        self.has_remote_description.store(true, Ordering::Release);
        self.set_signaling_state(next).await;

        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = self.driver.add_ice_candidate(&candidate).await {
                warn!(peer_id = %self.peer_id, error = %e, "queued ICE candidate rejected");
            }
        }
        Ok(())
    }

    /// Apply a trickled remote candidate. Candidates that beat the remote
    /// description here are held until it is set.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let _negotiating = self.negotiation.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if !self.has_remote_description.load(Ordering::Acquire) {
            trace!(peer_id = %self.peer_id, "queueing early ICE candidate");
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        Ok(self.driver.add_ice_candidate(&candidate).await?)
    }

    fn expect_signaling(
        &self,
        operation: &'static str,
        expected: SignalingState,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let state = self.signaling_state();
        if state != expected {
            return Err(ConnectionError::InvalidSignalingState { operation, state });
        }
        Ok(())
    }

    async fn set_signaling_state(&self, next: SignalingState) {
        let changed = {
            let mut state = self.signaling_state.write();
            std::mem::replace(&mut *state, next) != next
        };
        if changed {
            self.emit(ConnectionEvent::SignalingStateChanged(next)).await;
        }
    }

    // -- Teardown -------------------------------------------------------------

    /// Close every channel, then the session. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        info!(peer_id = %self.peer_id, "closing connection");

        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        for channel in channels {
            channel.transport_open.store(false, Ordering::Release);
            channel.outbound.lock().take();
            if channel.open.swap(false, Ordering::AcqRel) {
                self.emit(ConnectionEvent::ChannelClosed(channel.label.clone()))
                    .await;
            }
        }

        self.driver.close().await;
        self.pending_candidates.lock().clear();
        self.set_signaling_state(SignalingState::Closed).await;
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Closed))
            .await;
    }

    // -- Transport events -----------------------------------------------------

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            trace!(peer_id = %self.peer_id, "connection event dropped, no listener");
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::IceStateChanged(ice) => self.on_ice_state(ice).await,
            TransportEvent::ChannelOpened(label) => {
                if self.state() == ConnectionState::Closed {
                    return;
                }
                let channel = self.ensure_channel(&label, true);
                channel.transport_open.store(true, Ordering::Release);
                if self.state() == ConnectionState::Connected {
                    self.report_open(&channel).await;
                }
            }
            TransportEvent::ChannelClosed(label) => {
                let channel = self.channels.read().get(&label).cloned();
                if let Some(channel) = channel {
                    channel.transport_open.store(false, Ordering::Release);
                    self.report_closed(&channel).await;
                }
            }
            TransportEvent::Frame { label, frame } => {
                if self.state() == ConnectionState::Closed {
                    return;
                }
                self.emit(ConnectionEvent::MessageReceived {
                    label,
                    payload: frame,
                })
                .await;
            }
            TransportEvent::LocalCandidate(candidate) => {
                if !self.is_closed() {
                    self.emit(ConnectionEvent::LocalCandidate(candidate)).await;
                }
            }
        }
    }

    async fn on_ice_state(&self, ice: IceConnectionState) {
        let next = ConnectionState::from(ice);
        let changed = {
            let mut state = self.state.write();
            if state.is_terminal() {
                None
            } else if *state == next {
                Some(false)
            } else {
                *state = next;
                Some(true)
            }
        };
        let Some(changed) = changed else {
            trace!(peer_id = %self.peer_id, ?ice, "ignoring ICE signal on terminal connection");
            return;
        };

        self.emit(ConnectionEvent::IceStateChanged(ice)).await;
        if !changed {
            return;
        }

        debug!(peer_id = %self.peer_id, state = %next, "connection state changed");
        self.emit(ConnectionEvent::StateChanged(next)).await;

        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        match next {
            ConnectionState::Connected => {
                for channel in channels
                    .iter()
                    .filter(|c| c.transport_open.load(Ordering::Acquire))
                {
                    self.report_open(channel).await;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => {
                for channel in &channels {
                    self.report_closed(channel).await;
                }
                if next.is_terminal() {
                    for channel in &channels {
                        channel.outbound.lock().take();
                    }
                    self.set_signaling_state(SignalingState::Closed).await;
                }
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn report_open(&self, channel: &Channel) {
        if !channel.open.swap(true, Ordering::AcqRel) {
            debug!(peer_id = %self.peer_id, label = %channel.label, "channel open");
            self.emit(ConnectionEvent::ChannelOpened(channel.label.clone()))
                .await;
        }
    }

    async fn report_closed(&self, channel: &Channel) {
        if channel.open.swap(false, Ordering::AcqRel) {
            debug!(peer_id = %self.peer_id, label = %channel.label, "channel closed");
            self.emit(ConnectionEvent::ChannelClosed(channel.label.clone()))
                .await;
        }
    }

    // -- Tasks ----------------------------------------------------------------

    fn spawn_event_pump(conn: Weak<Self>, mut rx: mpsc::Receiver<TransportEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(conn) = conn.upgrade() else {
                    break;
                };
                conn.handle_transport_event(event).await;
            }
        });
    }

    fn spawn_outbound_pump(conn: Weak<Self>, label: String, mut rx: mpsc::Receiver<Frame>) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(driver) = conn.upgrade().map(|c| c.driver.clone()) else {
                    break;
                };
                if let Err(e) = driver.send(&label, frame).await {
                    warn!(label = %label, error = %e, "outbound frame dropped by transport");
                }
            }
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .field("signaling_state", &self.signaling_state())
            .field("channels", &self.channel_labels())
            .finish()
    }
}
