//! In-process loopback transport.
//!
//! [`MemoryNetwork`] pairs up drivers created for `(a, b)` and `(b, a)` and
//! connects them once both sides hold matching local and remote
//! descriptions, the way two ICE agents would after an offer/answer round
//! trip. Frames sent on one side come out of the other side's event queue,
//! in order. Tests and the demo binary use it in place of a real stack.
//!
//! Connectivity is emitted as `checking` then `connected`. Closing one side
//! makes the other report `disconnected` followed by `failed`, which is
//! what a browser reports once consent freshness runs out.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    Frame, IceCandidate, IceConnectionState, SdpKind, SessionDescription, SessionDriver,
    TransportError, TransportEvent, TransportFactory,
};
use crate::identity::PeerId;

const SDP_PREFIX: &str = "v=0 parley-memory";

/// Shared registry of loopback drivers. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    drivers: Mutex<HashMap<(PeerId, PeerId), Weak<MemoryDriver>>>,
    /// Serializes link-state mutation across both drivers of a pair.
    link_lock: Mutex<()>,
}

struct MemoryDriver {
    local: PeerId,
    remote: PeerId,
    network: Weak<NetworkInner>,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<DriverState>,
}

#[derive(Default)]
struct DriverState {
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    declared: BTreeSet<String>,
    open: BTreeSet<String>,
    linked: bool,
    closed: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an ICE state onto the driver `local` holds for `remote`, as if
    /// the transport had observed it. Returns `false` if no such driver is
    /// alive.
    pub async fn inject_ice_state(
        &self,
        local: &PeerId,
        remote: &PeerId,
        state: IceConnectionState,
    ) -> bool {
        match lookup(&self.inner, local, remote) {
            Some(driver) => {
                driver.emit(TransportEvent::IceStateChanged(state)).await;
                true
            }
            None => false,
        }
    }

    /// Number of live drivers. Used by tests to check for leaks.
    pub fn live_sessions(&self) -> usize {
        self.inner
            .drivers
            .lock()
            .values()
            .filter(|d| d.strong_count() > 0)
            .count()
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn SessionDriver> {
        let driver = Arc::new(MemoryDriver {
            local: local.clone(),
            remote: remote.clone(),
            network: Arc::downgrade(&self.inner),
            events,
            state: Mutex::new(DriverState::default()),
        });
        self.inner
            .drivers
            .lock()
            .insert((local.clone(), remote.clone()), Arc::downgrade(&driver));
        driver
    }
}

fn lookup(net: &NetworkInner, local: &PeerId, remote: &PeerId) -> Option<Arc<MemoryDriver>> {
    net.drivers
        .lock()
        .get(&(local.clone(), remote.clone()))
        .and_then(Weak::upgrade)
}

impl MemoryDriver {
    fn peer(&self) -> Option<Arc<MemoryDriver>> {
        let net = self.network.upgrade()?;
        lookup(&net, &self.remote, &self.local)
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!(
                "{} {}->{} session={}",
                SDP_PREFIX,
                self.local,
                self.remote,
                Uuid::new_v4()
            ),
        }
    }

    async fn emit(&self, event: TransportEvent) {
        // A dropped receiver means the connection is gone; nothing to tell.
        let _ = self.events.send(event).await;
    }

    /// Connect to the peer driver if both sides have completed the
    /// offer/answer exchange with each other's descriptions.
    async fn try_link(&self) {
        let Some(net) = self.network.upgrade() else {
            return;
        };
        let Some(peer) = self.peer() else {
            return;
        };

        let labels = {
            let _link = net.link_lock.lock();
            let mut mine = self.state.lock();
            if mine.linked || mine.closed {
                return;
            }
            let (Some(my_local), Some(my_remote)) = (&mine.local_desc, &mine.remote_desc) else {
                return;
            };

            let mut theirs = peer.state.lock();
            let matched = !theirs.closed
                && theirs.local_desc.as_ref().map(|d| &d.sdp) == Some(&my_remote.sdp)
                && theirs.remote_desc.as_ref().map(|d| &d.sdp) == Some(&my_local.sdp);
            if !matched {
                return;
            }

            let labels: BTreeSet<String> =
                mine.declared.union(&theirs.declared).cloned().collect();
            for side in [&mut *mine, &mut *theirs] {
                side.linked = true;
                side.declared.extend(labels.iter().cloned());
                side.open.extend(labels.iter().cloned());
            }
            labels
        };

        debug!(local = %self.local, remote = %self.remote, channels = labels.len(), "memory link up");
        for driver in [self, peer.as_ref()] {
            driver
                .emit(TransportEvent::IceStateChanged(IceConnectionState::Checking))
                .await;
            driver
                .emit(TransportEvent::IceStateChanged(IceConnectionState::Connected))
                .await;
            for label in &labels {
                driver
                    .emit(TransportEvent::ChannelOpened(label.clone()))
                    .await;
            }
        }
    }
}

#[async_trait]
impl SessionDriver for MemoryDriver {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match &state.remote_desc {
            Some(d) if d.kind == SdpKind::Offer => Ok(self.description(SdpKind::Answer)),
            _ => Err(TransportError::InvalidDescription(
                "answer requires a remote offer".into(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.local_desc = Some(desc.clone());
        }

        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 memory/{} 9 typ host", self.local),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }))
        .await;

        self.try_link().await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        if !desc.sdp.starts_with(SDP_PREFIX) {
            return Err(TransportError::InvalidDescription(
                "not a memory session description".into(),
            ));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.remote_desc = Some(desc.clone());
        }
        self.try_link().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidCandidate(candidate.candidate.clone()));
        }
        let state = self.state.lock();
        if state.remote_desc.is_none() {
            return Err(TransportError::InvalidCandidate(
                "no remote description".into(),
            ));
        }
        trace!(local = %self.local, remote = %self.remote, "remote candidate accepted");
        Ok(())
    }

    async fn open_channel(&self, label: &str, _ordered: bool) -> Result<(), TransportError> {
        let peer = self.peer();
        let opened = {
            let Some(net) = self.network.upgrade() else {
                return Err(TransportError::Closed);
            };
            let _link = net.link_lock.lock();
            let mut mine = self.state.lock();
            if mine.closed {
                return Err(TransportError::Closed);
            }
            mine.declared.insert(label.to_string());
            if !mine.linked {
                // Opened on both sides when the link comes up.
                return Ok(());
            }

            let mut opened = Vec::new();
            if mine.open.insert(label.to_string()) {
                opened.push(true);
            }
            if let Some(peer) = &peer {
                let mut theirs = peer.state.lock();
                theirs.declared.insert(label.to_string());
                if theirs.open.insert(label.to_string()) {
                    opened.push(false);
                }
            }
            opened
        };

        for is_local in opened {
            let event = TransportEvent::ChannelOpened(label.to_string());
            match (is_local, &peer) {
                (true, _) => self.emit(event).await,
                (false, Some(peer)) => peer.emit(event).await,
                (false, None) => {}
            }
        }
        Ok(())
    }

    async fn send(&self, label: &str, frame: Frame) -> Result<(), TransportError> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if !state.linked || !state.open.contains(label) {
                return Err(TransportError::ChannelUnavailable(label.to_string()));
            }
        }
        let peer = self.peer().ok_or(TransportError::Closed)?;
        peer.events
            .send(TransportEvent::Frame {
                label: label.to_string(),
                frame,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let was_linked = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open.clear();
            std::mem::replace(&mut state.linked, false)
        };
        if !was_linked {
            return;
        }

        let Some(peer) = self.peer() else {
            return;
        };
        let closed: Vec<String> = {
            let mut theirs = peer.state.lock();
            theirs.linked = false;
            std::mem::take(&mut theirs.open).into_iter().collect()
        };
        debug!(local = %self.local, remote = %self.remote, "memory link closed");
        for label in closed {
            peer.emit(TransportEvent::ChannelClosed(label)).await;
        }
        peer.emit(TransportEvent::IceStateChanged(IceConnectionState::Disconnected))
            .await;
        peer.emit(TransportEvent::IceStateChanged(IceConnectionState::Failed))
            .await;
    }
}
