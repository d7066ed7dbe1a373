//! In-process signaling relay.
//!
//! Every registered peer gets an inbox. Sending to a peer pushes a
//! [`SignalingEvent`] stamped with the sender's id into that inbox.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{SignalingError, SignalingEvent, SignalingTransport};
use crate::config::EVENT_QUEUE_CAPACITY;
use crate::identity::PeerId;
use crate::transport::IceCandidate;

#[derive(Clone, Default)]
pub struct MemorySignalingHub {
    inboxes: Arc<DashMap<PeerId, mpsc::Sender<SignalingEvent>>>,
}

/// One peer's handle on the hub.
#[derive(Clone)]
pub struct MemorySignaling {
    local: PeerId,
    hub: MemorySignalingHub,
}

impl MemorySignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` and return its outbound handle plus inbox. A second
    /// registration replaces the first inbox.
    pub fn register(&self, peer: &PeerId) -> (MemorySignaling, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        self.inboxes.insert(peer.clone(), tx);
        (
            MemorySignaling {
                local: peer.clone(),
                hub: self.clone(),
            },
            rx,
        )
    }

    pub fn unregister(&self, peer: &PeerId) {
        self.inboxes.remove(peer);
    }

    async fn deliver(&self, to: &PeerId, event: SignalingEvent) -> Result<(), SignalingError> {
        let inbox = self
            .inboxes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SignalingError::Unreachable(to.clone()))?;
        inbox
            .send(event)
            .await
            .map_err(|_| SignalingError::Unreachable(to.clone()))
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn send_offer(&self, to: &PeerId, sdp: &str) -> Result<(), SignalingError> {
        let event = SignalingEvent::Offer {
            from: self.local.clone(),
            sdp: sdp.to_string(),
        };
        self.hub.deliver(to, event).await
    }

    async fn send_answer(&self, to: &PeerId, sdp: &str) -> Result<(), SignalingError> {
        let event = SignalingEvent::Answer {
            from: self.local.clone(),
            sdp: sdp.to_string(),
        };
        self.hub.deliver(to, event).await
    }

    async fn send_ice_candidate(
        &self,
        to: &PeerId,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        let event = SignalingEvent::IceCandidate {
            from: self.local.clone(),
            candidate: candidate.clone(),
        };
        self.hub.deliver(to, event).await
    }
}
