//! # Signaling
//!
//! Before two peers can open a session they have to swap an offer, an
//! answer and a handful of ICE candidates through some relay they can both
//! reach. That relay is not ours: a WebSocket server, an order-book
//! message bus, a QR code. It is abstracted here as [`SignalingTransport`]
//! for the outbound direction and [`SignalingEvent`] for what comes back,
//! which the caller feeds to
//! [`ConnectionManager::handle_signal`](crate::network::ConnectionManager::handle_signal).

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PeerId;
use crate::transport::IceCandidate;

pub use memory::{MemorySignaling, MemorySignalingHub};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("peer {0} is not reachable through the relay")]
    Unreachable(PeerId),

    #[error("signaling relay closed")]
    Closed,
}

/// Outbound half of the relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send_offer(&self, to: &PeerId, sdp: &str) -> Result<(), SignalingError>;

    async fn send_answer(&self, to: &PeerId, sdp: &str) -> Result<(), SignalingError>;

    async fn send_ice_candidate(
        &self,
        to: &PeerId,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError>;
}

/// Inbound relay traffic, tagged with the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    Offer { from: PeerId, sdp: String },
    Answer { from: PeerId, sdp: String },
    IceCandidate { from: PeerId, candidate: IceCandidate },
}

impl SignalingEvent {
    pub fn from(&self) -> &PeerId {
        match self {
            SignalingEvent::Offer { from, .. }
            | SignalingEvent::Answer { from, .. }
            | SignalingEvent::IceCandidate { from, .. } => from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEvent::Offer { .. } => "offer",
            SignalingEvent::Answer { .. } => "answer",
            SignalingEvent::IceCandidate { .. } => "ice_candidate",
        }
    }
}
