//! # Session Transport
//!
//! The NAT-traversing session a [`Connection`](crate::network::Connection)
//! drives lives outside this crate. A WebRTC stack, a QUIC hole-puncher or
//! the in-memory [`MemoryNetwork`] all plug in through two traits:
//!
//! - [`TransportFactory`] creates one [`SessionDriver`] per connection and
//!   hands it the sender half of that connection's transport event queue.
//! - [`SessionDriver`] exposes the offer/answer/candidate dance, channel
//!   creation and framed sends.
//!
//! Everything the transport wants to tell the connection (ICE state,
//! channels opening or closing, inbound frames, local candidates) arrives
//! as a [`TransportEvent`] on that queue. Drivers never call back into the
//! connection directly.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::PeerId;

pub use memory::MemoryNetwork;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("channel {0:?} is not open on the transport")]
    ChannelUnavailable(String),

    #[error("transport session is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Wire-level Types
// ---------------------------------------------------------------------------

/// One message on a channel. Text carries JSON envelopes; binary carries
/// file chunks.
#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Text(s) => write!(f, "Frame::Text({} bytes)", s.len()),
            Frame::Binary(b) => write!(f, "Frame::Binary({} bytes)", b.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP offer or answer, opaque to everything except the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// ICE connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// What a driver reports to its connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceStateChanged(IceConnectionState),
    ChannelOpened(String),
    ChannelClosed(String),
    Frame { label: String, frame: Frame },
    LocalCandidate(IceCandidate),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One peer session.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: &SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Declare a channel. It is reported open through
    /// [`TransportEvent::ChannelOpened`] once the session can carry it.
    async fn open_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError>;

    /// Deliver one frame. Resolves once the transport has accepted it.
    async fn send(&self, label: &str, frame: Frame) -> Result<(), TransportError>;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

/// Creates sessions. One call per [`Connection`](crate::network::Connection).
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn SessionDriver>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_debug_hides_content() {
        let frame = Frame::Text("{\"secret\":1}".into());
        assert_eq!(format!("{:?}", frame), "Frame::Text(12 bytes)");
        assert!(Frame::Binary(Bytes::new()).is_empty());
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_description_type_field() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json["type"], "offer");
    }
}
