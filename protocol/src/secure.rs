//! # Secure Channel
//!
//! Glue between the protocols and the wire. Outbound, a typed protocol
//! message is serialized to JSON, sealed for the peer and sent as a text
//! frame carrying the JSON envelope; a file chunk is sealed and sent as a
//! binary frame carrying the binary envelope. Inbound, [`SecureChannel::open`]
//! reverses this and nothing downstream ever sees a frame that failed the
//! integrity check.
//!
//! The protocols talk to the wire only through [`PeerLink`], so they can be
//! tested against an in-memory link with no connection at all.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{CryptoError, EncryptedEnvelope, PeerEncryptionService};
use crate::identity::PeerId;
use crate::network::{ConnectionManager, ManagerError};
use crate::trade::TradeMessage;
use crate::transfer::FileMessage;
use crate::transport::Frame;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Every message that travels inside a text-frame envelope.
///
/// Both protocols tag their messages with a `type` field whose values do
/// not overlap, so the outer enum needs no tag of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    File(FileMessage),
    Trade(TradeMessage),
}

impl From<FileMessage> for WireMessage {
    fn from(msg: FileMessage) -> Self {
        WireMessage::File(msg)
    }
}

impl From<TradeMessage> for WireMessage {
    fn from(msg: TradeMessage) -> Self {
        WireMessage::Trade(msg)
    }
}

/// A decrypted inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(WireMessage),
    Chunk(Bytes),
}

/// What the protocols need from the wire.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send_message(&self, peer_id: &PeerId, message: WireMessage) -> Result<(), LinkError>;

    /// Send one file chunk. Waits for channel capacity.
    async fn send_chunk(&self, peer_id: &PeerId, chunk: Bytes) -> Result<(), LinkError>;
}

/// [`PeerLink`] over a connection manager and an encryption service.
#[derive(Clone)]
pub struct SecureChannel {
    manager: ConnectionManager,
    crypto: Arc<PeerEncryptionService>,
    label: String,
}

impl SecureChannel {
    /// Uses the manager's default channel.
    pub fn new(manager: ConnectionManager, crypto: Arc<PeerEncryptionService>) -> Self {
        let label = manager.config().default_channel.clone();
        Self {
            manager,
            crypto,
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn seal_message(&self, peer_id: &PeerId, message: &WireMessage) -> Result<Frame, LinkError> {
        let plaintext =
            serde_json::to_vec(message).map_err(|e| LinkError::Encode(e.to_string()))?;
        let envelope = self.crypto.encrypt_for_peer(peer_id, &plaintext)?;
        let json = envelope
            .to_json()
            .map_err(|e| LinkError::Encode(e.to_string()))?;
        Ok(Frame::Text(json))
    }

    pub fn seal_chunk(&self, peer_id: &PeerId, chunk: &[u8]) -> Result<Frame, LinkError> {
        let envelope = self.crypto.encrypt_for_peer(peer_id, chunk)?;
        Ok(Frame::Binary(Bytes::from(envelope.to_bytes())))
    }

    /// Decrypt and decode one inbound frame from `peer_id`.
    pub fn open(&self, peer_id: &PeerId, frame: &Frame) -> Result<Inbound, LinkError> {
        match frame {
            Frame::Text(text) => {
                let envelope = EncryptedEnvelope::from_json(text)
                    .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
                let plaintext = self.crypto.decrypt_from_peer(peer_id, &envelope)?;
                let message = serde_json::from_slice(&plaintext)
                    .map_err(|e| LinkError::Decode(e.to_string()))?;
                Ok(Inbound::Message(message))
            }
            Frame::Binary(bytes) => {
                let envelope = EncryptedEnvelope::from_bytes(bytes)
                    .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
                let plaintext = self.crypto.decrypt_from_peer(peer_id, &envelope)?;
                Ok(Inbound::Chunk(Bytes::from(plaintext)))
            }
        }
    }
}

#[async_trait]
impl PeerLink for SecureChannel {
    async fn send_message(&self, peer_id: &PeerId, message: WireMessage) -> Result<(), LinkError> {
        let frame = self.seal_message(peer_id, &message)?;
        self.manager.send_async(peer_id, &self.label, frame).await?;
        Ok(())
    }

    async fn send_chunk(&self, peer_id: &PeerId, chunk: Bytes) -> Result<(), LinkError> {
        let frame = self.seal_chunk(peer_id, &chunk)?;
        self.manager.send_async(peer_id, &self.label, frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CryptoConfig, ManagerConfig};
    use crate::crypto::MemoryKeyStore;
    use crate::signaling::MemorySignalingHub;
    use crate::trade::Asset;
    use crate::transport::MemoryNetwork;
    use uuid::Uuid;

    fn crypto() -> Arc<PeerEncryptionService> {
        let svc = PeerEncryptionService::new(Arc::new(MemoryKeyStore::new()), CryptoConfig::default());
        svc.initialize(false).unwrap();
        Arc::new(svc)
    }

    fn channel(id: &str, crypto: Arc<PeerEncryptionService>) -> SecureChannel {
        let hub = MemorySignalingHub::new();
        let (signaling, _rx) = hub.register(&id.into());
        let (manager, _events) = ConnectionManager::new(
            id.into(),
            ManagerConfig::default(),
            Arc::new(signaling),
            Arc::new(MemoryNetwork::new()),
        );
        SecureChannel::new(manager, crypto)
    }

    fn introduce(a: &PeerEncryptionService, a_id: &str, b: &PeerEncryptionService, b_id: &str) {
        a.add_peer_public_key(&b_id.into(), &b.get_public_key().unwrap(), true)
            .unwrap();
        b.add_peer_public_key(&a_id.into(), &a.get_public_key().unwrap(), true)
            .unwrap();
    }

    #[test]
    fn test_wire_message_dispatches_on_type() {
        let file: WireMessage = serde_json::from_str(&format!(
            r#"{{"type":"file_complete","transferId":"{}"}}"#,
            Uuid::nil()
        ))
        .unwrap();
        assert!(matches!(file, WireMessage::File(FileMessage::FileComplete { .. })));

        let trade: WireMessage =
            serde_json::from_str(r#"{"type":"trade_completion","tradeId":"t1"}"#).unwrap();
        assert!(matches!(trade, WireMessage::Trade(TradeMessage::TradeCompletion { .. })));

        assert!(serde_json::from_str::<WireMessage>(r#"{"type":"chat","text":"hi"}"#).is_err());
    }

    #[tokio::test]
    async fn test_message_and_chunk_roundtrip() {
        let (ca, cb) = (crypto(), crypto());
        introduce(&ca, "alice", &cb, "bob");
        let alice = channel("alice", ca);
        let bob = channel("bob", cb);

        let msg = WireMessage::Trade(TradeMessage::TradeRequest {
            trade_id: "t1".into(),
            offered_asset: Asset::new("BTC", 50_000_000),
            requested_asset: Asset::new("ETH", 12_000_000_000),
        });
        let frame = alice.seal_message(&"bob".into(), &msg).unwrap();
        assert!(!frame.is_binary());
        assert_eq!(bob.open(&"alice".into(), &frame).unwrap(), Inbound::Message(msg));

        let frame = alice.seal_chunk(&"bob".into(), &[9u8; 1000]).unwrap();
        assert!(frame.is_binary());
        assert_eq!(
            bob.open(&"alice".into(), &frame).unwrap(),
            Inbound::Chunk(Bytes::from(vec![9u8; 1000]))
        );
    }

    #[tokio::test]
    async fn test_stranger_frames_are_rejected() {
        let (ca, cb) = (crypto(), crypto());
        // Bob knows nothing about alice.
        ca.add_peer_public_key(&"bob".into(), &cb.get_public_key().unwrap(), false)
            .unwrap();
        let alice = channel("alice", ca);
        let bob = channel("bob", cb);

        let frame = alice
            .seal_message(
                &"bob".into(),
                &WireMessage::Trade(TradeMessage::TradeCompletion {
                    trade_id: "t1".into(),
                }),
            )
            .unwrap();
        assert!(matches!(
            bob.open(&"alice".into(), &frame),
            Err(LinkError::Crypto(CryptoError::UnknownPeer(_)))
        ));
    }

    #[tokio::test]
    async fn test_garbage_frames_are_malformed() {
        let c = crypto();
        c.add_peer_public_key(&"alice".into(), &crypto().get_public_key().unwrap(), false)
            .unwrap();
        let bob = channel("bob", c);

        assert!(matches!(
            bob.open(&"alice".into(), &Frame::Text("not json".into())),
            Err(LinkError::Crypto(CryptoError::MalformedEnvelope(_)))
        ));
        assert!(matches!(
            bob.open(&"alice".into(), &Frame::Binary(Bytes::from_static(b"short"))),
            Err(LinkError::Crypto(CryptoError::MalformedEnvelope(_)))
        ));
    }

    #[tokio::test]
    async fn test_sending_without_connection_fails() {
        let (ca, cb) = (crypto(), crypto());
        introduce(&ca, "alice", &cb, "bob");
        let alice = channel("alice", ca);
        let err = alice
            .send_message(
                &"bob".into(),
                TradeMessage::TradeCompletion {
                    trade_id: "t1".into(),
                }
                .into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Manager(ManagerError::NotConnected(_))));
    }
}
