//! # Peer Encryption Service
//!
//! Owns the local identity and the registry of peer public keys, and turns
//! plaintext into [`EncryptedEnvelope`]s for a named peer and back.
//!
//! The service never touches the transport. It is shared between the
//! secure channel and whoever imports peer keys, through an `Arc`; both the
//! identity slot and the registry sit behind `parking_lot::RwLock`, since
//! every connection reads the registry concurrently while mutation (a new
//! peer key, a regenerated identity) is rare.
//!
//! Every failure here is scoped to one message. An unknown peer, a
//! malformed envelope or a bad tag is reported to the caller and changes
//! nothing else.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::envelope::{EncryptedEnvelope, EnvelopeError};
use super::keys::{IdentityKeypair, PeerPublicKey};
use super::store::{KeyStore, StoreError, StoredIdentity};
use crate::config::CryptoConfig;
use crate::identity::PeerId;

/// Per-message and lifecycle errors of the encryption service.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption service is not initialized")]
    NotInitialized,

    #[error("no public key registered for peer {0}")]
    UnknownPeer(PeerId),

    #[error("malformed public key for peer {0}")]
    MalformedKey(PeerId),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("envelope integrity check failed")]
    IntegrityMismatch,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

/// A registered peer key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKeyEntry {
    pub peer_id: PeerId,
    pub public_key: PeerPublicKey,
    pub last_used_at: DateTime<Utc>,
    /// Application-level marker (e.g. key verified in person). The service
    /// encrypts to untrusted keys just the same.
    pub trusted: bool,
}

pub struct PeerEncryptionService {
    store: Arc<dyn KeyStore>,
    config: CryptoConfig,
    identity: RwLock<Option<IdentityKeypair>>,
    peers: RwLock<HashMap<PeerId, PeerKeyEntry>>,
}

impl PeerEncryptionService {
    pub fn new(store: Arc<dyn KeyStore>, config: CryptoConfig) -> Self {
        Self {
            store,
            config,
            identity: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Load the persisted identity, or generate and persist a new one.
    ///
    /// Idempotent: a second call returns the key already loaded. With
    /// `force_new_keys` a fresh identity replaces whatever was stored.
    /// Returns the exported public key.
    pub fn initialize(&self, force_new_keys: bool) -> Result<String, CryptoError> {
        if !force_new_keys {
            if let Some(kp) = self.identity.read().as_ref() {
                return Ok(kp.exported_public_key());
            }
            if let Some(bytes) = self.store.load(&self.config.storage_key)? {
                let keypair = StoredIdentity::decode(&bytes)?.to_keypair();
                let exported = keypair.exported_public_key();
                info!(public_key = %exported, "loaded persisted identity");
                *self.identity.write() = Some(keypair);
                return Ok(exported);
            }
        }

        let keypair = IdentityKeypair::generate();
        let record = StoredIdentity::from_keypair(&keypair);
        self.store.save(&self.config.storage_key, &record.encode()?)?;

        let exported = keypair.exported_public_key();
        info!(public_key = %exported, forced = force_new_keys, "generated new identity");
        *self.identity.write() = Some(keypair);
        Ok(exported)
    }

    /// The local identity's exported public key, if initialized.
    pub fn get_public_key(&self) -> Option<String> {
        self.identity
            .read()
            .as_ref()
            .map(IdentityKeypair::exported_public_key)
    }

    /// Register (or replace) a peer's public key. Last write wins.
    pub fn add_peer_public_key(
        &self,
        peer_id: &PeerId,
        exported_key: &str,
        trusted: bool,
    ) -> Result<(), CryptoError> {
        let public_key = PeerPublicKey::from_hex(exported_key)
            .map_err(|_| CryptoError::MalformedKey(peer_id.clone()))?;

        let entry = PeerKeyEntry {
            peer_id: peer_id.clone(),
            public_key,
            last_used_at: Utc::now(),
            trusted,
        };
        if let Some(previous) = self.peers.write().insert(peer_id.clone(), entry) {
            if previous.public_key != public_key {
                warn!(peer_id = %peer_id, "peer public key replaced");
            }
        }
        debug!(peer_id = %peer_id, trusted, "peer public key registered");
        Ok(())
    }

    /// Forget a peer's key. Returns whether one was registered.
    pub fn remove_peer_public_key(&self, peer_id: &PeerId) -> bool {
        self.peers.write().remove(peer_id).is_some()
    }

    /// Flip the application trust marker. Returns `false` for unknown peers.
    pub fn set_trusted(&self, peer_id: &PeerId, trusted: bool) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(entry) => {
                entry.trusted = trusted;
                true
            }
            None => false,
        }
    }

    pub fn peer_entry(&self, peer_id: &PeerId) -> Option<PeerKeyEntry> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Seal `plaintext` for `peer_id` with a fresh ephemeral key and IV.
    pub fn encrypt_for_peer(
        &self,
        peer_id: &PeerId,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let recipient = self.touch(peer_id)?;

        EncryptedEnvelope::seal(&recipient, plaintext).map_err(|e| match e {
            EnvelopeError::Agreement(_) => CryptoError::MalformedKey(peer_id.clone()),
            other => CryptoError::EncryptionFailed(other.to_string()),
        })
    }

    /// Open an envelope that `peer_id` sealed for us.
    ///
    /// The peer must be registered even though its static key takes no part
    /// in the agreement: envelopes from strangers are refused outright.
    pub fn decrypt_from_peer(
        &self,
        peer_id: &PeerId,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        self.touch(peer_id)?;

        let identity = self.identity.read();
        let identity = identity.as_ref().ok_or(CryptoError::NotInitialized)?;

        envelope.open(identity).map_err(|e| {
            warn!(peer_id = %peer_id, error = %e, "rejected envelope");
            match e {
                EnvelopeError::Malformed(reason) => CryptoError::MalformedEnvelope(reason),
                EnvelopeError::Agreement(a) => CryptoError::MalformedEnvelope(a.to_string()),
                EnvelopeError::IntegrityMismatch => CryptoError::IntegrityMismatch,
                EnvelopeError::Cipher(_) => CryptoError::DecryptionFailed,
            }
        })
    }

    /// Drop the identity, its persisted record and the whole registry.
    pub fn clear(&self) -> Result<(), CryptoError> {
        self.store.remove(&self.config.storage_key)?;
        *self.identity.write() = None;
        self.peers.write().clear();
        info!("encryption service cleared");
        Ok(())
    }

    /// Look a peer up and bump `last_used_at`.
    fn touch(&self, peer_id: &PeerId) -> Result<PeerPublicKey, CryptoError> {
        if self.identity.read().is_none() {
            return Err(CryptoError::NotInitialized);
        }
        let mut peers = self.peers.write();
        let entry = peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::UnknownPeer(peer_id.clone()))?;
        entry.last_used_at = Utc::now();
        Ok(entry.public_key)
    }
}

impl std::fmt::Debug for PeerEncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEncryptionService")
            .field("public_key", &self.get_public_key())
            .field("peers", &self.peers.read().len())
            .finish()
    }
}
