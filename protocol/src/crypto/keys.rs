//! # Key Management
//!
//! X25519 identity keys for Parley nodes.
//!
//! Every node owns exactly one long-lived [`IdentityKeypair`]. Its public
//! half is handed to peers out of band (QR code, order-book profile, a
//! trusted relay) as a 64-character hex string; peers register it with
//! their encryption service and from then on can seal envelopes only this
//! node can open.
//!
//! The identity is never used to encrypt directly. Senders pair it with a
//! fresh ephemeral secret per message (see [`super::agreement`]), so the
//! identity secret only ever appears on the receiving side of a
//! Diffie-Hellman.
//!
//! ## Security considerations
//!
//! - Secrets come from `OsRng`.
//! - `StaticSecret` zeroizes on drop.
//! - Key bytes are never logged. `Debug` prints the public half only.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::config::X25519_KEY_LENGTH;

/// Errors that can occur while parsing key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid public key: expected {X25519_KEY_LENGTH} hex-encoded bytes")]
    InvalidPublicKey,

    #[error("invalid secret key: expected {X25519_KEY_LENGTH} bytes")]
    InvalidSecretKey,
}

/// The local node's long-lived X25519 key pair.
///
/// Like the signing keys it replaced, this type deliberately does not
/// implement `Serialize`. Persisting it goes through
/// [`secret_bytes`](Self::secret_bytes) and the key store, explicitly.
#[derive(Clone)]
pub struct IdentityKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

/// A peer's X25519 public key, in the form that travels between nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerPublicKey {
    bytes: [u8; X25519_KEY_LENGTH],
}

impl IdentityKeypair {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild an identity from persisted secret bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild an identity from a byte slice of unknown length.
    pub fn try_from_secret_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; X25519_KEY_LENGTH] =
            slice.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Raw secret bytes. Only the key store should need these.
    pub fn secret_bytes(&self) -> [u8; X25519_KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// The public half.
    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey {
            bytes: self.public.to_bytes(),
        }
    }

    /// The public half in the exchange format (lower-case hex).
    pub fn exported_public_key(&self) -> String {
        self.public_key().to_hex()
    }

    /// X25519 with a peer's public key. Used on the receiving side of an
    /// envelope, where the peer key is the sender's ephemeral.
    pub(crate) fn diffie_hellman(&self, peer: &PeerPublicKey) -> SharedSecret {
        self.secret.diffie_hellman(&peer.to_dalek())
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeypair(pub={})", self.public_key().to_hex())
    }
}

impl PartialEq for IdentityKeypair {
    /// Identities compare by public key; secrets are not compared.
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for IdentityKeypair {}

// ---------------------------------------------------------------------------
// PeerPublicKey
// ---------------------------------------------------------------------------

impl PeerPublicKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    /// Parse a key from a slice, checking the length.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; X25519_KEY_LENGTH] =
            slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Import a key in the exchange format produced by
    /// [`IdentityKeypair::exported_public_key`]. Surrounding whitespace is
    /// ignored; upper-case hex is accepted.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    /// Export in the exchange format.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_LENGTH] {
        &self.bytes
    }

    pub(crate) fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.bytes)
    }
}

impl From<PublicKey> for PeerPublicKey {
    fn from(key: PublicKey) -> Self {
        Self {
            bytes: key.to_bytes(),
        }
    }
}

impl fmt::Display for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPublicKey({})", &self.to_hex()[..16])
    }
}
