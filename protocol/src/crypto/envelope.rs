//! # Encrypted Envelope
//!
//! The self-contained unit every payload travels in. Given the recipient's
//! identity secret, an envelope carries everything needed to open it: the
//! sender's ephemeral public key, the IV, the ciphertext and an integrity
//! tag. Nothing about a previous envelope is needed to open the next one.
//!
//! ## Integrity tag
//!
//! `tag = BLAKE3-keyed(integrity_key, iv || ciphertext)`, where
//! `integrity_key` comes out of the same key agreement as the AES key. A
//! relay that flips bits cannot recompute the tag without the DH secret, so
//! the tag detects forgery and not only corruption. The tag is checked
//! before AES-GCM runs, and compared in constant time (`blake3::Hash`'s
//! `PartialEq` is constant-time).
//!
//! ## Encodings
//!
//! Text frames carry the envelope as JSON with hex-encoded byte fields:
//!
//! ```json
//! {"version":1,"iv":"…","ephemeralPublicKey":"…","ciphertext":"…","integrityTag":"…"}
//! ```
//!
//! Binary frames (file chunks) use a fixed layout so a 16 KiB chunk does
//! not double in size:
//!
//! ```text
//! version(1) || ephemeral_public_key(32) || iv(12) || integrity_tag(32) || ciphertext
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::agreement::{self, AgreementError};
use super::encryption::{self, EncryptionError};
use super::keys::{IdentityKeypair, PeerPublicKey};
use crate::config::{
    AES_NONCE_LENGTH, AES_TAG_LENGTH, ENVELOPE_HEADER_LENGTH, ENVELOPE_VERSION,
    INTEGRITY_TAG_LENGTH, X25519_KEY_LENGTH,
};

/// Why an envelope could not be sealed or opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("integrity tag mismatch")]
    IntegrityMismatch,

    #[error("key agreement failed: {0}")]
    Agreement(#[from] AgreementError),

    #[error(transparent)]
    Cipher(#[from] EncryptionError),
}

/// A sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub version: u8,
    #[serde(with = "hex::serde")]
    pub iv: [u8; AES_NONCE_LENGTH],
    #[serde(with = "hex::serde")]
    pub ephemeral_public_key: [u8; X25519_KEY_LENGTH],
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub integrity_tag: [u8; INTEGRITY_TAG_LENGTH],
}

impl EncryptedEnvelope {
    /// Seal `plaintext` for the holder of `recipient`'s identity secret.
    pub fn seal(recipient: &PeerPublicKey, plaintext: &[u8]) -> Result<Self, EnvelopeError> {
        let (ephemeral, keys) = agreement::sender_keys(recipient)?;
        let ephemeral_public_key = *ephemeral.as_bytes();

        let aad = associated_data(ENVELOPE_VERSION, &ephemeral_public_key);
        let (iv, ciphertext) = encryption::seal(keys.cipher_key(), plaintext, &aad)?;
        let integrity_tag = integrity_tag(keys.integrity_key(), &iv, &ciphertext);

        Ok(Self {
            version: ENVELOPE_VERSION,
            iv,
            ephemeral_public_key,
            ciphertext,
            integrity_tag,
        })
    }

    /// Open with the local identity.
    ///
    /// Order of checks: version, ciphertext length, key agreement, integrity
    /// tag, then AES-GCM. No plaintext is produced unless all pass.
    pub fn open(&self, identity: &IdentityKeypair) -> Result<Vec<u8>, EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::Malformed(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.ciphertext.len() < AES_TAG_LENGTH {
            return Err(EnvelopeError::Malformed("ciphertext too short".into()));
        }

        let ephemeral = PeerPublicKey::from_bytes(self.ephemeral_public_key);
        let keys = agreement::recipient_keys(identity, &ephemeral)?;

        let expected = blake3::Hash::from(integrity_tag(
            keys.integrity_key(),
            &self.iv,
            &self.ciphertext,
        ));
        if expected != blake3::Hash::from(self.integrity_tag) {
            return Err(EnvelopeError::IntegrityMismatch);
        }

        let aad = associated_data(self.version, &self.ephemeral_public_key);
        Ok(encryption::open(
            keys.cipher_key(),
            &self.iv,
            &self.ciphertext,
            &aad,
        )?)
    }

    /// JSON text encoding.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Parse the JSON text encoding.
    pub fn from_json(s: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(s).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Fixed binary encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LENGTH + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.ephemeral_public_key);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.integrity_tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the fixed binary encoding.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() < ENVELOPE_HEADER_LENGTH {
            return Err(EnvelopeError::Malformed(format!(
                "binary envelope is {} bytes, header alone is {}",
                data.len(),
                ENVELOPE_HEADER_LENGTH
            )));
        }

        let (version, rest) = data.split_at(1);
        let (ephemeral, rest) = rest.split_at(X25519_KEY_LENGTH);
        let (iv, rest) = rest.split_at(AES_NONCE_LENGTH);
        let (tag, ciphertext) = rest.split_at(INTEGRITY_TAG_LENGTH);

        let malformed = |_| EnvelopeError::Malformed("bad field length".into());
        Ok(Self {
            version: version[0],
            ephemeral_public_key: ephemeral.try_into().map_err(malformed)?,
            iv: iv.try_into().map_err(malformed)?,
            integrity_tag: tag.try_into().map_err(malformed)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

fn associated_data(version: u8, ephemeral_public_key: &[u8; X25519_KEY_LENGTH]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + X25519_KEY_LENGTH);
    aad.push(version);
    aad.extend_from_slice(ephemeral_public_key);
    aad
}

fn integrity_tag(
    key: &[u8; 32],
    iv: &[u8; AES_NONCE_LENGTH],
    ciphertext: &[u8],
) -> [u8; INTEGRITY_TAG_LENGTH] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(iv);
    hasher.update(ciphertext);
    *hasher.finalize().as_bytes()
}
