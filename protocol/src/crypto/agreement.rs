//! # Per-Envelope Key Agreement
//!
//! One-sided ephemeral-static X25519. The sender draws a fresh ephemeral
//! secret for every envelope, agrees with the recipient's long-lived
//! identity key, and throws the ephemeral away. The recipient repeats the
//! agreement with its identity secret and the ephemeral public key carried
//! in the envelope.
//!
//! The raw DH output goes through BLAKE3 `derive_key` twice, under two
//! distinct contexts, producing the AES key and the integrity key. Both
//! derivations also absorb the ephemeral and recipient public keys, so a
//! derived key is bound to exactly one (ephemeral, recipient) pair:
//!
//! ```text
//! cipher_key    = BLAKE3-derive-key(CIPHER_CONTEXT,    dh || eph_pub || recipient_pub)
//! integrity_key = BLAKE3-derive-key(INTEGRITY_CONTEXT, dh || eph_pub || recipient_pub)
//! ```
//!
//! No canonical key ordering is needed. The roles are asymmetric and both
//! sides know which key is the ephemeral.

use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

use super::keys::{IdentityKeypair, PeerPublicKey};
use crate::config::{
    AES_KEY_LENGTH, ENVELOPE_CIPHER_CONTEXT, ENVELOPE_INTEGRITY_CONTEXT, X25519_KEY_LENGTH,
};

/// Errors in the key agreement step.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgreementError {
    /// The other key is a low-order point; the DH output would be all
    /// zeroes and carry no secret.
    #[error("key agreement produced a non-contributory shared secret")]
    NonContributory,
}

/// The two symmetric keys protecting a single envelope.
pub struct EnvelopeKeys {
    cipher_key: [u8; AES_KEY_LENGTH],
    integrity_key: [u8; 32],
}

impl EnvelopeKeys {
    pub fn cipher_key(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.cipher_key
    }

    pub fn integrity_key(&self) -> &[u8; 32] {
        &self.integrity_key
    }
}

impl fmt::Debug for EnvelopeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeKeys(..)")
    }
}

/// Sender side: fresh ephemeral, agree with `recipient`.
///
/// Returns the ephemeral public key to embed in the envelope together with
/// the derived keys. The ephemeral secret is consumed by the DH and never
/// leaves this function.
pub fn sender_keys(
    recipient: &PeerPublicKey,
) -> Result<(PeerPublicKey, EnvelopeKeys), AgreementError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.to_dalek());

    let keys = derive(&shared, ephemeral_public.as_bytes(), recipient.as_bytes())?;
    Ok((PeerPublicKey::from(ephemeral_public), keys))
}

/// Recipient side: agree with the envelope's ephemeral key using our
/// identity secret.
pub fn recipient_keys(
    identity: &IdentityKeypair,
    ephemeral_public: &PeerPublicKey,
) -> Result<EnvelopeKeys, AgreementError> {
    let shared = identity.diffie_hellman(ephemeral_public);
    derive(
        &shared,
        ephemeral_public.as_bytes(),
        identity.public_key().as_bytes(),
    )
}

fn derive(
    shared: &SharedSecret,
    ephemeral_public: &[u8; X25519_KEY_LENGTH],
    recipient_public: &[u8; X25519_KEY_LENGTH],
) -> Result<EnvelopeKeys, AgreementError> {
    if !shared.was_contributory() {
        return Err(AgreementError::NonContributory);
    }

    let kdf = |context: &str| -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(shared.as_bytes());
        hasher.update(ephemeral_public);
        hasher.update(recipient_public);
        *hasher.finalize().as_bytes()
    };

    Ok(EnvelopeKeys {
        cipher_key: kdf(ENVELOPE_CIPHER_CONTEXT),
        integrity_key: kdf(ENVELOPE_INTEGRITY_CONTEXT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_keys() {
        let bob = IdentityKeypair::generate();
        let (eph, alice_keys) = sender_keys(&bob.public_key()).unwrap();
        let bob_keys = recipient_keys(&bob, &eph).unwrap();

        assert_eq!(alice_keys.cipher_key(), bob_keys.cipher_key());
        assert_eq!(alice_keys.integrity_key(), bob_keys.integrity_key());
    }

    #[test]
    fn test_cipher_and_integrity_keys_differ() {
        let bob = IdentityKeypair::generate();
        let (_, keys) = sender_keys(&bob.public_key()).unwrap();
        assert_ne!(keys.cipher_key(), keys.integrity_key());
    }

    #[test]
    fn test_fresh_ephemeral_every_call() {
        let bob = IdentityKeypair::generate();
        let (eph1, keys1) = sender_keys(&bob.public_key()).unwrap();
        let (eph2, keys2) = sender_keys(&bob.public_key()).unwrap();
        assert_ne!(eph1, eph2);
        assert_ne!(keys1.cipher_key(), keys2.cipher_key());
    }

    #[test]
    fn test_other_recipient_derives_different_keys() {
        let bob = IdentityKeypair::generate();
        let eve = IdentityKeypair::generate();
        let (eph, alice_keys) = sender_keys(&bob.public_key()).unwrap();
        let eve_keys = recipient_keys(&eve, &eph).unwrap();
        assert_ne!(alice_keys.cipher_key(), eve_keys.cipher_key());
    }

    #[test]
    fn test_low_order_point_rejected() {
        // The identity point: every scalar maps it to zero.
        let zero = PeerPublicKey::from_bytes([0u8; 32]);
        assert_eq!(
            sender_keys(&zero).unwrap_err(),
            AgreementError::NonContributory
        );

        let bob = IdentityKeypair::generate();
        assert_eq!(
            recipient_keys(&bob, &zero).unwrap_err(),
            AgreementError::NonContributory
        );
    }

    #[test]
    fn test_debug_redacts_keys() {
        let bob = IdentityKeypair::generate();
        let (_, keys) = sender_keys(&bob.public_key()).unwrap();
        assert_eq!(format!("{:?}", keys), "EnvelopeKeys(..)");
    }
}
