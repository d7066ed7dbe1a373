//! # Cryptography for Parley
//!
//! Everything that protects a payload between two peers lives here. The
//! scheme is hybrid: asymmetric key agreement to get a one-time secret,
//! symmetric AEAD to protect the payload.
//!
//! - **X25519** for identities and per-message ephemerals.
//! - **BLAKE3** `derive_key` as the KDF, and keyed BLAKE3 as the envelope
//!   integrity tag.
//! - **AES-256-GCM** for the payload itself.
//!
//! Nothing here is novel. It is a thin, typed layer over audited crates;
//! the interesting decisions are which bytes go into the KDF and which go
//! into the AAD, and those are documented where they happen.

pub mod agreement;
pub mod encryption;
pub mod envelope;
pub mod keys;
pub mod service;
pub mod store;

pub use envelope::{EncryptedEnvelope, EnvelopeError};
pub use keys::{IdentityKeypair, KeyError, PeerPublicKey};
pub use service::{CryptoError, PeerEncryptionService, PeerKeyEntry};
pub use store::{KeyStore, MemoryKeyStore, SledKeyStore, StoreError, StoredIdentity};
