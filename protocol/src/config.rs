//! # Protocol Configuration & Constants
//!
//! Every magic number in Parley lives here, next to the runtime config
//! structs that the node binary fills from CLI flags or a JSON file.
//!
//! Constants that affect the wire (envelope layout, chunk size, KDF context
//! strings) must match on both peers. Changing one of them is a protocol
//! version bump, not a tuning knob.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Library protocol version, reported by the node binary.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Version byte carried in every [`EncryptedEnvelope`](crate::crypto::EncryptedEnvelope).
/// Receivers reject envelopes with any other value.
pub const ENVELOPE_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Key agreement for both the long-lived identity and per-message ephemerals.
pub const KEY_AGREEMENT_ALGORITHM: &str = "X25519";

/// Payload cipher. 256-bit keys, 96-bit nonces, 128-bit tags.
pub const SYMMETRIC_ALGORITHM: &str = "AES-256-GCM";

/// Envelope integrity check: BLAKE3 in keyed mode over `iv || ciphertext`.
pub const INTEGRITY_ALGORITHM: &str = "BLAKE3-keyed";

/// X25519 public and secret keys are both 32 bytes.
pub const X25519_KEY_LENGTH: usize = 32;

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Not sixteen.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Envelope integrity tag length (BLAKE3 output).
pub const INTEGRITY_TAG_LENGTH: usize = 32;

/// Fixed prefix of the binary envelope encoding:
/// `version(1) || ephemeral_public_key(32) || iv(12) || integrity_tag(32)`.
pub const ENVELOPE_HEADER_LENGTH: usize =
    1 + X25519_KEY_LENGTH + AES_NONCE_LENGTH + INTEGRITY_TAG_LENGTH;

/// BLAKE3 `derive_key` context for the per-message AES key.
pub const ENVELOPE_CIPHER_CONTEXT: &str = "parley v1 envelope cipher key";

/// BLAKE3 `derive_key` context for the per-message integrity key.
pub const ENVELOPE_INTEGRITY_CONTEXT: &str = "parley v1 envelope integrity key";

// ---------------------------------------------------------------------------
// Transport Parameters
// ---------------------------------------------------------------------------

/// Label of the channel the manager opens on `connect`.
pub const DEFAULT_CHANNEL_LABEL: &str = "parley";

/// Outbound frames buffered per channel before `send` reports backpressure.
pub const CHANNEL_QUEUE_CAPACITY: usize = 64;

/// Capacity of every event queue (transport, connection, manager, protocol).
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Maximum number of live connections a manager will hold.
pub const MAX_CONNECTIONS: usize = 64;

// ---------------------------------------------------------------------------
// File Transfer Parameters
// ---------------------------------------------------------------------------

/// Reference chunk size: 16 KiB keeps every frame under the common data
/// channel message limit.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// Largest chunk size a receiver accepts in a `file_request`.
pub const MAX_CHUNK_SIZE: u32 = 256 * 1024;

/// Largest file a receiver buffers in memory by default. 256 MiB.
pub const DEFAULT_MAX_INCOMING_SIZE: u64 = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Key Storage
// ---------------------------------------------------------------------------

/// Storage key under which the local identity is persisted.
pub const DEFAULT_IDENTITY_STORAGE_KEY: &str = "parley.identity.v1";

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Channel opened by `connect` and used by the secure channel layer.
    pub default_channel: String,
    /// Cap on simultaneously live connections.
    pub max_connections: usize,
    /// Per-channel outbound queue depth.
    pub channel_queue_capacity: usize,
    /// Depth of the connection and manager event queues.
    pub event_queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_channel: DEFAULT_CHANNEL_LABEL.to_string(),
            max_connections: MAX_CONNECTIONS,
            channel_queue_capacity: CHANNEL_QUEUE_CAPACITY,
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

/// Encryption service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Key under which the identity record is persisted in the key store.
    pub storage_key: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_IDENTITY_STORAGE_KEY.to_string(),
        }
    }
}

/// File transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size used for outgoing transfers.
    pub chunk_size: u32,
    /// Incoming requests above this size are rejected automatically.
    pub max_incoming_size: u64,
    /// Attach a SHA-256 digest to outgoing requests and verify incoming ones.
    pub verify_checksums: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_incoming_size: DEFAULT_MAX_INCOMING_SIZE,
            verify_checksums: true,
        }
    }
}

/// Everything a [`PeerNode`](crate::node::PeerNode) needs, in one
/// serde-friendly bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub manager: ManagerConfig,
    pub crypto: CryptoConfig,
    pub transfer: TransferConfig,
}
