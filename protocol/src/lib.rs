// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Parley Protocol Core Library
//!
//! Parley is the peer-to-peer core behind a trading client: two nodes find
//! each other through a signaling relay, open a direct session, and then
//! exchange end-to-end encrypted messages, files and trade negotiations
//! over it.
//!
//! Every message is sealed on its own. The sender does an X25519 agreement
//! between a fresh ephemeral key and the recipient's static key, derives an
//! AES-256-GCM key and a BLAKE3 integrity key from the result, and ships the
//! ephemeral public key inside the envelope. Nothing about one envelope
//! helps decrypt another.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **transport** - The session driver seam (ICE, descriptions, channels)
//!   plus an in-memory loopback network.
//! - **signaling** - The relay seam for offers, answers and candidates,
//!   plus an in-memory hub.
//! - **network** - One `Connection` per peer and the `ConnectionManager`
//!   that owns them.
//! - **crypto** - Identity keys, the sealed envelope, the key store and the
//!   `PeerEncryptionService`.
//! - **identity** - Peer ids and the key types callers pass around.
//! - **secure** - Seals protocol traffic on the way out, opens it on the
//!   way in.
//! - **transfer** - Chunked file transfer.
//! - **trade** - Trade negotiation state machine.
//! - **node** - `PeerNode`, which wires all of the above together.
//! - **config** - Protocol constants and runtime settings.
//!
//! ## Design Philosophy
//!
//! 1. Peer input never panics. Bad frames are dropped, logged and scoped
//!    to the peer they came from.
//! 2. Integrity is checked before anything is decrypted, and nothing that
//!    fails it reaches a state machine.
//! 3. No callbacks. Every component reports through a bounded queue of a
//!    closed event enum.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod network;
pub mod node;
pub mod secure;
pub mod signaling;
pub mod trade;
pub mod transfer;
pub mod transport;

pub use config::NodeConfig;
pub use identity::PeerId;
pub use node::{NodeError, NodeEvent, NodeEvents, PeerNode};
