//! # Identity
//!
//! Who is on the other end of a connection. A peer is addressed by its
//! [`PeerId`], which the signaling relay routes on, and authenticated only
//! through the X25519 key registered for that id with the encryption
//! service (see [`crate::crypto::keys`]).

pub mod peer_id;

pub use crate::crypto::keys::{IdentityKeypair, PeerPublicKey};
pub use peer_id::PeerId;
