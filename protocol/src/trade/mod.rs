//! # Trade Negotiation
//!
//! A two-party agreement to swap one asset for another, carried over the
//! same encrypted channel as everything else. Settlement itself happens
//! elsewhere; this module only tracks who agreed to what and the
//! settlement reference once there is one.
//!
//! ```text
//! messages.rs    - trade_request .. trade_cancel
//! negotiation.rs - One negotiation and its transition rules
//! protocol.rs    - The negotiation table and inbound handling
//! ```

pub mod messages;
pub mod negotiation;
pub mod protocol;

pub use messages::{Asset, TradeMessage};
pub use negotiation::{Negotiation, TradeRole, TradeStatus, TradeStep, TransitionError};
pub use protocol::{TradeError, TradeEvent, TradeProtocol};
