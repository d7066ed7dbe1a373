//! # Network Module
//!
//! Peer sessions and their lifecycle.
//!
//! ```text
//! connection.rs - One peer's session: ICE-driven state, signaling state,
//!                 labelled channels with bounded outbound queues
//! manager.rs    - Peer → Connection map, signaling bridge, merged events
//! ```
//!
//! ## Design Decisions
//!
//! - Connection and channel state sit behind `parking_lot` locks and are
//!   never held across an await. The one lock that is, the per-connection
//!   negotiation mutex, is a `tokio::sync::Mutex`.
//! - The manager map is a `DashMap`, so traffic to distinct peers does not
//!   contend.
//! - Callbacks are replaced by one bounded `mpsc` queue per connection and
//!   one per manager, each carrying a closed event enum.

pub mod connection;
pub mod manager;

pub use connection::{
    ChannelHandle, Connection, ConnectionError, ConnectionEvent, ConnectionState, SignalingState,
};
pub use manager::{ConnectionManager, ManagerError, ManagerEvent};
