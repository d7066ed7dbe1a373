//! # File Transfer
//!
//! Chunked file delivery between two connected peers.
//!
//! ```text
//! messages.rs - file_request / file_response / file_complete / file_cancel
//! session.rs  - One transfer's record and its status order
//! protocol.rs - The transfer table, inbound handling, chunk streaming
//! ```
//!
//! Control messages and chunks both ride the peer's default channel and
//! both are sealed per message, so a chunk is as private as the request
//! that announced it.

pub mod messages;
pub mod protocol;
pub mod session;

pub use messages::FileMessage;
pub use protocol::{FileTransferProtocol, TransferError, TransferEvent};
pub use session::{chunk_count, Transfer, TransferDirection, TransferStatus};
