//! Per-transfer state.
//!
//! A [`Transfer`] is owned by the protocol's table and only ever mutated
//! through the methods here, which enforce the status order:
//!
//! ```text
//! pending ──▶ transferring ──▶ completed
//!    │              │
//!    └──────────────┴────────▶ failed | canceled
//! ```
//!
//! Terminal records keep their metadata for inspection and never change
//! again. File bytes are released on the transition into a terminal status.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Canceled
        )
    }

    fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Transferring | Failed | Canceled) => true,
            (Transferring, Completed | Failed | Canceled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Why a chunk was not accepted. The transfer itself is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChunkRejection {
    NotTransferring(TransferStatus),
    Overflow { total_chunks: u64 },
    Oversized { len: usize, chunk_size: u32 },
}

impl fmt::Display for ChunkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkRejection::NotTransferring(status) => write!(f, "transfer is {status}"),
            ChunkRejection::Overflow { total_chunks } => {
                write!(f, "all {total_chunks} chunks already received")
            }
            ChunkRejection::Oversized { len, chunk_size } => {
                write!(f, "chunk of {len} bytes exceeds chunk size {chunk_size}")
            }
        }
    }
}

/// Number of chunks needed for `size` bytes. Zero bytes need zero chunks.
pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(u64::from(chunk_size))
}

/// Lower-case hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u64,
    /// Chunks sent (outgoing) or received (incoming).
    pub transferred_chunks: u64,
    pub status: TransferStatus,
    pub checksum: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Full file contents on the sending side.
    #[serde(skip)]
    source: Bytes,
    /// Received chunks in arrival order.
    #[serde(skip)]
    buffer: Vec<Bytes>,
}

impl Transfer {
    pub(crate) fn outgoing(
        peer_id: PeerId,
        file_name: String,
        mime_type: String,
        data: Bytes,
        chunk_size: u32,
        checksum: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let total_size = data.len() as u64;
        Self {
            id: Uuid::new_v4(),
            peer_id,
            direction: TransferDirection::Outgoing,
            file_name,
            mime_type,
            total_size,
            chunk_size,
            total_chunks: chunk_count(total_size, chunk_size),
            transferred_chunks: 0,
            status: TransferStatus::Pending,
            checksum,
            reason: None,
            created_at: now,
            updated_at: now,
            source: data,
            buffer: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn incoming(
        id: Uuid,
        peer_id: PeerId,
        file_name: String,
        mime_type: String,
        total_size: u64,
        chunk_size: u32,
        total_chunks: u64,
        checksum: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer_id,
            direction: TransferDirection::Incoming,
            file_name,
            mime_type,
            total_size,
            chunk_size,
            total_chunks,
            transferred_chunks: 0,
            status: TransferStatus::Pending,
            checksum,
            reason: None,
            created_at: now,
            updated_at: now,
            source: Bytes::new(),
            buffer: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fraction of chunks moved, in `[0, 1]`. An empty file counts as done
    /// once it completes.
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return if self.status == TransferStatus::Completed { 1.0 } else { 0.0 };
        }
        self.transferred_chunks as f64 / self.total_chunks as f64
    }

    pub fn received_bytes(&self) -> u64 {
        self.buffer.iter().map(|c| c.len() as u64).sum()
    }

    /// File bytes this record still holds: the source on the sending side,
    /// buffered chunks on the receiving side. Zero once terminal.
    pub fn held_bytes(&self) -> u64 {
        self.source.len() as u64 + self.received_bytes()
    }

    /// Move to `next`. Returns false, changing nothing, if the order forbids it.
    pub(crate) fn advance(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.source = Bytes::new();
            self.buffer = Vec::new();
        }
        self.touch();
        true
    }

    pub(crate) fn fail(&mut self, next: TransferStatus, reason: impl Into<String>) -> bool {
        if self.advance(next) {
            self.reason = Some(reason.into());
            true
        } else {
            false
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Slice `index` of the outgoing file. Zero-copy.
    pub(crate) fn chunk(&self, index: u64) -> Option<Bytes> {
        if index >= self.total_chunks {
            return None;
        }
        let size = u64::from(self.chunk_size);
        let start = usize::try_from(index * size).ok()?;
        let end = usize::try_from(((index + 1) * size).min(self.total_size)).ok()?;
        if end > self.source.len() {
            // Released after a terminal transition.
            return None;
        }
        Some(self.source.slice(start..end))
    }

    pub(crate) fn record_sent(&mut self) {
        self.transferred_chunks = (self.transferred_chunks + 1).min(self.total_chunks);
        self.touch();
    }

    /// Append a received chunk. Returns true once every chunk is in.
    pub(crate) fn push_chunk(&mut self, chunk: Bytes) -> Result<bool, ChunkRejection> {
        if self.status != TransferStatus::Transferring {
            return Err(ChunkRejection::NotTransferring(self.status));
        }
        if self.transferred_chunks >= self.total_chunks {
            return Err(ChunkRejection::Overflow {
                total_chunks: self.total_chunks,
            });
        }
        if chunk.len() > self.chunk_size as usize {
            return Err(ChunkRejection::Oversized {
                len: chunk.len(),
                chunk_size: self.chunk_size,
            });
        }
        self.buffer.push(chunk);
        self.transferred_chunks += 1;
        self.touch();
        Ok(self.transferred_chunks == self.total_chunks)
    }

    /// Concatenate the received chunks and check them against the
    /// announced size and checksum. Releases the chunk buffer.
    pub(crate) fn assemble(&mut self) -> Result<Bytes, String> {
        let mut out = BytesMut::with_capacity(self.received_bytes() as usize);
        for chunk in self.buffer.drain(..) {
            out.extend_from_slice(&chunk);
        }
        let data = out.freeze();
        if data.len() as u64 != self.total_size {
            return Err(format!(
                "size mismatch: expected {} bytes, received {}",
                self.total_size,
                data.len()
            ));
        }
        if let Some(expected) = &self.checksum {
            if !expected.eq_ignore_ascii_case(&sha256_hex(&data)) {
                return Err("checksum mismatch".into());
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(len: usize, chunk_size: u32) -> Transfer {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Transfer::outgoing(
            "bob".into(),
            "f.bin".into(),
            "application/octet-stream".into(),
            Bytes::from(data),
            chunk_size,
            None,
        )
    }

    fn incoming(size: u64, chunk_size: u32, checksum: Option<String>) -> Transfer {
        Transfer::incoming(
            Uuid::new_v4(),
            "alice".into(),
            "f.bin".into(),
            "application/octet-stream".into(),
            size,
            chunk_size,
            chunk_count(size, chunk_size),
            checksum,
        )
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        assert_eq!(chunk_count(0, 16_384), 0);
        assert_eq!(chunk_count(1, 16_384), 1);
        assert_eq!(chunk_count(16_384, 16_384), 1);
        assert_eq!(chunk_count(16_385, 16_384), 2);
        assert_eq!(chunk_count(40_000, 16_384), 3);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn test_outgoing_chunks_cover_the_file() {
        let t = outgoing(40_000, 16_384);
        assert_eq!(t.total_chunks, 3);
        assert_eq!(t.chunk(0).unwrap().len(), 16_384);
        assert_eq!(t.chunk(1).unwrap().len(), 16_384);
        assert_eq!(t.chunk(2).unwrap().len(), 40_000 - 2 * 16_384);
        assert!(t.chunk(3).is_none());
    }

    #[test]
    fn test_status_order_is_enforced() {
        let mut t = outgoing(10, 4);
        assert!(!t.advance(TransferStatus::Completed));
        assert!(t.advance(TransferStatus::Transferring));
        assert!(!t.advance(TransferStatus::Pending));
        assert!(t.advance(TransferStatus::Completed));
        for next in [
            TransferStatus::Failed,
            TransferStatus::Canceled,
            TransferStatus::Transferring,
        ] {
            assert!(!t.advance(next));
        }
        assert_eq!(t.status, TransferStatus::Completed);
    }

    #[test]
    fn test_terminal_status_releases_file_bytes() {
        let mut sent = outgoing(40_000, 16_384);
        assert_eq!(sent.held_bytes(), 40_000);
        sent.advance(TransferStatus::Transferring);
        sent.advance(TransferStatus::Completed);
        assert_eq!(sent.held_bytes(), 0);
        assert!(sent.chunk(0).is_none());

        let mut received = incoming(8, 4, None);
        received.advance(TransferStatus::Transferring);
        received.push_chunk(Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(received.held_bytes(), 4);
        received.fail(TransferStatus::Canceled, "user");
        assert_eq!(received.held_bytes(), 0);
        assert_eq!(received.transferred_chunks, 1);
    }

    #[test]
    fn test_fail_records_reason_once() {
        let mut t = outgoing(10, 4);
        assert!(t.fail(TransferStatus::Canceled, "user"));
        assert!(!t.fail(TransferStatus::Failed, "late"));
        assert_eq!(t.status, TransferStatus::Canceled);
        assert_eq!(t.reason.as_deref(), Some("user"));
    }

    #[test]
    fn test_incoming_assembles_in_order() {
        let data: Vec<u8> = (0..10u8).collect();
        let mut t = incoming(10, 4, Some(sha256_hex(&data)));
        assert!(matches!(
            t.push_chunk(Bytes::from_static(b"xx")),
            Err(ChunkRejection::NotTransferring(TransferStatus::Pending))
        ));
        t.advance(TransferStatus::Transferring);

        assert!(!t.push_chunk(Bytes::copy_from_slice(&data[0..4])).unwrap());
        assert!(!t.push_chunk(Bytes::copy_from_slice(&data[4..8])).unwrap());
        assert!(t.push_chunk(Bytes::copy_from_slice(&data[8..])).unwrap());
        assert!((t.progress() - 1.0).abs() < f64::EPSILON);
        assert!(matches!(
            t.push_chunk(Bytes::from_static(b"x")),
            Err(ChunkRejection::Overflow { total_chunks: 3 })
        ));

        assert_eq!(t.assemble().unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_oversized_chunk_is_rejected_without_counting() {
        let mut t = incoming(10, 4, None);
        t.advance(TransferStatus::Transferring);
        assert!(matches!(
            t.push_chunk(Bytes::from_static(b"12345")),
            Err(ChunkRejection::Oversized { len: 5, chunk_size: 4 })
        ));
        assert_eq!(t.transferred_chunks, 0);
    }

    #[test]
    fn test_assemble_detects_tampering() {
        let mut t = incoming(4, 4, Some(sha256_hex(b"abcd")));
        t.advance(TransferStatus::Transferring);
        t.push_chunk(Bytes::from_static(b"abce")).unwrap();
        assert_eq!(t.assemble().unwrap_err(), "checksum mismatch");

        let mut t = incoming(8, 4, None);
        t.advance(TransferStatus::Transferring);
        t.push_chunk(Bytes::from_static(b"abcd")).unwrap();
        t.push_chunk(Bytes::from_static(b"ab")).unwrap();
        assert!(t.assemble().unwrap_err().starts_with("size mismatch"));
    }

    #[test]
    fn test_empty_file_progress() {
        let mut t = incoming(0, 16_384, None);
        assert_eq!(t.total_chunks, 0);
        assert_eq!(t.progress(), 0.0);
        t.advance(TransferStatus::Transferring);
        t.advance(TransferStatus::Completed);
        assert_eq!(t.progress(), 1.0);
    }
}
