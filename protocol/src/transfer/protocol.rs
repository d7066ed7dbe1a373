//! # File Transfer Protocol
//!
//! Request/response file delivery over an established peer link.
//!
//! ```text
//! sender                                   receiver
//!   │── file_request ──────────────────────▶│  Requested event
//!   │◀───────────────────── file_response ──│  respond(id, accept)
//!   │── chunk 0 .. chunk n-1 (binary) ─────▶│  Progress events
//!   │◀───────────────────── file_complete ──│  Completed event
//! ```
//!
//! Chunks carry no header. They are matched to the single active incoming
//! transfer from that peer, which is why a peer may have at most one
//! transfer in flight per direction. Channels are ordered, so arrival order
//! is file order.
//!
//! The sender streams from a spawned task and re-reads the transfer status
//! before every chunk, so a cancel from either side stops the stream at the
//! next chunk boundary.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{TransferConfig, EVENT_QUEUE_CAPACITY, MAX_CHUNK_SIZE};
use crate::identity::PeerId;
use crate::secure::{LinkError, PeerLink};

use super::messages::FileMessage;
use super::session::{
    chunk_count, sha256_hex, Transfer, TransferDirection, TransferStatus,
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),

    #[error("cannot {operation} transfer {id}: it is {status}")]
    InvalidState {
        id: Uuid,
        status: TransferStatus,
        operation: &'static str,
    },

    #[error("a transfer with {0} is already in progress")]
    PeerBusy(PeerId),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer offered a file. Answer with [`FileTransferProtocol::respond`].
    Requested { transfer: Transfer },
    Accepted { id: Uuid, peer_id: PeerId },
    Rejected {
        id: Uuid,
        peer_id: PeerId,
        reason: Option<String>,
    },
    Progress {
        id: Uuid,
        peer_id: PeerId,
        transferred_chunks: u64,
        total_chunks: u64,
    },
    /// `data` is the assembled file on the receiving side, `None` on the
    /// sending side.
    Completed {
        id: Uuid,
        peer_id: PeerId,
        data: Option<Bytes>,
    },
    /// The peer canceled.
    Canceled {
        id: Uuid,
        peer_id: PeerId,
        reason: Option<String>,
    },
    Failed {
        id: Uuid,
        peer_id: PeerId,
        reason: String,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> Uuid {
        match self {
            TransferEvent::Requested { transfer } => transfer.id,
            TransferEvent::Accepted { id, .. }
            | TransferEvent::Rejected { id, .. }
            | TransferEvent::Progress { id, .. }
            | TransferEvent::Completed { id, .. }
            | TransferEvent::Canceled { id, .. }
            | TransferEvent::Failed { id, .. } => *id,
        }
    }
}

#[derive(Clone)]
pub struct FileTransferProtocol {
    inner: Arc<Inner>,
}

struct Inner {
    link: Arc<dyn PeerLink>,
    config: TransferConfig,
    transfers: RwLock<HashMap<Uuid, Transfer>>,
    events: mpsc::Sender<TransferEvent>,
}

impl FileTransferProtocol {
    pub fn new(
        link: Arc<dyn PeerLink>,
        config: TransferConfig,
    ) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let inner = Inner {
            link,
            config,
            transfers: RwLock::new(HashMap::new()),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub fn transfer(&self, id: &Uuid) -> Option<Transfer> {
        self.inner.transfers.read().get(id).cloned()
    }

    /// Every known transfer, oldest first.
    pub fn transfers(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self.inner.transfers.read().values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    /// Drop the record of a finished transfer and return it. Live
    /// transfers must be canceled first.
    pub fn remove(&self, id: &Uuid) -> Result<Transfer, TransferError> {
        let mut transfers = self.inner.transfers.write();
        match transfers.get(id) {
            None => Err(TransferError::UnknownTransfer(*id)),
            Some(t) if !t.is_terminal() => Err(TransferError::InvalidState {
                id: *id,
                status: t.status,
                operation: "remove",
            }),
            Some(_) => transfers
                .remove(id)
                .ok_or(TransferError::UnknownTransfer(*id)),
        }
    }

    /// Drop every finished transfer. Returns how many were removed.
    pub fn prune_terminal(&self) -> usize {
        let mut transfers = self.inner.transfers.write();
        let before = transfers.len();
        transfers.retain(|_, t| !t.is_terminal());
        let pruned = before - transfers.len();
        if pruned > 0 {
            debug!(pruned, remaining = transfers.len(), "finished transfers pruned");
        }
        pruned
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Offer `data` to `peer_id`. Chunks start flowing once the peer accepts.
    pub async fn send_file(
        &self,
        peer_id: &PeerId,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<Uuid, TransferError> {
        let chunk_size = self.inner.config.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }

        let data = data.into();
        let checksum = self.inner.config.verify_checksums.then(|| sha256_hex(&data));
        let transfer = Transfer::outgoing(
            peer_id.clone(),
            file_name.into(),
            mime_type.into(),
            data,
            chunk_size,
            checksum,
        );
        let id = transfer.id;
        let request = FileMessage::FileRequest {
            transfer_id: id,
            file_name: transfer.file_name.clone(),
            file_size: transfer.total_size,
            mime_type: transfer.mime_type.clone(),
            chunk_size,
            total_chunks: transfer.total_chunks,
            sha256: transfer.checksum.clone(),
        };

        {
            let mut transfers = self.inner.transfers.write();
            let busy = transfers.values().any(|t| {
                t.peer_id == *peer_id
                    && t.direction == TransferDirection::Outgoing
                    && !t.is_terminal()
            });
            if busy {
                return Err(TransferError::PeerBusy(peer_id.clone()));
            }
            transfers.insert(id, transfer);
        }

        if let Err(e) = self.inner.link.send_message(peer_id, request.into()).await {
            self.inner
                .with_transfer(&id, |t| t.fail(TransferStatus::Failed, e.to_string()));
            return Err(e.into());
        }

        info!(transfer = %id, peer_id = %peer_id, "file offered");
        Ok(id)
    }

    /// Accept or reject a pending incoming transfer.
    pub async fn respond(&self, id: Uuid, accept: bool) -> Result<(), TransferError> {
        let (peer_id, empty) = {
            let mut transfers = self.inner.transfers.write();
            let t = transfers
                .get(&id)
                .ok_or(TransferError::UnknownTransfer(id))?;
            if t.direction != TransferDirection::Incoming || t.status != TransferStatus::Pending {
                return Err(TransferError::InvalidState {
                    id,
                    status: t.status,
                    operation: "respond to",
                });
            }
            let peer_id = t.peer_id.clone();
            if accept {
                let busy = transfers.values().any(|o| {
                    o.id != id
                        && o.peer_id == peer_id
                        && o.direction == TransferDirection::Incoming
                        && o.status == TransferStatus::Transferring
                });
                if busy {
                    return Err(TransferError::PeerBusy(peer_id));
                }
            }
            let Some(t) = transfers.get_mut(&id) else {
                return Err(TransferError::UnknownTransfer(id));
            };
            if accept {
                t.advance(TransferStatus::Transferring);
            } else {
                t.fail(TransferStatus::Canceled, "rejected");
            }
            (peer_id, t.total_chunks == 0)
        };

        let response = FileMessage::FileResponse {
            transfer_id: id,
            accepted: accept,
            reason: (!accept).then(|| "rejected".to_string()),
        };
        if let Err(e) = self.inner.link.send_message(&peer_id, response.into()).await {
            self.inner
                .with_transfer(&id, |t| t.fail(TransferStatus::Failed, e.to_string()));
            return Err(e.into());
        }

        info!(transfer = %id, peer_id = %peer_id, accept, "responded to file offer");
        if accept && empty {
            self.inner.complete_incoming(id).await;
        }
        Ok(())
    }

    /// Cancel a transfer in either direction. The peer is told on a best
    /// effort basis; the local record is canceled regardless.
    pub async fn cancel(&self, id: Uuid) -> Result<(), TransferError> {
        let peer_id = {
            let mut transfers = self.inner.transfers.write();
            let t = transfers
                .get_mut(&id)
                .ok_or(TransferError::UnknownTransfer(id))?;
            if !t.fail(TransferStatus::Canceled, "canceled") {
                return Err(TransferError::InvalidState {
                    id,
                    status: t.status,
                    operation: "cancel",
                });
            }
            t.peer_id.clone()
        };
        info!(transfer = %id, peer_id = %peer_id, "transfer canceled");
        self.inner
            .notify_cancel(&peer_id, id, "canceled".to_string())
            .await;
        Ok(())
    }

    /// Fail every live transfer with `peer_id`. Called when its connection
    /// goes away; nothing is sent.
    pub async fn fail_peer(&self, peer_id: &PeerId) -> Vec<Uuid> {
        let failed: Vec<Uuid> = {
            let mut transfers = self.inner.transfers.write();
            transfers
                .values_mut()
                .filter(|t| t.peer_id == *peer_id)
                .filter_map(|t| {
                    t.fail(TransferStatus::Failed, "peer disconnected")
                        .then_some(t.id)
                })
                .collect()
        };
        for id in &failed {
            warn!(transfer = %id, peer_id = %peer_id, "transfer failed: peer disconnected");
            self.inner
                .emit(TransferEvent::Failed {
                    id: *id,
                    peer_id: peer_id.clone(),
                    reason: "peer disconnected".into(),
                })
                .await;
        }
        failed
    }

    /// Fail every live transfer that has not moved for at least `max_idle`
    /// and tell the peer.
    pub async fn fail_stalled(&self, max_idle: Duration) -> Vec<Uuid> {
        let now = chrono::Utc::now();
        let stalled: Vec<(Uuid, PeerId)> = {
            let mut transfers = self.inner.transfers.write();
            transfers
                .values_mut()
                .filter(|t| {
                    (now - t.updated_at)
                        .to_std()
                        .map(|idle| idle >= max_idle)
                        .unwrap_or(false)
                })
                .filter_map(|t| {
                    t.fail(TransferStatus::Failed, "stalled")
                        .then(|| (t.id, t.peer_id.clone()))
                })
                .collect()
        };
        for (id, peer_id) in &stalled {
            warn!(transfer = %id, peer_id = %peer_id, "transfer stalled");
            self.inner
                .notify_cancel(peer_id, *id, "stalled".to_string())
                .await;
            self.inner
                .emit(TransferEvent::Failed {
                    id: *id,
                    peer_id: peer_id.clone(),
                    reason: "stalled".into(),
                })
                .await;
        }
        stalled.into_iter().map(|(id, _)| id).collect()
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Handle a decrypted control message from `peer_id`. Protocol
    /// violations are logged and dropped.
    pub async fn handle_message(&self, peer_id: &PeerId, message: FileMessage) {
        trace!(peer_id = %peer_id, kind = message.kind(), "file message");
        match message {
            FileMessage::FileRequest {
                transfer_id,
                file_name,
                file_size,
                mime_type,
                chunk_size,
                total_chunks,
                sha256,
            } => {
                let rejection = if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                    Some(format!("invalid chunk size {chunk_size}"))
                } else if total_chunks != chunk_count(file_size, chunk_size) {
                    Some("chunk count does not match file size".to_string())
                } else if file_size > self.inner.config.max_incoming_size {
                    Some("file too large".to_string())
                } else {
                    None
                };
                if let Some(reason) = rejection {
                    warn!(transfer = %transfer_id, peer_id = %peer_id, %reason, "rejecting file offer");
                    let response = FileMessage::FileResponse {
                        transfer_id,
                        accepted: false,
                        reason: Some(reason),
                    };
                    if let Err(e) = self.inner.link.send_message(peer_id, response.into()).await {
                        debug!(transfer = %transfer_id, error = %e, "could not send rejection");
                    }
                    return;
                }

                let checksum = sha256.filter(|_| self.inner.config.verify_checksums);
                let transfer = Transfer::incoming(
                    transfer_id,
                    peer_id.clone(),
                    file_name,
                    mime_type,
                    file_size,
                    chunk_size,
                    total_chunks,
                    checksum,
                );
                {
                    let mut transfers = self.inner.transfers.write();
                    match transfers.entry(transfer_id) {
                        Entry::Occupied(_) => {
                            debug!(transfer = %transfer_id, "duplicate file offer ignored");
                            return;
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(transfer.clone());
                        }
                    }
                }
                info!(
                    transfer = %transfer_id,
                    peer_id = %peer_id,
                    name = %transfer.file_name,
                    size = file_size,
                    "file offered by peer"
                );
                self.inner.emit(TransferEvent::Requested { transfer }).await;
            }

            FileMessage::FileResponse {
                transfer_id,
                accepted,
                reason,
            } => {
                let changed = self.inner.with_owned(peer_id, &transfer_id, |t| {
                    if t.direction != TransferDirection::Outgoing {
                        return false;
                    }
                    if accepted {
                        t.advance(TransferStatus::Transferring)
                    } else {
                        t.fail(
                            TransferStatus::Canceled,
                            reason.clone().unwrap_or_else(|| "rejected".into()),
                        )
                    }
                });
                if !changed {
                    debug!(transfer = %transfer_id, "file response ignored");
                    return;
                }
                if accepted {
                    info!(transfer = %transfer_id, peer_id = %peer_id, "file accepted, streaming");
                    self.inner
                        .emit(TransferEvent::Accepted {
                            id: transfer_id,
                            peer_id: peer_id.clone(),
                        })
                        .await;
                    tokio::spawn(stream_chunks(Arc::clone(&self.inner), transfer_id));
                } else {
                    info!(transfer = %transfer_id, peer_id = %peer_id, "file rejected");
                    self.inner
                        .emit(TransferEvent::Rejected {
                            id: transfer_id,
                            peer_id: peer_id.clone(),
                            reason,
                        })
                        .await;
                }
            }

            FileMessage::FileComplete { transfer_id } => {
                let changed = self.inner.with_owned(peer_id, &transfer_id, |t| {
                    if t.direction != TransferDirection::Outgoing
                        || !t.advance(TransferStatus::Completed)
                    {
                        return false;
                    }
                    t.transferred_chunks = t.total_chunks;
                    true
                });
                if !changed {
                    debug!(transfer = %transfer_id, "file completion ignored");
                    return;
                }
                info!(transfer = %transfer_id, peer_id = %peer_id, "file delivered");
                self.inner
                    .emit(TransferEvent::Completed {
                        id: transfer_id,
                        peer_id: peer_id.clone(),
                        data: None,
                    })
                    .await;
            }

            FileMessage::FileCancel {
                transfer_id,
                reason,
            } => {
                let changed = self.inner.with_owned(peer_id, &transfer_id, |t| {
                    t.fail(
                        TransferStatus::Canceled,
                        reason.clone().unwrap_or_else(|| "canceled by peer".into()),
                    )
                });
                if !changed {
                    debug!(transfer = %transfer_id, "file cancel ignored");
                    return;
                }
                info!(transfer = %transfer_id, peer_id = %peer_id, "transfer canceled by peer");
                self.inner
                    .emit(TransferEvent::Canceled {
                        id: transfer_id,
                        peer_id: peer_id.clone(),
                        reason,
                    })
                    .await;
            }
        }
    }

    /// Handle a decrypted chunk from `peer_id`.
    pub async fn handle_chunk(&self, peer_id: &PeerId, chunk: Bytes) {
        let step = {
            let mut transfers = self.inner.transfers.write();
            let active = transfers.values_mut().find(|t| {
                t.peer_id == *peer_id
                    && t.direction == TransferDirection::Incoming
                    && t.status == TransferStatus::Transferring
            });
            let Some(t) = active else {
                debug!(peer_id = %peer_id, len = chunk.len(), "chunk with no active transfer dropped");
                return;
            };
            match t.push_chunk(chunk) {
                Ok(done) => (t.id, t.transferred_chunks, t.total_chunks, done),
                Err(rejection) => {
                    warn!(transfer = %t.id, peer_id = %peer_id, %rejection, "chunk dropped");
                    return;
                }
            }
        };

        let (id, transferred_chunks, total_chunks, done) = step;
        self.inner
            .emit(TransferEvent::Progress {
                id,
                peer_id: peer_id.clone(),
                transferred_chunks,
                total_chunks,
            })
            .await;
        if done {
            self.inner.complete_incoming(id).await;
        }
    }
}

impl Inner {
    async fn emit(&self, event: TransferEvent) {
        if self.events.send(event).await.is_err() {
            trace!("transfer event dropped: no receiver");
        }
    }

    fn with_transfer<R>(&self, id: &Uuid, f: impl FnOnce(&mut Transfer) -> R) -> Option<R> {
        self.transfers.write().get_mut(id).map(f)
    }

    /// Like `with_transfer`, but only for transfers with `peer_id`. A
    /// message naming another peer's transfer is dropped.
    fn with_owned(
        &self,
        peer_id: &PeerId,
        id: &Uuid,
        f: impl FnOnce(&mut Transfer) -> bool,
    ) -> bool {
        let mut transfers = self.transfers.write();
        match transfers.get_mut(id) {
            Some(t) if t.peer_id == *peer_id => f(t),
            Some(t) => {
                warn!(transfer = %id, owner = %t.peer_id, from = %peer_id, "message for another peer's transfer");
                false
            }
            None => false,
        }
    }

    async fn notify_cancel(&self, peer_id: &PeerId, id: Uuid, reason: String) {
        let cancel = FileMessage::FileCancel {
            transfer_id: id,
            reason: Some(reason),
        };
        if let Err(e) = self.link.send_message(peer_id, cancel.into()).await {
            debug!(transfer = %id, error = %e, "could not notify peer of cancel");
        }
    }

    /// Assemble and verify a fully received transfer, then confirm or
    /// cancel it with the sender.
    async fn complete_incoming(&self, id: Uuid) {
        let outcome = {
            let mut transfers = self.transfers.write();
            let Some(t) = transfers.get_mut(&id) else {
                return;
            };
            match t.assemble() {
                Ok(data) if t.advance(TransferStatus::Completed) => {
                    Ok((t.peer_id.clone(), data))
                }
                Ok(_) => return,
                Err(reason) => {
                    t.fail(TransferStatus::Failed, reason.clone());
                    Err((t.peer_id.clone(), reason))
                }
            }
        };

        match outcome {
            Ok((peer_id, data)) => {
                info!(transfer = %id, peer_id = %peer_id, size = data.len(), "file received");
                let complete = FileMessage::FileComplete { transfer_id: id };
                if let Err(e) = self.link.send_message(&peer_id, complete.into()).await {
                    debug!(transfer = %id, error = %e, "could not confirm completion");
                }
                self.emit(TransferEvent::Completed {
                    id,
                    peer_id,
                    data: Some(data),
                })
                .await;
            }
            Err((peer_id, reason)) => {
                warn!(transfer = %id, peer_id = %peer_id, %reason, "received file failed verification");
                self.notify_cancel(&peer_id, id, reason.clone()).await;
                self.emit(TransferEvent::Failed {
                    id,
                    peer_id,
                    reason,
                })
                .await;
            }
        }
    }
}

/// Push every chunk of outgoing transfer `id`, stopping as soon as it
/// leaves `Transferring`.
async fn stream_chunks(inner: Arc<Inner>, id: Uuid) {
    loop {
        let next = {
            let transfers = inner.transfers.read();
            match transfers.get(&id) {
                Some(t) if t.status == TransferStatus::Transferring => t
                    .chunk(t.transferred_chunks)
                    .map(|chunk| (t.peer_id.clone(), chunk)),
                _ => None,
            }
        };
        let Some((peer_id, chunk)) = next else {
            break;
        };

        if let Err(e) = inner.link.send_chunk(&peer_id, chunk).await {
            let reason = e.to_string();
            if inner
                .with_transfer(&id, |t| t.fail(TransferStatus::Failed, reason.clone()))
                .unwrap_or(false)
            {
                warn!(transfer = %id, peer_id = %peer_id, error = %e, "chunk send failed");
                inner
                    .emit(TransferEvent::Failed {
                        id,
                        peer_id,
                        reason,
                    })
                    .await;
            }
            break;
        }

        let progress = inner.with_transfer(&id, |t| {
            (t.status == TransferStatus::Transferring).then(|| {
                t.record_sent();
                (t.transferred_chunks, t.total_chunks)
            })
        });
        if let Some(Some((transferred_chunks, total_chunks))) = progress {
            inner
                .emit(TransferEvent::Progress {
                    id,
                    peer_id,
                    transferred_chunks,
                    total_chunks,
                })
                .await;
        }
    }
    trace!(transfer = %id, "chunk stream finished");
}
