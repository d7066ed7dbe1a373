//! # Trade Negotiation Protocol
//!
//! Both peers keep their own copy of every negotiation and move it only
//! along the order in [`super::negotiation`]. A local call that would break
//! the order fails with [`TradeError::InvalidTransition`]; an inbound
//! message that would break it is dropped, logged and surfaced as a
//! [`TradeEvent::InvalidTransition`].
//!
//! There are no acknowledgements. A lost message leaves the two copies
//! disagreeing until one side cancels. Re-delivery of a message whose
//! target status is already held changes nothing.

use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::EVENT_QUEUE_CAPACITY;
use crate::identity::PeerId;
use crate::secure::{LinkError, PeerLink};

use super::messages::{Asset, TradeMessage};
use super::negotiation::{Applied, Negotiation, TradeRole, TradeStatus, TradeStep};

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("unknown trade {0}")]
    UnknownTrade(String),

    #[error("trade {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("trade {id} is still {status}")]
    StillOpen { id: String, status: TradeStatus },

    #[error("trade {id} already settled under txid {recorded}")]
    TxidConflict { id: String, recorded: String },

    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Clone)]
pub enum TradeEvent {
    /// A peer proposed a trade. Answer with [`TradeProtocol::respond`].
    Requested { negotiation: Negotiation },
    /// The peer moved a trade, or its connection went away.
    StatusChanged {
        id: String,
        peer_id: PeerId,
        status: TradeStatus,
    },
    /// The peer sent a message the negotiation could not accept.
    InvalidTransition {
        id: String,
        peer_id: PeerId,
        from: TradeStatus,
        attempted: TradeStatus,
    },
}

#[derive(Clone)]
pub struct TradeProtocol {
    inner: Arc<Inner>,
}

struct Inner {
    link: Arc<dyn PeerLink>,
    negotiations: RwLock<HashMap<String, Negotiation>>,
    events: mpsc::Sender<TradeEvent>,
}

impl TradeProtocol {
    pub fn new(link: Arc<dyn PeerLink>) -> (Self, mpsc::Receiver<TradeEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let inner = Inner {
            link,
            negotiations: RwLock::new(HashMap::new()),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn negotiation(&self, id: &str) -> Option<Negotiation> {
        self.inner.negotiations.read().get(id).cloned()
    }

    /// Every known negotiation, oldest first.
    pub fn negotiations(&self) -> Vec<Negotiation> {
        let mut all: Vec<Negotiation> =
            self.inner.negotiations.read().values().cloned().collect();
        all.sort_by_key(|n| n.created_at);
        all
    }

    /// Drop the record of a finished negotiation and return it.
    pub fn remove(&self, id: &str) -> Result<Negotiation, TradeError> {
        let mut negotiations = self.inner.negotiations.write();
        match negotiations.get(id) {
            None => Err(TradeError::UnknownTrade(id.to_string())),
            Some(n) if !n.status.is_terminal() => Err(TradeError::StillOpen {
                id: id.to_string(),
                status: n.status,
            }),
            Some(_) => negotiations
                .remove(id)
                .ok_or_else(|| TradeError::UnknownTrade(id.to_string())),
        }
    }

    /// Drop every finished negotiation. Returns how many were removed.
    pub fn prune_terminal(&self) -> usize {
        let mut negotiations = self.inner.negotiations.write();
        let before = negotiations.len();
        negotiations.retain(|_, n| !n.status.is_terminal());
        let pruned = before - negotiations.len();
        if pruned > 0 {
            debug!(pruned, remaining = negotiations.len(), "finished trades pruned");
        }
        pruned
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Propose trading `offered` for `requested`. Returns the new trade id.
    pub async fn propose(
        &self,
        peer_id: &PeerId,
        offered: Asset,
        requested: Asset,
    ) -> Result<String, TradeError> {
        let id = Uuid::new_v4().to_string();
        let request = TradeMessage::TradeRequest {
            trade_id: id.clone(),
            offered_asset: offered.clone(),
            requested_asset: requested.clone(),
        };
        self.inner.negotiations.write().insert(
            id.clone(),
            Negotiation::new(id.clone(), peer_id.clone(), TradeRole::Initiator, offered, requested),
        );

        if let Err(e) = self.inner.link.send_message(peer_id, request.into()).await {
            if let Some(n) = self.inner.negotiations.write().get_mut(&id) {
                if n.apply(TradeStep::Cancel, TradeRole::Initiator).is_ok() {
                    n.reason = Some(e.to_string());
                }
            }
            return Err(e.into());
        }
        info!(trade = %id, peer_id = %peer_id, "trade proposed");
        Ok(id)
    }

    pub async fn respond(&self, id: &str, accept: bool) -> Result<(), TradeError> {
        let step = if accept {
            TradeStep::Accept
        } else {
            TradeStep::Reject
        };
        self.local_step(id, step, |trade_id| TradeMessage::TradeResponse {
            trade_id,
            accepted: accept,
        })
        .await
    }

    pub async fn confirm(&self, id: &str) -> Result<(), TradeError> {
        self.local_step(id, TradeStep::Confirm, |trade_id| {
            TradeMessage::TradeConfirmation { trade_id }
        })
        .await
    }

    /// Record the settlement reference and tell the peer.
    ///
    /// Repeating the call with the recorded txid is a no-op. A different
    /// txid for a trade that already has one fails with
    /// [`TradeError::TxidConflict`].
    pub async fn execute(&self, id: &str, txid: impl Into<String>) -> Result<(), TradeError> {
        let txid = txid.into();
        let message_txid = txid.clone();
        let check = |n: &Negotiation| match &n.txid {
            Some(recorded) if *recorded != txid => Err(TradeError::TxidConflict {
                id: n.id.clone(),
                recorded: recorded.clone(),
            }),
            _ => Ok(()),
        };
        let recorded = txid.clone();
        self.local_step_with(
            id,
            TradeStep::Execute,
            check,
            |n| n.txid = Some(recorded),
            |trade_id| TradeMessage::TradeExecution {
                trade_id,
                txid: message_txid,
            },
        )
        .await
    }

    pub async fn complete(&self, id: &str) -> Result<(), TradeError> {
        self.local_step(id, TradeStep::Complete, |trade_id| {
            TradeMessage::TradeCompletion { trade_id }
        })
        .await
    }

    pub async fn cancel(&self, id: &str, reason: Option<String>) -> Result<(), TradeError> {
        let recorded = reason.clone();
        self.local_step_with(
            id,
            TradeStep::Cancel,
            |_| Ok(()),
            |n| n.reason = recorded,
            |trade_id| TradeMessage::TradeCancel { trade_id, reason },
        )
        .await
    }

    /// Cancel every open negotiation with `peer_id`, without telling it.
    /// Trades already executing are left alone; settlement is outside
    /// this protocol.
    pub async fn cancel_peer(&self, peer_id: &PeerId) -> Vec<String> {
        let canceled: Vec<String> = {
            let mut negotiations = self.inner.negotiations.write();
            negotiations
                .values_mut()
                .filter(|n| n.peer_id == *peer_id)
                .filter_map(|n| {
                    let actor = n.role;
                    match n.apply(TradeStep::Cancel, actor) {
                        Ok(Applied::Changed) => {
                            n.reason = Some("peer disconnected".into());
                            Some(n.id.clone())
                        }
                        _ => None,
                    }
                })
                .collect()
        };
        for id in &canceled {
            warn!(trade = %id, peer_id = %peer_id, "trade canceled: peer disconnected");
            self.inner
                .emit(TradeEvent::StatusChanged {
                    id: id.clone(),
                    peer_id: peer_id.clone(),
                    status: TradeStatus::Canceled,
                })
                .await;
        }
        canceled
    }

    async fn local_step(
        &self,
        id: &str,
        step: TradeStep,
        message: impl FnOnce(String) -> TradeMessage,
    ) -> Result<(), TradeError> {
        self.local_step_with(id, step, |_| Ok(()), |_| {}, message).await
    }

    /// Apply our own `step`, run `update` if it changed anything, then send
    /// the matching message. A repeated call is a no-op and sends nothing.
    ///
    /// If the send fails the negotiation is put back the way it was, so a
    /// retry takes the step again and resends.
    async fn local_step_with(
        &self,
        id: &str,
        step: TradeStep,
        check: impl FnOnce(&Negotiation) -> Result<(), TradeError>,
        update: impl FnOnce(&mut Negotiation),
        message: impl FnOnce(String) -> TradeMessage,
    ) -> Result<(), TradeError> {
        let (peer_id, previous) = {
            let mut negotiations = self.inner.negotiations.write();
            let n = negotiations
                .get_mut(id)
                .ok_or_else(|| TradeError::UnknownTrade(id.to_string()))?;
            check(&*n)?;
            let previous = n.clone();
            let actor = n.role;
            match n.apply(step, actor) {
                Ok(Applied::Changed) => update(n),
                Ok(Applied::Duplicate) => {
                    debug!(trade = %id, status = %n.status, "trade already in target status");
                    return Ok(());
                }
                Err(e) => {
                    return Err(TradeError::InvalidTransition {
                        id: id.to_string(),
                        from: e.from,
                        to: e.to,
                    });
                }
            }
            (n.peer_id.clone(), previous)
        };

        let sent = self
            .inner
            .link
            .send_message(&peer_id, message(id.to_string()).into())
            .await;
        if let Err(e) = sent {
            if let Some(n) = self.inner.negotiations.write().get_mut(id) {
                // Only undo our own step; the peer may have moved it since.
                if n.status == step.target() {
                    *n = previous;
                }
            }
            warn!(trade = %id, peer_id = %peer_id, error = %e, "trade message not sent, step undone");
            return Err(e.into());
        }
        info!(trade = %id, peer_id = %peer_id, status = %step.target(), "trade updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Handle a decrypted trade message from `peer_id`.
    pub async fn handle_message(&self, peer_id: &PeerId, message: TradeMessage) {
        trace!(peer_id = %peer_id, kind = message.kind(), trade = message.trade_id(), "trade message");
        let (id, step) = match message {
            TradeMessage::TradeRequest {
                trade_id,
                offered_asset,
                requested_asset,
            } => {
                let negotiation = {
                    let mut negotiations = self.inner.negotiations.write();
                    match negotiations.entry(trade_id.clone()) {
                        Entry::Occupied(_) => {
                            debug!(trade = %trade_id, "duplicate trade request ignored");
                            return;
                        }
                        Entry::Vacant(slot) => slot
                            .insert(Negotiation::new(
                                trade_id.clone(),
                                peer_id.clone(),
                                TradeRole::Responder,
                                offered_asset,
                                requested_asset,
                            ))
                            .clone(),
                    }
                };
                info!(
                    trade = %trade_id,
                    peer_id = %peer_id,
                    offered = %negotiation.offered_asset,
                    requested = %negotiation.requested_asset,
                    "trade proposed by peer"
                );
                self.inner.emit(TradeEvent::Requested { negotiation }).await;
                return;
            }
            TradeMessage::TradeResponse { trade_id, accepted } => (
                trade_id,
                if accepted {
                    TradeStep::Accept
                } else {
                    TradeStep::Reject
                },
            ),
            TradeMessage::TradeConfirmation { trade_id } => (trade_id, TradeStep::Confirm),
            TradeMessage::TradeExecution { trade_id, txid } => {
                return self.inbound_step(peer_id, &trade_id, TradeStep::Execute, |n| {
                    n.txid = Some(txid)
                })
                .await;
            }
            TradeMessage::TradeCompletion { trade_id } => (trade_id, TradeStep::Complete),
            TradeMessage::TradeCancel { trade_id, reason } => {
                return self.inbound_step(peer_id, &trade_id, TradeStep::Cancel, |n| {
                    n.reason = reason
                })
                .await;
            }
        };
        self.inbound_step(peer_id, &id, step, |_| {}).await;
    }

    async fn inbound_step(
        &self,
        peer_id: &PeerId,
        id: &str,
        step: TradeStep,
        update: impl FnOnce(&mut Negotiation),
    ) {
        let outcome = {
            let mut negotiations = self.inner.negotiations.write();
            let Some(n) = negotiations.get_mut(id) else {
                debug!(trade = %id, peer_id = %peer_id, "message for unknown trade dropped");
                return;
            };
            if n.peer_id != *peer_id {
                warn!(trade = %id, owner = %n.peer_id, from = %peer_id, "message for another peer's trade dropped");
                return;
            }
            let actor = n.role.counterpart();
            match n.apply(step, actor) {
                Ok(Applied::Changed) => {
                    update(n);
                    Ok(n.status)
                }
                Ok(Applied::Duplicate) => {
                    debug!(trade = %id, status = %n.status, "duplicate trade message ignored");
                    return;
                }
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(status) => {
                info!(trade = %id, peer_id = %peer_id, %status, "trade moved by peer");
                self.inner
                    .emit(TradeEvent::StatusChanged {
                        id: id.to_string(),
                        peer_id: peer_id.clone(),
                        status,
                    })
                    .await;
            }
            Err(e) => {
                warn!(trade = %id, peer_id = %peer_id, error = %e, "invalid trade transition ignored");
                self.inner
                    .emit(TradeEvent::InvalidTransition {
                        id: id.to_string(),
                        peer_id: peer_id.clone(),
                        from: e.from,
                        attempted: e.to,
                    })
                    .await;
            }
        }
    }
}

impl Inner {
    async fn emit(&self, event: TradeEvent) {
        if self.events.send(event).await.is_err() {
            trace!("trade event dropped: no receiver");
        }
    }
}
