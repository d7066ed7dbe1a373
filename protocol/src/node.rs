//! # Peer Node
//!
//! The `PeerNode` is the composition root: one identity, one connection
//! manager, one encryption service and the two protocols that ride on
//! them, wired together and driven by a pair of background tasks.
//!
//! ```text
//!  signaling rx ──▶ signaling loop ──▶ ConnectionManager
//!                                            │ ManagerEvent
//!                                            ▼
//!                                      dispatch loop
//!                              decrypt ──┬──▶ FileTransferProtocol
//!                                        └──▶ TradeProtocol
//! ```
//!
//! The dispatch loop handles one inbound frame at a time, so chunks reach
//! the transfer protocol in channel order. It also awaits the protocols'
//! event queues: a caller that stops draining [`NodeEvents`] eventually
//! stalls inbound processing for every peer.
//!
//! Replies the protocols send from inside a handler, such as auto-rejects
//! and cancel notices, wait for room in the connection's bounded outbound
//! queue on this same task. Two nodes that flood each other can therefore
//! each block on the other's backpressure until a queue drains or the
//! connection drops. Keep `channel_queue_capacity` well above the
//! control-message rate, and send bulk data from a spawned task the way
//! chunk streaming does.
//!
//! A frame that fails to decrypt is dropped and reported as
//! [`NodeEvent::FrameRejected`]; the connection it came from stays open.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::crypto::{CryptoError, KeyStore, PeerEncryptionService};
use crate::identity::PeerId;
use crate::network::{ConnectionManager, ConnectionState, ManagerError, ManagerEvent};
use crate::secure::{Inbound, LinkError, SecureChannel, WireMessage};
use crate::signaling::{SignalingEvent, SignalingTransport};
use crate::trade::{TradeEvent, TradeProtocol};
use crate::transfer::{FileTransferProtocol, TransferEvent};
use crate::transport::{Frame, TransportFactory};

// ---------------------------------------------------------------------------
// Errors and Events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Peer-level happenings. Protocol events arrive on their own queues.
#[derive(Debug)]
pub enum NodeEvent {
    Connected {
        peer_id: PeerId,
    },
    Disconnected {
        peer_id: PeerId,
        state: ConnectionState,
    },
    /// Protocol traffic to `peer_id` can flow once the protocol channel
    /// reports open.
    ChannelOpened {
        peer_id: PeerId,
        label: String,
    },
    ChannelClosed {
        peer_id: PeerId,
        label: String,
    },
    /// A frame on the protocol channel that could not be decrypted or
    /// decoded. Nothing downstream saw it.
    FrameRejected {
        peer_id: PeerId,
        error: LinkError,
    },
    /// Traffic on any channel other than the protocol channel, passed
    /// through untouched.
    Message {
        peer_id: PeerId,
        label: String,
        payload: Frame,
    },
}

/// Receivers for everything a running node reports.
pub struct NodeEvents {
    pub node: mpsc::Receiver<NodeEvent>,
    pub transfers: mpsc::Receiver<TransferEvent>,
    pub trades: mpsc::Receiver<TradeEvent>,
}

// ---------------------------------------------------------------------------
// Peer Node
// ---------------------------------------------------------------------------

pub struct PeerNode {
    id: PeerId,
    config: NodeConfig,
    crypto: Arc<PeerEncryptionService>,
    manager: ConnectionManager,
    channel: SecureChannel,
    transfers: FileTransferProtocol,
    trades: TradeProtocol,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNode {
    /// Load (or create) the identity in `store`, wire every component and
    /// start the background tasks. Must be called inside a Tokio runtime.
    pub fn start(
        id: PeerId,
        config: NodeConfig,
        store: Arc<dyn KeyStore>,
        signaling: Arc<dyn SignalingTransport>,
        signaling_rx: mpsc::Receiver<SignalingEvent>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Self, NodeEvents), NodeError> {
        let crypto = Arc::new(PeerEncryptionService::new(store, config.crypto.clone()));
        let public_key = crypto.initialize(false)?;

        let (manager, manager_rx) =
            ConnectionManager::new(id.clone(), config.manager.clone(), signaling, factory);
        let channel = SecureChannel::new(manager.clone(), Arc::clone(&crypto));
        let link = Arc::new(channel.clone());
        let (transfers, transfer_rx) = FileTransferProtocol::new(link.clone(), config.transfer.clone());
        let (trades, trade_rx) = TradeProtocol::new(link);
        let (node_tx, node_rx) = mpsc::channel(config.manager.event_queue_capacity);

        let dispatcher = Dispatcher {
            channel: channel.clone(),
            transfers: transfers.clone(),
            trades: trades.clone(),
            events: node_tx,
        };
        let tasks = vec![
            manager.spawn_signaling_loop(signaling_rx),
            tokio::spawn(dispatcher.run(manager_rx)),
        ];

        info!(peer_id = %id, public_key = %public_key, "peer node started");

        let node = Self {
            id,
            config,
            crypto,
            manager,
            channel,
            transfers,
            trades,
            tasks: Mutex::new(tasks),
        };
        let events = NodeEvents {
            node: node_rx,
            transfers: transfer_rx,
            trades: trade_rx,
        };
        Ok((node, events))
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Lower-case hex of our public key, for out-of-band exchange.
    pub fn public_key(&self) -> Option<String> {
        self.crypto.get_public_key()
    }

    pub fn crypto(&self) -> &Arc<PeerEncryptionService> {
        &self.crypto
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn channel(&self) -> &SecureChannel {
        &self.channel
    }

    pub fn transfers(&self) -> &FileTransferProtocol {
        &self.transfers
    }

    pub fn trades(&self) -> &TradeProtocol {
        &self.trades
    }

    /// Register a peer's public key. Frames from a peer are rejected until
    /// this has been done for it.
    pub fn add_peer(&self, peer_id: &PeerId, public_key_hex: &str, trusted: bool) -> Result<(), NodeError> {
        self.crypto.add_peer_public_key(peer_id, public_key_hex, trusted)?;
        Ok(())
    }

    pub async fn connect(&self, peer_id: &PeerId) -> Result<(), NodeError> {
        self.manager.connect(peer_id).await?;
        Ok(())
    }

    /// Close the connection to `peer_id` and settle everything in flight
    /// with it.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let existed = self.manager.close_connection(peer_id).await;
        self.transfers.fail_peer(peer_id).await;
        self.trades.cancel_peer(peer_id).await;
        existed
    }

    /// Close every connection and stop the background tasks.
    pub async fn shutdown(&self) {
        self.manager.close_all().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(peer_id = %self.id, "peer node stopped");
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

struct Dispatcher {
    channel: SecureChannel,
    transfers: FileTransferProtocol,
    trades: TradeProtocol,
    events: mpsc::Sender<NodeEvent>,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::Receiver<ManagerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ManagerEvent::Connected { peer_id } => {
                    self.emit(NodeEvent::Connected { peer_id }).await;
                }
                ManagerEvent::Disconnected { peer_id, state } => {
                    if state.is_terminal() {
                        let failed = self.transfers.fail_peer(&peer_id).await;
                        let canceled = self.trades.cancel_peer(&peer_id).await;
                        if !failed.is_empty() || !canceled.is_empty() {
                            info!(
                                peer_id = %peer_id,
                                transfers = failed.len(),
                                trades = canceled.len(),
                                "settled in-flight work for lost peer"
                            );
                        }
                    }
                    self.emit(NodeEvent::Disconnected { peer_id, state }).await;
                }
                ManagerEvent::MessageReceived {
                    peer_id,
                    label,
                    payload,
                } => {
                    if label == self.channel.label() {
                        self.on_frame(peer_id, &payload).await;
                    } else {
                        self.emit(NodeEvent::Message {
                            peer_id,
                            label,
                            payload,
                        })
                        .await;
                    }
                }
                ManagerEvent::ChannelOpened { peer_id, label } => {
                    debug!(peer_id = %peer_id, %label, "channel open");
                    self.emit(NodeEvent::ChannelOpened { peer_id, label }).await;
                }
                ManagerEvent::ChannelClosed { peer_id, label } => {
                    debug!(peer_id = %peer_id, %label, "channel closed");
                    self.emit(NodeEvent::ChannelClosed { peer_id, label }).await;
                }
            }
        }
        trace!("dispatch loop finished");
    }

    async fn on_frame(&self, peer_id: PeerId, frame: &Frame) {
        match self.channel.open(&peer_id, frame) {
            Ok(Inbound::Message(WireMessage::File(message))) => {
                self.transfers.handle_message(&peer_id, message).await;
            }
            Ok(Inbound::Message(WireMessage::Trade(message))) => {
                self.trades.handle_message(&peer_id, message).await;
            }
            Ok(Inbound::Chunk(chunk)) => {
                self.transfers.handle_chunk(&peer_id, chunk).await;
            }
            Err(error) => {
                warn!(peer_id = %peer_id, len = frame.len(), %error, "inbound frame rejected");
                self.emit(NodeEvent::FrameRejected { peer_id, error }).await;
            }
        }
    }

    async fn emit(&self, event: NodeEvent) {
        if self.events.send(event).await.is_err() {
            trace!("node event dropped: no receiver");
        }
    }
}
