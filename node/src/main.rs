// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Parley Node
//!
//! Entry point for the `parley-node` binary. Parses CLI arguments,
//! initializes logging and then runs one of four subcommands:
//!
//! - `init`    - create the data directory and the identity key
//! - `pubkey`  - print the identity's exported public key
//! - `demo`    - two nodes, one file and one trade over the loopback network
//! - `version` - print build version information

mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_protocol::config::{ENVELOPE_VERSION, PROTOCOL_VERSION};
use parley_protocol::crypto::{
    KeyStore, MemoryKeyStore, PeerEncryptionService, SledKeyStore, StoredIdentity,
};
use parley_protocol::signaling::MemorySignalingHub;
use parley_protocol::trade::{Asset, TradeEvent, TradeStatus};
use parley_protocol::transfer::TransferEvent;
use parley_protocol::transport::MemoryNetwork;
use parley_protocol::{NodeConfig, NodeEvent, NodeEvents, PeerId, PeerNode};

use cli::{Commands, DemoArgs, InitArgs, ParleyNodeCli, StoreArgs};
use logging::LogFormat;
use metrics::NodeMetrics;

/// File written by `init` and picked up by later commands when no
/// `--config` is given.
const CONFIG_FILE_NAME: &str = "config.json";

/// Subdirectory of the data directory holding the sled key store.
const KEYS_DIR_NAME: &str = "keys";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ParleyNodeCli::parse();
    logging::init_logging(&cli.log_level, LogFormat::from_str_lossy(&cli.log_format));

    match cli.command {
        Commands::Init(args) => init_node(args),
        Commands::Pubkey(args) => print_public_key(args),
        Commands::Demo(args) => run_demo(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Read a JSON [`NodeConfig`]. Fields the file leaves out keep their defaults.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid node configuration in {}", path.display()))
}

/// The explicit `--config`, else `<data-dir>/config.json` if it exists.
fn resolve_config(args: &StoreArgs) -> Result<NodeConfig> {
    let fallback = args.data_dir.join(CONFIG_FILE_NAME);
    let path: Option<PathBuf> = match &args.config {
        Some(path) => Some(path.clone()),
        None if fallback.exists() => Some(fallback),
        None => None,
    };
    load_config(path.as_deref())
}

fn open_key_store(data_dir: &Path) -> Result<SledKeyStore> {
    let path = data_dir.join(KEYS_DIR_NAME);
    SledKeyStore::open(&path)
        .with_context(|| format!("failed to open key store at {}", path.display()))
}

// ---------------------------------------------------------------------------
// init / pubkey
// ---------------------------------------------------------------------------

/// Creates the data directory, writes a default config if none exists and
/// loads or generates the identity key.
fn init_node(args: InitArgs) -> Result<()> {
    let data_dir = &args.store.data_dir;
    tracing::info!(data_dir = %data_dir.display(), force = args.force, "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config = resolve_config(&args.store)?;
    let config_path = data_dir.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        let rendered = serde_json::to_string_pretty(&config)?;
        std::fs::write(&config_path, rendered)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    let store = Arc::new(open_key_store(data_dir)?);
    let crypto = PeerEncryptionService::new(store, config.crypto.clone());
    let public_key = crypto
        .initialize(args.force)
        .context("failed to initialize identity")?;

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Public key     : {}", public_key);

    Ok(())
}

/// Prints the stored identity's public key without creating one.
fn print_public_key(args: StoreArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let store = open_key_store(&args.data_dir)?;
    let Some(raw) = store
        .load(&config.crypto.storage_key)
        .context("failed to read identity record")?
    else {
        bail!(
            "no identity in {}; run `parley-node init` first",
            args.data_dir.display()
        );
    };
    let identity = StoredIdentity::decode(&raw).context("corrupt identity record")?;
    println!("{}", identity.to_keypair().exported_public_key());
    Ok(())
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

/// Everything a demo node reports, merged into one ordered stream.
#[derive(Debug)]
enum Observed {
    Node(NodeEvent),
    Transfer(TransferEvent),
    Trade(TradeEvent),
}

struct DemoPeer {
    node: PeerNode,
    observed: mpsc::UnboundedReceiver<Observed>,
    pump: JoinHandle<()>,
}

impl DemoPeer {
    fn start(
        name: &str,
        config: &NodeConfig,
        hub: &MemorySignalingHub,
        network: &MemoryNetwork,
        metrics: &Arc<NodeMetrics>,
    ) -> Result<Self> {
        let id = PeerId::new(name);
        let (signaling, signaling_rx) = hub.register(&id);
        let (node, events) = PeerNode::start(
            id,
            config.clone(),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(signaling),
            signaling_rx,
            Arc::new(network.clone()),
        )
        .with_context(|| format!("failed to start node {name}"))?;
        let (observed, pump) = spawn_pump(events, Arc::clone(metrics));
        Ok(Self {
            node,
            observed,
            pump,
        })
    }

    fn public_key(&self) -> Result<String> {
        self.node
            .public_key()
            .with_context(|| format!("node {} has no identity", self.node.id()))
    }

    /// Wait for the first event `pick` accepts, discarding the rest.
    async fn wait_for<R>(
        &mut self,
        limit: Duration,
        what: &str,
        mut pick: impl FnMut(Observed) -> Option<R>,
    ) -> Result<R> {
        let observed = &mut self.observed;
        let search = async {
            while let Some(event) = observed.recv().await {
                if let Some(found) = pick(event) {
                    return Some(found);
                }
            }
            None
        };
        tokio::time::timeout(limit, search)
            .await
            .with_context(|| format!("timed out waiting for {what}"))?
            .with_context(|| format!("event stream closed before {what}"))
    }

    async fn wait_trade_status(
        &mut self,
        limit: Duration,
        trade_id: &str,
        wanted: TradeStatus,
    ) -> Result<()> {
        let what = format!("trade {trade_id} to become {wanted}");
        let reached = self
            .wait_for(limit, &what, |event| match event {
                Observed::Trade(TradeEvent::StatusChanged { id, status, .. }) if id == trade_id => {
                    Some(status)
                }
                _ => None,
            })
            .await?;
        if reached != wanted {
            bail!("trade {trade_id} became {reached} instead of {wanted}");
        }
        Ok(())
    }

    async fn stop(self) {
        self.node.shutdown().await;
        self.pump.abort();
    }
}

/// Drain all three of a node's queues so no producer ever blocks on a full
/// one, recording metrics on the way.
fn spawn_pump(
    mut events: NodeEvents,
    metrics: Arc<NodeMetrics>,
) -> (mpsc::UnboundedReceiver<Observed>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        loop {
            let observed = tokio::select! {
                Some(event) = events.node.recv() => {
                    metrics.observe_node(&event);
                    Observed::Node(event)
                }
                Some(event) = events.transfers.recv() => {
                    metrics.observe_transfer(&event);
                    Observed::Transfer(event)
                }
                Some(event) = events.trades.recv() => {
                    metrics.observe_trade(&event);
                    Observed::Trade(event)
                }
                else => break,
            };
            if tx.send(observed).is_err() {
                break;
            }
        }
    });
    (rx, handle)
}

/// Deterministic filler so the receiver can be checked byte for byte.
fn demo_payload(size: usize) -> Bytes {
    (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let limit = Duration::from_secs(args.timeout_secs);
    let metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    let hub = MemorySignalingHub::new();
    let network = MemoryNetwork::new();
    let mut alice = DemoPeer::start("alice", &config, &hub, &network, &metrics)?;
    let mut bob = DemoPeer::start("bob", &config, &hub, &network, &metrics)?;
    let alice_id = alice.node.id().clone();
    let bob_id = bob.node.id().clone();

    // --- Key exchange (out of band) ---
    alice.node.add_peer(&bob_id, &bob.public_key()?, true)?;
    bob.node.add_peer(&alice_id, &alice.public_key()?, true)?;

    // --- Session ---
    let label = config.manager.default_channel.clone();
    alice.node.connect(&bob_id).await.context("connect failed")?;
    for peer in [&mut alice, &mut bob] {
        peer.wait_for(limit, "protocol channel", |event| match event {
            Observed::Node(NodeEvent::ChannelOpened { label: l, .. }) if l == label => Some(()),
            _ => None,
        })
        .await?;
    }
    metrics.connected_peers.set(
        (alice.node.manager().connection_count() + bob.node.manager().connection_count()) as i64,
    );
    tracing::info!(channel = %label, "alice and bob connected");

    // --- File transfer ---
    let payload = demo_payload(args.file_size);
    let started = Instant::now();
    let transfer_id = alice
        .node
        .transfers()
        .send_file(&bob_id, "demo.bin", "application/octet-stream", payload.clone())
        .await
        .context("send_file failed")?;

    let offered = bob
        .wait_for(limit, "file request", |event| match event {
            Observed::Transfer(TransferEvent::Requested { transfer }) if transfer.id == transfer_id => {
                Some(transfer)
            }
            _ => None,
        })
        .await?;
    tracing::info!(
        transfer = %transfer_id,
        size = offered.total_size,
        chunks = offered.total_chunks,
        "bob accepting file"
    );
    bob.node.transfers().respond(transfer_id, true).await?;

    let received = bob
        .wait_for(limit, "file data", |event| match event {
            Observed::Transfer(TransferEvent::Completed { id, data, .. }) if id == transfer_id => {
                Some(Ok(data.unwrap_or_default()))
            }
            Observed::Transfer(TransferEvent::Failed { id, reason, .. }) if id == transfer_id => {
                Some(Err(anyhow::anyhow!("transfer failed: {reason}")))
            }
            _ => None,
        })
        .await??;
    if received != payload {
        bail!("received file differs from the one sent");
    }
    alice
        .wait_for(limit, "sender completion", |event| match event {
            Observed::Transfer(TransferEvent::Completed { id, .. }) if id == transfer_id => Some(()),
            _ => None,
        })
        .await?;
    metrics
        .transfer_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    // --- Trade negotiation ---
    let trade_id = alice
        .node
        .trades()
        .propose(&bob_id, Asset::new("BTC", 1), Asset::new("USDC", 65_000))
        .await
        .context("propose failed")?;
    bob.wait_for(limit, "trade request", |event| match event {
        Observed::Trade(TradeEvent::Requested { negotiation }) if negotiation.id == trade_id => {
            Some(())
        }
        _ => None,
    })
    .await?;
    bob.node.trades().respond(&trade_id, true).await?;
    alice
        .wait_trade_status(limit, &trade_id, TradeStatus::Accepted)
        .await?;
    alice.node.trades().confirm(&trade_id).await?;
    bob.wait_trade_status(limit, &trade_id, TradeStatus::Confirmed)
        .await?;
    bob.node
        .trades()
        .execute(&trade_id, format!("demo-{}", &trade_id[..8]))
        .await?;
    alice
        .wait_trade_status(limit, &trade_id, TradeStatus::Executing)
        .await?;
    alice.node.trades().complete(&trade_id).await?;
    bob.wait_trade_status(limit, &trade_id, TradeStatus::Completed)
        .await?;

    let txid = alice
        .node
        .trades()
        .negotiation(&trade_id)
        .and_then(|n| n.txid)
        .unwrap_or_default();

    println!("Demo finished.");
    println!("  File     : {} bytes in {} chunks", received.len(), offered.total_chunks);
    println!("  Trade    : {} ({})", trade_id, TradeStatus::Completed);
    println!("  Txid     : {}", txid);
    println!();

    for peer in [&alice, &bob] {
        let transfers = peer.node.transfers().prune_terminal();
        let trades = peer.node.trades().prune_terminal();
        tracing::debug!(peer_id = %peer.node.id(), transfers, trades, "finished records pruned");
    }

    alice.stop().await;
    bob.stop().await;
    metrics.connected_peers.set(0);
    print!("{}", metrics.encode().context("failed to encode metrics")?);
    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("parley-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", PROTOCOL_VERSION);
    println!("envelope    v{}", ENVELOPE_VERSION);
    println!("rustc       {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_path_yields_defaults() {
        assert_eq!(load_config(None).unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_partial_config_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{ "transfer": { "chunk_size": 1024 } }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.manager, NodeConfig::default().manager);
    }

    #[test]
    fn test_init_then_pubkey_finds_the_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store_args = || StoreArgs {
            data_dir: dir.path().to_path_buf(),
            config: None,
        };
        init_node(InitArgs {
            store: store_args(),
            force: false,
        })
        .unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());

        print_public_key(store_args()).unwrap();
    }

    #[test]
    fn test_pubkey_without_init_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = print_public_key(StoreArgs {
            data_dir: dir.path().to_path_buf(),
            config: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("parley-node init"));
    }

    #[tokio::test]
    async fn test_demo_runs_end_to_end() {
        run_demo(DemoArgs {
            config: None,
            file_size: 40_000,
            timeout_secs: 10,
        })
        .await
        .unwrap();
    }
}
