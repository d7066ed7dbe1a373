//! # Prometheus Metrics
//!
//! Operational counters for a running node, fed from the node's event
//! queues and rendered in the Prometheus text exposition format.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use parley_protocol::trade::TradeEvent;
use parley_protocol::transfer::TransferEvent;
use parley_protocol::NodeEvent;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are `Arc`s internally) so it can be
/// shared across the tasks draining each event queue.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Number of live peer connections.
    pub connected_peers: IntGauge,
    /// Protocol events observed, by protocol and event name.
    pub protocol_events_total: IntCounterVec,
    /// Inbound frames dropped because they failed to open or decode.
    pub frames_rejected_total: IntCounter,
    /// Payload bytes of incoming files that were reassembled.
    pub chunk_bytes_received_total: IntCounter,
    /// Transfers that reached a final state, by outcome.
    pub transfers_total: IntCounterVec,
    /// Negotiations that reached a final state, by outcome.
    pub trades_total: IntCounterVec,
    /// Wall time from request to completion of a transfer, in seconds.
    pub transfer_duration_seconds: Histogram,
}

fn register<M>(registry: &Registry, metric: M) -> prometheus::Result<M>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("parley".into()), None)?;

        let connected_peers = register(
            &registry,
            IntGauge::new("connected_peers", "Number of live peer connections")?,
        )?;
        let protocol_events_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("protocol_events_total", "Protocol events observed"),
                &["protocol", "event"],
            )?,
        )?;
        let frames_rejected_total = register(
            &registry,
            IntCounter::new(
                "frames_rejected_total",
                "Inbound frames that failed integrity, decryption or decoding",
            )?,
        )?;
        let chunk_bytes_received_total = register(
            &registry,
            IntCounter::new(
                "chunk_bytes_received_total",
                "Bytes of incoming files reassembled from chunks",
            )?,
        )?;
        let transfers_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("transfers_total", "File transfers by final outcome"),
                &["outcome"],
            )?,
        )?;
        let trades_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("trades_total", "Trade negotiations by final outcome"),
                &["outcome"],
            )?,
        )?;
        let transfer_duration_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "transfer_duration_seconds",
                    "Time from transfer request to completion in seconds",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            )?,
        )?;

        Ok(Self {
            registry,
            connected_peers,
            protocol_events_total,
            frames_rejected_total,
            chunk_bytes_received_total,
            transfers_total,
            trades_total,
            transfer_duration_seconds,
        })
    }

    pub fn observe_node(&self, event: &NodeEvent) {
        let name = match event {
            NodeEvent::Connected { .. } => "connected",
            NodeEvent::Disconnected { .. } => "disconnected",
            NodeEvent::ChannelOpened { .. } => "channel_opened",
            NodeEvent::ChannelClosed { .. } => "channel_closed",
            NodeEvent::FrameRejected { .. } => {
                self.frames_rejected_total.inc();
                "frame_rejected"
            }
            NodeEvent::Message { .. } => "message",
        };
        self.protocol_events_total
            .with_label_values(&["node", name])
            .inc();
    }

    pub fn observe_transfer(&self, event: &TransferEvent) {
        let name = match event {
            TransferEvent::Requested { .. } => "requested",
            TransferEvent::Accepted { .. } => "accepted",
            TransferEvent::Progress { .. } => "progress",
            TransferEvent::Rejected { .. } => {
                self.transfers_total.with_label_values(&["rejected"]).inc();
                "rejected"
            }
            TransferEvent::Completed { data, .. } => {
                if let Some(data) = data {
                    self.chunk_bytes_received_total.inc_by(data.len() as u64);
                }
                self.transfers_total.with_label_values(&["completed"]).inc();
                "completed"
            }
            TransferEvent::Canceled { .. } => {
                self.transfers_total.with_label_values(&["canceled"]).inc();
                "canceled"
            }
            TransferEvent::Failed { .. } => {
                self.transfers_total.with_label_values(&["failed"]).inc();
                "failed"
            }
        };
        self.protocol_events_total
            .with_label_values(&["transfer", name])
            .inc();
    }

    pub fn observe_trade(&self, event: &TradeEvent) {
        let name = match event {
            TradeEvent::Requested { .. } => "requested",
            TradeEvent::StatusChanged { status, .. } => {
                if status.is_terminal() {
                    let outcome = status.to_string();
                    self.trades_total.with_label_values(&[&outcome]).inc();
                }
                "status_changed"
            }
            TradeEvent::InvalidTransition { .. } => "invalid_transition",
        };
        self.protocol_events_total
            .with_label_values(&["trade", name])
            .inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
