//! Trade negotiation messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An amount of some asset, in its smallest unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub amount: u64,
}

impl Asset {
    pub fn new(symbol: impl Into<String>, amount: u64) -> Self {
        Self {
            symbol: symbol.into(),
            amount,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeMessage {
    #[serde(rename_all = "camelCase")]
    TradeRequest {
        trade_id: String,
        offered_asset: Asset,
        requested_asset: Asset,
    },
    #[serde(rename_all = "camelCase")]
    TradeResponse { trade_id: String, accepted: bool },
    #[serde(rename_all = "camelCase")]
    TradeConfirmation { trade_id: String },
    /// `txid` is the settlement reference obtained outside this protocol.
    #[serde(rename_all = "camelCase")]
    TradeExecution { trade_id: String, txid: String },
    #[serde(rename_all = "camelCase")]
    TradeCompletion { trade_id: String },
    #[serde(rename_all = "camelCase")]
    TradeCancel {
        trade_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TradeMessage {
    pub fn trade_id(&self) -> &str {
        match self {
            TradeMessage::TradeRequest { trade_id, .. }
            | TradeMessage::TradeResponse { trade_id, .. }
            | TradeMessage::TradeConfirmation { trade_id }
            | TradeMessage::TradeExecution { trade_id, .. }
            | TradeMessage::TradeCompletion { trade_id }
            | TradeMessage::TradeCancel { trade_id, .. } => trade_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TradeMessage::TradeRequest { .. } => "trade_request",
            TradeMessage::TradeResponse { .. } => "trade_response",
            TradeMessage::TradeConfirmation { .. } => "trade_confirmation",
            TradeMessage::TradeExecution { .. } => "trade_execution",
            TradeMessage::TradeCompletion { .. } => "trade_completion",
            TradeMessage::TradeCancel { .. } => "trade_cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let msg = TradeMessage::TradeRequest {
            trade_id: "t1".into(),
            offered_asset: Asset::new("BTC", 1_000),
            requested_asset: Asset::new("ETH", 20_000),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "trade_request");
        assert_eq!(json["tradeId"], "t1");
        assert_eq!(json["offeredAsset"]["symbol"], "BTC");
        assert_eq!(json["requestedAsset"]["amount"], 20_000);
    }

    #[test]
    fn test_parses_execution() {
        let msg: TradeMessage =
            serde_json::from_str(r#"{"type":"trade_execution","tradeId":"t9","txid":"0xabc"}"#)
                .unwrap();
        assert_eq!(msg.trade_id(), "t9");
        assert_eq!(msg.kind(), "trade_execution");
        assert_eq!(
            msg,
            TradeMessage::TradeExecution {
                trade_id: "t9".into(),
                txid: "0xabc".into()
            }
        );
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        assert!(serde_json::from_str::<TradeMessage>(r#"{"type":"trade_response","tradeId":"t1"}"#).is_err());
        assert!(serde_json::from_str::<TradeMessage>(r#"{"type":"trade_execution","tradeId":"t1"}"#).is_err());
    }

    #[test]
    fn test_asset_display() {
        assert_eq!(Asset::new("SOL", 5).to_string(), "5 SOL");
    }
}
