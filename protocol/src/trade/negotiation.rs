//! Per-trade state and its transition rules.
//!
//! ```text
//! requested ──▶ accepted ──▶ confirmed ──▶ executing ──▶ completed
//!    │  │           │            │
//!    │  └▶ rejected │            │
//!    └──────────────┴────────────┴──▶ canceled
//! ```
//!
//! Only the responder answers a request and only the initiator confirms.
//! Execution, completion and cancellation may come from either side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::identity::PeerId;

use super::messages::Asset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeRole {
    /// Sent the `trade_request`.
    Initiator,
    Responder,
}

impl TradeRole {
    pub fn counterpart(self) -> Self {
        match self {
            TradeRole::Initiator => TradeRole::Responder,
            TradeRole::Responder => TradeRole::Initiator,
        }
    }
}

impl fmt::Display for TradeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeRole::Initiator => f.write_str("initiator"),
            TradeRole::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Requested,
    Accepted,
    Rejected,
    Confirmed,
    Executing,
    Completed,
    Canceled,
}

impl TradeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Rejected | TradeStatus::Completed | TradeStatus::Canceled
        )
    }

    pub fn can_become(self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Requested, Accepted | Rejected | Canceled)
                | (Accepted, Confirmed | Canceled)
                | (Confirmed, Executing | Canceled)
                | (Executing, Completed)
        )
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::Requested => "requested",
            TradeStatus::Accepted => "accepted",
            TradeStatus::Rejected => "rejected",
            TradeStatus::Confirmed => "confirmed",
            TradeStatus::Executing => "executing",
            TradeStatus::Completed => "completed",
            TradeStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// One move in a negotiation, local or inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeStep {
    Accept,
    Reject,
    Confirm,
    Execute,
    Complete,
    Cancel,
}

impl TradeStep {
    pub fn target(self) -> TradeStatus {
        match self {
            TradeStep::Accept => TradeStatus::Accepted,
            TradeStep::Reject => TradeStatus::Rejected,
            TradeStep::Confirm => TradeStatus::Confirmed,
            TradeStep::Execute => TradeStatus::Executing,
            TradeStep::Complete => TradeStatus::Completed,
            TradeStep::Cancel => TradeStatus::Canceled,
        }
    }

    /// The role allowed to take this step, if it is restricted.
    fn reserved_for(self) -> Option<TradeRole> {
        match self {
            TradeStep::Accept | TradeStep::Reject => Some(TradeRole::Responder),
            TradeStep::Confirm => Some(TradeRole::Initiator),
            TradeStep::Execute | TradeStep::Complete | TradeStep::Cancel => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Already in the target status. Nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{actor} cannot move trade from {from} to {to}")]
pub struct TransitionError {
    pub actor: TradeRole,
    pub from: TradeStatus,
    pub to: TradeStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiation {
    pub id: String,
    pub peer_id: PeerId,
    /// Our side of the trade.
    pub role: TradeRole,
    pub offered_asset: Asset,
    pub requested_asset: Asset,
    pub status: TradeStatus,
    pub txid: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Negotiation {
    pub(crate) fn new(
        id: String,
        peer_id: PeerId,
        role: TradeRole,
        offered_asset: Asset,
        requested_asset: Asset,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer_id,
            role,
            offered_asset,
            requested_asset,
            status: TradeStatus::Requested,
            txid: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply `step` taken by `actor`.
    pub(crate) fn apply(
        &mut self,
        step: TradeStep,
        actor: TradeRole,
    ) -> Result<Applied, TransitionError> {
        let to = step.target();
        let refused = TransitionError {
            actor,
            from: self.status,
            to,
        };
        if step.reserved_for().is_some_and(|role| role != actor) {
            return Err(refused);
        }
        if self.status == to {
            return Ok(Applied::Duplicate);
        }
        if !self.status.can_become(to) {
            return Err(refused);
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(Applied::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(role: TradeRole) -> Negotiation {
        Negotiation::new(
            "t1".into(),
            "bob".into(),
            role,
            Asset::new("BTC", 1),
            Asset::new("ETH", 30),
        )
    }

    const ALL_STEPS: [TradeStep; 6] = [
        TradeStep::Accept,
        TradeStep::Reject,
        TradeStep::Confirm,
        TradeStep::Execute,
        TradeStep::Complete,
        TradeStep::Cancel,
    ];

    #[test]
    fn test_happy_path() {
        let mut t = trade(TradeRole::Initiator);
        use TradeRole::*;
        assert_eq!(t.apply(TradeStep::Accept, Responder), Ok(Applied::Changed));
        assert_eq!(t.apply(TradeStep::Confirm, Initiator), Ok(Applied::Changed));
        assert_eq!(t.apply(TradeStep::Execute, Responder), Ok(Applied::Changed));
        assert_eq!(t.apply(TradeStep::Complete, Initiator), Ok(Applied::Changed));
        assert_eq!(t.status, TradeStatus::Completed);
    }

    #[test]
    fn test_roles_are_enforced() {
        let mut t = trade(TradeRole::Initiator);
        assert!(t.apply(TradeStep::Accept, TradeRole::Initiator).is_err());
        t.apply(TradeStep::Accept, TradeRole::Responder).unwrap();
        let err = t.apply(TradeStep::Confirm, TradeRole::Responder).unwrap_err();
        assert_eq!(err.from, TradeStatus::Accepted);
        assert_eq!(err.to, TradeStatus::Confirmed);
        assert_eq!(t.status, TradeStatus::Accepted);
    }

    #[test]
    fn test_out_of_order_is_refused() {
        let mut t = trade(TradeRole::Initiator);
        for step in [TradeStep::Confirm, TradeStep::Execute, TradeStep::Complete] {
            assert!(t.apply(step, TradeRole::Initiator).is_err());
            assert!(t.apply(step, TradeRole::Responder).is_err());
        }
        assert_eq!(t.status, TradeStatus::Requested);
    }

    #[test]
    fn test_redelivery_is_a_duplicate() {
        let mut t = trade(TradeRole::Responder);
        t.apply(TradeStep::Accept, TradeRole::Responder).unwrap();
        assert_eq!(
            t.apply(TradeStep::Accept, TradeRole::Responder),
            Ok(Applied::Duplicate)
        );
        // A contradicting response is not a duplicate.
        assert!(t.apply(TradeStep::Reject, TradeRole::Responder).is_err());
    }

    #[test]
    fn test_executing_cannot_be_canceled() {
        let mut t = trade(TradeRole::Initiator);
        t.apply(TradeStep::Accept, TradeRole::Responder).unwrap();
        t.apply(TradeStep::Confirm, TradeRole::Initiator).unwrap();
        t.apply(TradeStep::Execute, TradeRole::Initiator).unwrap();
        assert!(t.apply(TradeStep::Cancel, TradeRole::Responder).is_err());
    }

    #[test]
    fn test_terminal_states_never_move() {
        let terminals = [
            TradeStatus::Rejected,
            TradeStatus::Completed,
            TradeStatus::Canceled,
        ];
        for terminal in terminals {
            for step in ALL_STEPS {
                for actor in [TradeRole::Initiator, TradeRole::Responder] {
                    let mut t = trade(TradeRole::Initiator);
                    t.status = terminal;
                    let _ = t.apply(step, actor);
                    assert_eq!(t.status, terminal, "{step:?} by {actor} moved {terminal}");
                }
            }
        }
    }

    #[test]
    fn test_every_reachable_status_moves_forward_only() {
        let order = |s: TradeStatus| match s {
            TradeStatus::Requested => 0,
            TradeStatus::Accepted => 1,
            TradeStatus::Confirmed => 2,
            TradeStatus::Executing => 3,
            TradeStatus::Completed | TradeStatus::Rejected | TradeStatus::Canceled => 4,
        };
        let statuses = [
            TradeStatus::Requested,
            TradeStatus::Accepted,
            TradeStatus::Confirmed,
            TradeStatus::Executing,
        ];
        for from in statuses {
            for step in ALL_STEPS {
                let to = step.target();
                if from.can_become(to) {
                    assert!(order(to) > order(from), "{from} -> {to}");
                }
            }
        }
    }
}
