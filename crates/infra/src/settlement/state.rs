//! Per-message settlement state machine.
//!
//! ```text
//! RECEIVED -> PARSED -> SETTLING -> COMMITTED
//!     |                  |  ^
//!     |                  v  |
//!     |               RETRYING
//!     |                  |
//!     +------------------+-----> PERMANENT_FAILURE
//! ```

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use payflow_core::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    /// Delivery taken from the bus, payload not yet inspected.
    Received,
    /// Payload decoded and validated.
    Parsed,
    /// Settlement transaction in progress.
    Settling,
    /// Last attempt failed transiently; waiting to try again.
    Retrying,
    /// Terminal: both legs recorded (now or by an earlier delivery).
    Committed,
    /// Terminal: the message can never settle and was dead-lettered.
    PermanentFailure,
}

impl SettlementState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::Committed | SettlementState::PermanentFailure
        )
    }

    pub fn can_transition_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        matches!(
            (self, next),
            (Received, Parsed)
                | (Received, PermanentFailure)
                | (Parsed, Settling)
                | (Settling, Committed)
                | (Settling, Retrying)
                | (Settling, PermanentFailure)
                | (Retrying, Settling)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Received => "RECEIVED",
            SettlementState::Parsed => "PARSED",
            SettlementState::Settling => "SETTLING",
            SettlementState::Retrying => "RETRYING",
            SettlementState::Committed => "COMMITTED",
            SettlementState::PermanentFailure => "PERMANENT_FAILURE",
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one delivery through the state machine, logging each step.
#[derive(Debug)]
pub struct SettlementProgress {
    delivery_id: String,
    transfer_id: Option<TransactionId>,
    state: SettlementState,
}

impl SettlementProgress {
    pub fn new(delivery_id: impl Into<String>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            transfer_id: None,
            state: SettlementState::Received,
        }
    }

    /// Attach the transfer id once the payload has been decoded.
    pub fn identify(&mut self, transfer_id: TransactionId) {
        self.transfer_id = Some(transfer_id);
    }

    pub fn state(&self) -> SettlementState {
        self.state
    }

    pub fn advance(&mut self, next: SettlementState) {
        let from = self.state;
        if !from.can_transition_to(next) {
            warn!(
                delivery_id = %self.delivery_id,
                from = %from,
                to = %next,
                "unexpected settlement state transition"
            );
        }
        match self.transfer_id {
            Some(transfer_id) => debug!(
                delivery_id = %self.delivery_id,
                %transfer_id,
                from = %from,
                state = %next,
                "settlement state"
            ),
            None => debug!(
                delivery_id = %self.delivery_id,
                from = %from,
                state = %next,
                "settlement state"
            ),
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SettlementState::*;

    #[test]
    fn terminal_states() {
        assert!(Committed.is_terminal());
        assert!(PermanentFailure.is_terminal());
        for s in [Received, Parsed, Settling, Retrying] {
            assert!(!s.is_terminal(), "{s}");
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let all = [Received, Parsed, Settling, Retrying, Committed, PermanentFailure];
        for next in all {
            assert!(!Committed.can_transition_to(next));
            assert!(!PermanentFailure.can_transition_to(next));
        }
    }

    #[test]
    fn retry_loop_returns_to_settling() {
        let mut p = SettlementProgress::new("1");
        for next in [Parsed, Settling, Retrying, Settling, Committed] {
            assert!(p.state().can_transition_to(next));
            p.advance(next);
        }
        assert_eq!(p.state(), Committed);
        assert!(!Parsed.can_transition_to(Committed));
    }
}
