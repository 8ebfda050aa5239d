//! Order lifecycle state machine.
//!
//! # Design
//!
//! Every status change on an [`Order`](crate::Order) goes through
//! [`OrderStatus::transition`], which enforces the legal edges of the
//! lifecycle:
//!
//! ```text
//!   New ──────────────► InProgress ──► Completed (term.)
//!    │                     ▲   │
//!    └──► SentToOt ────────┘   └─────► Failed (term.)
//! ```
//!
//! `SentToOt` is kept so rows written by older bridges still parse; the
//! dispatcher never writes it. Nothing returns to `New`, and nothing reaches
//! a terminal status without passing through `InProgress`.

use serde::{Deserialize, Serialize};

/// All states a production order can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created by order entry; waiting for the bridge.
    New,
    /// Parameters handed to the device but not yet confirmed running.
    SentToOt,
    /// Start transaction written; the bridge is polling progress.
    InProgress,
    /// Device reported completion. **Terminal.**
    Completed,
    /// Timed out, rejected, or aborted by an error. **Terminal.**
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::SentToOt => "SENT_TO_OT",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "SENT_TO_OT" => Ok(OrderStatus::SentToOt),
            "IN_PROGRESS" => Ok(OrderStatus::InProgress),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Failed)
    }

    /// Statuses from which `self` can be reached in one step.
    pub fn predecessors(self) -> &'static [OrderStatus] {
        use OrderStatus::*;

        match self {
            New => &[],
            SentToOt => &[New],
            InProgress => &[New, SentToOt],
            Completed | Failed => &[InProgress],
        }
    }

    /// Validate a move from `self` to `next`.
    ///
    /// # Errors
    /// Returns [`TransitionError`] for any edge not in the lifecycle diagram,
    /// including self-loops.
    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus, TransitionError> {
        use OrderStatus::*;

        match (self, next) {
            (New, InProgress) | (New, SentToOt) | (SentToOt, InProgress) => Ok(next),
            (InProgress, Completed) | (InProgress, Failed) => Ok(next),
            (from, to) => Err(TransitionError { from, to }),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Returned when a status change is not a legal lifecycle edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal order transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// A persisted status string that does not name any [`OrderStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid order status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    const ALL: [OrderStatus; 5] = [New, SentToOt, InProgress, Completed, Failed];

    #[test]
    fn dispatch_path_is_legal() {
        assert_eq!(New.transition(InProgress), Ok(InProgress));
        assert_eq!(InProgress.transition(Completed), Ok(Completed));
        assert_eq!(InProgress.transition(Failed), Ok(Failed));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for from in [Completed, Failed] {
            for to in ALL {
                assert!(from.transition(to).is_err(), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn nothing_returns_to_new() {
        for from in ALL {
            assert!(from.transition(New).is_err());
        }
    }

    #[test]
    fn terminal_requires_in_progress() {
        for from in [New, SentToOt] {
            assert!(from.transition(Completed).is_err());
            assert!(from.transition(Failed).is_err());
        }
    }

    #[test]
    fn predecessors_agree_with_transition() {
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    to.predecessors().contains(&from),
                    from.transition(to).is_ok(),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ALL {
            assert_eq!(OrderStatus::parse(s.as_str()), Ok(s));
        }
        assert!(OrderStatus::parse("DONE").is_err());
    }

    #[test]
    fn error_message_names_both_ends() {
        let err = Completed.transition(InProgress).unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal order transition: COMPLETED -> IN_PROGRESS"
        );
    }
}
