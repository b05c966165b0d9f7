//! Rejection and error types.
//!
//! None of these are fatal. A replica that rejects an inbound message logs
//! the [`Rejection`] and drops the message; slow or Byzantine peers are
//! expected to produce them continuously.

use std::time::Duration;

use pbft_types::{ReplicaId, SlotNumber, ViewNumber};
use thiserror::Error;

/// Why an inbound message was dropped without changing replica state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Message view is below the replica's follow view.
    #[error("stale view {view} (following {follow_view})")]
    Stale {
        view: ViewNumber,
        follow_view: ViewNumber,
    },

    /// Slot is outside the legal checkpoint window `[low, high)`.
    #[error("slot {slot} outside window [{low}, {high})")]
    OutOfWindow {
        slot: SlotNumber,
        low: SlotNumber,
        high: SlotNumber,
    },

    /// The same vote was already recorded from this sender.
    #[error("duplicate vote")]
    DuplicateVote,

    /// A view advance was attempted before the rate limit expired.
    #[error("view advance rate limited for another {remaining:?}")]
    RateLimited { remaining: Duration },

    /// A pre-prepare came from a replica that does not lead its view.
    #[error("replica {from} does not lead view {view}")]
    NotLeader { from: ReplicaId, view: ViewNumber },

    /// The leader proposed two different values for one slot in one view.
    #[error("conflicting pre-prepare for slot {slot} in view {view}")]
    Equivocation { slot: SlotNumber, view: ViewNumber },

    /// Sender is not a member of the cluster.
    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),
}

impl Rejection {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stale { .. } => "stale",
            Self::OutOfWindow { .. } => "out_of_window",
            Self::DuplicateVote => "duplicate_vote",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotLeader { .. } => "not_leader",
            Self::Equivocation { .. } => "equivocation",
            Self::UnknownReplica(_) => "unknown_replica",
        }
    }
}

/// Errors from advancing a [`View`](crate::View).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    /// The minimum interval since the last advance has not elapsed.
    #[error("view advance rate limited for another {remaining:?}")]
    RateLimited { remaining: Duration },

    /// The requested view is not ahead of the current one.
    #[error("view {requested} is not ahead of current view {current}")]
    NotAhead {
        current: ViewNumber,
        requested: ViewNumber,
    },
}

impl From<ViewError> for Rejection {
    fn from(error: ViewError) -> Self {
        match error {
            ViewError::RateLimited { remaining } => Self::RateLimited { remaining },
            ViewError::NotAhead { current, requested } => Self::Stale {
                view: requested,
                follow_view: current,
            },
        }
    }
}

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] postcard::Error),
}
