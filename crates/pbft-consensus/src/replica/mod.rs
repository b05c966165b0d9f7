//! PBFT replica state machine.
//!
//! The replica is a pure, deterministic state machine:
//! - Takes events (peer messages, client traffic) plus the current instant
//! - Produces new state, outgoing messages, and effects
//! - No I/O, no clocks of its own, no randomness
//!
//! The runtime in `pbft-node` owns delivery and persistence; the simulated
//! cluster in this crate's tests drives the same state machine directly.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──Request──► Leader
//!                       │
//!                       ├──PrePrepare──► All
//!                       │
//!           All ──Prepare──► All      (2f+1 matching → prepare certificate)
//!           All ──Commit───► All      (2f+1 matching → commit certificate)
//!                       │
//! Client ◄──Reply──── All             (in slot order, once per slot)
//! ```
//!
//! ## View Change
//!
//! ```text
//! Client ──ViewChangeRequest──► All
//!           All ──ViewChangeVote──► All   (f+1 → join, 2f+1 → install)
//! New Leader ──PrePrepare──► All          (re-propose certified slots)
//! ```
//!
//! # Key Types
//!
//! - [`ReplicaState`]: The core state machine state
//! - [`ReplicaOutput`]: Output from processing an event
//! - [`ReplicaEvent`]: Events that can trigger state transitions

mod checkpoint;
mod normal;
mod state;
mod view_change;

pub use state::ReplicaState;

use pbft_types::{Decision, Proposal, ReplicaId};

use crate::message::{Message, MessagePayload, Reply};

// ============================================================================
// Replica Output
// ============================================================================

/// Output produced by the replica state machine.
///
/// The caller (runtime) is responsible for:
/// 1. Sending the outgoing messages via the transport
/// 2. Executing the effects (client replies, journal writes)
/// 3. Answering the client with `response`, if set
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// Messages to send to replicas. Broadcasts include the sender.
    pub messages: Vec<Message>,

    /// Effects to execute.
    pub effects: Vec<Effect>,

    /// Immediate answer to a client request event.
    pub response: Option<RequestResponse>,
}

impl ReplicaOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.effects.is_empty() && self.response.is_none()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.effects.extend(other.effects);
        if other.response.is_some() {
            self.response = other.response;
        }
    }
}

/// Side effects the runtime carries out on the replica's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Deliver a reply to the client at `callback`.
    Reply { callback: String, reply: Reply },
    /// Rewrite the decision journal with the full committed log.
    Persist { decisions: Vec<Decision> },
}

/// How a replica answered a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResponse {
    /// The request was proposed, queued, or is already in flight.
    Accepted,
    /// This replica does not lead the current view.
    Redirect { leader: ReplicaId },
    /// No leader is known (a view change is in progress) or the queue is full.
    Unavailable,
}

// ============================================================================
// Replica Event
// ============================================================================

/// Events that can trigger replica state transitions.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// Received a message from a replica (possibly this one).
    Message(Box<Message>),

    /// A client submitted an operation.
    ClientRequest(Proposal),

    /// A client asked for the leader to be replaced.
    ViewChangeRequest,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Creates a message from this replica to a specific target.
pub(crate) fn msg_to(from: ReplicaId, to: ReplicaId, payload: MessagePayload) -> Message {
    Message::targeted(from, to, payload)
}

/// Creates a broadcast message from this replica.
pub(crate) fn msg_broadcast(from: ReplicaId, payload: MessagePayload) -> Message {
    Message::broadcast(from, payload)
}
