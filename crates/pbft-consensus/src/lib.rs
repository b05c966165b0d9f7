//! # pbft-consensus: Practical Byzantine Fault Tolerance
//!
//! This crate implements the replica side of PBFT: a cluster of `n = 3f + 1`
//! replicas agrees on one ordered log of client operations while up to `f`
//! replicas behave arbitrarily.
//!
//! ## Components
//!
//! - [`View`]: the current epoch, its leader, and the view-advance rate limit
//! - [`QuorumTracker`]: per-slot prepare and commit votes and certificates
//! - [`CheckpointManager`]: stable log prefixes, the slot window, and GC
//! - [`ViewChangeCoordinator`]: merges view-change votes into a new-view plan
//! - [`ReplicaState`]: the orchestrating state machine
//! - [`ReplyTracker`] and [`RetryPolicy`]: the client's side of the contract
//!
//! ## Design
//!
//! The replica follows the functional core / imperative shell split. Every
//! transition goes through [`ReplicaState::process`], which consumes an event
//! and the current instant and returns the next state plus a
//! [`ReplicaOutput`] of messages and effects. Nothing here performs I/O; the
//! `pbft-node` crate delivers messages and carries out effects.
//!
//! ## Example
//!
//! ```ignore
//! use pbft_consensus::{ClusterConfig, ReplicaEvent, ReplicaState};
//!
//! let config = ClusterConfig::with_size(4);
//! let replica = ReplicaState::new(ReplicaId::new(0), config);
//! let (replica, output) = replica.process(Instant::now(), ReplicaEvent::ClientRequest(proposal));
//! for msg in output.messages {
//!     network.send(msg);
//! }
//! ```

mod checkpoint;
mod client;
mod config;
mod error;
pub mod instrumentation;
mod message;
mod quorum;
mod replica;
mod view;
mod view_change;

#[cfg(test)]
mod sim;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointOutcome, CheckpointVote};
pub use client::{ReplyTracker, RetryAction, RetryPolicy};
pub use config::{
    ClusterConfig, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_MAX_PENDING_REQUESTS,
    DEFAULT_VIEW_CHANGE_MIN_INTERVAL,
};
pub use error::{CodecError, Rejection, ViewError};
pub use message::{
    CheckpointSync, CheckpointSyncRequest, Commit, Envelope, Message, MessagePayload, PrePrepare,
    Prepare, Reply, ViewChangeVote,
};
pub use quorum::{Certificate, QuorumTracker, VoteKind, VoteOutcome};
pub use replica::{Effect, ReplicaEvent, ReplicaOutput, ReplicaState, RequestResponse};
pub use view::View;
pub use view_change::{NewViewPlan, ViewChangeCoordinator, VoteTally};

// Re-export the shared types so downstream crates need one import path.
pub use pbft_types::{
    ClientId, Decision, Digest, Proposal, ReplicaId, RequestId, SlotNumber, Timestamp,
    ViewNumber,
};
