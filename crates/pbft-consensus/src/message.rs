//! PBFT protocol messages.
//!
//! ## Normal Operation
//! - [`PrePrepare`] - Leader → All: Proposal for a slot
//! - [`Prepare`] - Replica → All: I accepted the leader's proposal
//! - [`Commit`] - Replica → All: I saw a prepare quorum
//!
//! ## Checkpointing
//! - [`CheckpointVote`] - Replica → All: Digest of my checkpoint candidate
//! - [`CheckpointSyncRequest`] - Replica → Voters: Send me that checkpoint
//! - [`CheckpointSync`] - Replica → Requester: Here is my stable checkpoint
//!
//! ## View Change
//! - [`ViewChangeVote`] - Replica → All: My state for a prospective view
//!
//! Client traffic ([`Envelope::Request`], [`Envelope::ViewChangeRequest`],
//! [`Envelope::Reply`]) shares the same wire envelope but never enters a
//! replica as a [`Message`].

use std::collections::BTreeMap;

use pbft_types::{ClientId, Proposal, ReplicaId, SlotNumber, ViewNumber};
use serde::{Deserialize, Serialize};

pub use crate::checkpoint::CheckpointVote;
use crate::checkpoint::Checkpoint;
use crate::error::CodecError;
use crate::quorum::Certificate;

// ============================================================================
// Message Envelope
// ============================================================================

/// A replica-to-replica message with routing information.
///
/// Broadcasts (`to == None`) are delivered to every replica including the
/// sender, so a replica's own votes count toward quorum like anyone else's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The replica that sent this message.
    pub from: ReplicaId,

    /// The intended recipient, or `None` for a broadcast.
    pub to: Option<ReplicaId>,

    pub payload: MessagePayload,
}

impl Message {
    pub fn targeted(from: ReplicaId, to: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }

    pub fn broadcast(from: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Returns true if `replica` should receive this message.
    pub fn is_for(&self, replica: ReplicaId) -> bool {
        self.to.is_none_or(|to| to == replica)
    }
}

// ============================================================================
// Message Payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    // === Normal Operation ===
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),

    // === Checkpointing ===
    CheckpointVote(CheckpointVote),
    CheckpointSyncRequest(CheckpointSyncRequest),
    CheckpointSync(CheckpointSync),

    // === View Change ===
    ViewChangeVote(ViewChangeVote),
}

impl MessagePayload {
    /// Returns the message type name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrePrepare(_) => "PrePrepare",
            Self::Prepare(_) => "Prepare",
            Self::Commit(_) => "Commit",
            Self::CheckpointVote(_) => "CheckpointVote",
            Self::CheckpointSyncRequest(_) => "CheckpointSyncRequest",
            Self::CheckpointSync(_) => "CheckpointSync",
            Self::ViewChangeVote(_) => "ViewChangeVote",
        }
    }

    /// Returns the slot a per-slot message targets.
    pub fn slot(&self) -> Option<SlotNumber> {
        match self {
            Self::PrePrepare(m) => Some(m.slot),
            Self::Prepare(m) => Some(m.slot),
            Self::Commit(m) => Some(m.slot),
            _ => None,
        }
    }
}

// ============================================================================
// Normal Operation Messages
// ============================================================================

/// The leader's proposal for a slot in a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub slot: SlotNumber,
    pub proposal: Proposal,
}

/// A replica accepted the pre-prepare for `(view, slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub slot: SlotNumber,
    pub proposal: Proposal,
}

/// A replica sealed a prepare certificate for `(view, slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub slot: SlotNumber,
    pub proposal: Proposal,
}

// ============================================================================
// Checkpoint Messages
// ============================================================================

/// Asks a voter for the checkpoint covering slots `0..next_slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSyncRequest {
    pub next_slot: SlotNumber,
}

/// A replica's stable checkpoint, sent to a lagging peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSync {
    pub checkpoint: Checkpoint,
}

// ============================================================================
// View Change Messages
// ============================================================================

/// A replica's attestation for a prospective view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeVote {
    pub prospective_view: ViewNumber,
    /// The sender's stable checkpoint.
    pub checkpoint: Checkpoint,
    /// Every prepare certificate the sender holds at or above the checkpoint.
    pub prepare_certificates: BTreeMap<SlotNumber, Certificate>,
}

// ============================================================================
// Client Traffic
// ============================================================================

/// A replica's answer to a client once the request's slot executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub from: ReplicaId,
    /// View of the commit certificate the slot executed under.
    pub view: ViewNumber,
    pub slot: SlotNumber,
    pub proposal: Proposal,
}

/// Everything that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Replica-to-replica protocol traffic.
    Peer(Message),
    /// A client operation, sent to the replica the client believes leads.
    Request(Proposal),
    /// A client asking replicas to replace the leader.
    ViewChangeRequest { client: ClientId },
    /// A replica's reply to a client.
    Reply(Reply),
}

impl Envelope {
    /// Encodes the envelope with `postcard`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(self).map_err(CodecError::Encode)
    }

    /// Decodes an envelope produced by [`Envelope::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes).map_err(CodecError::Decode)
    }
}
