//! Replica state structure.
//!
//! This module defines [`ReplicaState`], the core state of a PBFT replica.
//! The state is cloneable for simulation testing and follows the FCIS
//! pattern (pure, no I/O).

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use pbft_types::{
    ClientId, Decision, Digest, Proposal, ReplicaId, RequestId, SlotNumber, ViewNumber,
};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::ClusterConfig;
use crate::error::Rejection;
use crate::instrumentation::METRICS;
use crate::message::{Message, MessagePayload, PrePrepare, Reply};
use crate::quorum::{Certificate, QuorumTracker};
use crate::view::View;
use crate::view_change::ViewChangeCoordinator;

use super::{ReplicaEvent, ReplicaOutput};

// ============================================================================
// Per-Slot State
// ============================================================================

/// Everything a replica knows about one slot in the window.
#[derive(Debug, Clone)]
pub(crate) struct SlotState {
    /// The pre-prepare this replica accepted, at most one per view.
    pub(crate) pre_prepared: Option<(ViewNumber, Digest)>,
    /// The view in which this replica, as leader, assigned the slot.
    pub(crate) assigned_in: Option<ViewNumber>,
    pub(crate) votes: QuorumTracker,
    pub(crate) executed: bool,
}

impl SlotState {
    fn new(quorum: usize) -> Self {
        Self {
            pre_prepared: None,
            assigned_in: None,
            votes: QuorumTracker::new(quorum),
            executed: false,
        }
    }

    /// Returns the strongest certificate held for the slot.
    ///
    /// A commit certificate implies a prepare quorum in the same view, so it
    /// stands in for a missing or older prepare certificate.
    pub(crate) fn best_certificate(&self) -> Option<&Certificate> {
        match (self.votes.prepare_certificate(), self.votes.commit_certificate()) {
            (Some(prepare), Some(commit)) if commit.view > prepare.view => Some(commit),
            (Some(prepare), _) => Some(prepare),
            (None, commit) => commit,
        }
    }
}

/// Latest executed request per client, used to answer resends.
#[derive(Debug, Clone)]
pub(crate) struct ClientEntry {
    pub(crate) sequence: u64,
    pub(crate) reply: Reply,
}

// ============================================================================
// Replica State
// ============================================================================

/// The complete state of a PBFT replica.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    // ========================================================================
    // Identity
    // ========================================================================
    pub(crate) replica_id: ReplicaId,
    pub(crate) config: ClusterConfig,

    // ========================================================================
    // Views
    // ========================================================================
    /// Admission view. Messages from lower views are stale.
    pub(crate) follow: View,
    /// Installed view: the view whose leader this replica currently follows.
    /// Always `<= follow`; strictly lower while a view change is in progress.
    pub(crate) view: ViewNumber,
    pub(crate) view_changes: ViewChangeCoordinator,
    /// Proposals the installed view must keep, per slot: the installing
    /// plan's certificates merged with this replica's own.
    pub(crate) carried_over: BTreeMap<SlotNumber, Certificate>,
    /// Pre-prepares for views not yet installed, replayed on install.
    pub(crate) future_pre_prepares: BTreeMap<(ViewNumber, SlotNumber), (ReplicaId, PrePrepare)>,

    // ========================================================================
    // Log
    // ========================================================================
    /// Per-slot state for the legal window only.
    pub(crate) slots: BTreeMap<SlotNumber, SlotState>,
    pub(crate) checkpoint: CheckpointManager,
    /// First slot not yet executed (`lastCommitSlot + 1`).
    pub(crate) next_execute: SlotNumber,
    /// Executed decisions at or above the stable checkpoint.
    pub(crate) executed: BTreeMap<SlotNumber, Decision>,
    pub(crate) clients: BTreeMap<ClientId, ClientEntry>,

    // ========================================================================
    // Leader State
    // ========================================================================
    /// Requests proposed in the installed view and not yet executed.
    pub(crate) in_flight: BTreeMap<RequestId, SlotNumber>,
    /// Requests waiting for a free slot in the window.
    pub(crate) pending: VecDeque<Proposal>,
}

impl ReplicaState {
    /// Creates a new replica at view 0 with an empty log.
    pub fn new(replica_id: ReplicaId, config: ClusterConfig) -> Self {
        debug_assert!(
            config.contains(replica_id),
            "replica must be in cluster config"
        );

        let quorum = config.quorum_size();
        Self {
            replica_id,
            follow: View::new(config.view_change_min_interval()),
            view: ViewNumber::ZERO,
            view_changes: ViewChangeCoordinator::new(quorum),
            carried_over: BTreeMap::new(),
            future_pre_prepares: BTreeMap::new(),
            slots: BTreeMap::new(),
            checkpoint: CheckpointManager::new(config.checkpoint_interval(), quorum),
            next_execute: SlotNumber::ZERO,
            executed: BTreeMap::new(),
            clients: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            pending: VecDeque::new(),
            config,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns the installed view.
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Returns the admission view.
    pub fn follow_view(&self) -> ViewNumber {
        self.follow.number()
    }

    /// Returns true while the follow view is ahead of the installed view.
    pub fn is_view_changing(&self) -> bool {
        self.follow.number() > self.view
    }

    /// Returns the leader this replica follows, or `None` mid view change.
    pub fn leader(&self) -> Option<ReplicaId> {
        if self.is_view_changing() {
            None
        } else {
            Some(self.config.leader_for_view(self.view))
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.replica_id)
    }

    /// Returns the last slot executed, if any.
    pub fn last_committed(&self) -> Option<SlotNumber> {
        self.next_execute
            .as_u64()
            .checked_sub(1)
            .map(SlotNumber::new)
    }

    pub fn stable_checkpoint(&self) -> &Checkpoint {
        self.checkpoint.stable()
    }

    /// Returns the legal window `[low, high)`.
    pub fn window(&self) -> (SlotNumber, SlotNumber) {
        (self.checkpoint.next_slot(), self.checkpoint.upper_bound())
    }

    /// Returns every executed decision, stable prefix first.
    pub fn committed_decisions(&self) -> Vec<Decision> {
        let mut decisions = self.checkpoint.stable().decisions.clone();
        decisions.extend(self.executed.values().cloned());
        decisions
    }

    pub fn prepare_certificate(&self, slot: SlotNumber) -> Option<&Certificate> {
        self.slots.get(&slot)?.votes.prepare_certificate()
    }

    pub fn commit_certificate(&self, slot: SlotNumber) -> Option<&Certificate> {
        self.slots.get(&slot)?.votes.commit_certificate()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ========================================================================
    // Event Processing (Main Entry Point)
    // ========================================================================

    /// Processes an event and returns the new state and output.
    ///
    /// This method is pure: it takes ownership of `self`, processes the
    /// event, and returns a new state. The caller is responsible for
    /// executing the output.
    pub fn process(mut self, now: Instant, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        match event {
            ReplicaEvent::Message(msg) => self.on_message(now, *msg, &mut output),
            ReplicaEvent::ClientRequest(proposal) => {
                let response = self.on_client_request(proposal, &mut output);
                output.response = Some(response);
            }
            ReplicaEvent::ViewChangeRequest => {
                if let Err(rejection) = self.on_view_change_request(now, &mut output) {
                    self.reject(None, "ViewChangeRequest", &rejection);
                }
            }
        }
        METRICS.add_messages_sent(output.messages.len() as u64);
        (self, output)
    }

    fn on_message(&mut self, now: Instant, msg: Message, output: &mut ReplicaOutput) {
        METRICS.increment_messages_received();

        if !self.config.contains(msg.from) {
            self.reject(Some(msg.from), msg.payload.name(), &Rejection::UnknownReplica(msg.from));
            return;
        }
        if !msg.is_for(self.replica_id) {
            return;
        }

        let from = msg.from;
        let name = msg.payload.name();
        let result = match msg.payload {
            // Normal operation
            MessagePayload::PrePrepare(pp) => self.on_pre_prepare(from, pp, output),
            MessagePayload::Prepare(prepare) => self.on_prepare(from, prepare, output),
            MessagePayload::Commit(commit) => self.on_commit(from, commit, output),

            // Checkpointing
            MessagePayload::CheckpointVote(vote) => {
                self.on_checkpoint_vote(from, vote, output);
                Ok(())
            }
            MessagePayload::CheckpointSyncRequest(req) => {
                self.on_checkpoint_sync_request(from, req, output);
                Ok(())
            }
            MessagePayload::CheckpointSync(sync) => {
                self.on_checkpoint_sync(sync, output);
                Ok(())
            }

            // View change
            MessagePayload::ViewChangeVote(vote) => {
                self.on_view_change_vote(now, from, vote, output)
            }
        };

        if let Err(rejection) = result {
            self.reject(Some(from), name, &rejection);
        }
    }

    /// Logs and counts a dropped message.
    pub(crate) fn reject(&self, from: Option<ReplicaId>, message: &str, rejection: &Rejection) {
        METRICS.record_rejection(rejection);
        let from = from.map(|id| id.as_u8());
        match rejection {
            Rejection::Equivocation { .. } | Rejection::UnknownReplica(_) => tracing::warn!(
                replica = %self.replica_id,
                ?from,
                msg_type = message,
                %rejection,
                "dropping message"
            ),
            _ => tracing::debug!(
                replica = %self.replica_id,
                ?from,
                msg_type = message,
                %rejection,
                "dropping message"
            ),
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Rejects messages from views below the follow view.
    pub(crate) fn admit_view(&self, view: ViewNumber) -> Result<(), Rejection> {
        if view < self.follow.number() {
            return Err(Rejection::Stale {
                view,
                follow_view: self.follow.number(),
            });
        }
        Ok(())
    }

    /// Rejects slots outside the checkpoint window.
    pub(crate) fn admit_slot(&self, slot: SlotNumber) -> Result<(), Rejection> {
        if !self.checkpoint.contains(slot) {
            let (low, high) = self.window();
            return Err(Rejection::OutOfWindow { slot, low, high });
        }
        Ok(())
    }

    /// Returns the state of an admitted slot, creating it on first use.
    pub(crate) fn slot_mut(&mut self, slot: SlotNumber) -> &mut SlotState {
        debug_assert!(self.checkpoint.contains(slot));
        let quorum = self.config.quorum_size();
        self.slots
            .entry(slot)
            .or_insert_with(|| SlotState::new(quorum))
    }
}
