//! Checkpoint protocol handlers.
//!
//! Every `interval` executed slots, each replica votes for the log prefix it
//! has executed. A quorum of matching votes makes that prefix the stable
//! checkpoint, which slides the window forward and garbage-collects slot
//! state below it. A replica that falls behind fetches the agreed prefix
//! from the voters instead of replaying the slots.

use pbft_types::{ReplicaId, SlotNumber};

use crate::checkpoint::{CheckpointOutcome, CheckpointVote};
use crate::instrumentation::METRICS;
use crate::message::{CheckpointSync, CheckpointSyncRequest, MessagePayload};

use super::{Effect, ReplicaOutput, ReplicaState, msg_broadcast, msg_to};

impl ReplicaState {
    /// Votes for the prefix ending at `last_committed`.
    pub(crate) fn propose_checkpoint(
        &mut self,
        last_committed: SlotNumber,
        output: &mut ReplicaOutput,
    ) {
        let low = self.checkpoint.next_slot();
        let committed: Vec<_> = self
            .executed
            .range(low..=last_committed)
            .map(|(_, decision)| decision.clone())
            .collect();
        let vote = self.checkpoint.propose(&committed);

        output.messages.push(msg_broadcast(
            self.replica_id,
            MessagePayload::CheckpointVote(vote),
        ));
    }

    // ========================================================================
    // Checkpoint Vote Handler
    // ========================================================================

    pub(crate) fn on_checkpoint_vote(
        &mut self,
        from: ReplicaId,
        vote: CheckpointVote,
        output: &mut ReplicaOutput,
    ) {
        match self.checkpoint.receive_vote(from, vote) {
            CheckpointOutcome::Pending => {}
            CheckpointOutcome::Adopted { .. } => {
                self.on_checkpoint_advanced(output);
                self.drain_pending(output);
            }
            CheckpointOutcome::ContentMissing { next_slot, voters } => {
                tracing::debug!(
                    replica = %self.replica_id,
                    %next_slot,
                    "checkpoint agreed without local content, requesting it"
                );
                for voter in voters.into_iter().filter(|v| *v != self.replica_id) {
                    output.messages.push(msg_to(
                        self.replica_id,
                        voter,
                        MessagePayload::CheckpointSyncRequest(CheckpointSyncRequest { next_slot }),
                    ));
                }
            }
        }
    }

    // ========================================================================
    // Checkpoint Sync Handlers
    // ========================================================================

    /// Sends the stable checkpoint to a peer that is missing it.
    pub(crate) fn on_checkpoint_sync_request(
        &mut self,
        from: ReplicaId,
        request: CheckpointSyncRequest,
        output: &mut ReplicaOutput,
    ) {
        let stable = self.checkpoint.stable();
        if stable.next_slot < request.next_slot {
            return;
        }
        output.messages.push(msg_to(
            self.replica_id,
            from,
            MessagePayload::CheckpointSync(CheckpointSync {
                checkpoint: stable.clone(),
            }),
        ));
    }

    /// Adopts a checkpoint fetched from a peer, provided a quorum vouched for
    /// its digest.
    pub(crate) fn on_checkpoint_sync(&mut self, sync: CheckpointSync, output: &mut ReplicaOutput) {
        if !self.checkpoint.is_certified(&sync.checkpoint) {
            tracing::debug!(
                replica = %self.replica_id,
                next_slot = %sync.checkpoint.next_slot,
                "ignoring uncertified checkpoint"
            );
            return;
        }
        if self.checkpoint.receive_sync(sync.checkpoint) {
            self.on_checkpoint_advanced(output);
            self.drain_pending(output);
        }
    }

    // ========================================================================
    // Window Advance
    // ========================================================================

    /// Applies a newly stable checkpoint to the rest of the replica state.
    ///
    /// Drops per-slot state below the new low-water mark. A replica whose
    /// execution frontier was below the checkpoint jumps to it.
    pub(crate) fn on_checkpoint_advanced(&mut self, output: &mut ReplicaOutput) {
        let low = self.checkpoint.next_slot();
        METRICS.increment_checkpoints_adopted();
        tracing::info!(
            replica = %self.replica_id,
            next_slot = %low,
            "checkpoint stable"
        );

        self.slots = self.slots.split_off(&low);
        self.carried_over = self.carried_over.split_off(&low);
        self.executed = self.executed.split_off(&low);
        self.future_pre_prepares.retain(|(_, slot), _| *slot >= low);
        self.in_flight.retain(|_, slot| *slot >= low);

        if self.next_execute < low {
            tracing::info!(
                replica = %self.replica_id,
                from = %self.next_execute,
                to = %low,
                "execution frontier jumped to checkpoint"
            );
            self.next_execute = low;
            output.effects.push(Effect::Persist {
                decisions: self.committed_decisions(),
            });
        }

        self.execute_ready(output);
    }
}
