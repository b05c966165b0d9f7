//! Normal operation protocol handlers.
//!
//! This module implements the three-phase agreement pipeline:
//! - Client request (client → leader)
//! - PrePrepare (leader → all)
//! - Prepare (all → all)
//! - Commit (all → all), followed by in-order execution and reply

use pbft_types::{Proposal, ReplicaId, SlotNumber};

use crate::error::Rejection;
use crate::instrumentation::METRICS;
use crate::message::{Commit, MessagePayload, PrePrepare, Prepare, Reply};
use crate::quorum::{Certificate, VoteKind, VoteOutcome};

use super::state::ClientEntry;
use super::{Effect, ReplicaOutput, ReplicaState, RequestResponse, msg_broadcast};

impl ReplicaState {
    // ========================================================================
    // Client Request Handler
    // ========================================================================

    /// Handles a client request.
    ///
    /// A request that already executed is answered from the client table.
    /// Otherwise only the leader of an installed view proposes it; everyone
    /// else redirects, or reports unavailable mid view change.
    pub(crate) fn on_client_request(
        &mut self,
        proposal: Proposal,
        output: &mut ReplicaOutput,
    ) -> RequestResponse {
        METRICS.increment_client_requests();
        let request = proposal.request;

        if let Some(entry) = self.clients.get(&request.client_id) {
            if request.sequence < entry.sequence {
                return RequestResponse::Accepted;
            }
            if request.sequence == entry.sequence {
                tracing::debug!(
                    replica = %self.replica_id,
                    %request,
                    "resending cached reply"
                );
                output.effects.push(Effect::Reply {
                    callback: proposal.callback,
                    reply: entry.reply.clone(),
                });
                return RequestResponse::Accepted;
            }
        }

        let Some(leader) = self.leader() else {
            return RequestResponse::Unavailable;
        };
        if leader != self.replica_id {
            return RequestResponse::Redirect { leader };
        }

        if self.in_flight.contains_key(&request)
            || self.pending.iter().any(|queued| queued.request == request)
        {
            return RequestResponse::Accepted;
        }

        match self.next_free_slot() {
            Some(slot) => {
                self.propose_at(slot, proposal, output);
                RequestResponse::Accepted
            }
            None if self.pending.len() < self.config.max_pending_requests() => {
                tracing::debug!(
                    replica = %self.replica_id,
                    %request,
                    queued = self.pending.len() + 1,
                    "window full, queueing request"
                );
                self.pending.push_back(proposal);
                RequestResponse::Accepted
            }
            None => RequestResponse::Unavailable,
        }
    }

    /// Returns the lowest slot in the window not yet assigned in this view.
    pub(crate) fn next_free_slot(&self) -> Option<SlotNumber> {
        let (mut slot, high) = self.window();
        while slot < high {
            let assigned = self
                .slots
                .get(&slot)
                .is_some_and(|state| state.assigned_in == Some(self.view));
            if !assigned {
                return Some(slot);
            }
            slot = slot.next();
        }
        None
    }

    /// Assigns `proposal` to `slot` in the installed view and broadcasts the
    /// pre-prepare.
    pub(crate) fn propose_at(
        &mut self,
        slot: SlotNumber,
        proposal: Proposal,
        output: &mut ReplicaOutput,
    ) {
        let view = self.view;
        self.slot_mut(slot).assigned_in = Some(view);
        self.in_flight.insert(proposal.request, slot);

        tracing::info!(
            replica = %self.replica_id,
            %view,
            %slot,
            request = %proposal.request,
            "proposing"
        );
        output.messages.push(msg_broadcast(
            self.replica_id,
            MessagePayload::PrePrepare(PrePrepare {
                view,
                slot,
                proposal,
            }),
        ));
    }

    /// Proposes queued requests while the window has room.
    pub(crate) fn drain_pending(&mut self, output: &mut ReplicaOutput) {
        if !self.is_leader() {
            return;
        }
        while !self.pending.is_empty() {
            let Some(slot) = self.next_free_slot() else {
                break;
            };
            if let Some(proposal) = self.pending.pop_front() {
                self.propose_at(slot, proposal, output);
            }
        }
    }

    // ========================================================================
    // PrePrepare Handler
    // ========================================================================

    /// Handles a pre-prepare.
    ///
    /// Accepts at most one proposal per slot per view, only from the view's
    /// leader, and answers with a broadcast prepare. Pre-prepares for a view
    /// not yet installed are buffered until it is.
    pub(crate) fn on_pre_prepare(
        &mut self,
        from: ReplicaId,
        pp: PrePrepare,
        output: &mut ReplicaOutput,
    ) -> Result<(), Rejection> {
        self.admit_view(pp.view)?;
        self.admit_slot(pp.slot)?;
        if self.config.leader_for_view(pp.view) != from {
            return Err(Rejection::NotLeader {
                from,
                view: pp.view,
            });
        }

        if pp.view > self.view {
            self.buffer_pre_prepare(from, pp);
            return Ok(());
        }

        let digest = pp.proposal.digest();
        let equivocation = Rejection::Equivocation {
            slot: pp.slot,
            view: pp.view,
        };

        // A new view may only re-propose what was certified before it.
        if self
            .carried_over
            .get(&pp.slot)
            .is_some_and(|certificate| certificate.digest() != digest)
        {
            return Err(equivocation);
        }

        let slot = self.slot_mut(pp.slot);

        // A committed slot only ever admits its committed proposal.
        if slot
            .votes
            .commit_certificate()
            .is_some_and(|certificate| certificate.digest() != digest)
        {
            return Err(equivocation);
        }

        match slot.pre_prepared {
            Some((view, accepted)) if view == pp.view => {
                if accepted != digest {
                    return Err(equivocation);
                }
                return Ok(());
            }
            _ => slot.pre_prepared = Some((pp.view, digest)),
        }

        tracing::debug!(
            replica = %self.replica_id,
            view = %pp.view,
            slot = %pp.slot,
            "accepted pre-prepare"
        );
        output.messages.push(msg_broadcast(
            self.replica_id,
            MessagePayload::Prepare(Prepare {
                view: pp.view,
                slot: pp.slot,
                proposal: pp.proposal,
            }),
        ));
        Ok(())
    }

    fn buffer_pre_prepare(&mut self, from: ReplicaId, pp: PrePrepare) {
        let capacity = 2 * self.checkpoint.interval() as usize;
        let key = (pp.view, pp.slot);
        if self.future_pre_prepares.len() >= capacity && !self.future_pre_prepares.contains_key(&key)
        {
            tracing::debug!(
                replica = %self.replica_id,
                view = %pp.view,
                slot = %pp.slot,
                "future pre-prepare buffer full"
            );
            return;
        }
        self.future_pre_prepares.entry(key).or_insert((from, pp));
    }

    // ========================================================================
    // Prepare Handler
    // ========================================================================

    /// Handles a prepare vote. Sealing a prepare certificate broadcasts a
    /// commit for that view.
    pub(crate) fn on_prepare(
        &mut self,
        from: ReplicaId,
        prepare: Prepare,
        output: &mut ReplicaOutput,
    ) -> Result<(), Rejection> {
        self.admit_view(prepare.view)?;
        self.admit_slot(prepare.slot)?;

        let outcome = self.slot_mut(prepare.slot).votes.record_vote(
            VoteKind::Prepare,
            prepare.view,
            &prepare.proposal,
            from,
        );
        match outcome {
            VoteOutcome::Duplicate => Err(Rejection::DuplicateVote),
            VoteOutcome::Recorded => Ok(()),
            VoteOutcome::Sealed(certificate) => {
                tracing::debug!(
                    replica = %self.replica_id,
                    view = %certificate.view,
                    slot = %prepare.slot,
                    "prepare certificate sealed"
                );
                output.messages.push(msg_broadcast(
                    self.replica_id,
                    MessagePayload::Commit(Commit {
                        view: certificate.view,
                        slot: prepare.slot,
                        proposal: certificate.proposal,
                    }),
                ));
                Ok(())
            }
        }
    }

    // ========================================================================
    // Commit Handler
    // ========================================================================

    /// Handles a commit vote. Sealing a commit certificate executes every
    /// consecutive ready slot.
    pub(crate) fn on_commit(
        &mut self,
        from: ReplicaId,
        commit: Commit,
        output: &mut ReplicaOutput,
    ) -> Result<(), Rejection> {
        self.admit_view(commit.view)?;
        self.admit_slot(commit.slot)?;

        let outcome = self.slot_mut(commit.slot).votes.record_vote(
            VoteKind::Commit,
            commit.view,
            &commit.proposal,
            from,
        );
        match outcome {
            VoteOutcome::Duplicate => Err(Rejection::DuplicateVote),
            VoteOutcome::Recorded => Ok(()),
            VoteOutcome::Sealed(certificate) => {
                tracing::debug!(
                    replica = %self.replica_id,
                    view = %certificate.view,
                    slot = %commit.slot,
                    "commit certificate sealed"
                );
                self.execute_ready(output);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes committed slots in order starting at the commit frontier.
    ///
    /// A slot whose predecessor has not committed waits, even if its own
    /// commit certificate is sealed.
    pub(crate) fn execute_ready(&mut self, output: &mut ReplicaOutput) {
        loop {
            let slot = self.next_execute;
            let Some(state) = self.slots.get_mut(&slot) else {
                break;
            };
            let Some(certificate) = state.votes.commit_certificate().cloned() else {
                break;
            };
            debug_assert!(!state.executed, "slot {slot} executed twice");
            state.executed = true;
            self.next_execute = slot.next();
            self.execute(slot, certificate, output);
        }
    }

    fn execute(&mut self, slot: SlotNumber, certificate: Certificate, output: &mut ReplicaOutput) {
        let request = certificate.proposal.request;
        self.executed.insert(slot, certificate.proposal.decision());
        self.in_flight.remove(&request);
        METRICS.increment_commits();

        tracing::info!(
            replica = %self.replica_id,
            %slot,
            view = %certificate.view,
            %request,
            "slot committed"
        );

        let callback = certificate.proposal.callback.clone();
        let reply = Reply {
            from: self.replica_id,
            view: certificate.view,
            slot,
            proposal: certificate.proposal,
        };
        let newer = self
            .clients
            .get(&request.client_id)
            .is_none_or(|entry| entry.sequence <= request.sequence);
        if newer {
            self.clients.insert(
                request.client_id,
                ClientEntry {
                    sequence: request.sequence,
                    reply: reply.clone(),
                },
            );
        }

        output.effects.push(Effect::Persist {
            decisions: self.committed_decisions(),
        });
        output.effects.push(Effect::Reply { callback, reply });

        if self.checkpoint.is_boundary(slot) {
            self.propose_checkpoint(slot, output);
        }
    }
}
