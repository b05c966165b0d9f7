//! View change protocol handlers.
//!
//! A client that stops hearing back asks every replica to replace the
//! leader. A replica that agrees moves its follow view forward (subject to
//! the rate limit) and broadcasts a vote carrying its stable checkpoint and
//! every certificate it holds. `f + 1` votes for a higher view pull a
//! replica along without consulting the rate limit, since at least one of
//! them is correct. `2f + 1` votes install the view: the new leader
//! re-proposes each certified proposal in its original slot before taking
//! new requests, and every replica refuses a pre-prepare that puts anything
//! else in those slots.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use pbft_types::{ReplicaId, SlotNumber, ViewNumber};

use crate::error::Rejection;
use crate::instrumentation::METRICS;
use crate::message::{Message, MessagePayload, ViewChangeVote};
use crate::quorum::Certificate;
use crate::view_change::NewViewPlan;

use super::{ReplicaOutput, ReplicaState, msg_broadcast};

impl ReplicaState {
    // ========================================================================
    // View Change Request Handler
    // ========================================================================

    /// Handles a client's request to replace the leader.
    pub(crate) fn on_view_change_request(
        &mut self,
        now: Instant,
        output: &mut ReplicaOutput,
    ) -> Result<(), Rejection> {
        let target = self.follow.number().next();
        self.follow.try_advance(target, now)?;

        tracing::info!(
            replica = %self.replica_id,
            installed = %self.view,
            prospective = %target,
            "starting view change"
        );
        output.messages.push(self.view_change_vote(target));
        Ok(())
    }

    /// Builds this replica's vote for `view`.
    fn view_change_vote(&self, view: ViewNumber) -> Message {
        let low = self.checkpoint.next_slot();
        let prepare_certificates = self
            .slots
            .range(low..)
            .filter_map(|(slot, state)| Some((*slot, state.best_certificate()?.clone())))
            .collect();

        msg_broadcast(
            self.replica_id,
            MessagePayload::ViewChangeVote(ViewChangeVote {
                prospective_view: view,
                checkpoint: self.checkpoint.stable().clone(),
                prepare_certificates,
            }),
        )
    }

    // ========================================================================
    // View Change Vote Handler
    // ========================================================================

    pub(crate) fn on_view_change_vote(
        &mut self,
        now: Instant,
        from: ReplicaId,
        vote: ViewChangeVote,
        output: &mut ReplicaOutput,
    ) -> Result<(), Rejection> {
        let view = vote.prospective_view;
        self.admit_view(view)?;
        if view <= self.view {
            return Err(Rejection::Stale {
                view,
                follow_view: self.follow.number(),
            });
        }

        let tally = self.view_changes.receive_vote(from, vote);

        if view > self.follow.number() && tally.voters >= self.config.weak_quorum_size() {
            self.follow.install(view, now);
            tracing::info!(
                replica = %self.replica_id,
                prospective = %view,
                voters = tally.voters,
                "joining view change"
            );
            output.messages.push(self.view_change_vote(view));
        }

        let follow = self.follow.number();
        if let Some(plan) = tally.plan.filter(|plan| plan.view >= follow) {
            self.install_view(now, plan, output);
        }
        Ok(())
    }

    // ========================================================================
    // View Installation
    // ========================================================================

    fn install_view(&mut self, now: Instant, plan: NewViewPlan, output: &mut ReplicaOutput) {
        let NewViewPlan {
            view,
            checkpoint,
            certificates,
        } = plan;

        self.follow.install(view, now);
        self.view = view;
        self.view_changes.prune(view);
        METRICS.increment_view_changes();
        tracing::info!(
            replica = %self.replica_id,
            %view,
            leader = %self.config.leader_for_view(view),
            certified = certificates.len(),
            "view installed"
        );

        // A single voter supplied the checkpoint; take it only if a quorum
        // vouched for it here.
        if self.checkpoint.is_certified(&checkpoint) {
            if self.checkpoint.receive_sync(checkpoint) {
                self.on_checkpoint_advanced(output);
            }
        } else if checkpoint.next_slot > self.checkpoint.next_slot() {
            tracing::debug!(
                replica = %self.replica_id,
                next_slot = %checkpoint.next_slot,
                "ignoring uncertified checkpoint from view change"
            );
        }
        self.in_flight.clear();
        self.carry_over(certificates);

        if self.is_leader() {
            self.repropose(output);
            self.drain_pending(output);
        } else if !self.pending.is_empty() {
            tracing::debug!(
                replica = %self.replica_id,
                dropped = self.pending.len(),
                "no longer leader, dropping queued requests"
            );
            self.pending.clear();
        }

        self.replay_future_pre_prepares(output);
    }

    /// Fixes the proposals the installed view must keep: the plan's
    /// certificates, overridden by any higher-view certificate held locally,
    /// within the window.
    fn carry_over(&mut self, mut certificates: BTreeMap<SlotNumber, Certificate>) {
        for (slot, state) in &self.slots {
            let Some(local) = state.best_certificate() else {
                continue;
            };
            let newer = certificates
                .get(slot)
                .is_none_or(|merged| merged.view < local.view);
            if newer {
                certificates.insert(*slot, local.clone());
            }
        }
        certificates.retain(|slot, _| self.checkpoint.contains(*slot));
        self.carried_over = certificates;
    }

    /// Re-proposes every carried-over proposal in its original slot.
    fn repropose(&mut self, output: &mut ReplicaOutput) {
        let carried: Vec<_> = self
            .carried_over
            .iter()
            .map(|(slot, certificate)| (*slot, certificate.proposal.clone()))
            .collect();
        for (slot, proposal) in carried {
            self.propose_at(slot, proposal, output);
        }
    }

    /// Feeds buffered pre-prepares for the installed view back through the
    /// normal handler and drops those for superseded views.
    fn replay_future_pre_prepares(&mut self, output: &mut ReplicaOutput) {
        let buffered = std::mem::take(&mut self.future_pre_prepares);
        for ((view, slot), (from, pp)) in buffered {
            match view.cmp(&self.view) {
                Ordering::Greater => {
                    self.future_pre_prepares.insert((view, slot), (from, pp));
                }
                Ordering::Equal => {
                    if let Err(rejection) = self.on_pre_prepare(from, pp, output) {
                        self.reject(Some(from), "PrePrepare", &rejection);
                    }
                }
                Ordering::Less => {}
            }
        }
    }
}
