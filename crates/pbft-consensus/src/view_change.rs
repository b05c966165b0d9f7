//! View-change vote aggregation.
//!
//! Each [`ViewChangeVote`] carries the sender's stable checkpoint and its
//! surviving prepare certificates. The coordinator keeps only the newest vote
//! of each replica, so its memory is bounded by the cluster size no matter
//! how many views a faulty peer votes for. Once `2f + 1` distinct replicas
//! hold a vote for the same view, their votes are merged into a
//! [`NewViewPlan`]: for each slot the certificate with the highest view, and
//! the checkpoint with the highest `next_slot`. A plan is handed out at most
//! once per view, and never for a view below one already handed out.

use std::collections::BTreeMap;

use pbft_types::{ReplicaId, SlotNumber, ViewNumber};

use crate::checkpoint::Checkpoint;
use crate::message::ViewChangeVote;
use crate::quorum::Certificate;

/// Merged state the new view starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewViewPlan {
    pub view: ViewNumber,
    /// Newest well-formed checkpoint among the voters. Installing replicas
    /// adopt it only if they saw a quorum vote for it.
    pub checkpoint: Checkpoint,
    /// Highest-view prepare certificate per slot. The new leader must
    /// re-propose exactly these proposals.
    pub certificates: BTreeMap<SlotNumber, Certificate>,
}

/// What a single vote changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteTally {
    /// Distinct voters for the vote's view so far.
    pub voters: usize,
    /// Set at most once per view, when it first reaches quorum.
    pub plan: Option<NewViewPlan>,
}

/// Collects view-change votes for every prospective view above the
/// installed one.
#[derive(Debug, Clone)]
pub struct ViewChangeCoordinator {
    quorum: usize,
    latest: BTreeMap<ReplicaId, ViewChangeVote>,
    planned: Option<ViewNumber>,
}

impl ViewChangeCoordinator {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            latest: BTreeMap::new(),
            planned: None,
        }
    }

    /// Records a vote. It replaces the sender's previous vote only if it is
    /// for a higher view; a repeated or older vote is ignored.
    pub fn receive_vote(&mut self, from: ReplicaId, vote: ViewChangeVote) -> VoteTally {
        let view = vote.prospective_view;
        let newer = self
            .latest
            .get(&from)
            .is_none_or(|previous| previous.prospective_view < view);
        if newer {
            self.latest.insert(from, vote);
        }

        let voters = self.voters(view);
        let plan = if voters >= self.quorum && self.planned.is_none_or(|done| done < view) {
            self.planned = Some(view);
            Some(self.plan(view))
        } else {
            None
        };

        VoteTally { voters, plan }
    }

    /// Returns the number of distinct voters whose newest vote is for `view`.
    pub fn voters(&self, view: ViewNumber) -> usize {
        self.votes_for(view).count()
    }

    /// Drops votes for views at or below the installed view.
    pub fn prune(&mut self, installed: ViewNumber) {
        self.latest
            .retain(|_, vote| vote.prospective_view > installed);
    }

    fn votes_for(&self, view: ViewNumber) -> impl Iterator<Item = &ViewChangeVote> {
        self.latest
            .values()
            .filter(move |vote| vote.prospective_view == view)
    }

    fn plan(&self, view: ViewNumber) -> NewViewPlan {
        let mut certificates: BTreeMap<SlotNumber, Certificate> = BTreeMap::new();
        let mut checkpoint = Checkpoint::default();

        for vote in self.votes_for(view) {
            for (slot, certificate) in &vote.prepare_certificates {
                let newer = certificates
                    .get(slot)
                    .is_none_or(|existing| existing.view < certificate.view);
                if newer {
                    certificates.insert(*slot, certificate.clone());
                }
            }
            if vote.checkpoint.next_slot > checkpoint.next_slot
                && vote.checkpoint.is_well_formed()
            {
                checkpoint = vote.checkpoint.clone();
            }
        }

        NewViewPlan {
            view,
            checkpoint,
            certificates,
        }
    }

    #[cfg(test)]
    pub(crate) fn retained_votes(&self) -> usize {
        self.latest.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pbft_types::{ClientId, Decision, Proposal, RequestId, Timestamp};

    fn proposal(tag: &'static str) -> Proposal {
        Proposal::new(
            RequestId::new(ClientId::new(9), 0),
            "mem://client-9",
            Timestamp::from_millis(5),
            tag.as_bytes(),
        )
    }

    fn vote(view: u64, certs: &[(u64, u64, &'static str)], checkpoint_len: u64) -> ViewChangeVote {
        ViewChangeVote {
            prospective_view: ViewNumber::new(view),
            checkpoint: Checkpoint {
                next_slot: SlotNumber::new(checkpoint_len),
                decisions: (0..checkpoint_len)
                    .map(|i| Decision {
                        request: RequestId::new(ClientId::new(1), i),
                        data: Bytes::new(),
                    })
                    .collect(),
            },
            prepare_certificates: certs
                .iter()
                .map(|&(slot, view, tag)| {
                    (
                        SlotNumber::new(slot),
                        Certificate {
                            view: ViewNumber::new(view),
                            proposal: proposal(tag),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn plan_is_produced_once_at_quorum() {
        let mut coordinator = ViewChangeCoordinator::new(3);
        let a = coordinator.receive_vote(ReplicaId::new(0), vote(1, &[], 0));
        let b = coordinator.receive_vote(ReplicaId::new(1), vote(1, &[], 0));
        assert_eq!((a.voters, b.voters), (1, 2));
        assert!(a.plan.is_none() && b.plan.is_none());

        let c = coordinator.receive_vote(ReplicaId::new(2), vote(1, &[], 0));
        assert!(c.plan.is_some());

        let d = coordinator.receive_vote(ReplicaId::new(3), vote(1, &[], 0));
        assert_eq!(d.voters, 4);
        assert!(d.plan.is_none());
    }

    #[test]
    fn repeated_votes_do_not_count_twice() {
        let mut coordinator = ViewChangeCoordinator::new(3);
        for _ in 0..3 {
            coordinator.receive_vote(ReplicaId::new(0), vote(1, &[], 0));
        }
        assert_eq!(coordinator.voters(ViewNumber::new(1)), 1);
    }

    #[test]
    fn only_each_replicas_newest_vote_is_kept() {
        let mut coordinator = ViewChangeCoordinator::new(3);
        for view in 1..=1000 {
            coordinator.receive_vote(ReplicaId::new(3), vote(view, &[(0, view, "spam")], 0));
        }
        assert_eq!(coordinator.retained_votes(), 1);
        assert_eq!(coordinator.voters(ViewNumber::new(1000)), 1);

        // An older vote does not displace the newer one.
        coordinator.receive_vote(ReplicaId::new(3), vote(2, &[], 0));
        assert_eq!(coordinator.voters(ViewNumber::new(2)), 0);
        assert_eq!(coordinator.retained_votes(), 1);
    }

    #[test]
    fn no_plan_for_a_view_below_one_already_planned() {
        let mut coordinator = ViewChangeCoordinator::new(2);
        coordinator.receive_vote(ReplicaId::new(0), vote(2, &[], 0));
        let tally = coordinator.receive_vote(ReplicaId::new(1), vote(2, &[], 0));
        assert_eq!(tally.plan.map(|plan| plan.view), Some(ViewNumber::new(2)));

        coordinator.receive_vote(ReplicaId::new(2), vote(1, &[], 0));
        let tally = coordinator.receive_vote(ReplicaId::new(3), vote(1, &[], 0));
        assert_eq!(tally.voters, 2);
        assert!(tally.plan.is_none());

        coordinator.receive_vote(ReplicaId::new(0), vote(3, &[], 0));
        let tally = coordinator.receive_vote(ReplicaId::new(1), vote(3, &[], 0));
        assert_eq!(tally.plan.map(|plan| plan.view), Some(ViewNumber::new(3)));
    }

    #[test]
    fn highest_view_certificate_wins_per_slot() {
        let mut coordinator = ViewChangeCoordinator::new(3);
        coordinator.receive_vote(ReplicaId::new(0), vote(3, &[(0, 1, "old"), (1, 0, "b")], 0));
        coordinator.receive_vote(ReplicaId::new(1), vote(3, &[(0, 2, "new")], 0));
        let tally = coordinator.receive_vote(ReplicaId::new(2), vote(3, &[(0, 0, "older")], 0));

        let plan = tally.plan.unwrap();
        assert_eq!(plan.certificates[&SlotNumber::new(0)].proposal, proposal("new"));
        assert_eq!(plan.certificates[&SlotNumber::new(1)].proposal, proposal("b"));
    }

    #[test]
    fn newest_checkpoint_is_kept() {
        let mut coordinator = ViewChangeCoordinator::new(3);
        coordinator.receive_vote(ReplicaId::new(0), vote(1, &[], 10));
        coordinator.receive_vote(ReplicaId::new(1), vote(1, &[], 20));
        let plan = coordinator
            .receive_vote(ReplicaId::new(2), vote(1, &[], 0))
            .plan
            .unwrap();
        assert_eq!(plan.checkpoint.next_slot, SlotNumber::new(20));
    }

    #[test]
    fn prune_drops_installed_and_older_views() {
        let mut coordinator = ViewChangeCoordinator::new(3);
        coordinator.receive_vote(ReplicaId::new(0), vote(1, &[], 0));
        coordinator.receive_vote(ReplicaId::new(1), vote(2, &[], 0));
        coordinator.receive_vote(ReplicaId::new(2), vote(3, &[], 0));
        coordinator.prune(ViewNumber::new(2));
        assert_eq!(coordinator.voters(ViewNumber::new(1)), 0);
        assert_eq!(coordinator.voters(ViewNumber::new(2)), 0);
        assert_eq!(coordinator.voters(ViewNumber::new(3)), 1);
        assert_eq!(coordinator.retained_votes(), 1);
    }

    fn prepared(slot: u64, view: u64) -> Certificate {
        Certificate {
            view: ViewNumber::new(view),
            proposal: Proposal::new(
                RequestId::new(ClientId::new(9), slot),
                "mem://client-9",
                Timestamp::from_millis(5),
                format!("{slot}@{view}").into_bytes(),
            ),
        }
    }

    proptest::proptest! {
        #[test]
        fn plan_keeps_every_slots_highest_certificate(
            votes in proptest::collection::vec(
                proptest::collection::btree_map(0u64..6, 0u64..5, 0..6),
                3,
            ),
        ) {
            let mut coordinator = ViewChangeCoordinator::new(3);
            let mut plan = None;
            for (i, certs) in votes.iter().enumerate() {
                let vote = ViewChangeVote {
                    prospective_view: ViewNumber::new(5),
                    checkpoint: Checkpoint::default(),
                    prepare_certificates: certs
                        .iter()
                        .map(|(&slot, &view)| (SlotNumber::new(slot), prepared(slot, view)))
                        .collect(),
                };
                plan = coordinator.receive_vote(ReplicaId::new(i as u8), vote).plan;
            }
            let plan = plan.expect("three votes reach quorum");

            let mut highest: BTreeMap<u64, u64> = BTreeMap::new();
            for (&slot, &view) in votes.iter().flatten() {
                let entry = highest.entry(slot).or_insert(view);
                *entry = (*entry).max(view);
            }
            proptest::prop_assert_eq!(plan.certificates.len(), highest.len());
            for (slot, view) in highest {
                proptest::prop_assert_eq!(
                    &plan.certificates[&SlotNumber::new(slot)],
                    &prepared(slot, view)
                );
            }
        }
    }
}
