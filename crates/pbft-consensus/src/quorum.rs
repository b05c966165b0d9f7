//! Per-slot vote bookkeeping.
//!
//! A [`QuorumTracker`] records prepare and commit votes for one slot, keyed by
//! `(view, digest)`. Votes for different proposal contents never mix, so a
//! quorum can only form around one specific proposal: a Byzantine minority
//! voting for conflicting values cannot push any key to `2f + 1` on its own.
//!
//! Once a key reaches quorum the tracker seals a [`Certificate`]. Sealing is
//! sticky: [`QuorumTracker::has_quorum`] stays true for the rest of the slot's
//! life.

use std::collections::{BTreeMap, BTreeSet};

use pbft_types::{Digest, Proposal, ReplicaId, ViewNumber};
use serde::{Deserialize, Serialize};

/// Which agreement phase a vote belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteKind {
    Prepare,
    Commit,
}

/// Immutable proof that a quorum agreed on a proposal in a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub view: ViewNumber,
    pub proposal: Proposal,
}

impl Certificate {
    pub fn digest(&self) -> Digest {
        self.proposal.digest()
    }
}

/// Result of recording a single vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The sender already voted for this key, or for another key in the
    /// same or a later view; nothing changed.
    Duplicate,
    /// The vote was counted but sealed nothing new.
    Recorded,
    /// The vote completed a quorum and sealed this certificate.
    Sealed(Certificate),
}

#[derive(Debug, Clone)]
struct VoteSet {
    proposal: Proposal,
    voters: BTreeSet<ReplicaId>,
}

/// Votes of one phase. Each sender holds at most one key, so a slot never
/// tracks more than `n` keys per phase however many views a peer votes in.
#[derive(Debug, Clone, Default)]
struct Ballots {
    sets: BTreeMap<(ViewNumber, Digest), VoteSet>,
    latest: BTreeMap<ReplicaId, (ViewNumber, Digest)>,
}

impl Ballots {
    /// Moves `from`'s vote to `key` and returns the key's vote set, or `None`
    /// if the sender already voted in this or a later view.
    fn cast(
        &mut self,
        from: ReplicaId,
        key: (ViewNumber, Digest),
        proposal: &Proposal,
    ) -> Option<&VoteSet> {
        if let Some(previous) = self.latest.get(&from).copied() {
            if previous.0 >= key.0 {
                return None;
            }
            if let Some(set) = self.sets.get_mut(&previous) {
                set.voters.remove(&from);
                if set.voters.is_empty() {
                    self.sets.remove(&previous);
                }
            }
        }
        self.latest.insert(from, key);

        let set = self.sets.entry(key).or_insert_with(|| VoteSet {
            proposal: proposal.clone(),
            voters: BTreeSet::new(),
        });
        set.voters.insert(from);
        Some(&*set)
    }

    fn count(&self, key: &(ViewNumber, Digest)) -> usize {
        self.sets.get(key).map_or(0, |set| set.voters.len())
    }
}

/// Prepare and commit votes for one slot.
#[derive(Debug, Clone)]
pub struct QuorumTracker {
    quorum: usize,
    prepares: Ballots,
    commits: Ballots,
    prepare_certificate: Option<Certificate>,
    commit_certificate: Option<Certificate>,
}

impl QuorumTracker {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            prepares: Ballots::default(),
            commits: Ballots::default(),
            prepare_certificate: None,
            commit_certificate: None,
        }
    }

    /// Records a vote from `from` for `proposal` in `view`.
    ///
    /// Only a sender's newest view counts: a vote in a later view replaces
    /// its earlier one, anything else is a duplicate.
    ///
    /// A prepare quorum seals a prepare certificate unless one from the same
    /// or a higher view already exists; a higher view replaces a lower one.
    /// A commit quorum seals the commit certificate only once.
    pub fn record_vote(
        &mut self,
        kind: VoteKind,
        view: ViewNumber,
        proposal: &Proposal,
        from: ReplicaId,
    ) -> VoteOutcome {
        let ballots = match kind {
            VoteKind::Prepare => &mut self.prepares,
            VoteKind::Commit => &mut self.commits,
        };
        let Some(set) = ballots.cast(from, (view, proposal.digest()), proposal) else {
            return VoteOutcome::Duplicate;
        };
        if set.voters.len() < self.quorum {
            return VoteOutcome::Recorded;
        }

        let certificate = Certificate {
            view,
            proposal: set.proposal.clone(),
        };
        let sealed = match kind {
            VoteKind::Prepare => {
                let replaces = self
                    .prepare_certificate
                    .as_ref()
                    .is_none_or(|existing| existing.view < view);
                if replaces {
                    self.prepare_certificate = Some(certificate.clone());
                }
                replaces
            }
            VoteKind::Commit => {
                let first = self.commit_certificate.is_none();
                if first {
                    self.commit_certificate = Some(certificate.clone());
                }
                first
            }
        };

        if sealed {
            VoteOutcome::Sealed(certificate)
        } else {
            VoteOutcome::Recorded
        }
    }

    /// Returns true once any key has reached quorum or a certificate of this
    /// kind is sealed.
    pub fn has_quorum(&self, kind: VoteKind) -> bool {
        let (certificate, ballots) = match kind {
            VoteKind::Prepare => (&self.prepare_certificate, &self.prepares),
            VoteKind::Commit => (&self.commit_certificate, &self.commits),
        };
        certificate.is_some() || ballots.sets.values().any(|set| set.voters.len() >= self.quorum)
    }

    /// Returns the number of distinct voters for a key.
    pub fn vote_count(&self, kind: VoteKind, view: ViewNumber, digest: Digest) -> usize {
        match kind {
            VoteKind::Prepare => self.prepares.count(&(view, digest)),
            VoteKind::Commit => self.commits.count(&(view, digest)),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self, kind: VoteKind) -> usize {
        match kind {
            VoteKind::Prepare => self.prepares.sets.len(),
            VoteKind::Commit => self.commits.sets.len(),
        }
    }

    pub fn prepare_certificate(&self) -> Option<&Certificate> {
        self.prepare_certificate.as_ref()
    }

    pub fn commit_certificate(&self) -> Option<&Certificate> {
        self.commit_certificate.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::{ClientId, RequestId, Timestamp};
    use test_case::test_case;

    fn proposal(data: &'static str) -> Proposal {
        Proposal::new(
            RequestId::new(ClientId::new(1), 0),
            "mem://client-1",
            Timestamp::from_millis(0),
            data.as_bytes(),
        )
    }

    fn vote_from(tracker: &mut QuorumTracker, kind: VoteKind, view: u64, p: &Proposal, ids: &[u8]) {
        for &id in ids {
            tracker.record_vote(kind, ViewNumber::new(view), p, ReplicaId::new(id));
        }
    }

    #[test_case(4, 3 ; "n4")]
    #[test_case(7, 5 ; "n7")]
    #[test_case(10, 7 ; "n10")]
    fn quorum_forms_at_exactly_two_f_plus_one(n: u8, expected: usize) {
        let quorum = crate::ClusterConfig::with_size(n).quorum_size();
        assert_eq!(quorum, expected);

        let p = proposal("x");
        let mut tracker = QuorumTracker::new(quorum);
        let last = quorum as u8 - 1;

        for id in 0..last {
            let outcome =
                tracker.record_vote(VoteKind::Prepare, ViewNumber::ZERO, &p, ReplicaId::new(id));
            assert_eq!(outcome, VoteOutcome::Recorded);
        }
        assert!(!tracker.has_quorum(VoteKind::Prepare));

        let outcome =
            tracker.record_vote(VoteKind::Prepare, ViewNumber::ZERO, &p, ReplicaId::new(last));
        assert!(matches!(outcome, VoteOutcome::Sealed(_)));
        assert!(tracker.has_quorum(VoteKind::Prepare));
    }

    #[test]
    fn duplicate_votes_are_absorbed() {
        let p = proposal("x");
        let mut tracker = QuorumTracker::new(3);
        vote_from(&mut tracker, VoteKind::Commit, 0, &p, &[1, 1]);
        assert_eq!(
            tracker.record_vote(VoteKind::Commit, ViewNumber::ZERO, &p, ReplicaId::new(1)),
            VoteOutcome::Duplicate
        );
        assert_eq!(tracker.vote_count(VoteKind::Commit, ViewNumber::ZERO, p.digest()), 1);
    }

    #[test]
    fn conflicting_contents_never_share_a_quorum() {
        let honest = proposal("x");
        let forged = proposal("y");
        let mut tracker = QuorumTracker::new(3);

        vote_from(&mut tracker, VoteKind::Prepare, 0, &honest, &[0, 1]);
        vote_from(&mut tracker, VoteKind::Prepare, 0, &forged, &[2, 3]);
        assert!(!tracker.has_quorum(VoteKind::Prepare));
    }

    #[test]
    fn votes_in_different_views_do_not_combine() {
        let p = proposal("x");
        let mut tracker = QuorumTracker::new(3);
        vote_from(&mut tracker, VoteKind::Prepare, 0, &p, &[0, 1]);
        vote_from(&mut tracker, VoteKind::Prepare, 1, &p, &[2]);
        assert!(!tracker.has_quorum(VoteKind::Prepare));
    }

    #[test]
    fn higher_view_prepare_certificate_replaces_lower() {
        let p = proposal("x");
        let mut tracker = QuorumTracker::new(3);
        vote_from(&mut tracker, VoteKind::Prepare, 0, &p, &[0, 1, 2]);
        assert_eq!(tracker.prepare_certificate().unwrap().view, ViewNumber::ZERO);

        vote_from(&mut tracker, VoteKind::Prepare, 2, &p, &[0, 1]);
        let outcome = tracker.record_vote(VoteKind::Prepare, ViewNumber::new(2), &p, ReplicaId::new(3));
        assert!(matches!(outcome, VoteOutcome::Sealed(ref c) if c.view == ViewNumber::new(2)));
        assert_eq!(tracker.prepare_certificate().unwrap().view, ViewNumber::new(2));

        // A late quorum in an older view does not roll the certificate back.
        // Replicas 0 and 1 already voted in view 2, so only 2 counts here.
        vote_from(&mut tracker, VoteKind::Prepare, 1, &p, &[0, 1]);
        assert_eq!(tracker.vote_count(VoteKind::Prepare, ViewNumber::new(1), p.digest()), 0);
        let outcome = tracker.record_vote(VoteKind::Prepare, ViewNumber::new(1), &p, ReplicaId::new(2));
        assert_eq!(outcome, VoteOutcome::Recorded);
        assert_eq!(tracker.prepare_certificate().unwrap().view, ViewNumber::new(2));
    }

    #[test]
    fn commit_certificate_is_never_replaced() {
        let first = proposal("x");
        let mut tracker = QuorumTracker::new(3);
        vote_from(&mut tracker, VoteKind::Commit, 0, &first, &[0, 1, 2]);

        let later = proposal("y");
        vote_from(&mut tracker, VoteKind::Commit, 1, &later, &[0, 1]);
        let outcome = tracker.record_vote(VoteKind::Commit, ViewNumber::new(1), &later, ReplicaId::new(3));
        assert_eq!(outcome, VoteOutcome::Recorded);
        assert_eq!(tracker.commit_certificate().unwrap().proposal, first);
        assert!(tracker.has_quorum(VoteKind::Commit));
    }

    #[test]
    fn fourth_vote_after_quorum_is_only_recorded() {
        let p = proposal("x");
        let mut tracker = QuorumTracker::new(3);
        vote_from(&mut tracker, VoteKind::Commit, 0, &p, &[0, 1, 2]);
        let outcome = tracker.record_vote(VoteKind::Commit, ViewNumber::ZERO, &p, ReplicaId::new(3));
        assert_eq!(outcome, VoteOutcome::Recorded);
    }

    #[test]
    fn sender_keeps_one_key_per_phase() {
        let p = proposal("x");
        let mut tracker = QuorumTracker::new(3);
        for view in 1..=500 {
            let forged = proposal(if view % 2 == 0 { "y" } else { "z" });
            tracker.record_vote(VoteKind::Prepare, ViewNumber::new(view), &forged, ReplicaId::new(3));
            tracker.record_vote(VoteKind::Commit, ViewNumber::new(view), &forged, ReplicaId::new(3));
        }
        assert_eq!(tracker.tracked_keys(VoteKind::Prepare), 1);
        assert_eq!(tracker.tracked_keys(VoteKind::Commit), 1);

        // Same view, different content: the first vote stands.
        let outcome = tracker.record_vote(VoteKind::Prepare, ViewNumber::new(500), &p, ReplicaId::new(3));
        assert_eq!(outcome, VoteOutcome::Duplicate);

        // Honest voters are unaffected and still reach quorum with the
        // sender's newest vote.
        let newest = proposal("y");
        vote_from(&mut tracker, VoteKind::Prepare, 500, &newest, &[0]);
        let outcome = tracker.record_vote(VoteKind::Prepare, ViewNumber::new(500), &newest, ReplicaId::new(1));
        assert!(matches!(outcome, VoteOutcome::Sealed(ref c) if c.proposal == newest));
        assert_eq!(tracker.tracked_keys(VoteKind::Prepare), 1);
    }
}
