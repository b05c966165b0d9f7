//! Checkpoint agreement and log garbage collection.
//!
//! Replicas periodically agree on a stable prefix of the committed log. The
//! agreed [`Checkpoint`] sets the low-water mark of the slot window: slots
//! below `next_slot` are settled and their per-slot state can be dropped,
//! and a replica accepts per-slot messages only for
//! `[next_slot, next_slot + 2 * interval)`.
//!
//! Agreement is a secondary vote round. A vote carries only the digest of
//! the proposed checkpoint; the content is kept locally in `candidates`. A
//! replica that sees a digest reach quorum without knowing its content asks
//! the voters for it (see [`CheckpointOutcome::ContentMissing`]).

use std::collections::{BTreeMap, BTreeSet};

use pbft_types::{Decision, Digest, ReplicaId, SlotNumber, digest_of};
use serde::{Deserialize, Serialize};

/// A stable log prefix: the decisions for slots `0..next_slot`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First slot not covered by this checkpoint.
    pub next_slot: SlotNumber,
    /// Decisions for every covered slot, in slot order.
    pub decisions: Vec<Decision>,
}

impl Checkpoint {
    pub fn digest(&self) -> Digest {
        digest_of(self)
    }

    /// Returns true if the prefix length matches `next_slot`.
    pub fn is_well_formed(&self) -> bool {
        self.decisions.len() as u64 == self.next_slot.as_u64()
    }
}

/// A replica's vote for a checkpoint, identified by digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointVote {
    pub next_slot: SlotNumber,
    pub digest: Digest,
}

/// Result of [`CheckpointManager::receive_vote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Nothing new became stable.
    Pending,
    /// A checkpoint reached quorum and was adopted.
    Adopted { next_slot: SlotNumber },
    /// A digest reached quorum but its content is unknown locally. The
    /// caller should request it from `voters`.
    ContentMissing {
        next_slot: SlotNumber,
        voters: Vec<ReplicaId>,
    },
}

/// Tracks the stable checkpoint and in-flight checkpoint votes.
///
/// Only each replica's newest vote is kept, so pending votes never exceed
/// the cluster size. Digests that reached quorum are remembered in
/// `certified` until the stable checkpoint passes them, even after their
/// voters move on to the next boundary.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    interval: u64,
    quorum: usize,
    stable: Checkpoint,
    candidates: BTreeMap<Digest, Checkpoint>,
    latest: BTreeMap<ReplicaId, CheckpointVote>,
    certified: BTreeSet<(SlotNumber, Digest)>,
}

impl CheckpointManager {
    pub fn new(interval: u64, quorum: usize) -> Self {
        Self {
            interval,
            quorum,
            stable: Checkpoint::default(),
            candidates: BTreeMap::new(),
            latest: BTreeMap::new(),
            certified: BTreeSet::new(),
        }
    }

    pub fn stable(&self) -> &Checkpoint {
        &self.stable
    }

    pub fn next_slot(&self) -> SlotNumber {
        self.stable.next_slot
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Returns the first slot past the legal window.
    pub fn upper_bound(&self) -> SlotNumber {
        self.stable.next_slot.advance(2 * self.interval)
    }

    /// Returns true if `slot` lies in the legal window.
    pub fn contains(&self, slot: SlotNumber) -> bool {
        self.stable.next_slot <= slot && slot < self.upper_bound()
    }

    /// Returns true if `last_committed` closes a checkpoint interval.
    pub fn is_boundary(&self, last_committed: SlotNumber) -> bool {
        (last_committed.as_u64() + 1) % self.interval == 0
    }

    /// Builds a candidate from the stable prefix plus `committed`, the
    /// decisions for slots `next_slot..` in order, and returns the vote for it.
    pub fn propose(&mut self, committed: &[Decision]) -> CheckpointVote {
        let mut decisions = self.stable.decisions.clone();
        decisions.extend_from_slice(committed);

        let candidate = Checkpoint {
            next_slot: self.stable.next_slot.advance(committed.len() as u64),
            decisions,
        };
        let vote = CheckpointVote {
            next_slot: candidate.next_slot,
            digest: candidate.digest(),
        };

        tracing::debug!(
            next_slot = %vote.next_slot,
            digest = %vote.digest,
            "proposing checkpoint"
        );
        self.candidates.insert(vote.digest, candidate);
        vote
    }

    /// Counts a vote and adopts its checkpoint once `2f + 1` replicas agree.
    ///
    /// A vote replaces the sender's previous one only if it is for a higher
    /// `next_slot`.
    pub fn receive_vote(&mut self, from: ReplicaId, vote: CheckpointVote) -> CheckpointOutcome {
        if vote.next_slot <= self.stable.next_slot {
            return CheckpointOutcome::Pending;
        }
        let newer = self
            .latest
            .get(&from)
            .is_none_or(|previous| previous.next_slot < vote.next_slot);
        if !newer {
            return CheckpointOutcome::Pending;
        }
        self.latest.insert(from, vote);

        let voters: Vec<ReplicaId> = self
            .latest
            .iter()
            .filter(|(_, other)| **other == vote)
            .map(|(voter, _)| *voter)
            .collect();
        if voters.len() < self.quorum {
            return CheckpointOutcome::Pending;
        }
        self.certified.insert((vote.next_slot, vote.digest));

        match self.candidates.get(&vote.digest) {
            Some(candidate) if candidate.next_slot == vote.next_slot => {
                let candidate = candidate.clone();
                self.adopt(candidate);
                CheckpointOutcome::Adopted {
                    next_slot: vote.next_slot,
                }
            }
            _ => CheckpointOutcome::ContentMissing {
                next_slot: vote.next_slot,
                voters,
            },
        }
    }

    /// Adopts a strictly newer, well-formed checkpoint learned from a peer.
    ///
    /// Returns true if the checkpoint was adopted.
    pub fn receive_sync(&mut self, checkpoint: Checkpoint) -> bool {
        if checkpoint.next_slot <= self.stable.next_slot || !checkpoint.is_well_formed() {
            return false;
        }
        tracing::info!(next_slot = %checkpoint.next_slot, "checkpoint synchronized");
        self.adopt(checkpoint);
        true
    }

    /// Returns true if `2f + 1` replicas voted for exactly this checkpoint.
    pub fn is_certified(&self, checkpoint: &Checkpoint) -> bool {
        self.certified
            .contains(&(checkpoint.next_slot, checkpoint.digest()))
    }

    fn adopt(&mut self, checkpoint: Checkpoint) {
        debug_assert!(checkpoint.next_slot > self.stable.next_slot);
        self.stable = checkpoint;
        self.collect_garbage();
    }

    /// Drops votes and candidates the stable checkpoint already subsumes.
    fn collect_garbage(&mut self) {
        let next_slot = self.stable.next_slot;
        self.latest.retain(|_, vote| vote.next_slot > next_slot);
        self.certified.retain(|(slot, _)| *slot > next_slot);
        self.candidates
            .retain(|_, candidate| candidate.next_slot > next_slot);
    }

    #[cfg(test)]
    pub(crate) fn pending_votes(&self) -> usize {
        self.latest.len()
    }
}
