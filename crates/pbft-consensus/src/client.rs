//! Client-side decision logic.
//!
//! A client cannot trust any single replica, so it accepts a result only
//! after `f + 1` replicas send matching replies: at least one of them is
//! correct. [`ReplyTracker`] does the counting and [`RetryPolicy`] decides
//! what to do when a request goes unanswered. Both are pure; the async
//! driver in `pbft-node` owns the timers and sockets.

use std::collections::{BTreeMap, BTreeSet};

use pbft_types::{Digest, ReplicaId, RequestId, ViewNumber};

use crate::config::ClusterConfig;
use crate::message::Reply;

// ============================================================================
// Reply Tracker
// ============================================================================

/// Counts replies for one request until `f + 1` of them match.
#[derive(Debug, Clone)]
pub struct ReplyTracker {
    request: RequestId,
    needed: usize,
    votes: BTreeMap<(ViewNumber, Digest), BTreeSet<ReplicaId>>,
    accepted: Option<Reply>,
}

impl ReplyTracker {
    pub fn new(request: RequestId, config: &ClusterConfig) -> Self {
        Self {
            request,
            needed: config.weak_quorum_size(),
            votes: BTreeMap::new(),
            accepted: None,
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    /// Records a reply and returns the accepted result once `f + 1` replicas
    /// agree on the same view and proposal.
    ///
    /// Replies for other requests are ignored. Replies are matched by
    /// proposal digest, so a Byzantine replica that alters the payload forms
    /// its own group and cannot tip an honest one over the threshold.
    pub fn record(&mut self, reply: Reply) -> Option<&Reply> {
        if self.accepted.is_some() {
            return self.accepted.as_ref();
        }
        if reply.proposal.request != self.request {
            return None;
        }

        let voters = self
            .votes
            .entry((reply.view, reply.proposal.digest()))
            .or_default();
        voters.insert(reply.from);
        if voters.len() >= self.needed {
            self.accepted = Some(reply);
        }
        self.accepted.as_ref()
    }

    pub fn accepted(&self) -> Option<&Reply> {
        self.accepted.as_ref()
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// What the client should do after an unanswered attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Send the request again to `target`.
    Resend { target: ReplicaId },
    /// Ask every replica for a view change, then resend to `target`.
    RequestViewChange { target: ReplicaId },
    /// Attempts are exhausted.
    GiveUp { attempts: u32 },
}

/// Escalation state for a single request.
///
/// After `retries_before_view_change` consecutive failures the client
/// solicits a view change and rotates its target to the next replica in
/// round-robin order.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    replicas: Vec<ReplicaId>,
    retries_before_view_change: u32,
    max_attempts: u32,
    target_index: usize,
    attempts: u32,
    consecutive_failures: u32,
}

impl RetryPolicy {
    /// Creates a policy targeting the leader of view 0.
    ///
    /// # Panics
    ///
    /// Panics if `retries_before_view_change` or `max_attempts` is zero.
    pub fn new(config: &ClusterConfig, retries_before_view_change: u32, max_attempts: u32) -> Self {
        assert!(retries_before_view_change > 0, "retry threshold must be positive");
        assert!(max_attempts > 0, "max attempts must be positive");

        let replicas: Vec<ReplicaId> = config.replicas().collect();
        let leader = config.leader_for_view(ViewNumber::ZERO);
        let target_index = replicas.iter().position(|r| *r == leader).unwrap_or(0);
        Self {
            replicas,
            retries_before_view_change,
            max_attempts,
            target_index,
            attempts: 0,
            consecutive_failures: 0,
        }
    }

    /// Returns the replica the next attempt should go to.
    pub fn target(&self) -> ReplicaId {
        self.replicas[self.target_index]
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Follows a redirect to the replica believed to lead.
    pub fn redirect(&mut self, leader: ReplicaId) {
        if let Some(index) = self.replicas.iter().position(|r| *r == leader) {
            self.target_index = index;
        }
    }

    /// Records an unanswered attempt and decides the next step.
    pub fn on_failure(&mut self) -> RetryAction {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return RetryAction::GiveUp {
                attempts: self.attempts,
            };
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures < self.retries_before_view_change {
            return RetryAction::Resend {
                target: self.target(),
            };
        }

        self.consecutive_failures = 0;
        self.target_index = (self.target_index + 1) % self.replicas.len();
        RetryAction::RequestViewChange {
            target: self.target(),
        }
    }

    /// Resets escalation after a request succeeds. The target is kept, so
    /// the next request goes to the replica that just answered.
    pub fn on_success(&mut self) {
        self.attempts = 0;
        self.consecutive_failures = 0;
    }
}
