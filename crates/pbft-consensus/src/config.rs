//! Cluster configuration for the consensus core.
//!
//! [`ClusterConfig`] is the static view of the cluster every replica agrees
//! on: who the replicas are, how often checkpoints are taken, and how often a
//! replica may locally advance its view. Membership never changes at runtime.

use std::time::Duration;

use pbft_types::{ReplicaId, ViewNumber};

/// Default number of slots between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Default minimum time between two rate-limited view advances.
pub const DEFAULT_VIEW_CHANGE_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on requests a leader queues while its window is full.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 1024;

/// Static configuration of a PBFT cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Replica identifiers, sorted. The leader of view `v` is `replicas[v mod n]`.
    replicas: Vec<ReplicaId>,
    checkpoint_interval: u64,
    view_change_min_interval: Duration,
    max_pending_requests: usize,
}

impl ClusterConfig {
    /// Creates a configuration for the given replicas with default timings.
    ///
    /// # Panics
    ///
    /// Panics if `replicas` is empty.
    pub fn new(mut replicas: Vec<ReplicaId>) -> Self {
        assert!(!replicas.is_empty(), "cluster must have at least one replica");
        replicas.sort();
        replicas.dedup();

        Self {
            replicas,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            view_change_min_interval: DEFAULT_VIEW_CHANGE_MIN_INTERVAL,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
        }
    }

    /// Creates a configuration for replicas `0..size`.
    pub fn with_size(size: u8) -> Self {
        Self::new((0..size).map(ReplicaId::new).collect())
    }

    /// Sets the number of slots between checkpoints.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        assert!(interval > 0, "checkpoint interval must be positive");
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the minimum time between two rate-limited view advances.
    pub fn with_view_change_interval(mut self, interval: Duration) -> Self {
        self.view_change_min_interval = interval;
        self
    }

    /// Sets how many requests a leader queues while its window is full.
    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Returns the number of replicas `n`.
    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// Returns the number of Byzantine faults tolerated, `f = (n - 1) / 3`.
    pub fn max_faults(&self) -> usize {
        (self.cluster_size() - 1) / 3
    }

    /// Returns the agreement quorum `ceil((n + f + 1) / 2)`.
    ///
    /// This is `2f + 1` when `n = 3f + 1`. For larger `n` with the same `f`
    /// it grows so that any two quorums still share `f + 1` replicas, at
    /// least one of them correct.
    pub fn quorum_size(&self) -> usize {
        (self.cluster_size() + self.max_faults() + 2) / 2
    }

    /// Returns the number of matching votes guaranteed to include a correct
    /// replica, `f + 1`.
    pub fn weak_quorum_size(&self) -> usize {
        self.max_faults() + 1
    }

    /// Returns the designated leader of a view.
    pub fn leader_for_view(&self, view: ViewNumber) -> ReplicaId {
        let index = view.as_u64() % self.cluster_size() as u64;
        self.replicas[index as usize]
    }

    /// Returns true if the replica is a member of the cluster.
    pub fn contains(&self, replica: ReplicaId) -> bool {
        self.replicas.binary_search(&replica).is_ok()
    }

    /// Iterates over all replicas in order.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.iter().copied()
    }

    pub fn checkpoint_interval(&self) -> u64 {
        self.checkpoint_interval
    }

    pub fn view_change_min_interval(&self) -> Duration {
        self.view_change_min_interval
    }

    pub fn max_pending_requests(&self) -> usize {
        self.max_pending_requests
    }
}
