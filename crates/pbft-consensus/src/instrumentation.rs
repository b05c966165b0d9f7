//! Process-wide protocol counters.
//!
//! Counters are plain atomics updated with `Relaxed` ordering. They are shared
//! by every replica in the process, so an in-process cluster reports totals
//! across all of its replicas.
//!
//! ```ignore
//! use pbft_consensus::instrumentation::METRICS;
//!
//! METRICS.increment_commits();
//! let snapshot = METRICS.snapshot();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Rejection;

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

#[derive(Debug)]
pub struct Metrics {
    // === Traffic ===
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    client_requests_total: AtomicU64,

    // === Progress ===
    /// Slots executed in order.
    commits_total: AtomicU64,
    checkpoints_adopted_total: AtomicU64,
    view_changes_total: AtomicU64,

    // === Rejections ===
    rejected_stale: AtomicU64,
    rejected_out_of_window: AtomicU64,
    rejected_duplicate_vote: AtomicU64,
    rejected_rate_limited: AtomicU64,
    rejected_not_leader: AtomicU64,
    rejected_equivocation: AtomicU64,
    rejected_unknown_replica: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            messages_received_total: AtomicU64::new(0),
            messages_sent_total: AtomicU64::new(0),
            client_requests_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            checkpoints_adopted_total: AtomicU64::new(0),
            view_changes_total: AtomicU64::new(0),
            rejected_stale: AtomicU64::new(0),
            rejected_out_of_window: AtomicU64::new(0),
            rejected_duplicate_vote: AtomicU64::new(0),
            rejected_rate_limited: AtomicU64::new(0),
            rejected_not_leader: AtomicU64::new(0),
            rejected_equivocation: AtomicU64::new(0),
            rejected_unknown_replica: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    pub fn increment_messages_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_messages_sent(&self, count: u64) {
        self.messages_sent_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_client_requests(&self) {
        self.client_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Progress
    // ========================================================================

    pub fn increment_commits(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checkpoints_adopted(&self) {
        self.checkpoints_adopted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes(&self) {
        self.view_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    /// Counts a dropped message by rejection kind.
    pub fn record_rejection(&self, rejection: &Rejection) {
        let counter = match rejection {
            Rejection::Stale { .. } => &self.rejected_stale,
            Rejection::OutOfWindow { .. } => &self.rejected_out_of_window,
            Rejection::DuplicateVote => &self.rejected_duplicate_vote,
            Rejection::RateLimited { .. } => &self.rejected_rate_limited,
            Rejection::NotLeader { .. } => &self.rejected_not_leader,
            Rejection::Equivocation { .. } => &self.rejected_equivocation,
            Rejection::UnknownReplica(_) => &self.rejected_unknown_replica,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns snapshot of all metrics for testing/debugging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_received_total: load(&self.messages_received_total),
            messages_sent_total: load(&self.messages_sent_total),
            client_requests_total: load(&self.client_requests_total),
            commits_total: load(&self.commits_total),
            checkpoints_adopted_total: load(&self.checkpoints_adopted_total),
            view_changes_total: load(&self.view_changes_total),
            rejections_total: load(&self.rejected_stale)
                + load(&self.rejected_out_of_window)
                + load(&self.rejected_duplicate_vote)
                + load(&self.rejected_rate_limited)
                + load(&self.rejected_not_leader)
                + load(&self.rejected_equivocation)
                + load(&self.rejected_unknown_replica),
            rejected_equivocation: load(&self.rejected_equivocation),
            rejected_out_of_window: load(&self.rejected_out_of_window),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub client_requests_total: u64,
    pub commits_total: u64,
    pub checkpoints_adopted_total: u64,
    pub view_changes_total: u64,
    pub rejections_total: u64,
    pub rejected_equivocation: u64,
    pub rejected_out_of_window: u64,
}
