//! Rate-limited view tracking.

use std::time::{Duration, Instant};

use pbft_types::{ReplicaId, ViewNumber};

use crate::config::ClusterConfig;
use crate::error::ViewError;

/// A replica's follow view.
///
/// Advancing on local suspicion goes through [`View::try_advance`], which
/// refuses to move again until `min_interval` has passed since the last
/// advance. This damps view-change storms caused by spurious or Byzantine
/// view-change traffic. [`View::install`] bypasses the limit and is reserved
/// for moves backed by votes from other replicas.
#[derive(Debug, Clone)]
pub struct View {
    number: ViewNumber,
    min_interval: Duration,
    last_advance: Option<Instant>,
}

impl View {
    /// Creates view 0. The first advance is never rate limited.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            number: ViewNumber::ZERO,
            min_interval,
            last_advance: None,
        }
    }

    pub fn number(&self) -> ViewNumber {
        self.number
    }

    /// Returns the designated leader of this view.
    pub fn leader_of(&self, config: &ClusterConfig) -> ReplicaId {
        config.leader_for_view(self.number)
    }

    /// Advances to `new_view` if the rate limit allows it.
    ///
    /// On error the view is left unchanged.
    pub fn try_advance(&mut self, new_view: ViewNumber, now: Instant) -> Result<(), ViewError> {
        if new_view <= self.number {
            return Err(ViewError::NotAhead {
                current: self.number,
                requested: new_view,
            });
        }

        if let Some(last) = self.last_advance {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                return Err(ViewError::RateLimited {
                    remaining: self.min_interval - elapsed,
                });
            }
        }

        self.number = new_view;
        self.last_advance = Some(now);
        Ok(())
    }

    /// Moves to `new_view` without consulting the rate limit.
    ///
    /// Does nothing if `new_view` is not ahead. The move still counts as an
    /// advance for the purpose of later rate-limited attempts.
    pub fn install(&mut self, new_view: ViewNumber, now: Instant) {
        if new_view > self.number {
            self.number = new_view;
            self.last_advance = Some(now);
        }
    }
}
