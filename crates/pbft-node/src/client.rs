//! Async client driver.
//!
//! Sends each operation to the replica it believes leads, waits up to
//! `resend_interval` for `f + 1` matching replies, and otherwise follows
//! [`RetryPolicy`]: resend, solicit a view change from every replica, or give
//! up.

use std::time::Duration;

use bytes::Bytes;
use pbft_config::ClientSection;
use pbft_consensus::{ClusterConfig, Envelope, Reply, ReplyTracker, RetryAction, RetryPolicy};
use pbft_types::{ClientId, Proposal, ReplicaId, RequestId, Timestamp};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::network::{Address, Mailbox, Transport};

/// A client of one cluster. Requests are issued one at a time.
pub struct Client<T: Transport> {
    id: ClientId,
    callback: String,
    transport: T,
    mailbox: Mailbox,
    cluster: ClusterConfig,
    policy: RetryPolicy,
    resend_interval: Duration,
    next_sequence: u64,
}

impl<T: Transport> Client<T> {
    /// Creates a client that receives replies through `mailbox`, which must
    /// be registered as `Address::Client(callback)`.
    pub fn new(
        id: ClientId,
        callback: impl Into<String>,
        transport: T,
        mailbox: Mailbox,
        cluster: ClusterConfig,
        settings: &ClientSection,
    ) -> Self {
        let policy = RetryPolicy::new(
            &cluster,
            settings.retry_times_before_view_change,
            settings.max_attempts,
        );
        Self {
            id,
            callback: callback.into(),
            transport,
            mailbox,
            cluster,
            policy,
            resend_interval: settings.resend_interval(),
            next_sequence: 0,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Returns the replica the next request goes to first.
    pub fn target(&self) -> ReplicaId {
        self.policy.target()
    }

    /// Submits one operation and waits for `f + 1` matching replies.
    pub async fn submit(&mut self, data: impl Into<Bytes>) -> Result<Reply, ClientError> {
        let request = RequestId::new(self.id, self.next_sequence);
        self.next_sequence += 1;

        let proposal = Proposal::new(request, self.callback.clone(), Timestamp::now(), data);
        let mut tracker = ReplyTracker::new(request, &self.cluster);
        let mut target = self.policy.target();

        loop {
            self.send(Address::Replica(target), Envelope::Request(proposal.clone()))
                .await;

            if let Some(reply) = self.await_quorum(&mut tracker).await? {
                self.policy.on_success();
                self.policy
                    .redirect(self.cluster.leader_for_view(reply.view));
                debug!(client = %self.id, %request, slot = %reply.slot, view = %reply.view, "request committed");
                return Ok(reply);
            }

            match self.policy.on_failure() {
                RetryAction::Resend { target: next } => {
                    debug!(client = %self.id, %request, target = %next, "no quorum of replies, resending");
                    target = next;
                }
                RetryAction::RequestViewChange { target: next } => {
                    info!(client = %self.id, %request, target = %next, "soliciting view change");
                    self.broadcast_view_change().await;
                    target = next;
                }
                RetryAction::GiveUp { attempts } => {
                    warn!(client = %self.id, %request, attempts, "giving up");
                    return Err(ClientError::Exhausted { attempts });
                }
            }
        }
    }

    /// Collects replies until the tracker accepts one or the resend interval
    /// runs out.
    async fn await_quorum(
        &mut self,
        tracker: &mut ReplyTracker,
    ) -> Result<Option<Reply>, ClientError> {
        let deadline = Instant::now() + self.resend_interval;
        loop {
            let envelope = match time::timeout_at(deadline, self.mailbox.recv()).await {
                Err(_elapsed) => return Ok(None),
                Ok(None) => return Err(ClientError::Disconnected),
                Ok(Some(envelope)) => envelope,
            };
            match envelope {
                Envelope::Reply(reply) => {
                    if let Some(accepted) = tracker.record(reply) {
                        return Ok(Some(accepted.clone()));
                    }
                }
                other => {
                    debug!(client = %self.id, ?other, "ignoring non-reply envelope");
                }
            }
        }
    }

    async fn broadcast_view_change(&self) {
        for replica in self.cluster.replicas() {
            self.send(
                Address::Replica(replica),
                Envelope::ViewChangeRequest { client: self.id },
            )
            .await;
        }
    }

    async fn send(&self, to: Address, envelope: Envelope) {
        if let Err(error) = self.transport.send(to, envelope).await {
            debug!(client = %self.id, %error, "send failed");
        }
    }
}
