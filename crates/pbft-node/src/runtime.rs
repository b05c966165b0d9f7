//! Replica actor.
//!
//! One tokio task owns one [`ReplicaState`] and drains that replica's
//! mailbox one envelope at a time. Handlers therefore never run
//! concurrently against the same state. Outbound messages are spawned as
//! independent send tasks so a slow or crashed peer cannot stall the loop;
//! delivery failures are logged and forgotten.

use std::time::Instant;

use pbft_consensus::{
    Effect, Envelope, Message, ReplicaEvent, ReplicaOutput, ReplicaState, RequestResponse,
};
use pbft_types::{Decision, ReplicaId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::journal::Journal;
use crate::network::{Address, Mailbox, Transport};

/// A replica bound to a transport and a mailbox.
pub struct ReplicaNode<T: Transport> {
    state: ReplicaState,
    mailbox: Mailbox,
    shell: Shell<T>,
}

/// Everything the actor needs to carry out a [`ReplicaOutput`].
struct Shell<T: Transport> {
    replica_id: ReplicaId,
    peers: Vec<ReplicaId>,
    transport: T,
    journal: Option<Journal>,
}

impl<T: Transport> ReplicaNode<T> {
    pub fn new(state: ReplicaState, transport: T, mailbox: Mailbox, journal: Option<Journal>) -> Self {
        let shell = Shell {
            replica_id: state.replica_id(),
            peers: state.config().replicas().collect(),
            transport,
            journal,
        };
        Self {
            state,
            mailbox,
            shell,
        }
    }

    /// Runs until `shutdown` flips (or its sender is dropped) or the mailbox
    /// closes, then returns the final state for inspection.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ReplicaState {
        let Self {
            mut state,
            mut mailbox,
            shell,
        } = self;

        info!(replica = %shell.replica_id, "replica started");

        loop {
            tokio::select! {
                envelope = mailbox.recv() => {
                    let Some(envelope) = envelope else {
                        debug!(replica = %shell.replica_id, "mailbox closed");
                        break;
                    };
                    let Some(event) = shell.event_for(envelope) else {
                        continue;
                    };
                    let (next, output) = state.process(Instant::now(), event);
                    state = next;
                    shell.dispatch(output).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(
            replica = %shell.replica_id,
            view = %state.view(),
            last_committed = ?state.last_committed(),
            "replica stopped"
        );
        state
    }
}

impl<T: Transport> Shell<T> {
    fn event_for(&self, envelope: Envelope) -> Option<ReplicaEvent> {
        match envelope {
            Envelope::Peer(msg) => Some(ReplicaEvent::Message(Box::new(msg))),
            Envelope::Request(proposal) => Some(ReplicaEvent::ClientRequest(proposal)),
            Envelope::ViewChangeRequest { client } => {
                debug!(replica = %self.replica_id, %client, "client requested view change");
                Some(ReplicaEvent::ViewChangeRequest)
            }
            Envelope::Reply(reply) => {
                warn!(replica = %self.replica_id, from = %reply.from, "replica received a client reply");
                None
            }
        }
    }

    async fn dispatch(&self, output: ReplicaOutput) {
        for msg in output.messages {
            self.send_message(msg);
        }

        // Effects run in order, so a slot is journaled before its reply leaves.
        for effect in output.effects {
            match effect {
                Effect::Persist { decisions } => self.persist(&decisions).await,
                Effect::Reply { callback, reply } => {
                    self.spawn_send(Address::Client(callback), Envelope::Reply(reply));
                }
            }
        }

        match output.response {
            Some(RequestResponse::Redirect { leader }) => {
                debug!(replica = %self.replica_id, %leader, "request sent to non-leader");
            }
            Some(RequestResponse::Unavailable) => {
                debug!(replica = %self.replica_id, "request refused, no leader or queue full");
            }
            Some(RequestResponse::Accepted) | None => {}
        }
    }

    fn send_message(&self, msg: Message) {
        match msg.to {
            Some(to) => self.spawn_send(Address::Replica(to), Envelope::Peer(msg)),
            None => {
                for &to in &self.peers {
                    self.spawn_send(Address::Replica(to), Envelope::Peer(msg.clone()));
                }
            }
        }
    }

    fn spawn_send(&self, to: Address, envelope: Envelope) {
        let transport = self.transport.clone();
        let replica = self.replica_id;
        tokio::spawn(async move {
            if let Err(error) = transport.send(to, envelope).await {
                warn!(%replica, %error, "delivery failed");
            }
        });
    }

    async fn persist(&self, decisions: &[Decision]) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(error) = journal.write(decisions).await {
            warn!(
                replica = %self.replica_id,
                path = %journal.path().display(),
                %error,
                "journal write failed"
            );
        }
    }
}
