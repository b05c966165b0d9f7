//! Deterministic in-memory cluster for multi-replica tests.
//!
//! Messages sit in a single queue and are delivered one at a time. With
//! reordering enabled, a seeded `ChaCha8Rng` picks which queued message goes
//! next, so a failing seed always replays the same interleaving. Replicas can
//! be crashed, isolated, or marked Byzantine: a Byzantine replica runs the
//! honest state machine but every message it emits passes through a rewrite
//! hook first.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use pbft_types::{Decision, Proposal, ReplicaId, RequestId, SlotNumber};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ClusterConfig;
use crate::message::{Message, Reply};
use crate::replica::{Effect, ReplicaEvent, ReplicaOutput, ReplicaState, RequestResponse};

/// Rewrites one outbound message into zero or more messages.
pub(crate) type RewriteHook = Box<dyn FnMut(Message) -> Vec<Message>>;

/// Upper bound on deliveries in one `run`, to catch livelock.
const MAX_STEPS: usize = 200_000;

pub(crate) struct SimCluster {
    config: ClusterConfig,
    replicas: Vec<Option<ReplicaState>>,
    queue: VecDeque<(ReplicaId, Message)>,
    rng: ChaCha8Rng,
    reorder: bool,
    now: Instant,
    byzantine: BTreeMap<ReplicaId, RewriteHook>,
    isolated: Vec<ReplicaId>,
    replies: Vec<Reply>,
    persisted: BTreeMap<ReplicaId, Vec<Decision>>,
}

impl SimCluster {
    pub(crate) fn new(config: ClusterConfig, seed: u64) -> Self {
        let replicas = config
            .replicas()
            .map(|id| Some(ReplicaState::new(id, config.clone())))
            .collect();
        Self {
            config,
            replicas,
            queue: VecDeque::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            reorder: false,
            now: Instant::now(),
            byzantine: BTreeMap::new(),
            isolated: Vec::new(),
            replies: Vec::new(),
            persisted: BTreeMap::new(),
        }
    }

    pub(crate) fn with_reordering(mut self) -> Self {
        self.reorder = true;
        self
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub(crate) fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns a live replica.
    ///
    /// # Panics
    ///
    /// Panics if the replica has crashed.
    pub(crate) fn replica(&self, id: u8) -> &ReplicaState {
        self.replicas[usize::from(id)]
            .as_ref()
            .expect("replica has crashed")
    }

    /// Iterates over live replicas that are not Byzantine.
    pub(crate) fn honest(&self) -> impl Iterator<Item = &ReplicaState> {
        self.replicas
            .iter()
            .flatten()
            .filter(|r| !self.byzantine.contains_key(&r.replica_id()))
    }

    /// Returns every reply emitted for `request`, by any replica.
    pub(crate) fn replies_for(&self, request: RequestId) -> Vec<&Reply> {
        self.replies
            .iter()
            .filter(|reply| reply.proposal.request == request)
            .collect()
    }

    pub(crate) fn persisted(&self, id: u8) -> Option<&Vec<Decision>> {
        self.persisted.get(&ReplicaId::new(id))
    }

    /// Returns true if every live replica (Byzantine ones included) has a
    /// commit certificate for `slot`.
    pub(crate) fn all_committed(&self, slot: SlotNumber) -> bool {
        self.replicas
            .iter()
            .flatten()
            .all(|r| r.commit_certificate(slot).is_some() || r.stable_checkpoint().next_slot > slot)
    }

    // ========================================================================
    // Faults
    // ========================================================================

    pub(crate) fn crash(&mut self, id: u8) {
        self.replicas[usize::from(id)] = None;
    }

    /// Drops all traffic to and from `id` until [`SimCluster::heal`].
    pub(crate) fn isolate(&mut self, id: u8) {
        self.isolated.push(ReplicaId::new(id));
    }

    pub(crate) fn heal(&mut self, id: u8) {
        self.isolated.retain(|r| *r != ReplicaId::new(id));
    }

    pub(crate) fn set_byzantine(&mut self, id: u8, hook: impl FnMut(Message) -> Vec<Message> + 'static) {
        self.byzantine.insert(ReplicaId::new(id), Box::new(hook));
    }

    pub(crate) fn advance_clock(&mut self, by: Duration) {
        self.now += by;
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Submits a client request to one replica. Returns `None` if it crashed.
    pub(crate) fn submit(&mut self, to: u8, proposal: Proposal) -> Option<RequestResponse> {
        let output = self.process(ReplicaId::new(to), ReplicaEvent::ClientRequest(proposal))?;
        let response = output.response;
        self.enqueue(ReplicaId::new(to), output);
        response
    }

    /// Delivers a client's view-change request to each listed replica.
    pub(crate) fn request_view_change(&mut self, replicas: &[u8]) {
        for &id in replicas {
            if let Some(output) = self.process(ReplicaId::new(id), ReplicaEvent::ViewChangeRequest) {
                self.enqueue(ReplicaId::new(id), output);
            }
        }
    }

    /// Delivers queued messages until the queue drains.
    pub(crate) fn run(&mut self) -> usize {
        self.run_filtered(|_, _| true)
    }

    /// Like [`SimCluster::run`], but discards messages `keep` rejects.
    pub(crate) fn run_filtered(&mut self, mut keep: impl FnMut(ReplicaId, &Message) -> bool) -> usize {
        let mut steps = 0;
        while let Some((to, msg)) = self.next_delivery() {
            steps += 1;
            assert!(steps < MAX_STEPS, "simulation did not quiesce");
            if !keep(to, &msg) {
                continue;
            }
            if let Some(output) = self.process(to, ReplicaEvent::Message(Box::new(msg))) {
                self.enqueue(to, output);
            }
        }
        steps
    }

    fn next_delivery(&mut self) -> Option<(ReplicaId, Message)> {
        loop {
            let next = if self.reorder && !self.queue.is_empty() {
                let index = self.rng.gen_range(0..self.queue.len());
                self.queue.swap_remove_back(index)
            } else {
                self.queue.pop_front()
            }?;
            let cut = self.isolated.contains(&next.0) || self.isolated.contains(&next.1.from);
            if !cut {
                return Some(next);
            }
        }
    }

    fn process(&mut self, to: ReplicaId, event: ReplicaEvent) -> Option<ReplicaOutput> {
        let slot = &mut self.replicas[to.as_usize()];
        let state = slot.take()?;
        let (state, output) = state.process(self.now, event);
        *slot = Some(state);
        Some(output)
    }

    fn enqueue(&mut self, from: ReplicaId, output: ReplicaOutput) {
        for effect in output.effects {
            match effect {
                Effect::Reply { reply, .. } => self.replies.push(reply),
                Effect::Persist { decisions } => {
                    self.persisted.insert(from, decisions);
                }
            }
        }

        for msg in output.messages {
            let rewritten = match self.byzantine.get_mut(&from) {
                Some(hook) => hook(msg),
                None => vec![msg],
            };
            for msg in rewritten {
                match msg.to {
                    Some(to) => self.queue.push_back((to, msg)),
                    None => {
                        for to in self.config.replicas() {
                            self.queue.push_back((to, msg.clone()));
                        }
                    }
                }
            }
        }
    }
}
