//! Message transport.
//!
//! [`Transport`] is the seam between the replica runtime and the wire. The
//! in-process [`LocalNetwork`] encodes every [`Envelope`] with postcard,
//! hands the bytes to the receiver's bounded mailbox, and drops a configured
//! fraction of messages to emulate a lossy link.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pbft_consensus::Envelope;
use pbft_types::ReplicaId;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

/// Envelopes a mailbox buffers before senders start waiting.
const MAILBOX_CAPACITY: usize = 4096;

/// Where an envelope is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Replica(ReplicaId),
    /// A client, keyed by the callback it puts in its proposals.
    Client(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replica(id) => write!(f, "replica {id}"),
            Self::Client(callback) => write!(f, "client {callback}"),
        }
    }
}

/// Delivers envelopes to replicas and clients.
///
/// Delivery is best effort. An `Ok` means the envelope left this node, not
/// that it arrived; callers never retry on the receiver's behalf.
pub trait Transport: Clone + Send + Sync + 'static {
    fn send(&self, to: Address, envelope: Envelope) -> impl Future<Output = Result<()>> + Send;
}

// ============================================================================
// In-Process Network
// ============================================================================

/// An in-memory network connecting every replica and client of a
/// [`LocalCluster`](crate::LocalCluster).
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: Mutex<HashMap<Address, mpsc::Sender<Vec<u8>>>>,
    loss_rate: f64,
    timeout: Duration,
}

impl LocalNetwork {
    /// Creates a network that drops each envelope with probability
    /// `loss_rate` and gives up on a full mailbox after `timeout`.
    pub fn new(loss_rate: f64, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoints: Mutex::new(HashMap::new()),
                loss_rate: loss_rate.clamp(0.0, 1.0),
                timeout,
            }),
        }
    }

    /// Attaches an endpoint and returns its mailbox. Registering an address
    /// again replaces the previous mailbox.
    pub fn register(&self, address: Address) -> Mailbox {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        self.endpoints().insert(address.clone(), sender);
        Mailbox { address, receiver }
    }

    /// Detaches an endpoint. Later sends to it fail as unreachable.
    pub fn unregister(&self, address: &Address) {
        self.endpoints().remove(address);
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.endpoints().contains_key(address)
    }

    fn endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<Address, mpsc::Sender<Vec<u8>>>> {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn should_drop(&self) -> bool {
        self.inner.loss_rate > 0.0 && rand::thread_rng().gen_bool(self.inner.loss_rate)
    }
}

impl Transport for LocalNetwork {
    async fn send(&self, to: Address, envelope: Envelope) -> Result<()> {
        let bytes = envelope.to_bytes()?;

        if self.should_drop() {
            debug!(%to, "envelope dropped by simulated loss");
            return Ok(());
        }

        let sender = self
            .endpoints()
            .get(&to)
            .cloned()
            .ok_or_else(|| NodeError::Network {
                to: to.clone(),
                reason: "unreachable".to_string(),
            })?;

        sender
            .send_timeout(bytes, self.inner.timeout)
            .await
            .map_err(|e| NodeError::Network {
                to,
                reason: e.to_string(),
            })
    }
}

/// Receiving end of a registered endpoint.
pub struct Mailbox {
    address: Address,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl Mailbox {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Waits for the next well-formed envelope. Returns `None` once the
    /// endpoint is unregistered and drained.
    ///
    /// Undecodable frames are logged and skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let bytes = self.receiver.recv().await?;
            match Envelope::from_bytes(&bytes) {
                Ok(envelope) => return Some(envelope),
                Err(error) => {
                    warn!(address = %self.address, %error, "dropping undecodable envelope");
                }
            }
        }
    }
}
