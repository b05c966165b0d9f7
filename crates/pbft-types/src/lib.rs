//! # pbft-types: Core types for the PBFT replicated state machine
//!
//! This crate contains shared types used across the workspace:
//! - Identifiers ([`ReplicaId`], [`ClientId`], [`RequestId`])
//! - Protocol counters ([`ViewNumber`], [`SlotNumber`])
//! - Temporal types ([`Timestamp`])
//! - Content addressing ([`Digest`], [`digest_of`])
//! - Log payloads ([`Proposal`], [`Decision`])

use std::{
    fmt::{Debug, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod digest;

pub use digest::{DIGEST_LENGTH, Digest, digest_of};

// ============================================================================
// Identifiers - All Copy
// ============================================================================

/// Index of a replica within the cluster (`0..n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(u8);

impl ReplicaId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the replica index for slice indexing.
    pub fn as_usize(&self) -> usize {
        usize::from(self.0)
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ReplicaId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Identity of a client operation: `(client, sequence number)`.
///
/// A client numbers its operations `0, 1, 2, ...`; resending an operation
/// reuses the same `RequestId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub client_id: ClientId,
    pub sequence: u64,
}

impl RequestId {
    pub fn new(client_id: ClientId, sequence: u64) -> Self {
        Self {
            client_id,
            sequence,
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.client_id, self.sequence)
    }
}

// ============================================================================
// Protocol Counters - All Copy
// ============================================================================

/// A protocol epoch. The leader of view `v` is replica `v mod n`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the following view.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Position in the agreed-upon operation log. The first slot is `0`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SlotNumber(u64);

impl SlotNumber {
    pub const ZERO: SlotNumber = SlotNumber(0);

    pub fn new(slot: u64) -> Self {
        Self(slot)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the following slot.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the slot `count` positions further along the log.
    pub fn advance(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }
}

impl Display for SlotNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SlotNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Timestamp - Copy
// ============================================================================

/// Wall-clock submission time of a client operation.
///
/// Stored as milliseconds since the Unix epoch. Only clients read it; the
/// replicas treat it as part of the opaque proposal content.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Creates a timestamp for the current time.
    ///
    /// A system clock set before the Unix epoch yields [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(elapsed.as_millis() as u64)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000;
        let millis = self.0 % 1_000;
        write!(f, "{secs}.{millis:03}")
    }
}

// ============================================================================
// Log Payloads
// ============================================================================

/// A client operation proposed for a slot.
///
/// Replicas never interpret `data`; they agree on the whole value by its
/// [`Digest`], so equal proposals received from different senders count
/// toward the same quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Who submitted the operation and its sequence number.
    pub request: RequestId,
    /// Where replicas send their reply.
    pub callback: String,
    /// When the client first submitted the operation.
    pub timestamp: Timestamp,
    /// The opaque operation.
    pub data: Bytes,
}

impl Proposal {
    pub fn new(
        request: RequestId,
        callback: impl Into<String>,
        timestamp: Timestamp,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            request,
            callback: callback.into(),
            timestamp,
            data: data.into(),
        }
    }

    /// Returns the content digest used for quorum matching.
    pub fn digest(&self) -> Digest {
        digest_of(self)
    }

    /// Returns the decision recorded in the log once this proposal commits.
    pub fn decision(&self) -> Decision {
        Decision {
            request: self.request,
            data: self.data.clone(),
        }
    }
}

/// A committed log entry: which request ran, and with what operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub request: RequestId,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn proposal(sequence: u64, data: &'static str) -> Proposal {
        Proposal::new(
            RequestId::new(ClientId::new(1), sequence),
            "mem://client/1",
            Timestamp::from_millis(1_000),
            Bytes::from_static(data.as_bytes()),
        )
    }

    #[test]
    fn proposal_digest_ignores_allocation() {
        let a = proposal(0, "put x 1");
        let b = Proposal::new(
            RequestId::new(ClientId::new(1), 0),
            String::from("mem://client/1"),
            Timestamp::from_millis(1_000),
            b"put x 1".to_vec(),
        );
        assert_eq!(a.digest(), b.digest());
    }

    #[test_case(proposal(1, "put x 1") ; "different sequence")]
    #[test_case(proposal(0, "put x 2") ; "different data")]
    fn proposal_digest_tracks_content(other: Proposal) {
        assert_ne!(proposal(0, "put x 1").digest(), other.digest());
    }

    #[test]
    fn decision_drops_delivery_details() {
        let p = proposal(3, "get x");
        let decision = p.decision();
        assert_eq!(decision.request, p.request);
        assert_eq!(decision.data, p.data);
    }

    #[test]
    fn counters_saturate() {
        assert_eq!(ViewNumber::new(u64::MAX).next(), ViewNumber::new(u64::MAX));
        assert_eq!(SlotNumber::new(5).advance(10), SlotNumber::new(15));
    }

    #[test]
    fn proposal_survives_json() {
        let p = proposal(9, "del y");
        let encoded = serde_json::to_string(&p).unwrap();
        let decoded: Proposal = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.digest(), p.digest());
    }

    fn arbitrary_proposal() -> impl proptest::strategy::Strategy<Value = Proposal> {
        use proptest::prelude::*;
        (
            any::<u64>(),
            any::<u64>(),
            "[a-z:/0-9]{0,24}",
            any::<u64>(),
            proptest::collection::vec(any::<u8>(), 0..64),
        )
            .prop_map(|(client, sequence, callback, millis, data)| {
                Proposal::new(
                    RequestId::new(ClientId::new(client), sequence),
                    callback,
                    Timestamp::from_millis(millis),
                    data,
                )
            })
    }

    proptest::proptest! {
        #[test]
        fn digest_survives_wire_and_json_round_trips(p in arbitrary_proposal()) {
            let wire: Proposal = postcard::from_bytes(&postcard::to_allocvec(&p).unwrap()).unwrap();
            let json: Proposal = serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
            proptest::prop_assert_eq!(wire.digest(), p.digest());
            proptest::prop_assert_eq!(json.digest(), p.digest());
        }

        #[test]
        fn digest_separates_different_operations(
            p in arbitrary_proposal(),
            extra in proptest::prelude::any::<u8>(),
        ) {
            let mut other = p.clone();
            let mut data = other.data.to_vec();
            data.push(extra);
            other.data = Bytes::from(data);
            proptest::prop_assert_ne!(other.digest(), p.digest());
        }
    }
}
