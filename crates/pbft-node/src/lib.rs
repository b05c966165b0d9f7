//! # pbft-node: the imperative shell around the PBFT replica
//!
//! `pbft-consensus` decides; this crate does the I/O. Each replica runs as
//! a single tokio task ([`ReplicaNode`]) that feeds envelopes from its
//! mailbox into [`ReplicaState::process`](pbft_consensus::ReplicaState::process),
//! spawns the resulting sends, and writes its [`Journal`].
//!
//! [`LocalCluster`] wires a whole cluster onto one in-process
//! [`LocalNetwork`], and [`Client`] drives requests against it.
//!
//! ```ignore
//! let mut cluster = LocalCluster::start(PbftConfig::testing())?;
//! let mut client = cluster.client(ClientId::new(1));
//! let reply = client.submit(&b"put k v"[..]).await?;
//! ```

mod client;
mod cluster;
mod error;
mod journal;
mod network;
mod runtime;

pub use client::Client;
pub use cluster::{LocalCluster, cluster_config};
pub use error::{ClientError, NodeError, Result};
pub use journal::Journal;
pub use network::{Address, LocalNetwork, Mailbox, Transport};
pub use runtime::ReplicaNode;
