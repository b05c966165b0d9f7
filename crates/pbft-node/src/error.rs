//! Error types for the replica runtime and client driver.

use pbft_consensus::CodecError;
use thiserror::Error;

use crate::network::Address;

/// Runtime errors.
///
/// A replica never stops on a [`NodeError`]: delivery and journal failures
/// are logged and the actor keeps processing its mailbox.
#[derive(Error, Debug)]
pub enum NodeError {
    /// A message could not be delivered.
    #[error("failed to deliver to {to}: {reason}")]
    Network { to: Address, reason: String },

    /// An envelope failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The decision journal could not be written or read.
    #[error("journal error: {0}")]
    Journal(#[from] std::io::Error),

    /// The journal file did not contain a decision list.
    #[error("malformed journal: {0}")]
    MalformedJournal(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The actor task ended before it could be asked to stop.
    #[error("replica {0} shut down unexpectedly")]
    Shutdown(u8),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Why a client gave up on a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No `f + 1` matching replies arrived within the retry budget.
    #[error("request failed after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The client's mailbox was closed under it.
    #[error("client endpoint closed")]
    Disconnected,
}
