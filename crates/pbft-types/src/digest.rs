//! Content digests.
//!
//! Every component that matches values by content (votes on a proposal,
//! votes on a checkpoint, client replies) goes through [`digest_of`], so two
//! replicas that hold equal values always derive equal digests regardless of
//! which peer the value arrived from.
//!
//! The encoding is `postcard` over the value's `Serialize` impl. Struct fields
//! are encoded in declaration order and every collection used in hashed types
//! is ordered (`Vec`, `BTreeMap`), which makes the byte stream canonical. The
//! bytes are then hashed with BLAKE3.

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

/// Length of a content digest in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// A 32-byte BLAKE3 digest of a value's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// The all-zero digest. Never produced by [`digest_of`] in practice.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LENGTH]);

    /// Creates a digest from raw bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the digest as a byte array.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Digest({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Eight bytes is plenty to tell digests apart in logs
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Computes the content digest of a value.
///
/// # Panics
///
/// Panics if the value cannot be encoded by `postcard`. All types hashed in
/// this workspace are plain data with known-length collections, for which
/// encoding cannot fail.
pub fn digest_of<T: Serialize + ?Sized>(value: &T) -> Digest {
    let encoded = postcard::to_allocvec(value)
        .expect("canonical encoding never fails for plain data (all collections have a length)");
    Digest(blake3::hash(&encoded).into())
}
