//! # Fingerprint - Key Digest
//!
//! Every key in ShoalKV is identified by a fixed-width cryptographic digest
//! of its bytes, not by the key itself. The index, the segment headers, and
//! the on-device snapshot all store fingerprints, so two keys collide only if
//! their digests collide.
//!
//! Ordering and equality are plain bytewise comparison over the digest.
//! Bucket selection takes the first eight digest bytes as a little-endian
//! `u64`; the hash table's bucket count is a power of two, so only the low
//! bits participate.

use std::fmt;

use md5::{Digest, Md5};

/// Width of a key fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 16;

/// A 16-byte cryptographic digest of a key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Computes the fingerprint of `key`. Total over all byte strings.
    pub fn of(key: &[u8]) -> Self {
        let digest = Md5::digest(key);
        Self(digest.into())
    }

    /// Wraps raw digest bytes, e.g. when decoding an on-device record.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Bucket seed: the first eight digest bytes as a little-endian `u64`.
    ///
    /// Deterministic, and uniformly distributed in the low bits since the
    /// digest is cryptographic.
    #[must_use]
    pub fn bucket_hash(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}
