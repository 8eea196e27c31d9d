//! Hashed versions: the tamper-evident chain over a wavelet's history.
//!
//! A wavelet at version N carries a history hash derivable only from the
//! hash at N-1 plus the content of delta N. Two replicas that agree on the
//! chain up to some version therefore agree byte-for-byte on everything
//! that happened. This is divergence *detection*, not a security boundary -
//! collision resistance is incidental, catching unintentional forks is the
//! point.

use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};

use sha2::{Digest, Sha256};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::wave::WaveletName;

/// A version number paired with the history hash of the chain up to it.
///
/// Client-known versions may arrive unsigned (empty hash); those are matched
/// by number only. Everything server-side carries the full hash.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HashedVersion {
    pub version: u64,
    pub history_hash: Vec<u8>,
}

impl HashedVersion {
    pub fn new(version: u64, history_hash: Vec<u8>) -> Self {
        HashedVersion { version, history_hash }
    }

    /// A version with no hash attached, as sent by clients that only track
    /// numbers.
    pub fn unsigned(version: u64) -> Self {
        HashedVersion { version, history_hash: Vec::new() }
    }

    pub fn is_unsigned(&self) -> bool {
        self.history_hash.is_empty()
    }

    /// Whether `self` can stand for `other`: equal numbers, and equal hashes
    /// unless one side is unsigned.
    pub fn matches(&self, other: &HashedVersion) -> bool {
        self.version == other.version
            && (self.is_unsigned() || other.is_unsigned() || self.history_hash == other.history_hash)
    }
}

impl Ord for HashedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.history_hash.cmp(&other.history_hash))
    }
}

impl PartialOrd for HashedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for HashedVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_unsigned() {
            write!(f, "{}:unsigned", self.version)
        } else {
            let prefix = &self.history_hash[..self.history_hash.len().min(4)];
            write!(f, "{}:{}", self.version, hex::encode(prefix))
        }
    }
}

impl Debug for HashedVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashedVersion({})", self)
    }
}

/// Computes chain hashes. An explicit object rather than free functions so
/// embedders can thread a differently-seeded factory through without any
/// global state.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedVersionFactory;

impl HashedVersionFactory {
    pub fn new() -> Self {
        HashedVersionFactory
    }

    /// The root of a wavelet's chain: version 0, hashed from the canonical
    /// wavelet name alone. Every replica derives the same root without
    /// communicating.
    pub fn version_zero(&self, name: &WaveletName) -> HashedVersion {
        let mut hasher = Sha256::new();
        hasher.update(name.to_string().as_bytes());
        HashedVersion::new(0, hasher.finalize().to_vec())
    }

    /// The version after applying a delta: the number advances by the
    /// delta's op count, the hash covers the previous hash plus the delta's
    /// canonical bytes.
    pub fn next(
        &self,
        prev: &HashedVersion,
        delta_bytes: &[u8],
        op_count: usize,
    ) -> HashedVersion {
        let mut hasher = Sha256::new();
        hasher.update(&prev.history_hash);
        hasher.update(delta_bytes);
        HashedVersion::new(prev.version + op_count as u64, hasher.finalize().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wave::{WaveId, WaveletId, WaveletName};

    fn name() -> WaveletName {
        WaveletName::new(
            WaveId::new("example.com", "w+abc").unwrap(),
            WaveletId::new("example.com", "conv+root").unwrap(),
        )
    }

    #[test]
    fn version_zero_is_deterministic() {
        let f = HashedVersionFactory::new();
        assert_eq!(f.version_zero(&name()), f.version_zero(&name()));
        let other = WaveletName::new(
            WaveId::new("example.com", "w+other").unwrap(),
            WaveletId::new("example.com", "conv+root").unwrap(),
        );
        assert_ne!(f.version_zero(&name()), f.version_zero(&other));
    }

    #[test]
    fn chain_depends_on_content_and_parent() {
        let f = HashedVersionFactory::new();
        let v0 = f.version_zero(&name());
        let v2 = f.next(&v0, b"delta one", 2);
        assert_eq!(v2.version, 2);
        assert_ne!(v2.history_hash, v0.history_hash);
        // Same parent, different content: different hash.
        assert_ne!(v2.history_hash, f.next(&v0, b"delta two", 2).history_hash);
        // Same content, different parent: different hash.
        assert_ne!(f.next(&v2, b"x", 1).history_hash, f.next(&v0, b"x", 1).history_hash);
        // Replaying the same chain converges.
        assert_eq!(f.next(&v0, b"delta one", 2), v2);
    }

    #[test]
    fn unsigned_matching() {
        let f = HashedVersionFactory::new();
        let v0 = f.version_zero(&name());
        assert!(HashedVersion::unsigned(0).matches(&v0));
        assert!(!HashedVersion::unsigned(1).matches(&v0));
        let mut forged = v0.clone();
        forged.history_hash[0] ^= 1;
        assert!(!forged.matches(&f.version_zero(&name())));
    }
}
