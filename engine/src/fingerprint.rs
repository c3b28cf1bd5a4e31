//! Range fingerprints.
//!
//! The fingerprint of a set of timestamps is the XOR of a 12-byte hash of
//! each element (the first 12 bytes of its SHA-256). XOR makes the digest
//! independent of insertion order, and the fingerprint of two disjoint
//! ranges combined is the XOR of their fingerprints.

use crate::timestamp::{BinaryTimestamp, UpperBound};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::{BitXor, BitXorAssign};

/// Size of a fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 12;

/// XOR-fold digest of a range of timestamps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Fingerprint of the empty range.
    pub const ZERO: Fingerprint = Fingerprint([0; FINGERPRINT_SIZE]);

    /// Per-element hash of a single timestamp.
    pub fn of(timestamp: &BinaryTimestamp) -> Self {
        let digest = Sha256::digest(timestamp.as_bytes());
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        Self(bytes)
    }

    /// Fold the hashes of `timestamps`.
    pub fn of_all<'a>(timestamps: impl IntoIterator<Item = &'a BinaryTimestamp>) -> Self {
        timestamps.into_iter().map(Self::of).collect()
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl BitXor for Fingerprint {
    type Output = Fingerprint;

    fn bitxor(mut self, rhs: Self) -> Self::Output {
        self ^= rhs;
        self
    }
}

impl BitXorAssign for Fingerprint {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a ^= b;
        }
    }
}

impl FromIterator<Fingerprint> for Fingerprint {
    fn from_iter<I: IntoIterator<Item = Fingerprint>>(iter: I) -> Self {
        iter.into_iter().fold(Self::ZERO, BitXor::bitxor)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

/// A contiguous ordinal range described by its exclusive upper bound and the
/// fingerprint of its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintRange {
    pub upper_bound: UpperBound,
    pub fingerprint: Fingerprint,
}
