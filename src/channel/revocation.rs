use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{sha256, Hash256};

/// Highest usable pre-image index. Derivation walks 48 bits of the index, so
/// a producer covers `[0, 2^48)` states.
pub const MAX_REVOCATION_INDEX: u64 = (1 << 48) - 1;

/// Number of buckets needed to reconstruct every received pre-image: one per
/// possible trailing-zero count of a 48 bit index, plus the root.
const MAX_BUCKETS: usize = 49;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevocationError {
    #[error("revocation index {0} exceeds maximum")]
    IndexOutOfRange(u64),
    #[error("pre-image is not the next entry of the revocation chain")]
    OutOfOrderRevocation,
    #[error("no pre-image received for index {0}")]
    NoSuchIndex(u64),
}

// Derive the secret for a chain index by flipping each set bit of the index
// into the seed, hashing after every flip. Sharing a prefix above the lowest
// set bit is what makes ancestors derive descendants.
fn derive_secret(seed: &[u8; 32], index: u64) -> [u8; 32] {
    let mut res = *seed;
    for i in 0..48 {
        let bitpos = 47 - i;
        if index & (1 << bitpos) != 0 {
            res[bitpos / 8] ^= 1 << (bitpos & 7);
            res = sha256(res);
        }
    }
    res
}

/// Producer side of the revocation chain: the channel initiator derives
/// pre-image `i` on demand from a single 32 byte seed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationProducer {
    root: [u8; 32],
}

impl RevocationProducer {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { root: seed }
    }

    /// Pre-image for state `index`. States count up from zero while the
    /// underlying chain indexes count down, so later states cannot derive
    /// earlier ones.
    pub fn at_index(&self, index: u64) -> Result<Hash256, RevocationError> {
        if index > MAX_REVOCATION_INDEX {
            return Err(RevocationError::IndexOutOfRange(index));
        }
        Ok(derive_secret(&self.root, MAX_REVOCATION_INDEX - index).into())
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Element {
    index: u64,
    hash: Hash256,
}

impl Element {
    fn num_trailing_zeros(index: u64) -> usize {
        (index.trailing_zeros() as usize).min(48)
    }

    /// Derive a descendant secret. Fails if `to` does not live in the
    /// subtree rooted at this element.
    fn derive(&self, to: u64) -> Result<Element, RevocationError> {
        let zeros = Self::num_trailing_zeros(self.index);
        let mask = (1u64 << zeros) - 1;
        if to & !mask != self.index {
            return Err(RevocationError::OutOfOrderRevocation);
        }

        let mut value = self.hash.into_inner();
        for i in 0..zeros {
            let bitpos = zeros - 1 - i;
            if to & (1 << bitpos) != 0 {
                value[bitpos / 8] ^= 1 << (bitpos & 7);
                value = sha256(value);
            }
        }
        Ok(Element {
            index: to,
            hash: value.into(),
        })
    }
}

/// Consumer side of the revocation chain. Receives the counterparty's
/// pre-images one state at a time and keeps only `O(log N)` compact buckets,
/// each able to reconstruct the pre-images of its subtree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationStore {
    buckets: Vec<Element>,
    num_received: u64,
}

impl Default for RevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationStore {
    pub fn new() -> Self {
        Self {
            buckets: Vec::with_capacity(MAX_BUCKETS),
            num_received: 0,
        }
    }

    fn next_chain_index(&self) -> Result<u64, RevocationError> {
        if self.num_received > MAX_REVOCATION_INDEX {
            return Err(RevocationError::IndexOutOfRange(self.num_received));
        }
        Ok(MAX_REVOCATION_INDEX - self.num_received)
    }

    /// Accept the pre-image for the next state. Every already stored bucket
    /// must be derivable from the new entry, which is exactly the check that
    /// the sender walked the chain in order.
    pub fn add_next_entry(&mut self, pre_image: Hash256) -> Result<(), RevocationError> {
        let index = self.next_chain_index()?;
        let new_element = Element {
            index,
            hash: pre_image,
        };

        let bucket = Element::num_trailing_zeros(index);
        for i in 0..bucket {
            let expected = &self.buckets[i];
            let derived = new_element.derive(expected.index)?;
            if derived.hash != expected.hash {
                return Err(RevocationError::OutOfOrderRevocation);
            }
        }

        if bucket < self.buckets.len() {
            self.buckets[bucket] = new_element;
        } else {
            self.buckets.push(new_element);
        }
        self.num_received += 1;
        Ok(())
    }

    /// Reconstruct the pre-image for a previously received state `index`
    /// (counting up from zero, producer order).
    pub fn lookup_pre_image(&self, index: u64) -> Result<Hash256, RevocationError> {
        if index > MAX_REVOCATION_INDEX {
            return Err(RevocationError::IndexOutOfRange(index));
        }
        if index >= self.num_received {
            return Err(RevocationError::NoSuchIndex(index));
        }

        let chain_index = MAX_REVOCATION_INDEX - index;
        for bucket in &self.buckets {
            if let Ok(element) = bucket.derive(chain_index) {
                return Ok(element.hash);
            }
        }
        Err(RevocationError::NoSuchIndex(index))
    }

    /// Number of pre-images received so far.
    pub fn num_received(&self) -> u64 {
        self.num_received
    }

    /// Serialized form bounded by the bucket count, independent of how many
    /// pre-images were received.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialize revocation store")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RevocationError> {
        bincode::deserialize(bytes).map_err(|_| RevocationError::OutOfOrderRevocation)
    }
}
