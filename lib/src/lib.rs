// Shared Rust library
pub mod dht_messages;
pub mod metrics;

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use dht_messages::{NodeId, ID_BYTES};

/// Circular, inclusive interval membership on the ring.
///
/// If `start <= end` the interval is `start..=end`; otherwise it wraps through
/// zero and contains everything from `start` up to the top of the space plus
/// everything from zero up to `end`.
pub fn in_range(id: &NodeId, start: &NodeId, end: &NodeId) -> bool {
    if start <= end {
        start <= id && id <= end
    } else {
        start <= id || id <= end
    }
}

pub fn node_id_to_biguint(id: &NodeId) -> BigUint {
    BigUint::from_bytes_be(id)
}

/// Packs the low 160 bits of `value` into a big-endian identifier.
pub fn biguint_to_node_id(value: &BigUint) -> NodeId {
    let bytes = value.to_bytes_be();
    let mut id = [0u8; ID_BYTES];
    for (dst, src) in id.iter_mut().rev().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    id
}

/// Decimal rendering of an identifier, used in logs and the HTTP API.
pub fn display_id(id: &NodeId) -> String {
    node_id_to_biguint(id).to_string()
}

/// Inverse of `display_id`. Rejects anything that does not fit in 160 bits.
pub fn parse_id(text: &str) -> Option<NodeId> {
    let value: BigUint = text.trim().parse().ok()?;
    (value.bits() <= u64::from(IdentifierSpace::MAX_BITS)).then(|| biguint_to_node_id(&value))
}

/// An m-bit Chord identifier space.
///
/// Identifiers are stored as 160-bit big-endian byte arrays so that plain
/// lexicographic comparison matches numeric order; every identifier produced
/// by a space is already reduced modulo `2^m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentifierSpace {
    bits: u32,
}

impl Default for IdentifierSpace {
    fn default() -> Self {
        Self {
            bits: Self::MAX_BITS,
        }
    }
}

impl IdentifierSpace {
    /// SHA-1 produces 160-bit digests, so that is the widest usable ring.
    pub const MAX_BITS: u32 = 160;

    pub fn new(bits: u32) -> Option<Self> {
        (1..=Self::MAX_BITS)
            .contains(&bits)
            .then_some(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// One finger per bit of the space.
    pub fn finger_count(&self) -> usize {
        self.bits as usize
    }

    pub fn modulus(&self) -> BigUint {
        BigUint::one() << (self.bits as usize)
    }

    pub fn reduce(&self, value: &BigUint) -> NodeId {
        biguint_to_node_id(&(value % self.modulus()))
    }

    /// SHA-1 digest of `key` reduced into the space.
    pub fn hash(&self, key: &str) -> NodeId {
        let digest = Sha1::digest(key.as_bytes());
        self.reduce(&BigUint::from_bytes_be(digest.as_slice()))
    }

    pub fn id(&self, value: u64) -> NodeId {
        self.reduce(&BigUint::from(value))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        node_id_to_biguint(id) < self.modulus()
    }

    /// `(id + 2^i) mod 2^m`, the start of finger `i`.
    pub fn finger_start(&self, id: &NodeId, i: usize) -> NodeId {
        self.reduce(&(node_id_to_biguint(id) + (BigUint::one() << i)))
    }

    pub fn increment(&self, id: &NodeId) -> NodeId {
        self.reduce(&(node_id_to_biguint(id) + BigUint::one()))
    }

    pub fn decrement(&self, id: &NodeId) -> NodeId {
        self.reduce(&(node_id_to_biguint(id) + self.modulus() - BigUint::one()))
    }

    /// `(low, high]` on the ring. When `low == high` the interval covers the
    /// whole ring, which is what a lone node owning every key needs.
    pub fn in_half_open(&self, id: &NodeId, low: &NodeId, high: &NodeId) -> bool {
        in_range(id, &self.increment(low), high)
    }

    /// `(low, high)` on the ring. Empty when `high` directly follows `low`;
    /// everything except `low` when `low == high`.
    pub fn in_open(&self, id: &NodeId, low: &NodeId, high: &NodeId) -> bool {
        let first = self.increment(low);
        if first == *high {
            return false;
        }
        in_range(id, &first, &self.decrement(high))
    }
}
