//! # Identifiers and Ring Arithmetic
//!
//! This module defines the core identity types used throughout the crate:
//!
//! - [`Identifier`]: 20-byte SHA-1 value; keys, peers, and users all live in
//!   this space
//! - [`Node`]: a peer seen as a value object (identifier, address, public
//!   key); nodes are freely copied and never own network resources
//! - Ring arithmetic: the `M`-bit position a key occupies on the Chord ring
//!   and open-interval membership with wraparound
//!
//! ## Identity Model
//!
//! A peer's identifier is `SHA1(listen_address)`; a user's identifier is
//! `SHA1(canonical_encoding(public_key))`. Files are keyed by
//! `SHA1(resource_name)` and stored on the peer that is the successor of the
//! key. Two nodes are equal iff their identifiers are equal.
//!
//! ## Ring Positions
//!
//! Identifiers are totally ordered as big-endian unsigned integers. For
//! finger-table placement and interval tests, an identifier is reduced to a
//! ring position: the 160-bit integer modulo [`M`]. All successor and
//! predecessor comparisons happen in position space; identifier equality
//! always uses the full 20 bytes.

use std::cmp::Ordering;

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::crypto::WirePublicKey;

/// Number of finger-table entries and the modulus of the ring position
/// space.
pub const M: usize = 160;

/// A 20-byte ring identifier.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Identifier([u8; 20]);

impl Identifier {
    #[inline]
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// SHA-1 of arbitrary bytes; the only hash used for ring placement.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The all-zero identifier, used as the "unknown" sentinel in headers.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Signed three-way comparison on the big-endian unsigned value.
    pub fn compare(&self, other: &Identifier) -> Ordering {
        self.0.cmp(&other.0)
    }

    /// Ring position: the 160-bit value reduced modulo [`M`].
    pub fn position(&self) -> u64 {
        (BigUint::from_bytes_be(&self.0) % BigUint::from(M as u64))
            .to_u64()
            .expect("residue mod M fits in u64")
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", self.to_hex())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// True when walking clockwise from `a` reaches `x` strictly before `b`.
///
/// Non-wrapping (`a < b`): `a < x < b`. Wrapping (`a >= b`): `x > a` or
/// `x < b`. With `a == b` the interval covers the whole ring except `a`
/// itself, which is what a single-node ring needs for its own lookups.
pub fn between_open(x: u64, a: u64, b: u64) -> bool {
    if a < b {
        a < x && x < b
    } else {
        x > a || x < b
    }
}

/// True when walking clockwise from `a` reaches `x` at or before `b`: the
/// half-open interval `(a, b]`. Used for the successor-side convention;
/// `a == b` covers the whole ring, which is what a single-node ring needs.
pub fn between_right_closed(x: u64, a: u64, b: u64) -> bool {
    if a < b {
        a < x && x <= b
    } else {
        x > a || x <= b
    }
}

/// A peer on the ring, as seen by other peers: identifier, dialable address,
/// and the RSA public key that authenticates it. Equality is identifier
/// equality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: Identifier,
    pub addr: String,
    pub public_key: WirePublicKey,
}

impl Node {
    /// Build a node record for a peer listening on `addr`; the identifier is
    /// derived from the address.
    pub fn from_addr(addr: &str, public_key: WirePublicKey) -> Self {
        Self {
            id: Identifier::hash(addr.as_bytes()),
            addr: addr.to_string(),
            public_key,
        }
    }

    pub fn position(&self) -> u64 {
        self.id.position()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.addr)
    }
}
