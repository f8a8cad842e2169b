//! Bloom trust filter: "peers believed to be at or above tier T for
//! capability C", as a fixed-size bit array.
//!
//! Bit positions use double hashing over two independent digests
//! (SHA-256 and keccak-256): `idx_i = h1 + i·h2 mod m`, with `h2` forced odd.

use sha2::{Digest, Sha256};
use thiserror::Error;

use agentmesh_protocol::{hash::keccak256, TrustFilterWire, TrustTier};

use crate::auth::AuthError;

/// Upper bound on hash functions accepted from the wire.
const MAX_HASH_COUNT: u32 = 32;

/// Why a filter was refused, locally or from gossip.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterRejection {
    #[error("bit array is {got} bytes, expected {expected}")]
    WrongSize { expected: usize, got: usize },
    #[error("threshold {threshold} does not belong to tier {tier}")]
    ThresholdMismatch { tier: TrustTier, threshold: f64 },
    #[error("hash count {0} out of range")]
    BadHashCount(u32),
    #[error("filter has no creator")]
    MissingCreator,
    #[error("filter is unsigned")]
    Unsigned,
    #[error("bad signature: {0}")]
    BadSignature(#[from] AuthError),
    #[error("signed by {signer}, claims creator {creator}")]
    CreatorMismatch { signer: String, creator: String },
    #[error("filters for different capability, tier or shape cannot merge")]
    Incompatible,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BloomTrustFilter {
    pub capability:   String,
    pub tier:         TrustTier,
    bits:             Vec<u8>,
    hash_count:       u32,
    pub member_count: u64,
    /// Unix milliseconds.
    pub created_at:   u64,
    pub created_by:   String,
    pub signature:    Option<Vec<u8>>,
    pub public_key:   Option<Vec<u8>>,
}

impl BloomTrustFilter {
    /// `num_bits` is rounded up to whole bytes.
    pub fn new(
        capability: impl Into<String>,
        tier:       TrustTier,
        num_bits:   usize,
        hash_count: u32,
        created_by: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            capability:   capability.into(),
            tier,
            bits:         vec![0u8; num_bits.max(8).div_ceil(8)],
            hash_count:   hash_count.clamp(1, MAX_HASH_COUNT),
            member_count: 0,
            created_at,
            created_by:   created_by.into(),
            signature:    None,
            public_key:   None,
        }
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn min_reputation_threshold(&self) -> f64 {
        self.tier.min_reputation_threshold()
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = usize> {
        let sha = Sha256::digest(item.as_bytes());
        let kec = keccak256(item.as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&sha[..8]);
        b.copy_from_slice(&kec[..8]);
        let h1 = u64::from_be_bytes(a);
        let h2 = u64::from_be_bytes(b) | 1;
        let m  = self.num_bits() as u64;
        (0..u64::from(self.hash_count))
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn insert(&mut self, peer: &str) {
        let positions: Vec<usize> = self.positions(peer).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
        self.member_count += 1;
        self.signature = None;
    }

    /// May return a false positive, never a false negative.
    pub fn contains(&self, peer: &str) -> bool {
        self.positions(peer).all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Union of two filters: OR-ed bits, summed member counts, latest
    /// timestamp. The result is unsigned.
    pub fn merge(&self, other: &Self) -> Result<Self, FilterRejection> {
        if self.capability != other.capability
            || self.tier != other.tier
            || self.bits.len() != other.bits.len()
            || self.hash_count != other.hash_count
        {
            return Err(FilterRejection::Incompatible);
        }
        let bits = self.bits.iter().zip(&other.bits).map(|(a, b)| a | b).collect();
        Ok(Self {
            capability:   self.capability.clone(),
            tier:         self.tier,
            bits,
            hash_count:   self.hash_count,
            member_count: self.member_count.saturating_add(other.member_count),
            created_at:   self.created_at.max(other.created_at),
            created_by:   self.created_by.clone(),
            signature:    None,
            public_key:   None,
        })
    }

    /// Expected false-positive rate `(1 − e^(−k·n/m))^k`.
    pub fn estimated_fpr(&self) -> f64 {
        let k = f64::from(self.hash_count);
        let n = self.member_count as f64;
        let m = self.num_bits() as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    // ------------------------------------------------------------------------
    // Wire form
    // ------------------------------------------------------------------------

    pub fn to_wire(&self) -> TrustFilterWire {
        TrustFilterWire {
            capability:               self.capability.clone(),
            tier:                     self.tier,
            min_reputation_threshold: self.min_reputation_threshold(),
            bit_array:                self.bits.clone(),
            hash_count:               self.hash_count,
            member_count:             self.member_count,
            created_at:               self.created_at,
            created_by:               self.created_by.clone(),
            signature:                self.signature.clone().unwrap_or_default(),
            public_key:               self.public_key.clone().unwrap_or_default(),
        }
    }

    /// Structural validation of a received filter. Signatures are checked by
    /// the trust store.
    pub fn from_wire(wire: TrustFilterWire, expected_bits: usize) -> Result<Self, FilterRejection> {
        let expected = expected_bits.max(8).div_ceil(8);
        if wire.bit_array.len() != expected {
            return Err(FilterRejection::WrongSize { expected, got: wire.bit_array.len() });
        }
        if wire.min_reputation_threshold != wire.tier.min_reputation_threshold() {
            return Err(FilterRejection::ThresholdMismatch {
                tier:      wire.tier,
                threshold: wire.min_reputation_threshold,
            });
        }
        if wire.hash_count == 0 || wire.hash_count > MAX_HASH_COUNT {
            return Err(FilterRejection::BadHashCount(wire.hash_count));
        }
        if wire.created_by.trim().is_empty() {
            return Err(FilterRejection::MissingCreator);
        }
        Ok(Self {
            capability:   wire.capability,
            tier:         wire.tier,
            bits:         wire.bit_array,
            hash_count:   wire.hash_count,
            member_count: wire.member_count,
            created_at:   wire.created_at,
            created_by:   wire.created_by,
            signature:    (!wire.signature.is_empty()).then_some(wire.signature),
            public_key:   (!wire.public_key.is_empty()).then_some(wire.public_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(bits: usize, k: u32) -> BloomTrustFilter {
        BloomTrustFilter::new("translate", TrustTier::Good, bits, k, "me", 1)
    }

    #[test]
    fn inserted_peers_are_members() {
        let mut f = filter(1_024, 5);
        for i in 0..50 {
            f.insert(&format!("peer-{i}"));
        }
        assert!((0..50).all(|i| f.contains(&format!("peer-{i}"))));
        assert_eq!(f.member_count, 50);
    }

    #[test]
    fn merge_has_no_false_negatives() {
        let mut a = filter(4_096, 6);
        let mut b = filter(4_096, 6);
        b.created_at = 9;
        for i in 0..300 {
            a.insert(&format!("a-{i}"));
            b.insert(&format!("b-{i}"));
        }
        let merged = a.merge(&b).unwrap();
        assert!((0..300).all(|i| merged.contains(&format!("a-{i}"))));
        assert!((0..300).all(|i| merged.contains(&format!("b-{i}"))));
        assert_eq!(merged.member_count, 600);
        assert_eq!(merged.created_at, 9);
    }

    #[test]
    fn self_merge_leaves_bits_unchanged() {
        let mut a = filter(2_048, 4);
        for i in 0..100 {
            a.insert(&format!("p{i}"));
        }
        assert_eq!(a.merge(&a).unwrap().bits(), a.bits());
    }

    #[test]
    fn incompatible_filters_do_not_merge() {
        let a = filter(2_048, 4);
        assert_eq!(a.merge(&filter(1_024, 4)), Err(FilterRejection::Incompatible));
        assert_eq!(a.merge(&filter(2_048, 5)), Err(FilterRejection::Incompatible));
        let other_tier = BloomTrustFilter::new("translate", TrustTier::Elite, 2_048, 4, "me", 1);
        assert_eq!(a.merge(&other_tier), Err(FilterRejection::Incompatible));
    }

    #[test]
    fn observed_fpr_within_estimate() {
        let mut f = filter(8_192, 4);
        for i in 0..1_000 {
            f.insert(&format!("member-{i}"));
        }
        let estimate = f.estimated_fpr();
        assert!(estimate > 0.01 && estimate < 0.05, "estimate {estimate}");

        let trials = 20_000;
        let hits = (0..trials).filter(|i| f.contains(&format!("outsider-{i}"))).count();
        let observed = hits as f64 / trials as f64;
        assert!(observed < estimate * 2.0, "observed {observed}, estimate {estimate}");
    }

    #[test]
    fn wire_validation() {
        let mut f = filter(2_048, 4);
        f.insert("x");
        let wire = f.to_wire();
        assert_eq!(BloomTrustFilter::from_wire(wire.clone(), 2_048).unwrap(), f);

        assert_eq!(
            BloomTrustFilter::from_wire(wire.clone(), 4_096),
            Err(FilterRejection::WrongSize { expected: 512, got: 256 })
        );

        let mut bad = wire.clone();
        bad.min_reputation_threshold = 10.0;
        assert!(matches!(
            BloomTrustFilter::from_wire(bad, 2_048),
            Err(FilterRejection::ThresholdMismatch { .. })
        ));

        let mut anon = wire.clone();
        anon.created_by = " ".into();
        assert_eq!(BloomTrustFilter::from_wire(anon, 2_048), Err(FilterRejection::MissingCreator));

        let mut k0 = wire;
        k0.hash_count = 0;
        assert_eq!(BloomTrustFilter::from_wire(k0, 2_048), Err(FilterRejection::BadHashCount(0)));
    }
}
