use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    constants::{ACCEPTABLE_THRESHOLD, ELITE_THRESHOLD, GOOD_THRESHOLD},
    error::ProtocolError,
    hash::keccak256,
};

/// Reputation tier a trust filter vouches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Elite,
    Good,
    Acceptable,
}

impl TrustTier {
    /// Best tier first.
    pub const ALL: [TrustTier; 3] = [Self::Elite, Self::Good, Self::Acceptable];

    /// Minimum reputation a peer needs to be listed in a filter of this tier.
    /// Fixed per tier; a filter can never carry any other value.
    pub fn min_reputation_threshold(self) -> f64 {
        match self {
            Self::Elite      => ELITE_THRESHOLD,
            Self::Good       => GOOD_THRESHOLD,
            Self::Acceptable => ACCEPTABLE_THRESHOLD,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elite      => "elite",
            Self::Good       => "good",
            Self::Acceptable => "acceptable",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustTier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elite"      => Ok(Self::Elite),
            "good"       => Ok(Self::Good),
            "acceptable" => Ok(Self::Acceptable),
            other        => Err(ProtocolError::UnknownTier(other.to_owned())),
        }
    }
}

/// Gossiped form of a Bloom trust filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustFilterWire {
    pub capability:               String,
    pub tier:                     TrustTier,
    pub min_reputation_threshold: f64,
    #[serde(with = "serde_bytes")]
    pub bit_array:                Vec<u8>,
    pub hash_count:               u32,
    pub member_count:             u64,
    /// Unix milliseconds.
    pub created_at:               u64,
    pub created_by:               String,
    #[serde(with = "serde_bytes")]
    pub signature:                Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub public_key:               Vec<u8>,
}

impl TrustFilterWire {
    /// Canonical bytes of every field except the signature and public key.
    /// Strings and the bit array are length-prefixed so field boundaries
    /// cannot shift.
    pub fn content_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bit_array.len() + 128);
        put_str(&mut buf, &self.capability);
        put_str(&mut buf, self.tier.as_str());
        buf.extend_from_slice(&self.min_reputation_threshold.to_bits().to_be_bytes());
        buf.extend_from_slice(&(self.bit_array.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.bit_array);
        buf.extend_from_slice(&self.hash_count.to_be_bytes());
        buf.extend_from_slice(&self.member_count.to_be_bytes());
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        put_str(&mut buf, &self.created_by);
        buf
    }

    /// keccak256 of `content_bytes()`; this is what the creator signs.
    pub fn content_hash(&self) -> [u8; 32] {
        keccak256(&self.content_bytes())
    }
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}
