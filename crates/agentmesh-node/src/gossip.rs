//! Trust filter store and gossip.
//!
//! Local filters are rebuilt from the capability registry and reputation
//! scores, signed, and broadcast on an interval. Filters received from the
//! network are validated, signature-checked and OR-merged per
//! (capability, tier). Merged filters only grow until the next local rebuild
//! replaces them wholesale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use agentmesh_protocol::{
    constants::{DEFAULT_FILTER_BITS, DEFAULT_FILTER_HASHES},
    TrustFilterWire, TrustTier,
};

use crate::{
    auth::{verify_detached, MessageAuth},
    bloom::{BloomTrustFilter, FilterRejection},
};

#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub filter_bits:     usize,
    pub hash_count:      u32,
    pub gossip_interval: Duration,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            filter_bits:     DEFAULT_FILTER_BITS,
            hash_count:      DEFAULT_FILTER_HASHES,
            gossip_interval: Duration::from_secs(30),
        }
    }
}

type FilterKey = (String, TrustTier);

pub struct TrustFilterStore {
    config:         TrustConfig,
    local_peer:     String,
    local:          HashMap<FilterKey, BloomTrustFilter>,
    network:        HashMap<FilterKey, BloomTrustFilter>,
    last_broadcast: Option<u64>,
}

impl TrustFilterStore {
    pub fn new(config: TrustConfig, local_peer: impl Into<String>) -> Self {
        Self {
            config,
            local_peer:     local_peer.into(),
            local:          HashMap::new(),
            network:        HashMap::new(),
            last_broadcast: None,
        }
    }

    pub fn gossip_interval(&self) -> Duration {
        self.config.gossip_interval
    }

    /// Rebuild every local filter from `providers` (capability → peers) and
    /// the given reputation function. Network filters restart from the new
    /// local filters.
    pub fn rebuild<F>(&mut self, providers: &BTreeMap<String, BTreeSet<String>>, score: F, now: u64)
    where
        F: Fn(&str) -> f64,
    {
        self.local.clear();
        for (capability, peers) in providers {
            let scored: Vec<(&str, f64)> = peers.iter().map(|p| (p.as_str(), score(p))).collect();
            for tier in TrustTier::ALL {
                let threshold = tier.min_reputation_threshold();
                let mut filter = BloomTrustFilter::new(
                    capability.clone(),
                    tier,
                    self.config.filter_bits,
                    self.config.hash_count,
                    self.local_peer.clone(),
                    now,
                );
                for (peer, _) in scored.iter().filter(|(_, s)| *s >= threshold) {
                    filter.insert(peer);
                }
                if filter.member_count > 0 {
                    self.local.insert((capability.clone(), tier), filter);
                }
            }
        }
        self.network = self.local.clone();
        tracing::debug!(filters = self.local.len(), "Trust filters rebuilt");
    }

    /// Signed wire forms of all non-empty local filters, or nothing when the
    /// gossip interval has not elapsed.
    pub fn broadcast_due(&mut self, auth: &MessageAuth, now: u64) -> Vec<TrustFilterWire> {
        let interval = self.config.gossip_interval.as_millis() as u64;
        if self.last_broadcast.is_some_and(|t| now.saturating_sub(t) < interval) {
            return Vec::new();
        }
        self.last_broadcast = Some(now);

        self.local
            .values()
            .filter(|f| f.member_count > 0)
            .map(|f| {
                let mut wire = f.to_wire();
                wire.public_key = auth.public_key().to_vec();
                wire.signature  = auth.sign_bytes(&wire.content_hash());
                wire
            })
            .collect()
    }

    /// Validate and merge a filter received from the network.
    pub fn receive(&mut self, wire: TrustFilterWire) -> Result<(), FilterRejection> {
        let content_hash = wire.content_hash();
        let filter = BloomTrustFilter::from_wire(wire, self.config.filter_bits)?;
        if filter.hash_count() != self.config.hash_count {
            return Err(FilterRejection::Incompatible);
        }

        let (Some(sig), Some(pk)) = (&filter.signature, &filter.public_key) else {
            return Err(FilterRejection::Unsigned);
        };
        let signer = verify_detached(pk, &content_hash, sig)?;
        if signer != filter.created_by {
            return Err(FilterRejection::CreatorMismatch {
                signer,
                creator: filter.created_by.clone(),
            });
        }
        if filter.created_by == self.local_peer {
            return Ok(());
        }

        let key = (filter.capability.clone(), filter.tier);
        let merged = match self.network.get(&key) {
            Some(existing) => existing.merge(&filter)?,
            None => filter,
        };
        tracing::trace!(
            capability = %key.0,
            tier = %key.1,
            members = merged.member_count,
            "Trust filter merged",
        );
        self.network.insert(key, merged);
        Ok(())
    }

    /// Best tier whose local or merged filter tests positive for `peer`.
    pub fn best_tier(&self, capability: &str, peer: &str) -> Option<TrustTier> {
        TrustTier::ALL.into_iter().find(|&tier| {
            let key = (capability.to_owned(), tier);
            self.local.get(&key).is_some_and(|f| f.contains(peer))
                || self.network.get(&key).is_some_and(|f| f.contains(peer))
        })
    }

    pub fn local_filter(&self, capability: &str, tier: TrustTier) -> Option<&BloomTrustFilter> {
        self.local.get(&(capability.to_owned(), tier))
    }

    pub fn network_filter(&self, capability: &str, tier: TrustTier) -> Option<&BloomTrustFilter> {
        self.network.get(&(capability.to_owned(), tier))
    }
}
