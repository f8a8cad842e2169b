//! Reputation-weighted peer ranking for capability discovery.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use agentmesh_protocol::TrustTier;

use crate::latency::LatencyZone;

/// Weight of a peer whose latency has never been measured.
const UNKNOWN_ZONE_WEIGHT: f64 = 0.4;

/// A raw capability match before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMatch {
    pub peer_id:     String,
    /// Match strength in 0..=1.
    pub match_score: f64,
    /// Found through proximity discovery.
    pub proximity:   bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPeer {
    pub peer_id:     String,
    pub match_score: f64,
    pub tier:        Option<TrustTier>,
    pub reputation:  f64,
    pub zone:        Option<LatencyZone>,
    pub proximity:   bool,
    pub composite:   f64,
}

/// Where ranking reads its per-peer signals from.
pub trait RankingSignals {
    fn trust_tier(&self, capability: &str, peer: &str) -> Option<TrustTier>;
    fn reputation(&self, peer: &str) -> f64;
    fn zone(&self, peer: &str) -> Option<LatencyZone>;
}

pub fn tier_bonus(tier: Option<TrustTier>) -> f64 {
    match tier {
        Some(TrustTier::Elite)      => 0.3,
        Some(TrustTier::Good)       => 0.2,
        Some(TrustTier::Acceptable) => 0.1,
        None                        => 0.0,
    }
}

pub fn composite_score(
    match_score: f64,
    tier:        Option<TrustTier>,
    reputation:  f64,
    zone:        Option<LatencyZone>,
) -> f64 {
    let zone_weight = zone.map_or(UNKNOWN_ZONE_WEIGHT, LatencyZone::weight);
    0.4 * match_score + tier_bonus(tier) + 0.3 * (reputation / 100.0) + 0.2 * zone_weight
}

/// Rank matches: reputation descending, then proximity, then composite
/// descending. Ties keep their input order.
pub fn rank<S: RankingSignals + ?Sized>(
    capability: &str,
    matches:    Vec<PeerMatch>,
    signals:    &S,
) -> Vec<RankedPeer> {
    let mut ranked: Vec<RankedPeer> = matches
        .into_iter()
        .map(|m| {
            let tier       = signals.trust_tier(capability, &m.peer_id);
            let reputation = signals.reputation(&m.peer_id);
            let zone       = signals.zone(&m.peer_id);
            RankedPeer {
                composite: composite_score(m.match_score, tier, reputation, zone),
                peer_id: m.peer_id,
                match_score: m.match_score,
                tier,
                reputation,
                zone,
                proximity: m.proximity,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.reputation
            .total_cmp(&a.reputation)
            .then_with(|| b.proximity.cmp(&a.proximity))
            .then_with(|| b.composite.total_cmp(&a.composite))
    });
    ranked
}

// ============================================================================
// Capability registry
// ============================================================================

/// Capabilities advertised by peers.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    by_peer: HashMap<String, BTreeSet<String>>,
}

impl CapabilityRegistry {
    /// Replace a peer's advertised capabilities.
    pub fn advertise<I, S>(&mut self, peer: &str, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caps: BTreeSet<String> = capabilities
            .into_iter()
            .map(Into::into)
            .filter(|c: &String| !c.trim().is_empty())
            .collect();
        if caps.is_empty() {
            self.by_peer.remove(peer);
        } else {
            self.by_peer.insert(peer.to_owned(), caps);
        }
    }

    pub fn remove(&mut self, peer: &str) {
        self.by_peer.remove(peer);
    }

    pub fn capabilities(&self, peer: &str) -> Option<&BTreeSet<String>> {
        self.by_peer.get(peer)
    }

    /// Peers advertising `capability`, sorted by peer id.
    pub fn providers(&self, capability: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .by_peer
            .iter()
            .filter(|(_, caps)| caps.contains(capability))
            .map(|(p, _)| p.clone())
            .collect();
        out.sort();
        out
    }

    /// capability → providers.
    pub fn by_capability(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (peer, caps) in &self.by_peer {
            for cap in caps {
                out.entry(cap.clone()).or_default().insert(peer.clone());
            }
        }
        out
    }
}
