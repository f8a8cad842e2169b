use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Smoothing factor for per-peer RTT (weight of the newest sample).
const RTT_ALPHA: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyZone {
    Local,
    Regional,
    Continental,
    Global,
}

impl LatencyZone {
    pub const ALL: [LatencyZone; 4] =
        [Self::Local, Self::Regional, Self::Continental, Self::Global];

    /// Ranking weight: nearer zones score higher.
    pub fn weight(self) -> f64 {
        match self {
            Self::Local       => 1.0,
            Self::Regional    => 0.8,
            Self::Continental => 0.6,
            Self::Global      => 0.4,
        }
    }
}

impl fmt::Display for LatencyZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local       => "local",
            Self::Regional    => "regional",
            Self::Continental => "continental",
            Self::Global      => "global",
        };
        f.write_str(s)
    }
}

/// Upper RTT bounds (exclusive) of the three nearer zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyThresholds {
    pub local:       Duration,
    pub regional:    Duration,
    pub continental: Duration,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            local:       Duration::from_millis(20),
            regional:    Duration::from_millis(80),
            continental: Duration::from_millis(200),
        }
    }
}

impl LatencyThresholds {
    pub fn classify(&self, rtt: Duration) -> LatencyZone {
        if rtt < self.local {
            LatencyZone::Local
        } else if rtt < self.regional {
            LatencyZone::Regional
        } else if rtt < self.continental {
            LatencyZone::Continental
        } else {
            LatencyZone::Global
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneStats {
    pub count:  usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

/// Tracks a smoothed RTT per peer and the zone it falls in.
pub struct LatencyTracker {
    thresholds: LatencyThresholds,
    peers:      HashMap<String, (LatencyZone, f64)>,
}

impl LatencyTracker {
    pub fn new(thresholds: LatencyThresholds) -> Self {
        Self { thresholds, peers: HashMap::new() }
    }

    /// Record one RTT sample and return the peer's (possibly new) zone.
    pub fn record(&mut self, peer: &str, rtt: Duration) -> LatencyZone {
        let sample_ms = rtt.as_secs_f64() * 1_000.0;
        let smoothed = match self.peers.get(peer) {
            Some(&(_, prev)) => prev + RTT_ALPHA * (sample_ms - prev),
            None => sample_ms,
        };
        let zone = self.thresholds.classify(Duration::from_secs_f64(smoothed / 1_000.0));
        if let Some((old, _)) = self.peers.insert(peer.to_owned(), (zone, smoothed)) {
            if old != zone {
                tracing::debug!(peer = %peer, from = %old, to = %zone, "Latency zone changed");
            }
        }
        zone
    }

    pub fn zone(&self, peer: &str) -> Option<LatencyZone> {
        self.peers.get(peer).map(|(z, _)| *z)
    }

    pub fn rtt_ms(&self, peer: &str) -> Option<f64> {
        self.peers.get(peer).map(|(_, ms)| *ms)
    }

    pub fn remove(&mut self, peer: &str) {
        self.peers.remove(peer);
    }

    pub fn peers_in(&self, zone: LatencyZone) -> impl Iterator<Item = &str> {
        self.peers
            .iter()
            .filter(move |(_, (z, _))| *z == zone)
            .map(|(p, _)| p.as_str())
    }

    /// Statistics of current per-peer RTTs grouped by zone. Empty zones
    /// are omitted.
    pub fn zone_stats(&self) -> BTreeMap<LatencyZone, ZoneStats> {
        let mut out: BTreeMap<LatencyZone, ZoneStats> = BTreeMap::new();
        for (zone, ms) in self.peers.values() {
            out.entry(*zone)
                .and_modify(|s| {
                    s.min_ms = s.min_ms.min(*ms);
                    s.max_ms = s.max_ms.max(*ms);
                    s.avg_ms = (s.avg_ms * s.count as f64 + ms) / (s.count + 1) as f64;
                    s.count += 1;
                })
                .or_insert(ZoneStats { count: 1, min_ms: *ms, avg_ms: *ms, max_ms: *ms });
        }
        out
    }
}
