use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use agentmesh_protocol::constants::{REPUTATION_MAX, REPUTATION_MIN, REPUTATION_NEUTRAL};
use agentmesh_resolver::{ChainFeedback, ResolvedIdentity};

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub success_delta:   f64,
    pub failure_delta:   f64,
    /// How long chain feedback stays fresh.
    pub chain_ttl:       Duration,
    pub resync_interval: Duration,
    /// Stale peers re-fetched per resync tick.
    pub resync_batch:    usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            success_delta:   5.0,
            failure_delta:   10.0,
            chain_ttl:       Duration::from_secs(600),
            resync_interval: Duration::from_secs(60),
            resync_batch:    16,
        }
    }
}

/// Local job history with one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalReputation {
    pub local_score:         f64,
    pub total_jobs:          u64,
    pub successful_jobs:     u64,
    pub failed_jobs:         u64,
    pub last_interaction_at: u64,
}

impl Default for LocalReputation {
    fn default() -> Self {
        Self {
            local_score:         REPUTATION_NEUTRAL,
            total_jobs:          0,
            successful_jobs:     0,
            failed_jobs:         0,
            last_interaction_at: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReputation {
    /// -100..=100 as reported by the resolver.
    pub feedback_score:        f64,
    pub feedback_sample_count: u64,
    pub last_synced_at:        u64,
}

impl ChainReputation {
    /// Feedback mapped onto the 0..=100 reputation scale.
    pub fn normalized(&self) -> f64 {
        ((self.feedback_score + 100.0) / 2.0).clamp(REPUTATION_MIN, REPUTATION_MAX)
    }
}

/// Local history plus cached chain signals, keyed by peer id.
pub struct ReputationStore {
    config:     ReputationConfig,
    local:      HashMap<String, LocalReputation>,
    /// `None` records a sync that found no feedback.
    chain:      HashMap<String, (Option<ChainReputation>, u64)>,
    identities: HashMap<String, ResolvedIdentity>,
}

impl ReputationStore {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            local:      HashMap::new(),
            chain:      HashMap::new(),
            identities: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Local history
    // ------------------------------------------------------------------------

    pub fn record_success(&mut self, peer: &str, now: u64) -> f64 {
        let delta = self.config.success_delta;
        let e = self.local.entry(peer.to_owned()).or_default();
        e.total_jobs += 1;
        e.successful_jobs += 1;
        e.local_score = (e.local_score + delta).clamp(REPUTATION_MIN, REPUTATION_MAX);
        e.last_interaction_at = now;
        e.local_score
    }

    pub fn record_failure(&mut self, peer: &str, now: u64) -> f64 {
        let delta = self.config.failure_delta;
        let e = self.local.entry(peer.to_owned()).or_default();
        e.total_jobs += 1;
        e.failed_jobs += 1;
        e.local_score = (e.local_score - delta).clamp(REPUTATION_MIN, REPUTATION_MAX);
        e.last_interaction_at = now;
        e.local_score
    }

    pub fn local(&self, peer: &str) -> Option<&LocalReputation> {
        self.local.get(peer)
    }

    pub fn local_score(&self, peer: &str) -> f64 {
        self.local.get(peer).map_or(REPUTATION_NEUTRAL, |r| r.local_score)
    }

    // ------------------------------------------------------------------------
    // Chain signals
    // ------------------------------------------------------------------------

    pub fn set_identity(&mut self, peer: &str, identity: ResolvedIdentity) {
        self.identities.insert(peer.to_owned(), identity);
    }

    pub fn identity(&self, peer: &str) -> Option<&ResolvedIdentity> {
        self.identities.get(peer)
    }

    pub fn set_chain(&mut self, peer: &str, feedback: Option<ChainFeedback>, now: u64) {
        let entry = feedback.map(|f| ChainReputation {
            feedback_score:        f.feedback_score,
            feedback_sample_count: f.sample_count,
            last_synced_at:        now,
        });
        self.chain.insert(peer.to_owned(), (entry, now));
    }

    pub fn chain(&self, peer: &str) -> Option<&ChainReputation> {
        self.chain.get(peer).and_then(|(c, _)| c.as_ref())
    }

    /// Peers with a resolved agent id whose chain data is missing or older
    /// than the TTL, oldest first, at most `limit`.
    pub fn stale_peers(&self, now: u64, limit: usize) -> Vec<(String, String)> {
        let ttl = self.config.chain_ttl.as_millis() as u64;
        let mut stale: Vec<(u64, String, String)> = self
            .identities
            .iter()
            .filter_map(|(peer, id)| {
                let agent = id.agent_id.as_ref()?;
                let synced = self.chain.get(peer).map(|(_, at)| *at);
                let is_stale = synced.map_or(true, |at| now.saturating_sub(at) >= ttl);
                is_stale.then(|| (synced.unwrap_or(0), peer.clone(), agent.clone()))
            })
            .collect();
        stale.sort();
        stale.into_iter().take(limit).map(|(_, p, a)| (p, a)).collect()
    }

    // ------------------------------------------------------------------------
    // Blended score
    // ------------------------------------------------------------------------

    /// Local score blended with chain feedback. Each side is weighted by
    /// `ln(1 + samples)`, so a peer with no history on either side is neutral.
    pub fn score(&self, peer: &str) -> f64 {
        let local = self.local.get(peer);
        let local_score = local.map_or(REPUTATION_NEUTRAL, |r| r.local_score);
        let w_local = local.map_or(0.0, |r| (r.total_jobs as f64).ln_1p());

        let Some(chain) = self.chain(peer) else {
            return local_score;
        };
        let w_chain = (chain.feedback_sample_count as f64).ln_1p();
        if w_local + w_chain == 0.0 {
            return local_score;
        }
        (local_score * w_local + chain.normalized() * w_chain) / (w_local + w_chain)
    }

    /// Drop the identity and chain cache of a disconnected peer. Local job
    /// history survives reconnects.
    pub fn end_session(&mut self, peer: &str) {
        self.chain.remove(peer);
        self.identities.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ReputationStore {
        ReputationStore::new(ReputationConfig::default())
    }

    fn identity(agent: &str) -> ResolvedIdentity {
        ResolvedIdentity { agent_id: Some(agent.into()), wallet: None }
    }

    #[test]
    fn new_peers_are_neutral_and_scores_clamp() {
        let mut s = store();
        assert_eq!(s.score("p"), REPUTATION_NEUTRAL);
        for _ in 0..20 {
            s.record_success("p", 1);
        }
        assert_eq!(s.local_score("p"), REPUTATION_MAX);
        for _ in 0..20 {
            s.record_failure("p", 2);
        }
        assert_eq!(s.local_score("p"), REPUTATION_MIN);
        let r = s.local("p").unwrap();
        assert_eq!((r.total_jobs, r.successful_jobs, r.failed_jobs), (40, 20, 20));
        assert_eq!(r.last_interaction_at, 2);
    }

    #[test]
    fn chain_weight_grows_with_samples() {
        let mut s = store();
        s.record_success("p", 0); // local 55, one job
        s.set_chain("p", Some(ChainFeedback { feedback_score: 100.0, sample_count: 1 }), 0);
        // Equal weights: (55 + 100) / 2.
        assert!((s.score("p") - 77.5).abs() < 1e-9);

        s.set_chain("p", Some(ChainFeedback { feedback_score: 100.0, sample_count: 1_000 }), 0);
        assert!(s.score("p") > 90.0);
    }

    #[test]
    fn chain_only_peer_uses_chain_score() {
        let mut s = store();
        s.set_chain("p", Some(ChainFeedback { feedback_score: -100.0, sample_count: 3 }), 0);
        assert_eq!(s.score("p"), 0.0);
        s.set_chain("p", None, 1);
        assert_eq!(s.score("p"), REPUTATION_NEUTRAL);
    }

    #[test]
    fn stale_peers_respect_ttl_and_limit() {
        let mut s = store();
        let ttl = s.config().chain_ttl.as_millis() as u64;
        s.set_identity("a", identity("agent-a"));
        s.set_identity("b", identity("agent-b"));
        s.set_identity("c", ResolvedIdentity::default());

        let now = 1_000;
        let stale = s.stale_peers(now, 10);
        assert_eq!(stale.len(), 2);

        s.set_chain("a", None, now);
        assert_eq!(s.stale_peers(now + 1, 10), vec![("b".to_string(), "agent-b".to_string())]);
        assert_eq!(s.stale_peers(now + ttl, 10).len(), 2);
        assert_eq!(s.stale_peers(now + ttl, 1).len(), 1);
    }

    #[test]
    fn ending_a_session_keeps_only_local_history() {
        let mut s = store();
        s.record_success("p", 0);
        s.set_identity("p", identity("agent-p"));
        s.set_chain("p", Some(ChainFeedback { feedback_score: 100.0, sample_count: 5 }), 0);

        s.end_session("p");
        assert!(s.identity("p").is_none());
        assert!(s.chain("p").is_none());
        assert!(s.stale_peers(u64::MAX, 10).is_empty());
        assert!(s.local("p").is_some());
    }
}
