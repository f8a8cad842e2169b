//! Outbound dial scheduler.
//!
//! Discovery events feed a bounded FIFO of candidates. A fixed-interval tick
//! drains it under a global not-before timestamp (exponential backoff on
//! failure, reset on success) and a cap on dials in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DialConfig {
    pub tick_interval: Duration,
    pub base_backoff:  Duration,
    pub max_backoff:   Duration,
    pub max_in_flight: usize,
    pub max_queue:     usize,
    /// A dial outstanding longer than this counts as failed.
    pub dial_timeout:  Duration,
    /// Failures after which a candidate is dropped until rediscovered.
    pub max_attempts:  u32,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            base_backoff:  Duration::from_secs(1),
            max_backoff:   Duration::from_secs(60),
            max_in_flight: 8,
            max_queue:     256,
            dial_timeout:  Duration::from_secs(20),
            max_attempts:  5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialCandidate {
    pub peer_id:         String,
    pub known_addresses: Vec<String>,
}

/// Extract the peer id from the `/p2p/<id>` component of a multiaddr.
pub fn peer_id_from_addr(addr: &str) -> Option<&str> {
    let (_, rest) = addr.rsplit_once("/p2p/")?;
    let id = rest.split('/').next()?;
    (!id.is_empty()).then_some(id)
}

pub struct DialScheduler {
    config:      DialConfig,
    queue:       VecDeque<DialCandidate>,
    queued:      HashSet<String>,
    /// peer → (dial start in unix ms, addresses dialed).
    in_flight:   HashMap<String, (u64, Vec<String>)>,
    connected:   HashSet<String>,
    bootstrap:   HashSet<String>,
    attempts:    HashMap<String, u32>,
    /// peer → earliest retry time (unix ms).
    retry_at:    HashMap<String, u64>,
    not_before:  u64,
    backoff_ms:  u64,
}

impl DialScheduler {
    pub fn new<I, S>(config: DialConfig, bootstrap_addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let bootstrap = bootstrap_addrs
            .into_iter()
            .filter_map(|a| peer_id_from_addr(a.as_ref()).map(str::to_owned))
            .collect();
        let backoff_ms = config.base_backoff.as_millis() as u64;
        Self {
            config,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashMap::new(),
            connected: HashSet::new(),
            bootstrap,
            attempts: HashMap::new(),
            retry_at: HashMap::new(),
            not_before: 0,
            backoff_ms,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval
    }

    // ------------------------------------------------------------------------
    // Discovery / connection events
    // ------------------------------------------------------------------------

    /// Enqueue a discovered peer. Returns false when it was not enqueued.
    pub fn on_discovered(&mut self, candidate: DialCandidate) -> bool {
        let peer = &candidate.peer_id;
        if self.bootstrap.contains(peer)
            || self.connected.contains(peer)
            || self.in_flight.contains_key(peer)
        {
            return false;
        }
        if self.queued.contains(peer) {
            // Refresh addresses in place.
            if let Some(c) = self.queue.iter_mut().find(|c| &c.peer_id == peer) {
                for addr in candidate.known_addresses {
                    if !c.known_addresses.contains(&addr) {
                        c.known_addresses.push(addr);
                    }
                }
            }
            return false;
        }
        if self.queue.len() >= self.config.max_queue {
            tracing::debug!(peer = %peer, "Dial queue full, candidate dropped");
            return false;
        }
        // Rediscovery forgives past failures.
        self.attempts.remove(peer);
        self.queued.insert(peer.clone());
        self.queue.push_back(candidate);
        true
    }

    pub fn on_connected(&mut self, peer: &str) {
        self.connected.insert(peer.to_owned());
        self.attempts.remove(peer);
        self.retry_at.remove(peer);
        if self.queued.remove(peer) {
            self.queue.retain(|c| c.peer_id != peer);
        }
        if self.in_flight.remove(peer).is_some() {
            self.backoff_ms = self.config.base_backoff.as_millis() as u64;
            self.not_before = 0;
        }
    }

    pub fn on_disconnected(&mut self, peer: &str) {
        self.connected.remove(peer);
    }

    pub fn on_dial_failed(&mut self, peer: &str, now: u64) {
        let Some((_, addrs)) = self.in_flight.remove(peer) else {
            return;
        };
        self.record_failure(peer, addrs, now);
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Expire stale dials and pick the candidates to dial now.
    pub fn tick(&mut self, now: u64) -> Vec<DialCandidate> {
        self.expire_in_flight(now);
        if now < self.not_before {
            return Vec::new();
        }

        let mut ready = Vec::new();
        while self.in_flight.len() < self.config.max_in_flight {
            let Some(candidate) = self.queue.pop_front() else { break };
            let peer = candidate.peer_id.clone();

            if self.connected.contains(&peer) || self.in_flight.contains_key(&peer) {
                self.queued.remove(&peer);
                continue;
            }
            if self.retry_at.get(&peer).is_some_and(|&t| t > now) {
                self.queue.push_front(candidate);
                break;
            }

            self.queued.remove(&peer);
            self.retry_at.remove(&peer);
            self.in_flight.insert(peer, (now, candidate.known_addresses.clone()));
            ready.push(candidate);
        }
        ready
    }

    fn expire_in_flight(&mut self, now: u64) {
        let timeout = self.config.dial_timeout.as_millis() as u64;
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (started, _))| now.saturating_sub(*started) >= timeout)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in expired {
            tracing::debug!(peer = %peer, "Dial timed out");
            if let Some((_, addrs)) = self.in_flight.remove(&peer) {
                self.record_failure(&peer, addrs, now);
            }
        }
    }

    fn record_failure(&mut self, peer: &str, addrs: Vec<String>, now: u64) {
        let max_backoff = self.config.max_backoff.as_millis() as u64;
        self.not_before = now + self.backoff_ms;
        self.backoff_ms = (self.backoff_ms.saturating_mul(2)).min(max_backoff);

        let attempts = self.attempts.entry(peer.to_owned()).or_insert(0);
        *attempts += 1;
        if *attempts >= self.config.max_attempts {
            tracing::debug!(peer = %peer, "Dial attempts exhausted; waiting for rediscovery");
            self.attempts.remove(peer);
            self.retry_at.remove(peer);
            return;
        }
        // The candidate's retry time is the global not-before it just set.
        self.retry_at.insert(peer.to_owned(), self.not_before);
        if self.queued.insert(peer.to_owned()) {
            self.queue.push_back(DialCandidate {
                peer_id:         peer.to_owned(),
                known_addresses: addrs,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn not_before(&self) -> u64 {
        self.not_before
    }

    pub fn is_bootstrap(&self, peer: &str) -> bool {
        self.bootstrap.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(peer: &str) -> DialCandidate {
        DialCandidate {
            peer_id:         peer.into(),
            known_addresses: vec![format!("/ip4/10.0.0.1/tcp/9000/p2p/{peer}")],
        }
    }

    fn sched(max_in_flight: usize) -> DialScheduler {
        let config = DialConfig {
            max_in_flight,
            base_backoff: Duration::from_millis(100),
            max_backoff:  Duration::from_millis(400),
            dial_timeout: Duration::from_millis(1_000),
            max_attempts: 3,
            ..Default::default()
        };
        DialScheduler::new(config, ["/dns4/boot.example/tcp/9000/p2p/boot"])
    }

    #[test]
    fn addr_suffix_parsing() {
        assert_eq!(peer_id_from_addr("/ip4/1.2.3.4/tcp/1/p2p/12D3Koo"), Some("12D3Koo"));
        assert_eq!(peer_id_from_addr("/p2p/relay/p2p-circuit/p2p/target"), Some("target"));
        assert_eq!(peer_id_from_addr("/ip4/1.2.3.4/tcp/1"), None);
        assert_eq!(peer_id_from_addr("/ip4/1.2.3.4/tcp/1/p2p/"), None);
    }

    #[test]
    fn dedup_and_bootstrap_exclusion() {
        let mut s = sched(4);
        assert!(s.on_discovered(cand("a")));
        assert!(!s.on_discovered(cand("a")));
        assert!(!s.on_discovered(cand("boot")));
        assert_eq!(s.queued(), 1);
    }

    #[test]
    fn never_exceeds_in_flight_limit() {
        let mut s = sched(2);
        for p in ["a", "b", "c", "d"] {
            s.on_discovered(cand(p));
        }
        assert_eq!(s.tick(0).len(), 2);
        assert!(s.tick(10).is_empty());
        assert_eq!(s.in_flight(), 2);

        s.on_connected("a");
        let next = s.tick(20);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].peer_id, "c");
        assert!(s.in_flight() <= 2);
    }

    #[test]
    fn failure_backs_off_and_success_resets() {
        let mut s = sched(4);
        s.on_discovered(cand("a"));
        s.on_discovered(cand("b"));
        assert_eq!(s.tick(0).len(), 2);

        s.on_dial_failed("a", 0);
        assert_eq!(s.not_before(), 100);
        assert!(s.tick(50).is_empty());

        s.on_dial_failed("b", 60);
        // Backoff doubled on the second failure.
        assert_eq!(s.not_before(), 260);
        assert!(s.tick(200).is_empty());

        let retried = s.tick(260);
        assert_eq!(retried.len(), 2);
        s.on_connected("a");
        assert_eq!(s.not_before(), 0);

        // Next failure starts from the base backoff again.
        s.on_dial_failed("b", 300);
        assert_eq!(s.not_before(), 400);
    }

    #[test]
    fn candidate_retry_time_requeues_at_front() {
        let mut s = sched(4);
        s.on_discovered(cand("a"));
        s.on_discovered(cand("c"));
        assert_eq!(s.tick(0).len(), 2);
        s.on_dial_failed("a", 0);
        // A success clears the global gate but not a's own retry time.
        s.on_connected("c");
        assert_eq!(s.not_before(), 0);
        s.on_discovered(cand("b"));

        assert!(s.tick(50).is_empty());
        assert_eq!(s.queued(), 2);
        let ready = s.tick(100);
        assert_eq!(
            ready.iter().map(|c| c.peer_id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
    }

    #[test]
    fn connected_elsewhere_is_never_retried() {
        let mut s = sched(4);
        s.on_discovered(cand("a"));
        s.on_connected("a");
        assert_eq!(s.queued(), 0);
        assert!(s.tick(0).is_empty());
        assert!(!s.on_discovered(cand("a")));

        s.on_disconnected("a");
        assert!(s.on_discovered(cand("a")));
    }

    #[test]
    fn stale_dials_expire_and_attempts_are_capped() {
        let mut s = sched(4);
        s.on_discovered(cand("a"));
        assert_eq!(s.tick(0).len(), 1);

        // Times out at 1000, retry allowed from 1100.
        assert!(s.tick(1_000).is_empty());
        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.tick(1_100).len(), 1);

        s.on_dial_failed("a", 1_200);
        assert_eq!(s.tick(1_400).len(), 1);
        s.on_dial_failed("a", 1_500);
        // Third failure exhausts the attempts.
        assert_eq!(s.queued(), 0);
        assert!(s.tick(10_000).is_empty());

        assert!(s.on_discovered(cand("a")));
    }
}
