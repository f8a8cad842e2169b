//! Message bridge: per-peer admission state machine.
//!
//! The bridge owns every piece of per-peer handshake state. It never touches
//! the network; each entry point returns the `BridgeAction`s the caller must
//! carry out (sends, delayed disconnects, deliveries, events).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use agentmesh_protocol::{
    constants::{HANDSHAKE_TIMEOUT_MS, MAX_QUEUED_PER_PEER, REJECT_DISCONNECT_DELAY_MS},
    handshake::{
        self, HandshakeRequest, HandshakeResponse, PolicyMismatchNotice,
        VersionIncompatibleNotice,
    },
    AppMessage, EnforcementLevel, HandshakeContext, Rejection, WireMessage,
};

use crate::auth::MessageAuth;

/// Capacity of each subscription channel.
const SUBSCRIPTION_BUFFER: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub enforcement:       EnforcementLevel,
    pub handshake_timeout: Duration,
    /// Grace period between a rejection notice and the disconnect.
    pub reject_delay:      Duration,
    pub max_queued:        usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enforcement:       EnforcementLevel::Strict,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            reject_delay:      Duration::from_millis(REJECT_DISCONNECT_DELAY_MS),
            max_queued:        MAX_QUEUED_PER_PEER,
        }
    }
}

// ============================================================================
// Actions and events
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeAction {
    Send { peer: String, message: WireMessage },
    Disconnect { peer: String, after: Duration },
    /// An authenticated application message ready for subscribers.
    Deliver { peer: String, message: AppMessage },
    Event(BridgeEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Validated { peer: String },
    /// Admitted despite a failed check (warn mode or lenient timeout).
    AcceptedWithWarning { peer: String, reason: Rejection },
    Rejected { peer: String, reason: Rejection },
    /// The peer told us why it rejected us.
    NoticeReceived { peer: String, reason: Rejection },
}

/// Outcome of an outbound `send_direct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held until the handshake with the recipient completes.
    Deferred,
    Dropped,
}

// ============================================================================
// Per-peer state
// ============================================================================

/// Admission of one peer. Validated and pending are mutually exclusive by
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Unknown,
    Pending { initiated_at: u64 },
    Validated,
}

#[derive(Debug)]
struct PeerState {
    admission: Admission,
    /// Inbound messages received before admission, in arrival order.
    queue:     VecDeque<AppMessage>,
    /// Outbound messages waiting for admission, already signed.
    outbox:    VecDeque<AppMessage>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            admission: Admission::Unknown,
            queue:     VecDeque::new(),
            outbox:    VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionStatus {
    Unknown,
    Pending,
    Validated,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerAdmission {
    pub peer_id: String,
    pub status:  AdmissionStatus,
    pub queued:  usize,
}

// ============================================================================
// MessageBridge
// ============================================================================

pub struct MessageBridge {
    config:     BridgeConfig,
    ctx:        HandshakeContext,
    local_peer: String,
    auth:       Option<MessageAuth>,
    peers:      HashMap<String, PeerState>,
    /// Strictly rejected peers waiting for their disconnect. Everything they
    /// send is dropped.
    rejected:   HashSet<String>,
    topics:     HashMap<String, Vec<mpsc::Sender<AppMessage>>>,
    direct:     Vec<mpsc::Sender<AppMessage>>,
}

impl MessageBridge {
    pub fn new(
        config:     BridgeConfig,
        ctx:        HandshakeContext,
        local_peer: impl Into<String>,
        auth:       Option<MessageAuth>,
    ) -> Self {
        Self {
            config,
            ctx,
            local_peer: local_peer.into(),
            auth,
            peers:      HashMap::new(),
            rejected:   HashSet::new(),
            topics:     HashMap::new(),
            direct:     Vec::new(),
        }
    }

    pub fn enforcement(&self) -> EnforcementLevel {
        self.config.enforcement
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    pub fn on_connected(&mut self, peer: &str, now: u64) -> Vec<BridgeAction> {
        self.initiate_handshake(peer, now)
    }

    /// Start a handshake with `peer` unless one is open or finished.
    pub fn initiate_handshake(&mut self, peer: &str, now: u64) -> Vec<BridgeAction> {
        if self.rejected.contains(peer) {
            return Vec::new();
        }
        if !self.config.enforcement.requires_handshake() {
            return self.admit(peer, None);
        }
        let state = self.peers.entry(peer.to_owned()).or_default();
        if state.admission != Admission::Unknown {
            return Vec::new();
        }
        state.admission = Admission::Pending { initiated_at: now };
        tracing::debug!(peer = %peer, "Handshake initiated");
        vec![BridgeAction::Send {
            peer:    peer.to_owned(),
            message: WireMessage::HandshakeRequest(handshake::build_request(&self.ctx, now)),
        }]
    }

    pub fn on_disconnected(&mut self, peer: &str) {
        if let Some(state) = self.peers.remove(peer) {
            if !state.queue.is_empty() || !state.outbox.is_empty() {
                tracing::debug!(
                    peer = %peer,
                    "Disconnected with {} queued / {} outbound messages; discarded",
                    state.queue.len(),
                    state.outbox.len(),
                );
            }
        }
        self.rejected.remove(peer);
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub fn on_message(&mut self, peer: &str, msg: WireMessage, now: u64) -> Vec<BridgeAction> {
        match msg {
            WireMessage::HandshakeRequest(req)    => self.on_request(peer, req),
            WireMessage::HandshakeResponse(resp)  => self.on_response(peer, resp),
            WireMessage::VersionIncompatible(n)   => self.on_incompatible_notice(peer, n),
            WireMessage::PolicyMismatch(n)        => self.on_policy_notice(peer, n),
            WireMessage::Application(app)         => self.on_application(peer, app, now),
            // Filters only count when they arrive over gossip.
            WireMessage::TrustFilter(_) => {
                tracing::debug!(peer = %peer, "Trust filter on bilateral channel ignored");
                Vec::new()
            }
        }
    }

    fn on_request(&mut self, peer: &str, req: HandshakeRequest) -> Vec<BridgeAction> {
        if self.rejected.contains(peer) {
            return Vec::new();
        }
        if !self.config.enforcement.requires_handshake() {
            return self.admit(peer, None);
        }

        let mut actions = vec![BridgeAction::Send {
            peer:    peer.to_owned(),
            message: WireMessage::HandshakeResponse(handshake::build_response(&self.ctx, &req)),
        }];

        let Some(reason) = handshake::evaluate_request(&self.ctx, &req) else {
            actions.extend(self.admit(peer, None));
            return actions;
        };

        match self.config.enforcement {
            EnforcementLevel::Strict => {
                let notice = match &reason {
                    Rejection::PolicyMismatch { .. } => Some(WireMessage::PolicyMismatch(
                        handshake::build_policy_mismatch_notice(&self.ctx, &req.policy_hash),
                    )),
                    Rejection::VersionIncompatible { .. } => Some(WireMessage::VersionIncompatible(
                        handshake::build_incompatible_notice(&self.ctx, req.protocol_version),
                    )),
                    _ => None,
                };
                if let Some(message) = notice {
                    actions.push(BridgeAction::Send { peer: peer.to_owned(), message });
                }
                actions.extend(self.reject(peer, reason));
            }
            EnforcementLevel::Warn | EnforcementLevel::None => {
                actions.extend(self.admit(peer, Some(reason)));
            }
        }
        actions
    }

    fn on_response(&mut self, peer: &str, resp: HandshakeResponse) -> Vec<BridgeAction> {
        let pending = self
            .peers
            .get(peer)
            .is_some_and(|s| matches!(s.admission, Admission::Pending { .. }));
        if !pending || self.rejected.contains(peer) {
            tracing::trace!(peer = %peer, "Handshake response without pending handshake ignored");
            return Vec::new();
        }

        match handshake::interpret_response(&self.ctx, &resp) {
            Ok(()) => self.admit(peer, None),
            Err(reason) => match self.config.enforcement {
                EnforcementLevel::Strict => self.reject(peer, reason),
                _ => self.admit(peer, Some(reason)),
            },
        }
    }

    fn on_incompatible_notice(
        &mut self,
        peer:   &str,
        notice: VersionIncompatibleNotice,
    ) -> Vec<BridgeAction> {
        tracing::warn!(
            peer = %peer,
            required = %notice.required_min_version,
            upgrade_url = notice.upgrade_url.as_deref().unwrap_or("-"),
            "Peer requires a newer protocol version: {}",
            notice.message,
        );
        vec![BridgeAction::Event(BridgeEvent::NoticeReceived {
            peer:   peer.to_owned(),
            reason: Rejection::VersionIncompatible {
                peer_version: notice.your_version,
                required:     notice.required_min_version,
                upgrade_url:  notice.upgrade_url,
            },
        })]
    }

    fn on_policy_notice(&mut self, peer: &str, notice: PolicyMismatchNotice) -> Vec<BridgeAction> {
        tracing::warn!(peer = %peer, "Peer reports policy mismatch: {}", notice.message);
        vec![BridgeAction::Event(BridgeEvent::NoticeReceived {
            peer:   peer.to_owned(),
            reason: Rejection::PolicyMismatch {
                expected: notice.expected_hash,
                received: notice.received_hash,
            },
        })]
    }

    fn on_application(&mut self, peer: &str, msg: AppMessage, now: u64) -> Vec<BridgeAction> {
        if self.rejected.contains(peer) {
            tracing::debug!(peer = %peer, id = %msg.id, "Message from rejected peer dropped");
            return Vec::new();
        }
        if !self.config.enforcement.requires_handshake() {
            let mut actions = self.admit(peer, None);
            actions.extend(self.authenticate(peer, msg));
            return actions;
        }

        let max_queued = self.config.max_queued;
        let state = self.peers.entry(peer.to_owned()).or_default();
        let admission = state.admission;
        match admission {
            Admission::Validated => self.authenticate(peer, msg).into_iter().collect(),
            Admission::Pending { .. } => {
                enqueue(&mut state.queue, msg, max_queued, peer);
                Vec::new()
            }
            Admission::Unknown => {
                enqueue(&mut state.queue, msg, max_queued, peer);
                self.initiate_handshake(peer, now)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    /// Resolve every handshake pending longer than the configured timeout.
    pub fn sweep_timeouts(&mut self, now: u64) -> Vec<BridgeAction> {
        let timeout = self.config.handshake_timeout.as_millis() as u64;
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter_map(|(peer, s)| match s.admission {
                Admission::Pending { initiated_at }
                    if now.saturating_sub(initiated_at) >= timeout => Some(peer.clone()),
                _ => None,
            })
            .collect();

        let mut actions = Vec::new();
        for peer in expired {
            if self.config.enforcement == EnforcementLevel::Strict {
                actions.extend(self.reject(&peer, Rejection::Timeout));
            } else {
                actions.extend(self.admit(&peer, Some(Rejection::Timeout)));
            }
        }
        actions
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Send an application message to `peer`, signing it when authentication
    /// is enabled. Messages to peers not yet admitted wait for the handshake.
    pub fn send_direct(
        &mut self,
        peer: &str,
        mut msg: AppMessage,
        now: u64,
    ) -> (SendOutcome, Vec<BridgeAction>) {
        if self.rejected.contains(peer) {
            return (SendOutcome::Dropped, Vec::new());
        }
        if let Some(auth) = &self.auth {
            auth.sign(&mut msg);
        }

        let requires = self.config.enforcement.requires_handshake();
        let admission = self.peers.get(peer).map(|s| s.admission);
        if !requires || admission == Some(Admission::Validated) {
            let send = BridgeAction::Send {
                peer:    peer.to_owned(),
                message: WireMessage::Application(msg),
            };
            return (SendOutcome::Sent, vec![send]);
        }

        let max_queued = self.config.max_queued;
        let state = self.peers.entry(peer.to_owned()).or_default();
        if state.outbox.len() >= max_queued {
            tracing::warn!(peer = %peer, id = %msg.id, "Outbound queue full, message dropped");
            return (SendOutcome::Dropped, Vec::new());
        }
        state.outbox.push_back(msg);
        (SendOutcome::Deferred, self.initiate_handshake(peer, now))
    }

    // ------------------------------------------------------------------------
    // Admission transitions
    // ------------------------------------------------------------------------

    fn admit(&mut self, peer: &str, warning: Option<Rejection>) -> Vec<BridgeAction> {
        let state = self.peers.entry(peer.to_owned()).or_default();
        let newly_validated = state.admission != Admission::Validated;
        state.admission = Admission::Validated;
        let outbox = std::mem::take(&mut state.outbox);
        let queued = std::mem::take(&mut state.queue);

        let mut actions = Vec::with_capacity(outbox.len() + queued.len() + 1);
        if newly_validated {
            match warning {
                Some(reason) => {
                    tracing::warn!(peer = %peer, "Peer admitted with warning: {reason}");
                    actions.push(BridgeAction::Event(BridgeEvent::AcceptedWithWarning {
                        peer: peer.to_owned(),
                        reason,
                    }));
                }
                None => {
                    tracing::info!(peer = %peer, "Peer validated");
                    actions.push(BridgeAction::Event(BridgeEvent::Validated {
                        peer: peer.to_owned(),
                    }));
                }
            }
        }
        actions.extend(outbox.into_iter().map(|m| BridgeAction::Send {
            peer:    peer.to_owned(),
            message: WireMessage::Application(m),
        }));
        for msg in queued {
            actions.extend(self.authenticate(peer, msg));
        }
        actions
    }

    fn reject(&mut self, peer: &str, reason: Rejection) -> Vec<BridgeAction> {
        if let Some(state) = self.peers.remove(peer) {
            if !state.queue.is_empty() {
                tracing::debug!(peer = %peer, "Discarding {} queued messages", state.queue.len());
            }
        }
        self.rejected.insert(peer.to_owned());
        tracing::warn!(peer = %peer, "Peer rejected: {reason}");
        vec![
            BridgeAction::Event(BridgeEvent::Rejected { peer: peer.to_owned(), reason }),
            BridgeAction::Disconnect { peer: peer.to_owned(), after: self.config.reject_delay },
        ]
    }

    fn authenticate(&mut self, peer: &str, msg: AppMessage) -> Option<BridgeAction> {
        if let Some(auth) = self.auth.as_mut() {
            if let Err(e) = auth.verify(&msg, peer) {
                tracing::debug!(peer = %peer, id = %msg.id, "Dropping unauthenticated message: {e}");
                return None;
            }
        }
        Some(BridgeAction::Deliver { peer: peer.to_owned(), message: msg })
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Receive delivered messages addressed to `topic`.
    pub fn subscribe_topic(&mut self, topic: &str) -> mpsc::Receiver<AppMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics.entry(topic.to_owned()).or_default().push(tx);
        rx
    }

    /// Receive delivered messages addressed to this node's peer id.
    pub fn subscribe_direct(&mut self) -> mpsc::Receiver<AppMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.direct.push(tx);
        rx
    }

    /// Hand a delivered message to its subscribers. Returns how many
    /// subscribers received it; closed subscriptions are pruned.
    pub fn dispatch(&mut self, msg: &AppMessage) -> usize {
        let subscribers = if msg.to == self.local_peer {
            &mut self.direct
        } else {
            match self.topics.get_mut(&msg.to) {
                Some(subs) => subs,
                None => return 0,
            }
        };

        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(msg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(to = %msg.to, id = %msg.id, "Subscriber lagging, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn is_validated(&self, peer: &str) -> bool {
        self.peers.get(peer).is_some_and(|s| s.admission == Admission::Validated)
    }

    pub fn is_pending(&self, peer: &str) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|s| matches!(s.admission, Admission::Pending { .. }))
    }

    pub fn is_rejected(&self, peer: &str) -> bool {
        self.rejected.contains(peer)
    }

    pub fn queued_len(&self, peer: &str) -> usize {
        self.peers.get(peer).map_or(0, |s| s.queue.len())
    }

    pub fn validated_peers(&self) -> impl Iterator<Item = &str> {
        self.peers
            .iter()
            .filter(|(_, s)| s.admission == Admission::Validated)
            .map(|(p, _)| p.as_str())
    }

    pub fn admissions(&self) -> Vec<PeerAdmission> {
        let mut out: Vec<PeerAdmission> = self
            .peers
            .iter()
            .map(|(peer, s)| PeerAdmission {
                peer_id: peer.clone(),
                status:  match s.admission {
                    Admission::Unknown        => AdmissionStatus::Unknown,
                    Admission::Pending { .. } => AdmissionStatus::Pending,
                    Admission::Validated      => AdmissionStatus::Validated,
                },
                queued:  s.queue.len(),
            })
            .collect();
        out.extend(self.rejected.iter().map(|peer| PeerAdmission {
            peer_id: peer.clone(),
            status:  AdmissionStatus::Rejected,
            queued:  0,
        }));
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }
}

/// Append to a bounded queue, deduplicating by message id. On overflow the
/// incoming message is the one dropped.
fn enqueue(queue: &mut VecDeque<AppMessage>, msg: AppMessage, max: usize, peer: &str) {
    if queue.iter().any(|m| m.id == msg.id) {
        tracing::trace!(peer = %peer, id = %msg.id, "Duplicate queued message ignored");
        return;
    }
    if queue.len() >= max {
        tracing::warn!(peer = %peer, id = %msg.id, "Handshake queue full, message dropped");
        return;
    }
    queue.push_back(msg);
}
