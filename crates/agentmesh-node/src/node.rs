use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use agentmesh_protocol::{
    constants::{MSG_TYPE_CAPABILITY_ADVERTISE, TOPIC_TRUST_FILTERS},
    AppMessage, HandshakeContext, TrustTier, WireMessage,
};
use agentmesh_resolver::{ChainFeedback, IdentityResolver, ResolvedIdentity};

use crate::{
    auth::{MessageAuth, DEFAULT_KEY_CACHE_SIZE},
    bridge::{BridgeAction, BridgeConfig, BridgeEvent, MessageBridge, PeerAdmission, SendOutcome},
    dial::{peer_id_from_addr, DialCandidate, DialConfig, DialScheduler},
    gossip::{TrustConfig, TrustFilterStore},
    identity::NodeIdentity,
    latency::{LatencyThresholds, LatencyTracker, LatencyZone, ZoneStats},
    ranking::{self, CapabilityRegistry, PeerMatch, RankedPeer, RankingSignals},
    reputation::{ReputationConfig, ReputationStore},
    transport::{Transport, TransportEvent},
};

/// Capacity of the node command channel.
const COMMAND_BUFFER: usize = 256;

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn new_message_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything `MeshNode` consumes, already parsed.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub handshake:      HandshakeContext,
    pub bridge:         BridgeConfig,
    pub dial:           DialConfig,
    pub trust:          TrustConfig,
    pub latency:        LatencyThresholds,
    pub reputation:     ReputationConfig,
    /// Sign outbound and verify inbound application messages.
    pub sign_messages:  bool,
    /// Bootstrap multiaddrs; their peers are never auto-dialed.
    pub bootstrap:      Vec<String>,
    /// Capabilities this node advertises to admitted peers.
    pub capabilities:   Vec<String>,
    pub sweep_interval: Duration,
}

// ============================================================================
// Commands
// ============================================================================

pub enum NodeCommand {
    Send {
        to:       String,
        msg_type: String,
        payload:  Vec<u8>,
        reply:    oneshot::Sender<SendOutcome>,
    },
    RecordJob { peer: String, success: bool },
    Peers(oneshot::Sender<Vec<PeerAdmission>>),
    Zones(oneshot::Sender<BTreeMap<LatencyZone, ZoneStats>>),
    Rank { capability: String, reply: oneshot::Sender<Vec<RankedPeer>> },
    SubscribeTopic { topic: String, reply: oneshot::Sender<mpsc::Receiver<AppMessage>> },
    SubscribeDirect(oneshot::Sender<mpsc::Receiver<AppMessage>>),

    // Results of background work, applied by peer id.
    Disconnect(String),
    Resolved { peer: String, identity: ResolvedIdentity },
    ChainSynced { peer: String, feedback: Option<ChainFeedback> },
}

/// Cheaply cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    tx:         mpsc::Sender<NodeCommand>,
    local_peer: String,
}

impl NodeHandle {
    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> NodeCommand) -> anyhow::Result<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| anyhow::anyhow!("node loop unavailable"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node loop dropped the request"))
    }

    pub async fn send(
        &self,
        to:       impl Into<String>,
        msg_type: impl Into<String>,
        payload:  Vec<u8>,
    ) -> anyhow::Result<SendOutcome> {
        let (to, msg_type) = (to.into(), msg_type.into());
        self.request(|reply| NodeCommand::Send { to, msg_type, payload, reply }).await
    }

    pub async fn record_job(&self, peer: impl Into<String>, success: bool) -> anyhow::Result<()> {
        self.tx
            .send(NodeCommand::RecordJob { peer: peer.into(), success })
            .await
            .map_err(|_| anyhow::anyhow!("node loop unavailable"))
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<PeerAdmission>> {
        self.request(NodeCommand::Peers).await
    }

    pub async fn zones(&self) -> anyhow::Result<BTreeMap<LatencyZone, ZoneStats>> {
        self.request(NodeCommand::Zones).await
    }

    pub async fn rank(&self, capability: impl Into<String>) -> anyhow::Result<Vec<RankedPeer>> {
        let capability = capability.into();
        self.request(|reply| NodeCommand::Rank { capability, reply }).await
    }

    pub async fn subscribe_topic(
        &self,
        topic: impl Into<String>,
    ) -> anyhow::Result<mpsc::Receiver<AppMessage>> {
        let topic = topic.into();
        self.request(|reply| NodeCommand::SubscribeTopic { topic, reply }).await
    }

    pub async fn subscribe_direct(&self) -> anyhow::Result<mpsc::Receiver<AppMessage>> {
        self.request(NodeCommand::SubscribeDirect).await
    }
}

// ============================================================================
// Ranking signals view
// ============================================================================

struct NodeSignals<'a> {
    trust:      &'a TrustFilterStore,
    reputation: &'a ReputationStore,
    latency:    &'a LatencyTracker,
}

impl RankingSignals for NodeSignals<'_> {
    fn trust_tier(&self, capability: &str, peer: &str) -> Option<TrustTier> {
        self.trust.best_tier(capability, peer)
    }

    fn reputation(&self, peer: &str) -> f64 {
        self.reputation.score(peer)
    }

    fn zone(&self, peer: &str) -> Option<LatencyZone> {
        self.latency.zone(peer)
    }
}

// ============================================================================
// MeshNode
// ============================================================================

/// The node actor. Owns every piece of mutable state; all changes happen
/// inside `run` in response to transport events, timer ticks and commands.
pub struct MeshNode {
    local_peer:       String,
    /// Signs gossiped trust filters.
    filter_signer:    MessageAuth,
    bridge:           MessageBridge,
    dial:             DialScheduler,
    trust:            TrustFilterStore,
    latency:          LatencyTracker,
    reputation:       ReputationStore,
    capabilities:     CapabilityRegistry,
    own_capabilities: Vec<String>,
    bootstrap:        Vec<String>,
    resolver:         Arc<dyn IdentityResolver>,
    /// Peers with a chain fetch in flight.
    syncing:          HashSet<String>,
    sweep_interval:   Duration,

    commands_tx: mpsc::Sender<NodeCommand>,
    commands_rx: mpsc::Receiver<NodeCommand>,
    cancel:      CancellationToken,
}

impl MeshNode {
    pub fn new(
        config:   NodeConfig,
        identity: &NodeIdentity,
        resolver: Arc<dyn IdentityResolver>,
        cancel:   CancellationToken,
    ) -> (Self, NodeHandle) {
        let local_peer = identity.peer_id.clone();
        let message_auth = config
            .sign_messages
            .then(|| MessageAuth::new(identity.signing_key.clone(), DEFAULT_KEY_CACHE_SIZE));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        tracing::info!(
            peer_id     = %local_peer,
            enforcement = %config.bridge.enforcement,
            network     = %config.handshake.network_id,
            policy      = %config.handshake.policy_hash,
            signing     = config.sign_messages,
            "Mesh node configured",
        );

        let node = Self {
            filter_signer:    MessageAuth::new(identity.signing_key.clone(), 1),
            bridge:           MessageBridge::new(
                config.bridge,
                config.handshake,
                local_peer.clone(),
                message_auth,
            ),
            dial:             DialScheduler::new(config.dial, &config.bootstrap),
            trust:            TrustFilterStore::new(config.trust, local_peer.clone()),
            latency:          LatencyTracker::new(config.latency),
            reputation:       ReputationStore::new(config.reputation),
            capabilities:     CapabilityRegistry::default(),
            own_capabilities: config.capabilities,
            bootstrap:        config.bootstrap,
            resolver,
            syncing:          HashSet::new(),
            sweep_interval:   config.sweep_interval,
            commands_tx:      commands_tx.clone(),
            commands_rx,
            cancel,
            local_peer:       local_peer.clone(),
        };
        let handle = NodeHandle { tx: commands_tx, local_peer };
        (node, handle)
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    // ========================================================================
    // Main event loop
    // ========================================================================

    pub async fn run<T: Transport>(mut self, mut transport: T) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();
        let mut dial_timer   = tokio::time::interval(self.dial.tick_interval());
        let mut sweep_timer  = tokio::time::interval(self.sweep_interval);
        let mut gossip_timer = tokio::time::interval(self.trust.gossip_interval());
        let mut resync_timer = tokio::time::interval(self.reputation.config().resync_interval);

        self.dial_bootstrap(&mut transport);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Mesh node shutting down");
                    break;
                }
                event = transport.next_event() => match event {
                    Some(event) => self.handle_event(&mut transport, event, now_ms()),
                    None => {
                        tracing::warn!("Transport closed; stopping node");
                        break;
                    }
                },
                Some(cmd) = self.commands_rx.recv() => {
                    self.handle_command(&mut transport, cmd, now_ms());
                }
                _ = dial_timer.tick() => {
                    self.on_dial_tick(&mut transport, now_ms());
                }
                _ = sweep_timer.tick() => {
                    let actions = self.bridge.sweep_timeouts(now_ms());
                    self.apply_actions(&mut transport, actions);
                }
                _ = gossip_timer.tick() => {
                    self.on_gossip_tick(&mut transport, now_ms());
                }
                _ = resync_timer.tick() => {
                    self.on_resync_tick(now_ms());
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    pub fn handle_event<T: Transport>(&mut self, transport: &mut T, event: TransportEvent, now: u64) {
        match event {
            TransportEvent::Discovered { peer, addrs } => {
                if peer == self.local_peer {
                    return;
                }
                if self.dial.on_discovered(DialCandidate { peer_id: peer.clone(), known_addresses: addrs }) {
                    tracing::debug!(peer = %peer, "Dial candidate queued");
                }
            }
            TransportEvent::Connected(peer) => {
                tracing::debug!(peer = %peer, "Connected");
                self.dial.on_connected(&peer);
                let actions = self.bridge.on_connected(&peer, now);
                self.apply_actions(transport, actions);
                self.spawn_resolve(peer);
            }
            TransportEvent::Disconnected(peer) => {
                tracing::debug!(peer = %peer, "Disconnected");
                self.dial.on_disconnected(&peer);
                self.bridge.on_disconnected(&peer);
                self.capabilities.remove(&peer);
                self.latency.remove(&peer);
                self.reputation.end_session(&peer);
                self.syncing.remove(&peer);
            }
            TransportEvent::Message { peer, data } => {
                let msg = match WireMessage::from_cbor(&data) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(peer = %peer, "Dropping undecodable message: {e}");
                        return;
                    }
                };
                tracing::trace!(peer = %peer, kind = msg.kind(), "Wire message");
                let actions = self.bridge.on_message(&peer, msg, now);
                self.apply_actions(transport, actions);
            }
            TransportEvent::Gossip { source, data } => match WireMessage::from_cbor(&data) {
                Ok(WireMessage::TrustFilter(wire)) => {
                    if let Err(e) = self.trust.receive(wire) {
                        tracing::debug!(source = %source, "Dropping trust filter: {e}");
                    }
                }
                Ok(other) => {
                    tracing::debug!(source = %source, kind = other.kind(), "Non-filter gossip dropped");
                }
                Err(e) => tracing::debug!(source = %source, "Dropping undecodable gossip: {e}"),
            },
            TransportEvent::DialFailed(peer) => {
                tracing::debug!(peer = %peer, "Dial failed");
                self.dial.on_dial_failed(&peer, now);
            }
            TransportEvent::RoundTrip { peer, rtt } => {
                self.latency.record(&peer, rtt);
            }
        }
    }

    fn apply_actions<T: Transport>(&mut self, transport: &mut T, actions: Vec<BridgeAction>) {
        let mut queue: VecDeque<BridgeAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                BridgeAction::Send { peer, message } => match message.to_cbor() {
                    Ok(bytes) => {
                        if let Err(e) = transport.send(&peer, bytes) {
                            tracing::warn!(peer = %peer, "Send of {} failed: {e}", message.kind());
                        }
                    }
                    Err(e) => tracing::warn!(peer = %peer, "Encoding {} failed: {e}", message.kind()),
                },
                BridgeAction::Disconnect { peer, after } => self.schedule_disconnect(peer, after),
                BridgeAction::Deliver { peer, message } => {
                    if message.msg_type == MSG_TYPE_CAPABILITY_ADVERTISE {
                        self.on_capability_advertise(&peer, &message.payload);
                    }
                    self.bridge.dispatch(&message);
                }
                BridgeAction::Event(BridgeEvent::Validated { peer })
                | BridgeAction::Event(BridgeEvent::AcceptedWithWarning { peer, .. }) => {
                    queue.extend(self.advertise_to(&peer, now_ms()));
                }
                BridgeAction::Event(BridgeEvent::Rejected { .. })
                | BridgeAction::Event(BridgeEvent::NoticeReceived { .. }) => {}
            }
        }
    }

    fn schedule_disconnect(&self, peer: String, after: Duration) {
        let tx     = self.commands_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(NodeCommand::Disconnect(peer)).await;
                }
            }
        });
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    fn advertise_to(&mut self, peer: &str, now: u64) -> Vec<BridgeAction> {
        if self.own_capabilities.is_empty() {
            return Vec::new();
        }
        let payload = match serde_json::to_vec(&self.own_capabilities) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Capability advertisement encode failed: {e}");
                return Vec::new();
            }
        };
        let msg = AppMessage::new(
            new_message_id(),
            self.local_peer.clone(),
            peer,
            MSG_TYPE_CAPABILITY_ADVERTISE,
            payload,
            now,
        );
        self.bridge.send_direct(peer, msg, now).1
    }

    fn on_capability_advertise(&mut self, peer: &str, payload: &[u8]) {
        match serde_json::from_slice::<Vec<String>>(payload) {
            Ok(caps) => {
                tracing::debug!(peer = %peer, "Capabilities advertised: {caps:?}");
                self.capabilities.advertise(peer, caps);
            }
            Err(e) => tracing::debug!(peer = %peer, "Malformed capability advertisement: {e}"),
        }
    }

    /// Rank the peers advertising `capability`.
    pub fn rank(&self, capability: &str) -> Vec<RankedPeer> {
        let matches = self
            .capabilities
            .providers(capability)
            .into_iter()
            .map(|peer_id| PeerMatch {
                proximity:   self.latency.zone(&peer_id) == Some(LatencyZone::Local),
                match_score: 1.0,
                peer_id,
            })
            .collect();
        self.rank_matches(capability, matches)
    }

    /// Rank externally produced capability matches.
    pub fn rank_matches(&self, capability: &str, matches: Vec<PeerMatch>) -> Vec<RankedPeer> {
        let signals = NodeSignals {
            trust:      &self.trust,
            reputation: &self.reputation,
            latency:    &self.latency,
        };
        ranking::rank(capability, matches, &signals)
    }

    /// Report a finished job with `peer`.
    pub fn record_job(&mut self, peer: &str, success: bool) -> f64 {
        let now = now_ms();
        let score = if success {
            self.reputation.record_success(peer, now)
        } else {
            self.reputation.record_failure(peer, now)
        };
        tracing::debug!(peer = %peer, success, score, "Job outcome recorded");
        score
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn on_dial_tick<T: Transport>(&mut self, transport: &mut T, now: u64) {
        for candidate in self.dial.tick(now) {
            let peer = candidate.peer_id;
            if transport.is_connected(&peer) {
                self.dial.on_connected(&peer);
                continue;
            }
            match transport.dial(&peer, &candidate.known_addresses) {
                Ok(()) => tracing::debug!(peer = %peer, "Dialing"),
                Err(e) => {
                    tracing::debug!(peer = %peer, "Dial error: {e}");
                    self.dial.on_dial_failed(&peer, now);
                }
            }
        }
    }

    /// Dial every bootstrap address once, then start routing discovery.
    /// Bootstrap peers stay out of the dial queue.
    fn dial_bootstrap<T: Transport>(&mut self, transport: &mut T) {
        for addr in &self.bootstrap {
            let Some(peer) = peer_id_from_addr(addr) else {
                tracing::warn!("Bootstrap address {addr} has no /p2p/ peer id; skipped");
                continue;
            };
            match transport.dial(peer, std::slice::from_ref(addr)) {
                Ok(()) => tracing::info!(peer = %peer, "Dialing bootstrap peer"),
                Err(e) => tracing::warn!(peer = %peer, "Bootstrap dial failed: {e}"),
            }
        }
        if !self.bootstrap.is_empty() {
            transport.start_discovery();
        }
    }

    fn on_gossip_tick<T: Transport>(&mut self, transport: &mut T, now: u64) {
        let providers = self.capabilities.by_capability();
        let reputation = &self.reputation;
        self.trust.rebuild(&providers, |p| reputation.score(p), now);

        for wire in self.trust.broadcast_due(&self.filter_signer, now) {
            let capability = wire.capability.clone();
            match WireMessage::TrustFilter(wire).to_cbor() {
                Ok(bytes) => {
                    if let Err(e) = transport.publish(TOPIC_TRUST_FILTERS, bytes) {
                        tracing::debug!(capability = %capability, "Trust filter publish failed: {e}");
                    }
                }
                Err(e) => tracing::warn!(capability = %capability, "Trust filter encode failed: {e}"),
            }
        }
    }

    fn on_resync_tick(&mut self, now: u64) {
        let batch = self.reputation.config().resync_batch;
        for (peer, agent_id) in self.reputation.stale_peers(now, batch) {
            if !self.syncing.insert(peer.clone()) {
                continue;
            }
            let resolver = Arc::clone(&self.resolver);
            let tx = self.commands_tx.clone();
            tokio::spawn(async move {
                let feedback = match resolver.chain_feedback(&agent_id).await {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(peer = %peer, agent = %agent_id, "Chain feedback fetch failed: {e}");
                        None
                    }
                };
                let _ = tx.send(NodeCommand::ChainSynced { peer, feedback }).await;
            });
        }
    }

    fn spawn_resolve(&self, peer: String) {
        let resolver = Arc::clone(&self.resolver);
        let tx = self.commands_tx.clone();
        tokio::spawn(async move {
            match resolver.resolve(&peer).await {
                Ok(identity) => {
                    let _ = tx.send(NodeCommand::Resolved { peer, identity }).await;
                }
                Err(e) => tracing::debug!(peer = %peer, "Identity unresolved: {e}"),
            }
        });
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub fn handle_command<T: Transport>(&mut self, transport: &mut T, cmd: NodeCommand, now: u64) {
        match cmd {
            NodeCommand::Send { to, msg_type, payload, reply } => {
                let outcome = self.send_app(transport, to, msg_type, payload, now);
                let _ = reply.send(outcome);
            }
            NodeCommand::RecordJob { peer, success } => {
                self.record_job(&peer, success);
            }
            NodeCommand::Peers(reply) => {
                let _ = reply.send(self.bridge.admissions());
            }
            NodeCommand::Zones(reply) => {
                let _ = reply.send(self.latency.zone_stats());
            }
            NodeCommand::Rank { capability, reply } => {
                let _ = reply.send(self.rank(&capability));
            }
            NodeCommand::SubscribeTopic { topic, reply } => {
                let _ = reply.send(self.bridge.subscribe_topic(&topic));
            }
            NodeCommand::SubscribeDirect(reply) => {
                let _ = reply.send(self.bridge.subscribe_direct());
            }
            NodeCommand::Disconnect(peer) => {
                // The peer may have reconnected since the rejection.
                if !self.bridge.is_rejected(&peer) {
                    tracing::debug!(peer = %peer, "Stale disconnect skipped");
                    return;
                }
                tracing::info!(peer = %peer, "Disconnecting rejected peer");
                transport.disconnect(&peer);
            }
            NodeCommand::Resolved { peer, identity } => {
                if !transport.is_connected(&peer) {
                    return;
                }
                if let Some(agent) = &identity.agent_id {
                    tracing::debug!(peer = %peer, agent = %agent, "Identity resolved");
                }
                self.reputation.set_identity(&peer, identity);
            }
            NodeCommand::ChainSynced { peer, feedback } => {
                self.syncing.remove(&peer);
                if self.reputation.identity(&peer).is_some() {
                    self.reputation.set_chain(&peer, feedback, now);
                }
            }
        }
    }

    /// Send to a connected peer directly, otherwise fan out to every admitted
    /// peer with `to` as the topic.
    fn send_app<T: Transport>(
        &mut self,
        transport: &mut T,
        to:        String,
        msg_type:  String,
        payload:   Vec<u8>,
        now:       u64,
    ) -> SendOutcome {
        let msg = AppMessage::new(new_message_id(), self.local_peer.clone(), to.clone(), msg_type, payload, now);

        if transport.is_connected(&to) {
            let (outcome, actions) = self.bridge.send_direct(&to, msg, now);
            self.apply_actions(transport, actions);
            return outcome;
        }

        let targets: Vec<String> = self.bridge.validated_peers().map(str::to_owned).collect();
        if targets.is_empty() {
            return SendOutcome::Dropped;
        }
        for peer in targets {
            let (_, actions) = self.bridge.send_direct(&peer, msg.clone(), now);
            self.apply_actions(transport, actions);
        }
        SendOutcome::Sent
    }

    #[cfg(test)]
    async fn recv_command(&mut self) -> Option<NodeCommand> {
        self.commands_rx.recv().await
    }
}
