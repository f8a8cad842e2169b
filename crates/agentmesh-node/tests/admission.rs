//! Two message bridges wired back to back through an in-memory relay.

use std::collections::VecDeque;
use std::time::Duration;

use agentmesh_node::{
    auth::MessageAuth,
    bridge::{BridgeAction, BridgeConfig, BridgeEvent, MessageBridge, SendOutcome},
    identity::NodeIdentity,
};
use agentmesh_protocol::{
    handshake, AppMessage, EnforcementLevel, HandshakeContext, PolicyDocument, ProtocolVersion,
    Rejection, WireMessage,
};

const ALICE: usize = 0;
const BOB: usize = 1;

struct Side {
    peer_id:     String,
    bridge:      MessageBridge,
    received:    Vec<WireMessage>,
    delivered:   Vec<AppMessage>,
    events:      Vec<BridgeEvent>,
    disconnects: Vec<(String, Duration)>,
}

impl Side {
    fn rejections(&self) -> Vec<&Rejection> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Rejected { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    fn got_policy_notice(&self) -> bool {
        self.received.iter().any(|m| matches!(m, WireMessage::PolicyMismatch(_)))
    }
}

struct Relay {
    sides: [Side; 2],
    now:   u64,
}

fn ctx(policy: &[&str]) -> HandshakeContext {
    HandshakeContext {
        version:     ProtocolVersion::new(1, 0, 0),
        min_version: ProtocolVersion::new(1, 0, 0),
        network_id:  "testnet".into(),
        policy_hash: PolicyDocument::new(policy.iter().copied()).hash(),
        upgrade_url: None,
    }
}

fn side(peer_id: &str, enforcement: EnforcementLevel, policy: &[&str], auth: Option<MessageAuth>) -> Side {
    let config = BridgeConfig { enforcement, ..Default::default() };
    Side {
        peer_id:     peer_id.to_owned(),
        bridge:      MessageBridge::new(config, ctx(policy), peer_id, auth),
        received:    Vec::new(),
        delivered:   Vec::new(),
        events:      Vec::new(),
        disconnects: Vec::new(),
    }
}

impl Relay {
    fn new(alice: Side, bob: Side) -> Self {
        Self { sides: [alice, bob], now: 0 }
    }

    fn peer_of(&self, idx: usize) -> String {
        self.sides[1 - idx].peer_id.clone()
    }

    fn connect(&mut self) {
        self.connect_with(Vec::new());
    }

    /// Both sides see the connection come up. `held` are actions alice
    /// produced before that, delivered first.
    fn connect_with(&mut self, held: Vec<BridgeAction>) {
        let (a, b) = (self.peer_of(ALICE), self.peer_of(BOB));
        let now = self.now;
        let first = self.sides[ALICE].bridge.on_connected(&a, now);
        let second = self.sides[BOB].bridge.on_connected(&b, now);
        self.pump(VecDeque::from([(ALICE, held), (ALICE, first), (BOB, second)]));
    }

    /// Hand a message to `from`'s bridge without running the resulting actions.
    fn send_held(&mut self, from: usize, id: &str) -> (SendOutcome, Vec<BridgeAction>) {
        let to = self.peer_of(from);
        let msg = AppMessage::new(
            id,
            self.sides[from].peer_id.clone(),
            to.clone(),
            "chat",
            id.as_bytes().to_vec(),
            self.now,
        );
        let now = self.now;
        self.sides[from].bridge.send_direct(&to, msg, now)
    }

    fn send(&mut self, from: usize, id: &str) -> SendOutcome {
        let (outcome, actions) = self.send_held(from, id);
        self.pump(VecDeque::from([(from, actions)]));
        outcome
    }

    /// Run every action to quiescence. Sends are delivered to the other side
    /// immediately and in order.
    fn pump(&mut self, mut pending: VecDeque<(usize, Vec<BridgeAction>)>) {
        while let Some((idx, actions)) = pending.pop_front() {
            for action in actions {
                match action {
                    BridgeAction::Send { message, .. } => {
                        let to = 1 - idx;
                        let from = self.sides[idx].peer_id.clone();
                        self.sides[to].received.push(message.clone());
                        let now = self.now;
                        let out = self.sides[to].bridge.on_message(&from, message, now);
                        pending.push_back((to, out));
                    }
                    BridgeAction::Disconnect { peer, after } => self.sides[idx].disconnects.push((peer, after)),
                    BridgeAction::Deliver { message, .. } => self.sides[idx].delivered.push(message),
                    BridgeAction::Event(e) => self.sides[idx].events.push(e),
                }
            }
        }
    }
}

fn ids(msgs: &[AppMessage]) -> Vec<&str> {
    msgs.iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn strict_peers_with_equal_policy_validate_and_lose_nothing() {
    let mut relay = Relay::new(
        side("alice", EnforcementLevel::Strict, &["no-spam"], None),
        side("bob", EnforcementLevel::Strict, &["no-spam"], None),
    );

    // Queued before the connection is even up.
    let mut held = Vec::new();
    for id in ["m1", "m2", "m3"] {
        let (outcome, actions) = relay.send_held(ALICE, id);
        assert_eq!(outcome, SendOutcome::Deferred);
        held.extend(actions);
    }
    // Only the first send opens a handshake.
    assert_eq!(held.len(), 1);
    relay.connect_with(held);

    let [alice, bob] = &relay.sides;
    assert!(alice.bridge.is_validated("bob"));
    assert!(bob.bridge.is_validated("alice"));
    assert_eq!(ids(&bob.delivered), ["m1", "m2", "m3"]);
    assert!(alice.rejections().is_empty() && bob.rejections().is_empty());
    assert!(alice.disconnects.is_empty() && bob.disconnects.is_empty());
    assert_eq!(alice.bridge.queued_len("bob"), 0);

    assert_eq!(relay.send(BOB, "reply"), SendOutcome::Sent);
    assert_eq!(ids(&relay.sides[ALICE].delivered), ["reply"]);
}

#[test]
fn policy_mismatch_is_reported_to_both_sides_and_disconnects_after_grace() {
    let mut relay = Relay::new(
        side("alice", EnforcementLevel::Strict, &["H1"], None),
        side("bob", EnforcementLevel::Strict, &["H2"], None),
    );
    relay.connect();

    for (side, other) in [(&relay.sides[ALICE], "bob"), (&relay.sides[BOB], "alice")] {
        assert!(side.got_policy_notice(), "{} got no notice", side.peer_id);
        let rejections = side.rejections();
        assert_eq!(rejections.len(), 1);
        assert!(rejections[0].is_policy_mismatch());
        assert_eq!(side.disconnects, [(other.to_string(), Duration::from_secs(1))]);
        assert!(!side.bridge.is_validated(other));
        assert!(side.bridge.is_rejected(other));
    }

    // Traffic during the grace period is dropped instead of renegotiated.
    assert_eq!(relay.send(ALICE, "late"), SendOutcome::Dropped);
    assert!(relay.sides[BOB].delivered.is_empty());
}

#[test]
fn enforcement_none_validates_without_any_exchange() {
    let mut relay = Relay::new(
        side("alice", EnforcementLevel::None, &["H1"], None),
        side("bob", EnforcementLevel::None, &["H2"], None),
    );
    relay.connect();

    for side in &relay.sides {
        assert!(side.received.is_empty());
        assert!(matches!(side.events.as_slice(), [BridgeEvent::Validated { .. }]));
    }
    assert_eq!(relay.send(ALICE, "hi"), SendOutcome::Sent);
    assert_eq!(ids(&relay.sides[BOB].delivered), ["hi"]);
}

#[test]
fn early_inbound_messages_wait_for_the_handshake_outcome() {
    let alice_ctx = ctx(&["p"]);
    let app = |id: &str| WireMessage::Application(AppMessage::new(id, "alice", "bob", "chat", vec![], 0));

    // Accepted: queue flushes in arrival order.
    let mut bob = side("bob", EnforcementLevel::Strict, &["p"], None).bridge;
    bob.on_connected("alice", 0);
    for id in ["m1", "m2", "m3"] {
        assert!(bob.on_message("alice", app(id), 1).is_empty());
    }
    assert_eq!(bob.queued_len("alice"), 3);
    let resp = handshake::build_response(&alice_ctx, &handshake::build_request(&ctx(&["p"]), 0));
    let delivered: Vec<String> = bob
        .on_message("alice", WireMessage::HandshakeResponse(resp), 2)
        .into_iter()
        .filter_map(|a| match a {
            BridgeAction::Deliver { message, .. } => Some(message.id),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, ["m1", "m2", "m3"]);

    // Rejected: queue is discarded.
    let mut bob = side("bob", EnforcementLevel::Strict, &["other"], None).bridge;
    bob.on_connected("alice", 0);
    for id in ["m1", "m2", "m3"] {
        bob.on_message("alice", app(id), 1);
    }
    let resp = handshake::build_response(&alice_ctx, &handshake::build_request(&ctx(&["other"]), 0));
    let actions = bob.on_message("alice", WireMessage::HandshakeResponse(resp), 2);
    assert!(!actions.iter().any(|a| matches!(a, BridgeAction::Deliver { .. })));
    assert!(actions.iter().any(|a| matches!(a, BridgeAction::Disconnect { .. })));
    assert_eq!(bob.queued_len("alice"), 0);
}

#[test]
fn handshake_timeout_follows_enforcement() {
    let mut strict = side("bob", EnforcementLevel::Strict, &["p"], None).bridge;
    strict.on_connected("alice", 0);
    assert!(strict.sweep_timeouts(9_999).is_empty());
    let actions = strict.sweep_timeouts(10_000);
    assert!(actions.contains(&BridgeAction::Event(BridgeEvent::Rejected {
        peer:   "alice".into(),
        reason: Rejection::Timeout,
    })));

    let mut warn = side("bob", EnforcementLevel::Warn, &["p"], None).bridge;
    warn.on_connected("alice", 0);
    let actions = warn.sweep_timeouts(10_000);
    assert!(matches!(
        actions.as_slice(),
        [BridgeAction::Event(BridgeEvent::AcceptedWithWarning { reason: Rejection::Timeout, .. })]
    ));
    assert!(warn.is_validated("alice"));
}

#[test]
fn signed_messages_are_verified_end_to_end() {
    let alice_id = NodeIdentity::generate();
    let bob_id = NodeIdentity::generate();
    let mut relay = Relay::new(
        side(&alice_id.peer_id, EnforcementLevel::Strict, &["p"], Some(MessageAuth::new(alice_id.signing_key.clone(), 16))),
        side(&bob_id.peer_id, EnforcementLevel::Strict, &["p"], Some(MessageAuth::new(bob_id.signing_key.clone(), 16))),
    );
    relay.connect();
    assert_eq!(relay.send(ALICE, "signed"), SendOutcome::Sent);

    let delivered = &relay.sides[BOB].delivered;
    assert_eq!(ids(delivered), ["signed"]);
    assert!(delivered[0].is_signed());

    // A tampered copy of the same message is dropped.
    let mut forged = delivered[0].clone();
    forged.id = "forged".into();
    forged.payload = b"evil".to_vec();
    let now = relay.now;
    let actions = relay.sides[BOB]
        .bridge
        .on_message(&alice_id.peer_id, WireMessage::Application(forged), now);
    assert!(actions.is_empty());

    // An untouched message signed by alice, relayed by another admitted
    // peer, fails the transport check and is neither delivered nor queued.
    let mallory = NodeIdentity::generate();
    let bob = &mut relay.sides[BOB].bridge;
    bob.on_connected(&mallory.peer_id, now);
    let accept = handshake::build_response(&ctx(&["p"]), &handshake::build_request(&ctx(&["p"]), now));
    bob.on_message(&mallory.peer_id, WireMessage::HandshakeResponse(accept), now);
    assert!(bob.is_validated(&mallory.peer_id));

    let genuine = relay.sides[BOB].delivered[0].clone();
    let actions = relay.sides[BOB]
        .bridge
        .on_message(&mallory.peer_id, WireMessage::Application(genuine.clone()), now);
    assert!(actions.is_empty());
    assert_eq!(relay.sides[BOB].bridge.queued_len(&mallory.peer_id), 0);

    // The same bytes from alice herself still go through.
    let actions = relay.sides[BOB]
        .bridge
        .on_message(&alice_id.peer_id, WireMessage::Application(genuine), now);
    assert!(actions.iter().any(|a| matches!(a, BridgeAction::Deliver { .. })));
}
