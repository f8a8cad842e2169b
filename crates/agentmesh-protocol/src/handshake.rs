//! Pure handshake logic.
//!
//! Nothing in this module touches node state: every function maps its
//! inputs to a wire message or a verdict, so the whole negotiation can be
//! tested without a network.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    error::ProtocolError,
    policy::PolicyHash,
    version::ProtocolVersion,
};

// ============================================================================
// Enforcement
// ============================================================================

/// How strictly handshake failures are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    /// Reject and disconnect on any incompatibility or timeout.
    Strict,
    /// Accept incompatible peers but surface a warning.
    Warn,
    /// Skip the handshake entirely; every peer is admitted.
    None,
}

impl EnforcementLevel {
    pub fn requires_handshake(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for EnforcementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Strict => "strict",
            Self::Warn   => "warn",
            Self::None   => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for EnforcementLevel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn"   => Ok(Self::Warn),
            "none"   => Ok(Self::None),
            other    => Err(ProtocolError::UnknownEnforcement(other.to_owned())),
        }
    }
}

// ============================================================================
// Local context
// ============================================================================

/// Everything the local node contributes to a handshake.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub version:     ProtocolVersion,
    pub min_version: ProtocolVersion,
    pub network_id:  String,
    pub policy_hash: PolicyHash,
    pub upgrade_url: Option<String>,
}

// ============================================================================
// Wire messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: ProtocolVersion,
    pub network_id:       String,
    /// Unix milliseconds at the sender.
    pub timestamp:        u64,
    pub policy_hash:      String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted:             bool,
    pub protocol_version:     ProtocolVersion,
    pub min_protocol_version: ProtocolVersion,
    pub reason:               Option<String>,
    pub upgrade_url:          Option<String>,
    pub policy_mismatch:      Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionIncompatibleNotice {
    pub required_min_version: ProtocolVersion,
    pub your_version:         ProtocolVersion,
    pub upgrade_url:          Option<String>,
    pub message:              String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMismatchNotice {
    pub expected_hash: String,
    pub received_hash: String,
    pub message:       String,
}

// ============================================================================
// Verdicts
// ============================================================================

/// Why a handshake did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    PolicyMismatch {
        expected: String,
        received: String,
    },
    VersionIncompatible {
        peer_version: ProtocolVersion,
        required:     ProtocolVersion,
        upgrade_url:  Option<String>,
    },
    NetworkMismatch {
        expected: String,
        received: String,
    },
    Timeout,
}

impl Rejection {
    pub fn is_policy_mismatch(&self) -> bool {
        matches!(self, Self::PolicyMismatch { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyMismatch { expected, received } => write!(
                f,
                "policy mismatch: expected {}, received {}",
                short(expected),
                short(received),
            ),
            Self::VersionIncompatible { peer_version, required, .. } => write!(
                f,
                "protocol version {peer_version} is below required minimum {required}",
            ),
            Self::NetworkMismatch { expected, received } => {
                write!(f, "network mismatch: expected {expected}, received {received}")
            }
            Self::Timeout => f.write_str("handshake timed out"),
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Result of comparing two policy hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyValidation {
    pub valid:  bool,
    pub reason: Option<Rejection>,
}

/// Compare the local policy hash against one received from a peer.
pub fn validate_policy(local: &PolicyHash, remote: &str) -> PolicyValidation {
    if local.matches(remote) {
        PolicyValidation { valid: true, reason: None }
    } else {
        PolicyValidation {
            valid:  false,
            reason: Some(Rejection::PolicyMismatch {
                expected: local.as_str().to_owned(),
                received: remote.to_owned(),
            }),
        }
    }
}

/// Evaluate a peer's request against the local context.
///
/// All three checks always run. When several fail, the policy mismatch is
/// reported first, then the version, then the network id.
pub fn evaluate_request(ctx: &HandshakeContext, req: &HandshakeRequest) -> Option<Rejection> {
    let version_ok = req.protocol_version.satisfies(&ctx.min_version);
    let policy     = validate_policy(&ctx.policy_hash, &req.policy_hash);
    let network_ok = ctx.network_id == req.network_id;

    if let Some(reason) = policy.reason {
        return Some(reason);
    }
    if !version_ok {
        return Some(Rejection::VersionIncompatible {
            peer_version: req.protocol_version,
            required:     ctx.min_version,
            upgrade_url:  ctx.upgrade_url.clone(),
        });
    }
    if !network_ok {
        return Some(Rejection::NetworkMismatch {
            expected: ctx.network_id.clone(),
            received: req.network_id.clone(),
        });
    }
    None
}

// ============================================================================
// Builders
// ============================================================================

pub fn build_request(ctx: &HandshakeContext, now_ms: u64) -> HandshakeRequest {
    HandshakeRequest {
        protocol_version: ctx.version,
        network_id:       ctx.network_id.clone(),
        timestamp:        now_ms,
        policy_hash:      ctx.policy_hash.as_str().to_owned(),
    }
}

pub fn build_response(ctx: &HandshakeContext, req: &HandshakeRequest) -> HandshakeResponse {
    let rejection = evaluate_request(ctx, req);
    let accepted  = rejection.is_none();
    let (upgrade_url, policy_mismatch) = match &rejection {
        None => (None, None),
        Some(Rejection::PolicyMismatch { .. }) => (None, Some(true)),
        Some(Rejection::VersionIncompatible { upgrade_url, .. }) => {
            (upgrade_url.clone(), Some(false))
        }
        Some(_) => (None, Some(false)),
    };
    HandshakeResponse {
        accepted,
        protocol_version:     ctx.version,
        min_protocol_version: ctx.min_version,
        reason:               rejection.as_ref().map(ToString::to_string),
        upgrade_url,
        policy_mismatch,
    }
}

pub fn build_incompatible_notice(
    ctx:          &HandshakeContext,
    peer_version: ProtocolVersion,
) -> VersionIncompatibleNotice {
    VersionIncompatibleNotice {
        required_min_version: ctx.min_version,
        your_version:         peer_version,
        upgrade_url:          ctx.upgrade_url.clone(),
        message: format!(
            "protocol version {peer_version} is not supported on {}; minimum is {}",
            ctx.network_id, ctx.min_version,
        ),
    }
}

pub fn build_policy_mismatch_notice(
    ctx:           &HandshakeContext,
    received_hash: &str,
) -> PolicyMismatchNotice {
    PolicyMismatchNotice {
        expected_hash: ctx.policy_hash.as_str().to_owned(),
        received_hash: received_hash.to_owned(),
        message: format!(
            "policy hash does not match the {} network policy",
            ctx.network_id,
        ),
    }
}

/// Interpret a response from the peer we sent a request to.
pub fn interpret_response(
    ctx:  &HandshakeContext,
    resp: &HandshakeResponse,
) -> Result<(), Rejection> {
    if resp.accepted {
        return Ok(());
    }
    if resp.policy_mismatch == Some(true) {
        return Err(Rejection::PolicyMismatch {
            expected: String::new(),
            received: ctx.policy_hash.as_str().to_owned(),
        });
    }
    if !ctx.version.satisfies(&resp.min_protocol_version) {
        return Err(Rejection::VersionIncompatible {
            peer_version: ctx.version,
            required:     resp.min_protocol_version,
            upgrade_url:  resp.upgrade_url.clone(),
        });
    }
    Err(Rejection::NetworkMismatch {
        expected: resp.reason.clone().unwrap_or_default(),
        received: ctx.network_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyDocument;
    use proptest::prelude::*;

    fn ctx(version: ProtocolVersion, policy: &[&str]) -> HandshakeContext {
        HandshakeContext {
            version,
            min_version: ProtocolVersion::new(1, 0, 0),
            network_id:  "testnet".into(),
            policy_hash: PolicyDocument::new(policy.iter().copied()).hash(),
            upgrade_url: Some("https://example.org/upgrade".into()),
        }
    }

    #[test]
    fn equal_versions_and_policies_accept() {
        let a = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        let b = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        let resp = build_response(&b, &build_request(&a, 1));
        assert!(resp.accepted);
        assert_eq!(resp.reason, None);
        assert_eq!(resp.policy_mismatch, None);
        assert!(interpret_response(&a, &resp).is_ok());
    }

    #[test]
    fn policy_mismatch_is_flagged() {
        let a = ctx(ProtocolVersion::new(1, 0, 0), &["rule one"]);
        let b = ctx(ProtocolVersion::new(1, 0, 0), &["rule two"]);
        let resp = build_response(&b, &build_request(&a, 1));
        assert!(!resp.accepted);
        assert_eq!(resp.policy_mismatch, Some(true));
        assert!(matches!(
            interpret_response(&a, &resp),
            Err(Rejection::PolicyMismatch { .. })
        ));
    }

    #[test]
    fn old_version_is_rejected_with_upgrade_url() {
        let mut old = ctx(ProtocolVersion::new(0, 9, 0), &["rule"]);
        old.min_version = ProtocolVersion::new(0, 9, 0);
        let new = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        let resp = build_response(&new, &build_request(&old, 1));
        assert!(!resp.accepted);
        assert_eq!(resp.policy_mismatch, Some(false));
        assert_eq!(resp.upgrade_url.as_deref(), Some("https://example.org/upgrade"));
        match interpret_response(&old, &resp) {
            Err(Rejection::VersionIncompatible { required, upgrade_url, .. }) => {
                assert_eq!(required, ProtocolVersion::new(1, 0, 0));
                assert!(upgrade_url.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn policy_takes_precedence_over_version() {
        let mut old = ctx(ProtocolVersion::new(0, 1, 0), &["other"]);
        old.min_version = ProtocolVersion::new(0, 1, 0);
        let new = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        let reason = evaluate_request(&new, &build_request(&old, 1));
        assert!(matches!(reason, Some(Rejection::PolicyMismatch { .. })));
    }

    #[test]
    fn network_mismatch_rejects() {
        let a = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        let mut b = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        b.network_id = "mainnet".into();
        let resp = build_response(&b, &build_request(&a, 1));
        assert!(!resp.accepted);
        assert_eq!(resp.policy_mismatch, Some(false));
        assert!(matches!(
            interpret_response(&a, &resp),
            Err(Rejection::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn notices_carry_both_sides() {
        let c = ctx(ProtocolVersion::new(1, 0, 0), &["rule"]);
        let n = build_policy_mismatch_notice(&c, "abc");
        assert_eq!(n.expected_hash, c.policy_hash.as_str());
        assert_eq!(n.received_hash, "abc");

        let v = build_incompatible_notice(&c, ProtocolVersion::new(0, 5, 0));
        assert_eq!(v.required_min_version, c.min_version);
        assert_eq!(v.your_version, ProtocolVersion::new(0, 5, 0));
    }

    #[test]
    fn enforcement_parses() {
        assert_eq!("STRICT".parse::<EnforcementLevel>().unwrap(), EnforcementLevel::Strict);
        assert_eq!("warn".parse::<EnforcementLevel>().unwrap(), EnforcementLevel::Warn);
        assert!(!"none".parse::<EnforcementLevel>().unwrap().requires_handshake());
        assert!("lenient".parse::<EnforcementLevel>().is_err());
    }

    proptest! {
        #[test]
        fn matching_inputs_always_accept(
            major in 1u16..5, minor in 0u16..20, patch in 0u16..20,
            rules in proptest::collection::vec("[a-z ]{1,16}", 0..6),
        ) {
            let v = ProtocolVersion::new(major, minor, patch);
            let rules: Vec<&str> = rules.iter().map(String::as_str).collect();
            let a = ctx(v, &rules);
            let b = ctx(v, &rules);
            prop_assert!(build_response(&b, &build_request(&a, 0)).accepted);
        }

        #[test]
        fn single_char_difference_is_policy_mismatch(
            hash in "[0-9a-f]{64}",
            idx in 0usize..64,
        ) {
            let local = PolicyHash(hash.clone());
            let mut bytes = hash.into_bytes();
            bytes[idx] = if bytes[idx] == b'0' { b'1' } else { b'0' };
            let remote = String::from_utf8(bytes).unwrap();
            let v = validate_policy(&local, &remote);
            prop_assert!(!v.valid);
            prop_assert!(v.reason.as_ref().is_some_and(Rejection::is_policy_mismatch));
        }
    }
}
