// ============================================================================
// Protocol constants
// ============================================================================

use crate::version::ProtocolVersion;

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Oldest peer version this build will admit by default.
pub const MIN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Network identifier used when none is configured.
pub const DEFAULT_NETWORK_ID: &str = "agentmesh-mainnet";

/// Where peers running an outdated version are sent.
pub const DEFAULT_UPGRADE_URL: &str = "https://agentmesh.network/upgrade";

// --- Handshake --------------------------------------------------------------

/// How long a handshake may stay pending before the timeout fallback fires.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Delay between sending a rejection notice and tearing down the connection,
/// so the notice reaches the peer first.
pub const REJECT_DISCONNECT_DELAY_MS: u64 = 1_000;

/// Maximum application messages buffered per peer while a handshake is open.
pub const MAX_QUEUED_PER_PEER: usize = 64;

/// Upper bound on byte comparisons performed when two policy hashes differ
/// in length.
pub const MAX_POLICY_HASH_COMPARE: usize = 128;

// --- Transport --------------------------------------------------------------

/// Maximum encoded wire message size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 65_536; // 64 KB

/// libp2p protocol string for bilateral wire messages.
pub const BILATERAL_PROTOCOL: &str = "/agentmesh/bilateral/1.0.0";

/// libp2p identify protocol string.
pub const IDENTIFY_PROTOCOL: &str = "/agentmesh/identify/1.0.0";

// --- Trust filters ----------------------------------------------------------

/// Default Bloom filter size in bits (8 KiB of bit array).
pub const DEFAULT_FILTER_BITS: usize = 65_536;

/// Default number of hash functions per Bloom filter.
pub const DEFAULT_FILTER_HASHES: u32 = 7;

/// Reputation scale bounds shared by local and chain reputation.
pub const REPUTATION_MIN: f64 = 0.0;
pub const REPUTATION_MAX: f64 = 100.0;
pub const REPUTATION_NEUTRAL: f64 = 50.0;

/// Fixed tier thresholds on the reputation scale.
pub const ELITE_THRESHOLD: f64 = 90.0;
pub const GOOD_THRESHOLD: f64 = 75.0;
pub const ACCEPTABLE_THRESHOLD: f64 = 50.0;

// --- Pubsub topics ----------------------------------------------------------

pub const TOPIC_TRUST_FILTERS: &str = "/agentmesh/v1/trust-filters";

/// Application message type carrying a capability advertisement.
pub const MSG_TYPE_CAPABILITY_ADVERTISE: &str = "capability.advertise";
