use clap::Parser;
use libp2p::Multiaddr;
use std::{path::PathBuf, time::Duration};

use agentmesh_protocol::{
    constants::{
        DEFAULT_FILTER_BITS, DEFAULT_FILTER_HASHES, DEFAULT_NETWORK_ID, MIN_PROTOCOL_VERSION,
        PROTOCOL_VERSION,
    },
    EnforcementLevel, HandshakeContext, PolicyDocument, ProtocolVersion,
};

use crate::{
    bridge::BridgeConfig,
    dial::DialConfig,
    gossip::TrustConfig,
    latency::LatencyThresholds,
    node::NodeConfig,
    reputation::ReputationConfig,
};

#[derive(Parser, Debug)]
#[command(name = "agentmesh-node", about = "agentmesh trust-and-admission node")]
pub struct Config {
    /// libp2p listen multiaddr.
    #[arg(long, env = "AGENTMESH_LISTEN_ADDR", default_value = "/ip4/0.0.0.0/tcp/9100")]
    pub listen_addr: Multiaddr,

    /// Bootstrap peer multiaddrs (can repeat). Must end in /p2p/<peer id>.
    #[arg(long, env = "AGENTMESH_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<Multiaddr>,

    /// Network identifier exchanged in the handshake.
    #[arg(long, env = "AGENTMESH_NETWORK_ID", default_value = DEFAULT_NETWORK_ID)]
    pub network_id: String,

    /// Handshake enforcement: strict, warn or none.
    #[arg(long, env = "AGENTMESH_ENFORCEMENT", default_value = "strict")]
    pub enforcement: EnforcementLevel,

    /// Oldest peer protocol version accepted.
    #[arg(long, env = "AGENTMESH_MIN_VERSION", default_value_t = MIN_PROTOCOL_VERSION)]
    pub min_version: ProtocolVersion,

    /// Network policy file, one rule per line. An empty policy when absent.
    #[arg(long, env = "AGENTMESH_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Upgrade URL sent to peers running a too-old version.
    #[arg(long, env = "AGENTMESH_UPGRADE_URL")]
    pub upgrade_url: Option<String>,

    #[arg(
        long,
        env = "AGENTMESH_HANDSHAKE_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub handshake_timeout_ms: u64,

    /// Grace period between a rejection notice and the disconnect.
    #[arg(long, env = "AGENTMESH_REJECT_DELAY_MS", default_value_t = 1_000)]
    pub reject_delay_ms: u64,

    /// Messages held per peer while its handshake is open.
    #[arg(long, env = "AGENTMESH_MAX_QUEUED", default_value_t = 64)]
    pub max_queued: usize,

    /// Sign outbound application messages and require valid signatures inbound.
    #[arg(long, env = "AGENTMESH_SIGN_MESSAGES", default_value_t = false)]
    pub sign_messages: bool,

    // Dial scheduler

    #[arg(
        long,
        env = "AGENTMESH_DIAL_TICK_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub dial_tick_ms: u64,

    #[arg(long, env = "AGENTMESH_DIAL_BASE_BACKOFF_MS", default_value_t = 1_000)]
    pub dial_base_backoff_ms: u64,

    #[arg(long, env = "AGENTMESH_DIAL_MAX_BACKOFF_MS", default_value_t = 60_000)]
    pub dial_max_backoff_ms: u64,

    /// Concurrent outbound dials.
    #[arg(long, env = "AGENTMESH_MAX_IN_FLIGHT", default_value_t = 8)]
    pub max_in_flight: usize,

    #[arg(long, env = "AGENTMESH_DIAL_TIMEOUT_MS", default_value_t = 20_000)]
    pub dial_timeout_ms: u64,

    /// Failures before a candidate is dropped until rediscovered.
    #[arg(long, env = "AGENTMESH_DIAL_MAX_ATTEMPTS", default_value_t = 5)]
    pub dial_max_attempts: u32,

    // Trust filters

    #[arg(long, env = "AGENTMESH_FILTER_BITS", default_value_t = DEFAULT_FILTER_BITS)]
    pub filter_bits: usize,

    #[arg(long, env = "AGENTMESH_FILTER_HASHES", default_value_t = DEFAULT_FILTER_HASHES)]
    pub filter_hashes: u32,

    #[arg(
        long,
        env = "AGENTMESH_GOSSIP_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub gossip_interval_secs: u64,

    // Latency zones (RTT upper bounds)

    #[arg(long, env = "AGENTMESH_ZONE_LOCAL_MS", default_value_t = 20)]
    pub zone_local_ms: u64,

    #[arg(long, env = "AGENTMESH_ZONE_REGIONAL_MS", default_value_t = 80)]
    pub zone_regional_ms: u64,

    #[arg(long, env = "AGENTMESH_ZONE_CONTINENTAL_MS", default_value_t = 200)]
    pub zone_continental_ms: u64,

    // Reputation

    /// Reputation aggregator URL. Chain reputation is disabled when absent.
    #[arg(long, env = "AGENTMESH_AGGREGATOR_URL")]
    pub aggregator_url: Option<String>,

    /// Solana RPC endpoint used to confirm SATI registration of agent ids.
    #[arg(long, env = "AGENTMESH_RPC_URL")]
    pub rpc_url: Option<String>,

    #[arg(long, env = "AGENTMESH_CHAIN_TTL_SECS", default_value_t = 600)]
    pub chain_ttl_secs: u64,

    // Node

    /// Introspection API listen address, e.g. 127.0.0.1:8180. Disabled when absent.
    #[arg(long, env = "AGENTMESH_API_ADDR")]
    pub api_addr: Option<String>,

    /// Path to the 32-byte Ed25519 secret key file.
    #[arg(long, env = "AGENTMESH_KEYPAIR_PATH", default_value = "agentmesh-identity.key")]
    pub keypair_path: PathBuf,

    /// Capabilities advertised to admitted peers (comma separated).
    #[arg(long, env = "AGENTMESH_CAPABILITIES", value_delimiter = ',')]
    pub capabilities: Vec<String>,
}

impl Config {
    pub fn bootstrap_strings(&self) -> Vec<String> {
        self.bootstrap.iter().map(ToString::to_string).collect()
    }

    /// Local handshake context. Reads the policy file if one is configured.
    pub fn handshake_context(&self) -> anyhow::Result<HandshakeContext> {
        let policy = match &self.policy_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("failed to read policy file {}: {e}", path.display())
                })?;
                PolicyDocument::from_text(&text)
            }
            None => PolicyDocument::default(),
        };
        if self.min_version > PROTOCOL_VERSION {
            anyhow::bail!(
                "min version {} is newer than this node's protocol version {}",
                self.min_version,
                PROTOCOL_VERSION,
            );
        }
        Ok(HandshakeContext {
            version:     PROTOCOL_VERSION,
            min_version: self.min_version,
            network_id:  self.network_id.clone(),
            policy_hash: policy.hash(),
            upgrade_url: self.upgrade_url.clone(),
        })
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            enforcement:       self.enforcement,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            reject_delay:      Duration::from_millis(self.reject_delay_ms),
            max_queued:        self.max_queued,
        }
    }

    pub fn dial_config(&self) -> DialConfig {
        DialConfig {
            tick_interval: Duration::from_millis(self.dial_tick_ms),
            base_backoff:  Duration::from_millis(self.dial_base_backoff_ms),
            max_backoff:   Duration::from_millis(self.dial_max_backoff_ms),
            max_in_flight: self.max_in_flight,
            dial_timeout:  Duration::from_millis(self.dial_timeout_ms),
            max_attempts:  self.dial_max_attempts,
            ..DialConfig::default()
        }
    }

    pub fn trust_config(&self) -> TrustConfig {
        TrustConfig {
            filter_bits:     self.filter_bits,
            hash_count:      self.filter_hashes,
            gossip_interval: Duration::from_secs(self.gossip_interval_secs),
        }
    }

    pub fn latency_thresholds(&self) -> LatencyThresholds {
        LatencyThresholds {
            local:       Duration::from_millis(self.zone_local_ms),
            regional:    Duration::from_millis(self.zone_regional_ms),
            continental: Duration::from_millis(self.zone_continental_ms),
        }
    }

    pub fn reputation_config(&self) -> ReputationConfig {
        ReputationConfig {
            chain_ttl: Duration::from_secs(self.chain_ttl_secs),
            ..ReputationConfig::default()
        }
    }

    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let bridge = self.bridge_config();
        Ok(NodeConfig {
            handshake:      self.handshake_context()?,
            // Sweep often enough that a timeout is noticed within a tenth of it.
            sweep_interval: (bridge.handshake_timeout / 10).max(Duration::from_millis(100)),
            bridge,
            dial:           self.dial_config(),
            trust:          self.trust_config(),
            latency:        self.latency_thresholds(),
            reputation:     self.reputation_config(),
            sign_messages:  self.sign_messages,
            bootstrap:      self.bootstrap_strings(),
            capabilities:   self.capabilities.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_component_defaults() {
        let cfg = Config::parse_from(["agentmesh-node"]);
        assert_eq!(cfg.enforcement, EnforcementLevel::Strict);
        assert_eq!(cfg.network_id, DEFAULT_NETWORK_ID);

        let bridge = cfg.bridge_config();
        let default = BridgeConfig::default();
        assert_eq!(bridge.handshake_timeout, default.handshake_timeout);
        assert_eq!(bridge.reject_delay, default.reject_delay);
        assert_eq!(bridge.max_queued, default.max_queued);

        let dial = cfg.dial_config();
        assert_eq!(dial.max_in_flight, DialConfig::default().max_in_flight);
        assert_eq!(cfg.latency_thresholds(), LatencyThresholds::default());
    }

    #[test]
    fn flags_parse_into_typed_values() {
        let cfg = Config::parse_from([
            "agentmesh-node",
            "--enforcement", "warn",
            "--min-version", "1.0.0",
            "--capabilities", "translate,summarize",
            "--bootstrap", "/ip4/10.0.0.1/tcp/9100/p2p/12D3KooWLudabD69eAYzfoZMVRqJb8XHBLDKsQvRn6Q9hTQqvMuY",
        ]);
        assert_eq!(cfg.enforcement, EnforcementLevel::Warn);
        assert_eq!(cfg.capabilities, ["translate", "summarize"]);
        assert!(cfg.bootstrap_strings()[0].ends_with("/p2p/12D3KooWLudabD69eAYzfoZMVRqJb8XHBLDKsQvRn6Q9hTQqvMuY"));
        assert!(Config::try_parse_from(["agentmesh-node", "--enforcement", "lax"]).is_err());
    }

    #[test]
    fn zero_intervals_are_refused() {
        for flag in ["--dial-tick-ms", "--gossip-interval-secs", "--handshake-timeout-ms"] {
            assert!(Config::try_parse_from(["agentmesh-node", flag, "0"]).is_err(), "{flag} accepted 0");
            assert!(Config::try_parse_from(["agentmesh-node", flag, "1"]).is_ok());
        }
    }

    #[test]
    fn policy_file_drives_policy_hash() {
        let path = std::env::temp_dir().join(format!("agentmesh-policy-{}.txt", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# comment\nno-spam\n\nrate-limit 10/s").unwrap();

        let cfg = Config::parse_from(["agentmesh-node", "--policy-file", path.to_str().unwrap()]);
        let ctx = cfg.handshake_context().unwrap();
        assert_eq!(ctx.policy_hash, PolicyDocument::new(["no-spam", "rate-limit 10/s"]).hash());
        std::fs::remove_file(&path).ok();

        let missing = Config::parse_from(["agentmesh-node", "--policy-file", "/nonexistent/policy"]);
        assert!(missing.handshake_context().is_err());
    }
}
