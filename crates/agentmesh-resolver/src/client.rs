use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;

use crate::error::ResolverError;

/// Token-2022 program ID (same on mainnet + devnet).
const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

/// Per-request timeout for aggregator and RPC calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Resolver interface
// ============================================================================

/// On-chain identity linked to a peer, as far as it could be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResolvedIdentity {
    /// Agent mint address, hex encoded.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub wallet:   Option<String>,
}

/// Aggregated chain-side feedback for one agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainFeedback {
    /// Average feedback score on the protocol scale, -100..=100.
    pub feedback_score: f64,
    pub sample_count:   u64,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Look up the agent id and wallet linked to a peer.
    async fn resolve(&self, peer_id: &str) -> Result<ResolvedIdentity, ResolverError>;

    /// Fetch chain feedback for an agent. `Ok(None)` when the agent has none.
    async fn chain_feedback(&self, agent_id: &str) -> Result<Option<ChainFeedback>, ResolverError>;
}

/// Resolver used when no aggregator is configured: nothing ever resolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

#[async_trait]
impl IdentityResolver for NoopResolver {
    async fn resolve(&self, _peer_id: &str) -> Result<ResolvedIdentity, ResolverError> {
        Ok(ResolvedIdentity::default())
    }

    async fn chain_feedback(&self, _agent_id: &str) -> Result<Option<ChainFeedback>, ResolverError> {
        Ok(None)
    }
}

// ============================================================================
// SATI registry
// ============================================================================

/// Checks that an agent id is a live SATI registration.
///
/// A SATI agent is a Token-2022 NFT mint, so we check that the mint account
/// exists and is owned by the Token-2022 program.
pub struct SatiRegistry {
    rpc:     RpcClient,
    token22: Pubkey,
}

impl SatiRegistry {
    pub fn new(rpc_url: &str) -> Self {
        Self {
            rpc:     RpcClient::new_with_timeout(rpc_url.to_owned(), REQUEST_TIMEOUT),
            token22: Pubkey::from_str(TOKEN_2022_PROGRAM_ID).expect("valid Token-2022 ID"),
        }
    }

    /// Returns:
    ///   `Ok(true)`  registered (mint exists under Token-2022)
    ///   `Ok(false)` not registered (account absent or wrong owner)
    ///   `Err(_)`    RPC failure; the caller treats this as unknown
    pub async fn is_registered(&self, agent_mint: &[u8; 32]) -> Result<bool, ResolverError> {
        let mint_pubkey = Pubkey::new_from_array(*agent_mint);
        match self.rpc.get_account(&mint_pubkey).await {
            Ok(account) => Ok(account.owner == self.token22),
            Err(e) => Err(ResolverError::Rpc(e.to_string())),
        }
    }
}

// ============================================================================
// Aggregator-backed resolver
// ============================================================================

/// Resolves identities and chain feedback through the reputation aggregator
/// HTTP API, optionally confirming agent ids against the SATI registry.
///
/// Routes used:
///   GET /identity/:peer_id    → `{ "agent_id": .., "wallet": .. }`
///   GET /reputation/:agent_id → `{ "feedback_count": .., "average_score": .. }`
pub struct AggregatorResolver {
    http:     reqwest::Client,
    base_url: String,
    sati:     Option<SatiRegistry>,
}

impl AggregatorResolver {
    pub fn new(base_url: &str, sati: Option<SatiRegistry>) -> Result<Self, ResolverError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ResolverError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            sati,
        })
    }

    async fn get_json(&self, path: &str) -> Result<Option<serde_json::Value>, ResolverError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolverError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ResolverError::Http(format!("{url}: status {}", resp.status())));
        }
        let body = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ResolverError::Decode(e.to_string()))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl IdentityResolver for AggregatorResolver {
    async fn resolve(&self, peer_id: &str) -> Result<ResolvedIdentity, ResolverError> {
        let mut identity = match self.get_json(&format!("/identity/{peer_id}")).await? {
            Some(body) => parse_identity(body)?,
            None => return Ok(ResolvedIdentity::default()),
        };

        // An agent id the registry positively denies is discarded. RPC
        // failures keep it: infrastructure trouble must not erase identities.
        if let (Some(sati), Some(agent_id)) = (&self.sati, identity.agent_id.clone()) {
            let mint = agent_id_bytes(&agent_id)?;
            match sati.is_registered(&mint).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(peer = %peer_id, agent = %agent_id, "agent id not registered in SATI");
                    identity.agent_id = None;
                }
                Err(e) => tracing::debug!(peer = %peer_id, "SATI check failed: {e}"),
            }
        }
        Ok(identity)
    }

    async fn chain_feedback(&self, agent_id: &str) -> Result<Option<ChainFeedback>, ResolverError> {
        match self.get_json(&format!("/reputation/{agent_id}")).await? {
            Some(body) => parse_reputation(body),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AggregatorReputation {
    feedback_count: u64,
    average_score:  f64,
}

fn parse_identity(body: serde_json::Value) -> Result<ResolvedIdentity, ResolverError> {
    let mut id: ResolvedIdentity =
        serde_json::from_value(body).map_err(|e| ResolverError::Decode(e.to_string()))?;
    id.agent_id = id.agent_id.filter(|s| !s.is_empty());
    id.wallet   = id.wallet.filter(|s| !s.is_empty());
    Ok(id)
}

fn parse_reputation(body: serde_json::Value) -> Result<Option<ChainFeedback>, ResolverError> {
    let rep: AggregatorReputation =
        serde_json::from_value(body).map_err(|e| ResolverError::Decode(e.to_string()))?;
    if rep.feedback_count == 0 {
        return Ok(None);
    }
    Ok(Some(ChainFeedback {
        feedback_score: rep.average_score.clamp(-100.0, 100.0),
        sample_count:   rep.feedback_count,
    }))
}

/// Agent ids on the wire are hex-encoded 32-byte mint addresses.
fn agent_id_bytes(agent_id: &str) -> Result<[u8; 32], ResolverError> {
    let bytes = hex::decode(agent_id.trim_start_matches("0x"))
        .map_err(|_| ResolverError::InvalidAgentId(agent_id.to_owned()))?;
    bytes
        .try_into()
        .map_err(|_| ResolverError::InvalidAgentId(agent_id.to_owned()))
}
