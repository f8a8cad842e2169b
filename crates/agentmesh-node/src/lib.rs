//! agentmesh node: handshake admission, dial scheduling, Bloom trust filter
//! gossip, latency zones, reputation and reputation-weighted peer ranking.

pub mod api;
pub mod auth;
pub mod bloom;
pub mod bridge;
pub mod config;
pub mod dial;
pub mod gossip;
pub mod identity;
pub mod latency;
pub mod network;
pub mod node;
pub mod ranking;
pub mod reputation;
pub mod transport;
