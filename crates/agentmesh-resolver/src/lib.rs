// agentmesh-resolver: maps peer ids to on-chain agent identities and fetches
// chain-side feedback for them. Every failure here means "unresolved" to
// the caller, never a hard error.

pub mod client;
pub mod error;

pub use client::{
    AggregatorResolver, ChainFeedback, IdentityResolver, NoopResolver, ResolvedIdentity,
    SatiRegistry,
};
pub use error::ResolverError;
