use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),
}
