use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid protocol version string: {0}")]
    InvalidVersion(String),

    #[error("unknown trust tier: {0}")]
    UnknownTier(String),

    #[error("unknown enforcement level: {0}")]
    UnknownEnforcement(String),

    #[error("wire message too large: {size} bytes exceeds {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
