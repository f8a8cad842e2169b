pub mod constants;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod message;
pub mod policy;
pub mod trust;
pub mod version;

pub use constants::*;
pub use error::ProtocolError;
pub use handshake::{EnforcementLevel, HandshakeContext, Rejection};
pub use message::{AppMessage, WireMessage};
pub use policy::{PolicyDocument, PolicyHash};
pub use trust::{TrustFilterWire, TrustTier};
pub use version::ProtocolVersion;
