use serde::{Deserialize, Serialize};

use crate::{
    constants::MAX_MESSAGE_SIZE,
    error::ProtocolError,
    handshake::{
        HandshakeRequest, HandshakeResponse, PolicyMismatchNotice, VersionIncompatibleNotice,
    },
    trust::{put_str, TrustFilterWire},
};

/// Application message envelope.
///
/// `to` is either a peer id (direct message) or a topic name.
/// `signature` covers `signing_bytes()`; `public_key` is the sender's raw
/// ed25519 key, from which receivers derive the sender's peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessage {
    pub id:         String,
    pub from:       String,
    pub to:         String,
    pub msg_type:   String,
    #[serde(with = "serde_bytes")]
    pub payload:    Vec<u8>,
    /// Unix milliseconds at the sender.
    pub timestamp:  u64,
    #[serde(default, with = "serde_bytes")]
    pub signature:  Option<Vec<u8>>,
    #[serde(default, with = "serde_bytes")]
    pub public_key: Option<Vec<u8>>,
}

impl AppMessage {
    pub fn new(
        id:        impl Into<String>,
        from:      impl Into<String>,
        to:        impl Into<String>,
        msg_type:  impl Into<String>,
        payload:   Vec<u8>,
        timestamp: u64,
    ) -> Self {
        Self {
            id:         id.into(),
            from:       from.into(),
            to:         to.into(),
            msg_type:   msg_type.into(),
            payload,
            timestamp,
            signature:  None,
            public_key: None,
        }
    }

    /// Canonical serialization of the semantic fields, in a fixed order.
    /// Signature and public key are excluded.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 96);
        put_str(&mut buf, &self.id);
        put_str(&mut buf, &self.from);
        put_str(&mut buf, &self.to);
        put_str(&mut buf, &self.msg_type);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some() && self.public_key.is_some()
    }
}

/// Every message this layer puts on the wire.
///
/// Decoded once at the transport boundary; handlers match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum WireMessage {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    VersionIncompatible(VersionIncompatibleNotice),
    PolicyMismatch(PolicyMismatchNotice),
    Application(AppMessage),
    TrustFilter(TrustFilterWire),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeRequest(_)    => "HANDSHAKE_REQUEST",
            Self::HandshakeResponse(_)   => "HANDSHAKE_RESPONSE",
            Self::VersionIncompatible(_) => "VERSION_INCOMPATIBLE",
            Self::PolicyMismatch(_)      => "POLICY_MISMATCH",
            Self::Application(_)         => "APPLICATION",
            Self::TrustFilter(_)         => "TRUST_FILTER",
        }
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: buf.len(), limit: MAX_MESSAGE_SIZE });
        }
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: data.len(), limit: MAX_MESSAGE_SIZE });
        }
        ciborium::from_reader(data).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ProtocolVersion;

    #[test]
    fn signing_bytes_exclude_signature() {
        let mut m = AppMessage::new("1", "a", "b", "chat", b"hi".to_vec(), 7);
        let before = m.signing_bytes();
        m.signature = Some(vec![9; 64]);
        m.public_key = Some(vec![8; 32]);
        assert_eq!(before, m.signing_bytes());
        assert!(m.is_signed());
    }

    #[test]
    fn signing_bytes_are_unambiguous() {
        // Moving a character across a field boundary must change the bytes.
        let a = AppMessage::new("1", "ab", "c", "t", vec![], 0);
        let b = AppMessage::new("1", "a", "bc", "t", vec![], 0);
        assert_ne!(a.signing_bytes(), b.signing_bytes());
    }

    #[test]
    fn application_message_survives_cbor() {
        let mut m = AppMessage::new("42", "peer-a", "topic/x", "chat", b"payload".to_vec(), 99);
        m.signature = Some(vec![1; 64]);
        let wire = WireMessage::Application(m.clone());
        let decoded = WireMessage::from_cbor(&wire.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded, WireMessage::Application(m));
    }

    #[test]
    fn handshake_request_survives_cbor() {
        let req = WireMessage::HandshakeRequest(HandshakeRequest {
            protocol_version: ProtocolVersion::new(1, 2, 3),
            network_id:       "net".into(),
            timestamp:        5,
            policy_hash:      "ab".repeat(32),
        });
        let decoded = WireMessage::from_cbor(&req.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded.kind(), "HANDSHAKE_REQUEST");
        assert_eq!(decoded, req);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            WireMessage::from_cbor(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::CborDecode(_))
        ));
    }

    #[test]
    fn oversized_input_is_rejected_before_decode() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            WireMessage::from_cbor(&big),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }
}
