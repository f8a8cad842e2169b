//! Network policy documents and their content hashes.
//!
//! Every peer on a network must run under the same ordered rule list. Peers
//! compare the SHA-256 of the normalized rule text during the handshake
//! rather than the rules themselves.

use serde::{Deserialize, Serialize};

use crate::hash::{ct_eq, sha256_hex};

/// Ordered list of network rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub rules: Vec<String>,
}

impl PolicyDocument {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { rules: rules.into_iter().map(Into::into).collect() }
    }

    /// Parse a policy from text, one rule per line. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn from_text(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        )
    }

    /// Canonical text form: trimmed rules, empty rules dropped, `\n` joined.
    /// Rule order is significant.
    pub fn normalized(&self) -> String {
        self.rules
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn hash(&self) -> PolicyHash {
        PolicyHash(sha256_hex(self.normalized().as_bytes()))
    }
}

/// Hex digest of a normalized policy document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyHash(pub String);

impl PolicyHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a hash received from a peer.
    pub fn matches(&self, other: &str) -> bool {
        ct_eq(&self.0, other)
    }
}

impl std::fmt::Display for PolicyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
