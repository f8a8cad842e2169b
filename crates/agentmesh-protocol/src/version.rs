use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Semantic protocol version exchanged during the handshake.
///
/// Ordering is lexicographic over (major, minor, patch), which the derived
/// `Ord` gives us from the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// True when `self` (a peer's version) satisfies the local minimum.
    pub fn satisfies(&self, min: &ProtocolVersion) -> bool {
        self >= min
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('v');
        let mut parts = s.split('.');
        let mut next = || -> Result<u16, ProtocolError> {
            parts
                .next()
                .ok_or_else(|| ProtocolError::InvalidVersion(s.to_owned()))?
                .parse::<u16>()
                .map_err(|_| ProtocolError::InvalidVersion(s.to_owned()))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ProtocolError::InvalidVersion(s.to_owned()));
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let v: ProtocolVersion = "1.2.3".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 2, 3));
        assert_eq!(v.to_string(), "1.2.3");
        assert_eq!("v2.0.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(2, 0, 1));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("1.2".parse::<ProtocolVersion>().is_err());
        assert!("1.2.3.4".parse::<ProtocolVersion>().is_err());
        assert!("one.two.three".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let min = ProtocolVersion::new(1, 2, 0);
        assert!(ProtocolVersion::new(1, 2, 0).satisfies(&min));
        assert!(ProtocolVersion::new(1, 10, 0).satisfies(&min));
        assert!(ProtocolVersion::new(2, 0, 0).satisfies(&min));
        assert!(!ProtocolVersion::new(1, 1, 99).satisfies(&min));
        assert!(!ProtocolVersion::new(0, 9, 9).satisfies(&min));
    }
}
