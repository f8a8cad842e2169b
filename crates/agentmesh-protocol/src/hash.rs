use sha2::{Digest, Sha256};
use tiny_keccak::{Hasher, Keccak};

use crate::constants::MAX_POLICY_HASH_COMPARE;

/// Keccak-256 hash of the input bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut k = Keccak::v256();
    let mut out = [0u8; 32];
    k.update(data);
    k.finalize(&mut out);
    out
}

/// SHA-256 of the input, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time string comparison.
///
/// Every byte position up to the longer length is visited, so the running
/// time does not reveal where two strings first differ. When the lengths
/// differ the walk is capped at `MAX_POLICY_HASH_COMPARE` positions; the
/// cap depends only on a protocol constant, never on which input is longer.
pub fn ct_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len = if a.len() == b.len() {
        a.len()
    } else {
        a.len().max(b.len()).min(MAX_POLICY_HASH_COMPARE)
    };
    let mut diff: u8 = u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_is_stable() {
        assert_eq!(keccak256(b"hello"), keccak256(b"hello"));
        assert_ne!(keccak256(b"hello"), keccak256(b"hellp"));
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        );
    }

    #[test]
    fn ct_eq_matches_plain_equality() {
        assert!(ct_eq("abcdef", "abcdef"));
        assert!(ct_eq("", ""));
        assert!(!ct_eq("abcdef", "abcdeg"));
        assert!(!ct_eq("abc", "abcd"));
        assert!(!ct_eq("abcd", "abc"));
    }

    #[test]
    fn ct_eq_rejects_long_prefix_match() {
        // Same first 128 bytes, different lengths: the capped walk finds no
        // byte difference but the length flag still fails the comparison.
        let a = "a".repeat(200);
        let b = "a".repeat(300);
        assert!(!ct_eq(&a, &b));
    }
}
