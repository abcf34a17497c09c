// src/hashing.rs
// content_hash / normalized_content_hash derivation (spec.md §3 invariant 1).

use sha2::{Digest, Sha256};

use crate::text::normalize;

/// SHA-256 of the content, byte-for-byte.
pub fn content_hash(content: &str) -> String {
    hex(content.as_bytes())
}

/// SHA-256 of the whitespace/case/punctuation-collapsed content.
pub fn normalized_content_hash(content: &str) -> String {
    hex(normalize(content).as_bytes())
}

fn hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_equal_iff_bytes_equal() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("Hello"));
    }

    #[test]
    fn normalized_hash_equal_iff_normalize_equal() {
        let a = "Use  Tabs, not spaces!";
        let b = "use tabs not spaces";
        assert_eq!(normalized_content_hash(a), normalized_content_hash(b));
        assert_ne!(normalized_content_hash(a), normalized_content_hash("use spaces not tabs"));
    }

    #[test]
    fn content_hash_deterministic() {
        let h1 = content_hash("repeatable content");
        let h2 = content_hash("repeatable content");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
