//! Deterministic keyed search index over sealed text.
//!
//! Each whitespace token of at least three characters is lowercased and
//! replaced by the first 8 bytes of its keyed BLAKE3 hash, hex-encoded and
//! space-joined. A query goes through the same transform and is answered by
//! a substring test against the stored index. The index leaks which tokens
//! appear and how often; it never reveals the plaintext. Truncation to
//! 8 bytes admits cross-token collisions at roughly 2^-64 per pair.

/// Minimum token length that enters the index.
pub const MIN_TOKEN_LEN: usize = 3;

/// Bytes of each keyed hash kept in the index.
pub const TOKEN_HASH_LEN: usize = 8;

const INDEX_KEY_CONTEXT: &str = "pelican-crypt 2026-06 search index key";

/// Derive the index key from the master secret.
pub fn index_key(master: &[u8]) -> [u8; 32] {
    blake3::derive_key(INDEX_KEY_CONTEXT, master)
}

fn hash_token(key: &[u8; 32], token: &str) -> String {
    let lowered = token.to_lowercase();
    let digest = blake3::keyed_hash(key, lowered.as_bytes());
    hex::encode(&digest.as_bytes()[..TOKEN_HASH_LEN])
}

/// Transform plaintext into its index form.
pub fn build_index(key: &[u8; 32], text: &str) -> String {
    let hashes: Vec<String> = text
        .split_whitespace()
        .filter(|token| token.chars().count() >= MIN_TOKEN_LEN)
        .map(|token| hash_token(key, token))
        .collect();
    hashes.join(" ")
}

/// Answer a substring query against a stored index.
///
/// A query whose every token is shorter than [`MIN_TOKEN_LEN`] transforms to
/// the empty string and matches nothing.
pub fn matches(key: &[u8; 32], stored_index: &str, query: &str) -> bool {
    let transformed = build_index(key, query);
    if transformed.is_empty() {
        return false;
    }
    stored_index.contains(&transformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        index_key(b"test master key")
    }

    #[test]
    fn every_long_token_is_found() {
        let key = key();
        let index = build_index(&key, "Quarterly report attached for review");
        for token in ["quarterly", "report", "attached", "for", "review"] {
            assert!(matches(&key, &index, token), "token {token} not found");
        }
    }

    #[test]
    fn search_is_case_insensitive() {
        let key = key();
        let index = build_index(&key, "Quarterly Report");
        assert!(matches(&key, &index, "REPORT"));
    }

    #[test]
    fn short_tokens_are_dropped() {
        let key = key();
        let index = build_index(&key, "to be or not");
        assert!(!matches(&key, &index, "to"));
        assert!(matches(&key, &index, "not"));
    }

    #[test]
    fn absent_token_does_not_match() {
        let key = key();
        let index = build_index(&key, "quarterly report attached");
        assert!(!matches(&key, &index, "invoice"));
    }

    #[test]
    fn multi_token_query_matches_in_order() {
        let key = key();
        let index = build_index(&key, "quarterly report attached");
        assert!(matches(&key, &index, "quarterly report"));
        assert!(!matches(&key, &index, "report quarterly"));
    }

    #[test]
    fn token_frequency_is_preserved() {
        let key = key();
        let index = build_index(&key, "ping ping");
        let single = build_index(&key, "ping");
        assert_eq!(index, format!("{single} {single}"));
    }

    #[test]
    fn different_keys_produce_different_indexes() {
        let a = build_index(&index_key(b"key one"), "report");
        let b = build_index(&index_key(b"key two"), "report");
        assert_ne!(a, b);
    }
}
