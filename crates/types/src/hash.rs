//! Canonical hashing and Merkle accumulation for the Palisade ledger.
//!
//! Every header hash in the chain is a SHA-256 digest over the UTF-8
//! concatenation of an ordered field list with no separators. The field
//! ordering is part of the wire contract: two nodes that disagree on it
//! produce incompatible chains.

use sha2::{Digest, Sha256};

/// Hash of the genesis parent: 64 zero characters.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// SHA-256 over the ordered concatenation of `fields`, lowercase hex.
pub fn canonical_hash(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 of the empty string, used for empty transaction sets and
/// placeholder state/receipts roots.
pub fn hash_empty() -> String {
    canonical_hash(&[])
}

/// Merkle root over an ordered list of hex hashes.
///
/// Adjacent hashes are paired left-to-right; an odd-length level duplicates
/// its last element rather than zero-padding. This duplication is required
/// for hash compatibility with existing chain data.
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return hash_empty();
    }

    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(canonical_hash(&[left, right]));
        }
        level = next;
    }
    level.swap_remove(0)
}
