//! Validator votes on candidate blocks.

use serde::{Deserialize, Serialize};

/// A single validator's ballot for a candidate block hash.
///
/// Votes are transient: the consensus engine consumes them while tallying
/// and discards the tally once the block hash reaches finality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub validator: String,
    pub block_hash: String,
    pub approve: bool,
    pub signature: String,
    pub timestamp: u64,
}

impl Vote {
    /// Byte string covered by the validator's Ed25519 signature.
    ///
    /// Fixed field order, no separators, matching the canonical-hash
    /// convention used for block headers.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(self.validator.as_bytes());
        payload.extend_from_slice(self.block_hash.as_bytes());
        payload.extend_from_slice(if self.approve { b"1" } else { b"0" });
        payload.extend_from_slice(self.timestamp.to_string().as_bytes());
        payload
    }
}
