//! Ledger transactions.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::BlockError;
use crate::hash::canonical_hash;

/// A transaction submitted for inclusion in a block.
///
/// Created by a submitter, validated when a containing block is validated,
/// and immutable once included. The `data` field carries an opaque
/// contract-call payload when the transaction targets a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub value: u64,
    pub data: String,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub signature: String,
    pub timestamp: u64,
}

impl Transaction {
    /// Create a transaction with a canonical hash over its payload fields.
    /// The signature is attached separately by the submitter's key.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        value: u64,
        data: impl Into<String>,
        nonce: u64,
        gas_limit: u64,
        gas_price: u64,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        let data = data.into();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let hash = canonical_hash(&[
            &from,
            &to,
            &value.to_string(),
            &data,
            &nonce.to_string(),
            &gas_limit.to_string(),
            &gas_price.to_string(),
            &timestamp.to_string(),
        ]);

        Self {
            hash,
            from,
            to,
            value,
            data,
            nonce,
            gas_limit,
            gas_price,
            signature: String::new(),
            timestamp,
        }
    }

    /// Validation applied when the transaction enters a block: the hash,
    /// sender, and signature must all be present.
    pub fn validate(&self) -> Result<(), BlockError> {
        if self.hash.is_empty() {
            return Err(BlockError::EmptyField("transaction.hash"));
        }
        if self.from.is_empty() {
            return Err(BlockError::EmptyField("transaction.from"));
        }
        if self.signature.is_empty() {
            return Err(BlockError::EmptyField("transaction.signature"));
        }
        Ok(())
    }
}
