//! Block and header structures for the Palisade PoA chain.
//!
//! A block's hash commits to its header fields in a fixed order (see
//! [`BlockHeader::hash`]); validation recomputes the digest through the same
//! code path used at construction so the two can never drift apart.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::{canonical_hash, hash_empty, merkle_root};
use crate::transaction::Transaction;

/// Block validation and construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("header hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("empty field: {0}")]
    EmptyField(&'static str),
    #[error("timestamp must be positive")]
    InvalidTimestamp,
    #[error("invalid transaction at index {index}: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: Box<BlockError>,
    },
}

/// The hash-input subset of a block: everything except the hash itself, the
/// transaction bodies, and the validator signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: String,
    pub number: u64,
    pub timestamp: u64,
    pub validator: String,
    pub state_root: String,
    pub transactions_root: String,
    pub receipts_root: String,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub extra_data: String,
}

impl BlockHeader {
    /// Canonical header hash. The field order here is load-bearing: it is
    /// the cross-implementation hash contract and must never be reordered.
    pub fn hash(&self) -> String {
        canonical_hash(&[
            &self.parent_hash,
            &self.number.to_string(),
            &self.timestamp.to_string(),
            &self.validator,
            &self.state_root,
            &self.transactions_root,
            &self.receipts_root,
            &self.gas_limit.to_string(),
            &self.gas_used.to_string(),
            &self.extra_data,
        ])
    }
}

/// An immutable block. Owned by the consensus engine until finalized; the
/// only post-construction mutation is attaching the proposer signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub signature: String,
}

impl Block {
    /// Hex hashes of the contained transactions, in block order.
    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.hash.clone()).collect()
    }
}

/// Assembles a block from a parent link, a transaction set, and a gas limit.
///
/// Transactions and the gas limit must be supplied explicitly; `build` fails
/// with [`BlockError::MissingField`] otherwise. State and receipts roots
/// default to the empty hash until the execution engine supplies real ones.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    parent_hash: String,
    number: u64,
    validator: String,
    timestamp: Option<u64>,
    transactions: Option<Vec<Transaction>>,
    gas_limit: Option<u64>,
    gas_used: u64,
    state_root: Option<String>,
    receipts_root: Option<String>,
    extra_data: String,
}

impl BlockBuilder {
    pub fn new(parent_hash: impl Into<String>, number: u64, validator: impl Into<String>) -> Self {
        Self {
            parent_hash: parent_hash.into(),
            number,
            validator: validator.into(),
            timestamp: None,
            transactions: None,
            gas_limit: None,
            gas_used: 0,
            state_root: None,
            receipts_root: None,
            extra_data: String::new(),
        }
    }

    pub fn transactions(mut self, transactions: Vec<Transaction>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn gas_used(mut self, gas_used: u64) -> Self {
        self.gas_used = gas_used;
        self
    }

    /// Integration point for the execution engine's real state root.
    pub fn state_root(mut self, root: impl Into<String>) -> Self {
        self.state_root = Some(root.into());
        self
    }

    pub fn receipts_root(mut self, root: impl Into<String>) -> Self {
        self.receipts_root = Some(root.into());
        self
    }

    pub fn extra_data(mut self, extra: impl Into<String>) -> Self {
        self.extra_data = extra.into();
        self
    }

    /// Fixed timestamp for deterministic construction in tests.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Block, BlockError> {
        let transactions = self
            .transactions
            .ok_or(BlockError::MissingField("transactions"))?;
        let gas_limit = self.gas_limit.ok_or(BlockError::MissingField("gas_limit"))?;

        let timestamp = match self.timestamp {
            Some(ts) => ts,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        let tx_hashes: Vec<String> = transactions.iter().map(|tx| tx.hash.clone()).collect();
        let header = BlockHeader {
            parent_hash: self.parent_hash,
            number: self.number,
            timestamp,
            validator: self.validator,
            state_root: self.state_root.unwrap_or_else(hash_empty),
            transactions_root: merkle_root(&tx_hashes),
            receipts_root: self.receipts_root.unwrap_or_else(hash_empty),
            gas_limit,
            gas_used: self.gas_used,
            extra_data: self.extra_data,
        };

        Ok(Block {
            hash: header.hash(),
            header,
            transactions,
            signature: String::new(),
        })
    }
}

/// Independently recompute and check a block's integrity.
///
/// Runs the same header hash as construction, then the structural rules:
/// non-empty hash, parent hash, and validator; positive timestamp; every
/// transaction carrying a hash, sender, and signature.
pub fn validate_block(block: &Block) -> Result<(), BlockError> {
    if block.hash.is_empty() {
        return Err(BlockError::EmptyField("hash"));
    }
    if block.header.parent_hash.is_empty() {
        return Err(BlockError::EmptyField("parent_hash"));
    }
    if block.header.validator.is_empty() {
        return Err(BlockError::EmptyField("validator"));
    }
    if block.header.timestamp == 0 {
        return Err(BlockError::InvalidTimestamp);
    }

    let expected = block.header.hash();
    if expected != block.hash {
        return Err(BlockError::HashMismatch {
            expected,
            actual: block.hash.clone(),
        });
    }

    for (index, tx) in block.transactions.iter().enumerate() {
        tx.validate()
            .map_err(|source| BlockError::InvalidTransaction {
                index,
                source: Box::new(source),
            })?;
    }

    Ok(())
}
