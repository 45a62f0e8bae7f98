//! Ledger storage collaborator.
//!
//! The consensus engine consults the chain head at proposal time through
//! the [`LedgerStore`] trait; finalized blocks are appended through the
//! same trait. Only an in-memory backend ships with the engine — validator
//! and vote state carries no persistence requirement beyond the current
//! round, and durable backends plug in behind the trait.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use palisade_types::{Block, ZERO_HASH};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("block {0} not found")]
    BlockNotFound(String),
    #[error("block number {0} already stored")]
    DuplicateNumber(u64),
}

/// Abstract chain storage consulted by the consensus engine.
pub trait LedgerStore: Send + Sync {
    /// Hash of the chain head; the all-zero hash before any block exists.
    fn latest_block_hash(&self) -> String;
    /// Number of the chain head; 0 at genesis.
    fn latest_block_number(&self) -> u64;
    fn store_block(&self, block: Block) -> Result<()>;
    fn get_block(&self, hash: &str) -> Result<Option<Block>>;
    fn get_block_by_number(&self, number: u64) -> Result<Option<Block>>;
}

#[derive(Default)]
struct MemoryLedgerInner {
    blocks_by_hash: HashMap<String, Block>,
    hashes_by_number: HashMap<u64, String>,
    head: Option<(String, u64)>,
}

/// In-memory chain storage used by single-node deployments and tests.
#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<MemoryLedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn latest_block_hash(&self) -> String {
        self.inner
            .read()
            .head
            .as_ref()
            .map(|(hash, _)| hash.clone())
            .unwrap_or_else(|| ZERO_HASH.to_string())
    }

    fn latest_block_number(&self) -> u64 {
        self.inner.read().head.as_ref().map(|(_, n)| *n).unwrap_or(0)
    }

    fn store_block(&self, block: Block) -> Result<()> {
        let mut inner = self.inner.write();
        let number = block.header.number;
        if inner.hashes_by_number.contains_key(&number) {
            return Err(StorageError::DuplicateNumber(number).into());
        }

        debug!(number, hash = %block.hash, "storing finalized block");
        inner.hashes_by_number.insert(number, block.hash.clone());
        let advance = inner.head.as_ref().map(|(_, n)| number > *n).unwrap_or(true);
        if advance {
            inner.head = Some((block.hash.clone(), number));
        }
        inner.blocks_by_hash.insert(block.hash.clone(), block);
        Ok(())
    }

    fn get_block(&self, hash: &str) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks_by_hash.get(hash).cloned())
    }

    fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let inner = self.inner.read();
        Ok(inner
            .hashes_by_number
            .get(&number)
            .and_then(|hash| inner.blocks_by_hash.get(hash))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::BlockBuilder;

    fn block(number: u64, parent: &str) -> Block {
        BlockBuilder::new(parent, number, "validator-1")
            .timestamp(1_700_000_000 + number)
            .transactions(vec![])
            .gas_limit(8_000_000)
            .build()
            .unwrap()
    }

    #[test]
    fn genesis_defaults() {
        let store = MemoryLedger::new();
        assert_eq!(store.latest_block_hash(), ZERO_HASH);
        assert_eq!(store.latest_block_number(), 0);
    }

    #[test]
    fn head_advances_with_stored_blocks() {
        let store = MemoryLedger::new();
        let b1 = block(1, ZERO_HASH);
        let b2 = block(2, &b1.hash);

        store.store_block(b1.clone()).unwrap();
        assert_eq!(store.latest_block_hash(), b1.hash);
        store.store_block(b2.clone()).unwrap();
        assert_eq!(store.latest_block_number(), 2);
        assert_eq!(store.latest_block_hash(), b2.hash);

        assert_eq!(store.get_block(&b1.hash).unwrap().unwrap().hash, b1.hash);
        assert_eq!(
            store.get_block_by_number(2).unwrap().unwrap().hash,
            b2.hash
        );
    }

    #[test]
    fn duplicate_number_rejected() {
        let store = MemoryLedger::new();
        store.store_block(block(1, ZERO_HASH)).unwrap();
        assert!(store.store_block(block(1, ZERO_HASH)).is_err());
    }
}
