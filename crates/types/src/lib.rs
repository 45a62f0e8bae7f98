pub mod block;
pub mod event;
pub mod hash;
pub mod transaction;
pub mod vote;

pub use block::{validate_block, Block, BlockBuilder, BlockError, BlockHeader};
pub use event::LedgerEvent;
pub use hash::{canonical_hash, hash_empty, merkle_root, ZERO_HASH};
pub use transaction::Transaction;
pub use vote::Vote;
