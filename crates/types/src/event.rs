//! Typed ledger events.
//!
//! Every engine component reports side effects as values on an explicit
//! outbound channel instead of an emitter hidden inside the call graph. The
//! external audit collaborator owns persistence; the core only emits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    BlockProposed {
        block_hash: String,
        number: u64,
        validator: String,
        transaction_count: usize,
    },
    VoteCast {
        block_hash: String,
        validator: String,
        approve: bool,
    },
    ConsensusReached {
        block_hash: String,
        approved: bool,
    },
    ValidatorAdded {
        validator: String,
    },
    ValidatorRemoved {
        validator: String,
    },
    ContractDeployed {
        address: String,
        deployer: String,
        gas_used: u64,
    },
    FunctionExecuted {
        address: String,
        function: String,
        gas_used: u64,
    },
    ExecutionFailed {
        address: String,
        function: String,
        error: String,
    },
    GasRecorded {
        address: String,
        function: String,
        gas_used: u64,
        cost: u64,
    },
    StateUpdated {
        address: String,
        version: u32,
        keys_added: usize,
        keys_modified: usize,
        keys_deleted: usize,
    },
    SnapshotCreated {
        address: String,
        snapshot_id: String,
        block_number: u64,
    },
}
