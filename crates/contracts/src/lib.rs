pub mod abi;
pub mod contract;
pub mod state;

pub use abi::{
    AbiError, ContractAbi, ContractEvent, ContractFunction, ContractParameter, Mutability,
    ParamType, Visibility,
};
pub use contract::{Contract, ContractError, ExecutionContext, ExecutionResult, LogEntry};
pub use state::ContractState;
