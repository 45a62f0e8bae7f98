//! The contract model: validated dispatch into a fixed interpreter.
//!
//! Functions are not compiled bytecode. Each ABI entry resolves once, at
//! contract construction, into a [`Behavior`]: read-only functions return a
//! deterministic canned value, state-changing functions write a per-call
//! storage key and bump the nonce. Re-matching function name strings on
//! every call is deliberately avoided.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::abi::{ContractAbi, ContractFunction, Mutability};
use crate::state::ContractState;

/// Base gas charged for any dispatched call.
const DISPATCH_BASE_GAS: u64 = 21_000;
/// Charged when a function declares no gas limit of its own.
const DEFAULT_FUNCTION_GAS: u64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("function {0} not found in contract ABI")]
    FunctionNotFound(String),
    #[error("function {0} is not externally callable")]
    NotExternallyCallable(String),
    #[error("gas limit exceeded for {function}: used {gas_used} of {limit}")]
    GasLimitExceeded {
        function: String,
        gas_used: u64,
        limit: u64,
    },
    #[error("argument mismatch for {function}: {reason}")]
    ArgumentMismatch { function: String, reason: String },
}

/// Environment for one contract call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub sender: String,
    pub value: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub block_number: u64,
    pub timestamp: u64,
}

impl ExecutionContext {
    pub fn new(sender: impl Into<String>, gas_limit: u64) -> Self {
        Self {
            sender: sender.into(),
            value: 0,
            gas_limit,
            gas_used: 0,
            block_number: 0,
            timestamp: 0,
        }
    }
}

/// One emitted event log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub event: String,
    pub contract: String,
    pub data: String,
    pub block_number: u64,
}

/// Outcome of one call. Transient; the caller owns persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub return_value: Option<String>,
    pub gas_used: u64,
    pub events: Vec<LogEntry>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>, gas_used: u64) -> Self {
        Self {
            success: false,
            return_value: None,
            gas_used,
            events: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Canned return classes for read-only functions, resolved by name once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadBehavior {
    /// Balance- and supply-style queries return zero.
    Zero,
    /// Metadata queries echo the contract address.
    Metadata,
    /// Everything else returns a fixed sentinel.
    Generic,
}

impl ReadBehavior {
    fn resolve(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("balance") || lower.contains("supply") || lower.contains("count") {
            ReadBehavior::Zero
        } else if lower.contains("name") || lower.contains("symbol") {
            ReadBehavior::Metadata
        } else {
            ReadBehavior::Generic
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    ReadOnly(ReadBehavior),
    Mutating,
}

impl Behavior {
    fn resolve(function: &ContractFunction) -> Self {
        if function.mutability.is_read_only() {
            Behavior::ReadOnly(ReadBehavior::resolve(&function.name))
        } else {
            Behavior::Mutating
        }
    }
}

/// A deployed contract: immutable schema plus live state.
#[derive(Debug, Clone)]
pub struct Contract {
    pub address: String,
    pub owner: String,
    pub abi: ContractAbi,
    pub state: ContractState,
    behaviors: HashMap<String, Behavior>,
}

impl Contract {
    pub fn new(address: impl Into<String>, owner: impl Into<String>, abi: ContractAbi, state: ContractState) -> Self {
        let behaviors = abi
            .functions
            .iter()
            .map(|f| (f.name.clone(), Behavior::resolve(f)))
            .collect();
        Self {
            address: address.into(),
            owner: owner.into(),
            abi,
            state,
            behaviors,
        }
    }

    /// Validate and dispatch one function call.
    ///
    /// On any error the contract state is untouched; mutation happens only
    /// after every check has passed.
    pub fn execute(
        &mut self,
        name: &str,
        args: &[serde_json::Value],
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionResult, ContractError> {
        let function = self
            .abi
            .function(name)
            .ok_or_else(|| ContractError::FunctionNotFound(name.to_string()))?;

        if !function.visibility.is_externally_callable() {
            return Err(ContractError::NotExternallyCallable(name.to_string()));
        }

        let effective_limit = function.gas_limit.unwrap_or(ctx.gas_limit);
        if ctx.gas_used >= effective_limit {
            return Err(ContractError::GasLimitExceeded {
                function: name.to_string(),
                gas_used: ctx.gas_used,
                limit: effective_limit,
            });
        }

        if args.len() != function.inputs.len() {
            return Err(ContractError::ArgumentMismatch {
                function: name.to_string(),
                reason: format!("expected {} arguments, got {}", function.inputs.len(), args.len()),
            });
        }
        for (parameter, value) in function.inputs.iter().zip(args) {
            if !parameter.param_type.validates(value) {
                return Err(ContractError::ArgumentMismatch {
                    function: name.to_string(),
                    reason: format!(
                        "argument {} is not a valid {}",
                        parameter.name, parameter.param_type
                    ),
                });
            }
        }

        let gas_used = dispatch_gas(function, args.len());
        let behavior = self
            .behaviors
            .get(name)
            .copied()
            .unwrap_or_else(|| Behavior::resolve(function));

        let (return_value, events) = match behavior {
            Behavior::ReadOnly(read) => (Some(self.read_only_return(read)), Vec::new()),
            Behavior::Mutating => {
                let key = format!("call_{}_{}", name, self.state.nonce);
                let recorded = serde_json::to_string(args).unwrap_or_default();
                self.state.storage.insert(key, recorded);
                self.state.nonce += 1;

                let events = match self.abi.events.first() {
                    Some(event) => vec![LogEntry {
                        event: event.name.clone(),
                        contract: self.address.clone(),
                        data: format!("{name} executed by {}", ctx.sender),
                        block_number: ctx.block_number,
                    }],
                    None => Vec::new(),
                };
                (Some("0x1".to_string()), events)
            }
        };

        ctx.gas_used += gas_used;
        debug!(contract = %self.address, function = name, gas_used, "dispatched call");

        Ok(ExecutionResult {
            success: true,
            return_value,
            gas_used,
            events,
            error: None,
        })
    }

    fn read_only_return(&self, behavior: ReadBehavior) -> String {
        match behavior {
            ReadBehavior::Zero => "0".to_string(),
            ReadBehavior::Metadata => self.address.clone(),
            ReadBehavior::Generic => "0x1".to_string(),
        }
    }

    /// True when the named function may receive a non-zero call value.
    pub fn is_payable(&self, name: &str) -> bool {
        self.abi
            .function(name)
            .map(|f| f.mutability == Mutability::Payable)
            .unwrap_or(false)
    }
}

/// Interpreter gas: base charge, per-parameter cost, then the function's
/// declared limit (or the flat default when it declares none).
fn dispatch_gas(function: &ContractFunction, argc: usize) -> u64 {
    let params: u64 = function
        .inputs
        .iter()
        .map(|p| p.param_type.dispatch_cost(argc))
        .sum();
    DISPATCH_BASE_GAS + params + function.gas_limit.unwrap_or(DEFAULT_FUNCTION_GAS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ContractEvent, ContractParameter, ParamType, Visibility};
    use serde_json::json;

    fn abi() -> ContractAbi {
        ContractAbi {
            functions: vec![
                ContractFunction {
                    name: "transfer".into(),
                    inputs: vec![
                        ContractParameter::new("to", ParamType::Address),
                        ContractParameter::new("amount", ParamType::Uint(256)),
                    ],
                    outputs: vec![ContractParameter::new("ok", ParamType::Bool)],
                    visibility: Visibility::Public,
                    mutability: Mutability::Nonpayable,
                    gas_limit: None,
                },
                ContractFunction {
                    name: "balanceOf".into(),
                    inputs: vec![ContractParameter::new("who", ParamType::Address)],
                    outputs: vec![ContractParameter::new("balance", ParamType::Uint(256))],
                    visibility: Visibility::Public,
                    mutability: Mutability::View,
                    gas_limit: None,
                },
                ContractFunction {
                    name: "rebalance".into(),
                    inputs: vec![ContractParameter::new("seed", ParamType::Uint(256))],
                    outputs: vec![],
                    visibility: Visibility::Private,
                    mutability: Mutability::Nonpayable,
                    gas_limit: None,
                },
                ContractFunction {
                    name: "tune".into(),
                    inputs: vec![ContractParameter::new("knob", ParamType::Uint(256))],
                    outputs: vec![],
                    visibility: Visibility::Public,
                    mutability: Mutability::Nonpayable,
                    gas_limit: Some(30_000),
                },
            ],
            events: vec![ContractEvent {
                name: "Transfer".into(),
                inputs: vec![],
            }],
        }
    }

    fn contract() -> Contract {
        let address = format!("0x{}", "c".repeat(40));
        let state = ContractState::new(address.clone(), "bytecode", "0xdeployer", 1_700_000_000);
        Contract::new(address, "0xdeployer", abi(), state)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(format!("0x{}", "a".repeat(40)), 1_000_000)
    }

    fn addr_arg() -> serde_json::Value {
        json!(format!("0x{}", "b".repeat(40)))
    }

    #[test]
    fn unknown_function_is_rejected() {
        let mut c = contract();
        assert_eq!(
            c.execute("mint", &[], &mut ctx()).unwrap_err(),
            ContractError::FunctionNotFound("mint".into())
        );
    }

    #[test]
    fn private_function_is_not_externally_callable() {
        let mut c = contract();
        assert_eq!(
            c.execute("rebalance", &[json!(1)], &mut ctx()).unwrap_err(),
            ContractError::NotExternallyCallable("rebalance".into())
        );
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let mut c = contract();
        assert!(matches!(
            c.execute("transfer", &[addr_arg()], &mut ctx()).unwrap_err(),
            ContractError::ArgumentMismatch { .. }
        ));
    }

    #[test]
    fn type_predicate_failure_is_rejected() {
        let mut c = contract();
        let err = c
            .execute("transfer", &[json!("0xshort"), json!(5)], &mut ctx())
            .unwrap_err();
        assert!(matches!(err, ContractError::ArgumentMismatch { .. }));

        let err = c
            .execute("transfer", &[addr_arg(), json!(-5)], &mut ctx())
            .unwrap_err();
        assert!(matches!(err, ContractError::ArgumentMismatch { .. }));
    }

    #[test]
    fn gas_exhausted_context_is_rejected_without_mutation() {
        let mut c = contract();
        let mut context = ctx();
        context.gas_used = context.gas_limit;
        let before = c.state.clone();

        let err = c
            .execute("transfer", &[addr_arg(), json!(5)], &mut context)
            .unwrap_err();
        assert!(matches!(err, ContractError::GasLimitExceeded { .. }));
        assert_eq!(c.state, before);
    }

    #[test]
    fn function_gas_limit_overrides_context_limit() {
        let mut c = contract();
        let mut context = ctx();
        context.gas_used = 30_000; // equals tune's own limit, below the context's
        assert!(matches!(
            c.execute("tune", &[json!(1)], &mut context).unwrap_err(),
            ContractError::GasLimitExceeded { .. }
        ));
    }

    #[test]
    fn view_call_returns_canned_value_without_mutation() {
        let mut c = contract();
        let before = c.state.clone();
        let result = c.execute("balanceOf", &[addr_arg()], &mut ctx()).unwrap();

        assert!(result.success);
        assert_eq!(result.return_value.as_deref(), Some("0"));
        assert!(result.events.is_empty());
        assert_eq!(c.state, before);
    }

    #[test]
    fn mutating_call_writes_storage_bumps_nonce_and_logs() {
        let mut c = contract();
        let result = c
            .execute("transfer", &[addr_arg(), json!(5)], &mut ctx())
            .unwrap();

        assert!(result.success);
        assert_eq!(c.state.nonce, 1);
        assert!(c.state.storage.contains_key("call_transfer_0"));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event, "Transfer");
    }

    #[test]
    fn dispatch_gas_formula() {
        let mut c = contract();
        let mut context = ctx();
        let result = c
            .execute("transfer", &[addr_arg(), json!(5)], &mut context)
            .unwrap();
        // 21000 base + address(50) + uint(50) + default function gas 50000.
        assert_eq!(result.gas_used, 21_000 + 50 + 50 + 50_000);
        assert_eq!(context.gas_used, result.gas_used);
    }
}
