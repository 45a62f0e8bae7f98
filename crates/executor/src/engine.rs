//! The contract execution engine.
//!
//! Wraps the contract model's dispatch with environment bookkeeping and a
//! security gate, runs every call under a wall-clock timeout, and publishes
//! state changes through the state manager only after the call succeeds —
//! a failed or timed-out call leaves no partial writes.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use palisade_contracts::{
    AbiError, Contract, ContractAbi, ContractError, ContractState, ExecutionContext,
    ExecutionResult, LogEntry,
};
use palisade_gas::{GasMeter, GasUsage};
use palisade_security::AccessPolicy;
use palisade_state::{StateError, StateManager};
use palisade_types::{canonical_hash, LedgerEvent};

/// Engine-level resource limits.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Wall-clock ceiling for one call.
    pub max_execution_time: Duration,
    /// Bytecode ceiling at registration, bytes.
    pub max_contract_size: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_millis(5_000),
            max_contract_size: 24_576,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("sender {0} is not a well-formed address")]
    InvalidSender(String),
    #[error("function {0} is not payable")]
    NotPayable(String),
    #[error("call value {value} exceeds the per-call ceiling {limit}")]
    ValueExceedsPolicy { value: u64, limit: u64 },
    #[error("reentrancy limit reached for {contract} by {sender}")]
    ReentrancyDetected { contract: String, sender: String },
    #[error("execution of {0} timed out")]
    ExecutionTimeout(String),
    #[error("contract {0} not found")]
    ContractNotFound(String),
    #[error("bytecode is {size} bytes, limit is {limit}")]
    ContractTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// The contract-call surface.
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub contract_address: String,
    pub function_name: String,
    pub args: Vec<serde_json::Value>,
    pub sender: String,
    pub value: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
}

/// Dispatches validated calls into registered contracts.
pub struct ExecutionEngine {
    policy: ExecutionPolicy,
    access: AccessPolicy,
    state: Arc<StateManager>,
    gas: Arc<GasMeter>,
    contracts: RwLock<HashMap<String, Contract>>,
    /// Calls observed per `(contract, sender)`. Never reset: the reference
    /// behavior is a lifetime cap, not a call-stack depth guard, and is
    /// preserved here deliberately.
    reentrancy: Mutex<HashMap<(String, String), u32>>,
    block_number: AtomicU64,
    block_timestamp: AtomicU64,
    cumulative_gas: AtomicU64,
    logs: Mutex<Vec<LogEntry>>,
    events: Option<mpsc::UnboundedSender<LedgerEvent>>,
    /// Artificial dispatch latency for exercising the timeout path.
    #[cfg(test)]
    dispatch_delay: Duration,
}

impl ExecutionEngine {
    pub fn new(
        policy: ExecutionPolicy,
        access: AccessPolicy,
        state: Arc<StateManager>,
        gas: Arc<GasMeter>,
    ) -> Self {
        Self {
            policy,
            access,
            state,
            gas,
            contracts: RwLock::new(HashMap::new()),
            reentrancy: Mutex::new(HashMap::new()),
            block_number: AtomicU64::new(0),
            block_timestamp: AtomicU64::new(0),
            cumulative_gas: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
            events: None,
            #[cfg(test)]
            dispatch_delay: Duration::ZERO,
        }
    }

    /// Attach the outbound ledger-event channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<LedgerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[cfg(test)]
    fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    fn emit(&self, event: LedgerEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("ledger event receiver dropped; execution not audited");
            }
        }
    }

    /// Current block environment stamped into call contexts.
    pub fn set_block_env(&self, number: u64, timestamp: u64) {
        self.block_number.store(number, Ordering::Relaxed);
        self.block_timestamp.store(timestamp, Ordering::Relaxed);
    }

    pub fn cumulative_gas(&self) -> u64 {
        self.cumulative_gas.load(Ordering::Relaxed)
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().clone()
    }

    pub fn contract(&self, address: &str) -> Option<Contract> {
        self.contracts.read().get(address).cloned()
    }

    pub fn gas_meter(&self) -> &Arc<GasMeter> {
        &self.gas
    }

    /// Register a validated contract and its initial state. Deployment
    /// validation (ABI rules, bytecode size) happens here; richer request
    /// checks live in the deployment manager.
    pub fn register_contract(
        &self,
        address: &str,
        deployer: &str,
        abi: ContractAbi,
        bytecode: &str,
        value: u64,
        deployed_at: u64,
    ) -> Result<(), ExecutionError> {
        abi.validate_for_deployment()?;
        if bytecode.len() > self.policy.max_contract_size {
            return Err(ExecutionError::ContractTooLarge {
                size: bytecode.len(),
                limit: self.policy.max_contract_size,
            });
        }

        let mut state = ContractState::new(address, bytecode, deployer, deployed_at);
        state.balance = value;
        self.state.register_contract(state.clone())?;

        let contract = Contract::new(address, deployer, abi, state);
        self.contracts.write().insert(address.to_string(), contract);

        debug!(address, deployer, "contract registered");
        self.emit(LedgerEvent::ContractDeployed {
            address: address.to_string(),
            deployer: deployer.to_string(),
            gas_used: 0,
        });
        Ok(())
    }

    fn gate(&self, call: &ContractCall) -> Result<(), ExecutionError> {
        if call.sender.len() != 42 || !call.sender.starts_with("0x") {
            return Err(ExecutionError::InvalidSender(call.sender.clone()));
        }

        let contracts = self.contracts.read();
        let contract = contracts
            .get(&call.contract_address)
            .ok_or_else(|| ExecutionError::ContractNotFound(call.contract_address.clone()))?;

        if call.value > 0 && !contract.is_payable(&call.function_name) {
            return Err(ExecutionError::NotPayable(call.function_name.clone()));
        }
        if let Some(limit) = self.access.max_value_per_call {
            if call.value > limit {
                return Err(ExecutionError::ValueExceedsPolicy {
                    value: call.value,
                    limit,
                });
            }
        }

        let key = (call.contract_address.clone(), call.sender.clone());
        let mut counters = self.reentrancy.lock();
        let count = counters.entry(key).or_insert(0);
        if *count >= self.access.max_reentrancy_depth {
            return Err(ExecutionError::ReentrancyDetected {
                contract: call.contract_address.clone(),
                sender: call.sender.clone(),
            });
        }
        *count += 1;
        Ok(())
    }

    /// Execute one contract call.
    ///
    /// Errors are folded into a failed [`ExecutionResult`] rather than
    /// propagated, so one rejected transaction never aborts block
    /// construction for the rest. A failure after the gate charges the
    /// call's full gas limit.
    pub async fn execute_call(&self, call: ContractCall) -> ExecutionResult {
        if let Err(error) = self.gate(&call) {
            debug!(%error, function = %call.function_name, "call rejected at the gate");
            self.emit(LedgerEvent::ExecutionFailed {
                address: call.contract_address.clone(),
                function: call.function_name.clone(),
                error: error.to_string(),
            });
            return ExecutionResult::failure(error.to_string(), 0);
        }

        let block_number = self.block_number.load(Ordering::Relaxed);
        let timestamp = self.block_timestamp.load(Ordering::Relaxed);

        // Working copy: the live schema plus the state manager's current
        // state. All mutation stays on this copy until commit.
        let mut contract = match self.contract(&call.contract_address) {
            Some(contract) => contract,
            None => {
                return ExecutionResult::failure(
                    ExecutionError::ContractNotFound(call.contract_address.clone()).to_string(),
                    0,
                )
            }
        };
        let prior_state = match self.state.get_state(&call.contract_address) {
            Some(state) => state,
            None => {
                return ExecutionResult::failure(
                    ExecutionError::ContractNotFound(call.contract_address.clone()).to_string(),
                    0,
                )
            }
        };
        contract.state = prior_state.clone();

        let mut ctx = ExecutionContext::new(call.sender.clone(), call.gas_limit);
        ctx.value = call.value;
        ctx.block_number = block_number;
        ctx.timestamp = timestamp;

        let function_name = call.function_name.clone();
        let args = call.args.clone();
        #[cfg(test)]
        let dispatch_delay = self.dispatch_delay;
        let dispatch = tokio::task::spawn_blocking(move || {
            #[cfg(test)]
            std::thread::sleep(dispatch_delay);
            let outcome = contract.execute(&function_name, &args, &mut ctx);
            (contract, outcome)
        });

        let (contract, outcome) =
            match tokio::time::timeout(self.policy.max_execution_time, dispatch).await {
                Ok(Ok(done)) => done,
                Ok(Err(join_error)) => {
                    warn!(%join_error, "dispatch task failed");
                    return self.fail(&call, join_error.to_string());
                }
                Err(_) => {
                    let error = ExecutionError::ExecutionTimeout(call.function_name.clone());
                    return self.fail(&call, error.to_string());
                }
            };

        let result = match outcome {
            Ok(result) => result,
            Err(error) => return self.fail(&call, error.to_string()),
        };

        // Commit at the end: only a successful call publishes state.
        if contract.state != prior_state {
            let tx_hash = self.synthetic_tx_hash(&call, timestamp);
            if let Err(error) = self.state.update_contract_state(
                &call.contract_address,
                contract.state,
                &tx_hash,
                block_number,
            ) {
                return self.fail(&call, error.to_string());
            }
            self.record_gas(&call, result.gas_used, &tx_hash, timestamp);
        } else {
            let tx_hash = self.synthetic_tx_hash(&call, timestamp);
            self.record_gas(&call, result.gas_used, &tx_hash, timestamp);
        }

        self.cumulative_gas
            .fetch_add(result.gas_used, Ordering::Relaxed);
        self.logs.lock().extend(result.events.iter().cloned());

        self.emit(LedgerEvent::FunctionExecuted {
            address: call.contract_address.clone(),
            function: call.function_name.clone(),
            gas_used: result.gas_used,
        });
        result
    }

    /// Failed executions charge the call's full gas limit.
    fn fail(&self, call: &ContractCall, error: String) -> ExecutionResult {
        let timestamp = self.block_timestamp.load(Ordering::Relaxed);
        let tx_hash = self.synthetic_tx_hash(call, timestamp);
        self.record_gas(call, call.gas_limit, &tx_hash, timestamp);
        self.cumulative_gas
            .fetch_add(call.gas_limit, Ordering::Relaxed);

        self.emit(LedgerEvent::ExecutionFailed {
            address: call.contract_address.clone(),
            function: call.function_name.clone(),
            error: error.clone(),
        });
        ExecutionResult::failure(error, call.gas_limit)
    }

    fn record_gas(&self, call: &ContractCall, gas_used: u64, tx_hash: &str, timestamp: u64) {
        self.gas.record_usage(GasUsage {
            contract_address: call.contract_address.clone(),
            function_name: call.function_name.clone(),
            gas_used,
            gas_limit: call.gas_limit,
            gas_price: call.gas_price,
            cost: gas_used.saturating_mul(call.gas_price),
            timestamp,
            transaction_hash: tx_hash.to_string(),
        });
    }

    /// The call surface carries no transaction hash; state and gas records
    /// key on a canonical hash of the call instead.
    fn synthetic_tx_hash(&self, call: &ContractCall, timestamp: u64) -> String {
        canonical_hash(&[
            &call.sender,
            &call.contract_address,
            &call.function_name,
            &timestamp.to_string(),
            &self.cumulative_gas.load(Ordering::Relaxed).to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_contracts::{
        ContractEvent, ContractFunction, ContractParameter, Mutability, ParamType, Visibility,
    };
    use palisade_gas::GasPolicy;
    use palisade_state::StateConfig;
    use serde_json::json;

    const CONTRACT: &str = "0xcccccccccccccccccccccccccccccccccccccccc";
    const DEPLOYER: &str = "0xdddddddddddddddddddddddddddddddddddddddd";
    const SENDER: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn abi() -> ContractAbi {
        ContractAbi {
            functions: vec![
                ContractFunction {
                    name: "store".into(),
                    inputs: vec![ContractParameter::new("value", ParamType::Uint(256))],
                    outputs: vec![],
                    visibility: Visibility::Public,
                    mutability: Mutability::Nonpayable,
                    gas_limit: None,
                },
                ContractFunction {
                    name: "deposit".into(),
                    inputs: vec![ContractParameter::new("note", ParamType::String)],
                    outputs: vec![],
                    visibility: Visibility::Public,
                    mutability: Mutability::Payable,
                    gas_limit: None,
                },
                ContractFunction {
                    name: "peek".into(),
                    inputs: vec![ContractParameter::new("key", ParamType::String)],
                    outputs: vec![ContractParameter::new("value", ParamType::String)],
                    visibility: Visibility::Public,
                    mutability: Mutability::View,
                    gas_limit: None,
                },
            ],
            events: vec![ContractEvent {
                name: "Stored".into(),
                inputs: vec![],
            }],
        }
    }

    fn engine() -> ExecutionEngine {
        let state = Arc::new(StateManager::new(StateConfig {
            snapshot_interval_secs: 0,
            ..StateConfig::default()
        }));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy::default(),
            state,
            gas,
        );
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 0, 1_700_000_000)
            .unwrap();
        engine.set_block_env(1, 1_700_000_100);
        engine
    }

    fn call(function: &str, args: Vec<serde_json::Value>) -> ContractCall {
        ContractCall {
            contract_address: CONTRACT.into(),
            function_name: function.into(),
            args,
            sender: SENDER.into(),
            value: 0,
            gas_limit: 1_000_000,
            gas_price: 100,
        }
    }

    #[test]
    fn oversized_bytecode_is_rejected() {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy::default(),
            state,
            gas,
        );
        let big = "x".repeat(24_577);
        assert!(matches!(
            engine.register_contract(CONTRACT, DEPLOYER, abi(), &big, 0, 0),
            Err(ExecutionError::ContractTooLarge { .. })
        ));
    }

    #[test]
    fn registration_credits_attached_value() {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy::default(),
            state.clone(),
            gas,
        );
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 500, 0)
            .unwrap();
        assert_eq!(state.get_state(CONTRACT).unwrap().balance, 500);
    }

    #[tokio::test]
    async fn malformed_sender_is_rejected() {
        let e = engine();
        let mut c = call("store", vec![json!(1)]);
        c.sender = "not-an-address".into();
        let result = e.execute_call(c).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not a well-formed address"));
    }

    #[tokio::test]
    async fn value_to_non_payable_function_is_rejected() {
        let e = engine();
        let mut c = call("store", vec![json!(1)]);
        c.value = 10;
        let result = e.execute_call(c).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not payable"));
    }

    #[tokio::test]
    async fn value_to_payable_function_is_accepted() {
        let e = engine();
        let mut c = call("deposit", vec![json!("rent")]);
        c.value = 10;
        let result = e.execute_call(c).await;
        assert!(result.success, "{:?}", result.error);
    }

    #[tokio::test]
    async fn reentrancy_cap_is_a_lifetime_cap() {
        let e = engine();
        for _ in 0..3 {
            let result = e.execute_call(call("peek", vec![json!("k")])).await;
            assert!(result.success);
        }
        // The counter never resets, so the fourth call from the same
        // sender is rejected even though no call is actually nested.
        let result = e.execute_call(call("peek", vec![json!("k")])).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("reentrancy"));
    }

    #[tokio::test]
    async fn successful_call_commits_through_state_manager() {
        let state = Arc::new(StateManager::new(StateConfig {
            snapshot_interval_secs: 0,
            ..StateConfig::default()
        }));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy::default(),
            state.clone(),
            gas.clone(),
        );
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 0, 1_700_000_000)
            .unwrap();

        let result = engine.execute_call(call("store", vec![json!(7)])).await;
        assert!(result.success);
        assert_eq!(result.events.len(), 1);

        let committed = state.get_state(CONTRACT).unwrap();
        assert_eq!(committed.nonce, 1);
        assert!(committed.storage.contains_key("call_store_0"));
        assert_eq!(committed.version, 2);
        assert_eq!(gas.usage_history(CONTRACT).len(), 1);
        assert_eq!(engine.cumulative_gas(), result.gas_used);
        assert_eq!(engine.logs().len(), 1);
    }

    #[tokio::test]
    async fn failed_call_leaves_state_untouched_and_charges_full_limit() {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy::default(),
            state.clone(),
            gas,
        );
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 0, 1_700_000_000)
            .unwrap();
        let before = state.get_state(CONTRACT).unwrap();

        let mut c = call("store", vec![json!(7)]);
        c.gas_limit = 0; // context exhausted before dispatch
        let result = engine.execute_call(c).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("gas limit exceeded"));
        assert_eq!(result.gas_used, 0); // the full (zero) limit
        assert_eq!(state.get_state(CONTRACT).unwrap(), before);
    }

    #[tokio::test]
    async fn view_call_commits_nothing() {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy::default(),
            state.clone(),
            gas,
        );
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 0, 1_700_000_000)
            .unwrap();

        let result = engine.execute_call(call("peek", vec![json!("k")])).await;
        assert!(result.success);
        // No version bump for a read-only call.
        assert_eq!(state.get_state(CONTRACT).unwrap().version, 1);
    }

    #[tokio::test]
    async fn slow_dispatch_times_out_and_commits_nothing() {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy {
                max_execution_time: Duration::from_millis(20),
                ..ExecutionPolicy::default()
            },
            AccessPolicy::default(),
            state.clone(),
            gas.clone(),
        )
        .with_dispatch_delay(Duration::from_millis(200));
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 0, 1_700_000_000)
            .unwrap();

        let result = engine.execute_call(call("store", vec![json!(7)])).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        // A timed-out call charges the full limit but publishes nothing.
        assert_eq!(result.gas_used, 1_000_000);
        assert_eq!(state.get_state(CONTRACT).unwrap().version, 1);
        assert!(state.get_state(CONTRACT).unwrap().storage.is_empty());
        assert_eq!(gas.usage_history(CONTRACT).len(), 1);
    }

    #[tokio::test]
    async fn value_above_policy_ceiling_is_rejected_at_the_gate() {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let gas = Arc::new(GasMeter::new(GasPolicy::default()).unwrap());
        let engine = ExecutionEngine::new(
            ExecutionPolicy::default(),
            AccessPolicy {
                max_value_per_call: Some(100),
                ..AccessPolicy::default()
            },
            state,
            gas.clone(),
        );
        engine
            .register_contract(CONTRACT, DEPLOYER, abi(), "bytecode", 0, 1_700_000_000)
            .unwrap();

        let mut over = call("deposit", vec![json!("rent")]);
        over.value = 101;
        let result = engine.execute_call(over).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("per-call ceiling"));
        assert_eq!(result.gas_used, 0);
        assert!(gas.usage_history(CONTRACT).is_empty());

        let mut at_limit = call("deposit", vec![json!("rent")]);
        at_limit.value = 100;
        assert!(engine.execute_call(at_limit).await.success);
    }

    #[tokio::test]
    async fn unknown_contract_fails_without_gas_charge() {
        let e = engine();
        let mut c = call("store", vec![json!(1)]);
        c.contract_address = format!("0x{}", "9".repeat(40));
        let result = e.execute_call(c).await;
        assert!(!result.success);
        assert_eq!(result.gas_used, 0);
    }
}
