//! Deployment validation and lifecycle.
//!
//! Every deployment passes the same pipeline: request validation, optional
//! approval, schema rules, security analysis, address derivation, engine
//! registration, then constructor execution when the ABI declares one.
//! Sub-fatal analyzer findings surface as warnings on the result instead
//! of blocking.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use palisade_contracts::{AbiError, ContractAbi};
use palisade_security::{SecurityAnalyzer, Severity};
use palisade_types::canonical_hash;

use crate::engine::{ContractCall, ExecutionEngine, ExecutionError};

/// Deployment-side limits.
#[derive(Debug, Clone)]
pub struct DeploymentPolicy {
    /// When set, a deployment must present a previously issued approval.
    pub require_approval: bool,
    /// Ceiling on the gas limit a deployment request may carry.
    pub max_gas_limit: u64,
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            require_approval: false,
            max_gas_limit: 10_000_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("deployment request carries no bytecode")]
    MissingBytecode,
    #[error("deployment request carries no ABI")]
    MissingAbi,
    #[error("deployer {0} is not a well-formed address")]
    InvalidDeployer(String),
    #[error("requested gas limit {requested} exceeds the deployment ceiling {limit}")]
    GasLimitTooHigh { requested: u64, limit: u64 },
    #[error("constructor expects {expected} arguments, got {got}")]
    ConstructorArity { expected: usize, got: usize },
    #[error("deployment requires approval and none was presented")]
    ApprovalRequired,
    #[error("security analysis failed with risk score {risk_score}")]
    SecurityRejected { risk_score: u32 },
    #[error("contract {0} already carries a verification record")]
    AlreadyVerified(String),
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// One request to deploy a contract.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub deployer: String,
    pub bytecode: String,
    pub abi: ContractAbi,
    pub constructor_args: Vec<serde_json::Value>,
    pub gas_limit: u64,
    pub gas_price: u64,
    /// Value credited to the contract's initial balance.
    pub value: u64,
    pub timestamp: u64,
}

/// Outcome of one accepted deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub contract_address: Option<String>,
    pub gas_used: u64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Source-verification metadata attached to a deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractVerification {
    pub contract_address: String,
    pub source_hash: String,
    pub compiler: String,
    pub compiler_version: String,
    pub verified_at: u64,
}

/// Runs the deployment pipeline in front of the execution engine.
pub struct DeploymentManager {
    policy: DeploymentPolicy,
    engine: Arc<ExecutionEngine>,
    analyzer: SecurityAnalyzer,
    approvals: Mutex<HashSet<String>>,
    verifications: Mutex<HashMap<String, ContractVerification>>,
}

impl DeploymentManager {
    pub fn new(policy: DeploymentPolicy, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            policy,
            engine,
            analyzer: SecurityAnalyzer::new(),
            approvals: Mutex::new(HashSet::new()),
            verifications: Mutex::new(HashMap::new()),
        }
    }

    /// Issue an approval for one specific deployment request. The token is
    /// bound to the deployer, bytecode, and timestamp, and is consumed by
    /// the first matching deployment.
    pub fn approve(&self, deployer: &str, bytecode: &str, timestamp: u64) -> String {
        let token = approval_token(deployer, bytecode, timestamp);
        self.approvals.lock().insert(token.clone());
        info!(deployer, "deployment approved");
        token
    }

    /// Validate and deploy one contract.
    ///
    /// Pipeline errors come back as `Err`; once the contract is registered,
    /// a failing constructor is reported on the result instead, since the
    /// registration itself stands.
    pub async fn deploy(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentResult, DeploymentError> {
        self.validate(&request)?;

        if self.policy.require_approval {
            let token = approval_token(&request.deployer, &request.bytecode, request.timestamp);
            if !self.approvals.lock().remove(&token) {
                return Err(DeploymentError::ApprovalRequired);
            }
        }

        request.abi.validate_for_deployment()?;

        let constructor = request.abi.function("constructor").cloned();
        if let Some(ctor) = &constructor {
            if request.constructor_args.len() != ctor.inputs.len() {
                return Err(DeploymentError::ConstructorArity {
                    expected: ctor.inputs.len(),
                    got: request.constructor_args.len(),
                });
            }
        }

        let address = derive_address(&request.deployer, request.timestamp);

        let report = self.analyzer.analyze(&address, &request.abi);
        if !report.passed {
            warn!(
                deployer = %request.deployer,
                risk_score = report.risk_score,
                "deployment rejected by security analysis"
            );
            return Err(DeploymentError::SecurityRejected {
                risk_score: report.risk_score,
            });
        }
        let warnings: Vec<String> = report
            .findings
            .iter()
            .filter(|f| f.severity >= Severity::Medium)
            .map(|f| f.message.clone())
            .collect();

        self.engine.register_contract(
            &address,
            &request.deployer,
            request.abi.clone(),
            &request.bytecode,
            request.value,
            request.timestamp,
        )?;

        let mut gas_used = 0;
        let mut success = true;
        let mut error = None;
        if let Some(ctor) = constructor {
            if ctor.visibility.is_externally_callable() {
                let outcome = self
                    .engine
                    .execute_call(ContractCall {
                        contract_address: address.clone(),
                        function_name: ctor.name,
                        args: request.constructor_args.clone(),
                        sender: request.deployer.clone(),
                        value: 0,
                        gas_limit: request.gas_limit,
                        gas_price: request.gas_price,
                    })
                    .await;
                gas_used = outcome.gas_used;
                success = outcome.success;
                error = outcome.error;
            }
        }

        info!(address = %address, deployer = %request.deployer, gas_used, "contract deployed");
        Ok(DeploymentResult {
            success,
            contract_address: Some(address),
            gas_used,
            warnings,
            error,
        })
    }

    fn validate(&self, request: &DeploymentRequest) -> Result<(), DeploymentError> {
        if request.bytecode.is_empty() {
            return Err(DeploymentError::MissingBytecode);
        }
        if request.abi.functions.is_empty() && request.abi.events.is_empty() {
            return Err(DeploymentError::MissingAbi);
        }
        if request.deployer.len() != 42 || !request.deployer.starts_with("0x") {
            return Err(DeploymentError::InvalidDeployer(request.deployer.clone()));
        }
        if request.gas_limit > self.policy.max_gas_limit {
            return Err(DeploymentError::GasLimitTooHigh {
                requested: request.gas_limit,
                limit: self.policy.max_gas_limit,
            });
        }
        Ok(())
    }

    /// Attach a verification record. Each contract verifies at most once.
    pub fn set_verification(
        &self,
        verification: ContractVerification,
    ) -> Result<(), DeploymentError> {
        let mut verifications = self.verifications.lock();
        if verifications.contains_key(&verification.contract_address) {
            return Err(DeploymentError::AlreadyVerified(
                verification.contract_address,
            ));
        }
        info!(address = %verification.contract_address, "verification recorded");
        verifications.insert(verification.contract_address.clone(), verification);
        Ok(())
    }

    pub fn verification(&self, address: &str) -> Option<ContractVerification> {
        self.verifications.lock().get(address).cloned()
    }
}

fn approval_token(deployer: &str, bytecode: &str, timestamp: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(deployer.as_bytes());
    hasher.update(bytecode.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Contract addresses hash the deployer and deployment time; the first 20
/// bytes of the digest become the address.
fn derive_address(deployer: &str, timestamp: u64) -> String {
    let digest = canonical_hash(&[deployer, &timestamp.to_string()]);
    format!("0x{}", &digest[..40])
}
