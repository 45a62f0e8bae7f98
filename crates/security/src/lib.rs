//! Heuristic security analysis of contract schemas.
//!
//! The analyzer works on ABI shape and naming alone — there is no bytecode
//! to inspect. Findings below High severity are advisory; Critical and High
//! findings fail the report and block deployment.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use palisade_contracts::{ContractAbi, ContractFunction};

/// Function-name fragments that are rejected outright.
static BLOCKED_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["selfdestruct", "delegatecall", "callcode", "suicide", "tx.origin"]
});

/// Name fragments suggesting a function performs arithmetic.
const ARITHMETIC_NAMES: &[&str] = &["add", "sub", "mul", "div", "calc", "compute"];
/// Name fragments suggesting a function moves or creates value.
const VALUE_MOVING_NAMES: &[&str] = &["transfer", "mint", "burn", "approve"];
/// Name fragments suggesting an access-control guard by convention.
const ROLE_CHECK_NAMES: &[&str] = &["only", "auth", "role", "guard", "restricted"];
/// Name fragments claiming administrative capability.
const ADMIN_NAMES: &[&str] = &["owner", "admin"];

/// Per-function gas declarations above this are flagged.
const GAS_LIMIT_FLAG_THRESHOLD: u64 = 1_000_000;
/// Reports cap the weighted risk sum here.
const MAX_RISK_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn weight(self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 5,
            Severity::Critical => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindingCategory {
    Static,
    Runtime,
    AccessControl,
    BlockedPattern,
}

/// One analyzer finding against a contract or a specific function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub severity: Severity,
    pub category: FindingCategory,
    pub function: Option<String>,
    pub message: String,
}

/// The analyzer's verdict for one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub contract_address: String,
    pub findings: Vec<SecurityFinding>,
    /// Severity-weighted sum, capped at 100.
    pub risk_score: u32,
    /// True when no Critical or High finding is present.
    pub passed: bool,
}

/// Call-side limits consumed by the execution engine's security gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Calls per `(contract, sender)` pair before rejection.
    pub max_reentrancy_depth: u32,
    /// Ceiling on the value attached to a single call; `None` is unlimited.
    pub max_value_per_call: Option<u64>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            max_reentrancy_depth: 3,
            max_value_per_call: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SecurityAnalyzer;

impl SecurityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, contract_address: &str, abi: &ContractAbi) -> SecurityReport {
        let mut findings = Vec::new();

        for function in &abi.functions {
            self.check_blocked_patterns(function, &mut findings);
            self.check_static(function, &mut findings);
            self.check_runtime_heuristics(function, &mut findings);
            self.check_access_control(function, &mut findings);
        }

        let callable = abi
            .functions
            .iter()
            .filter(|f| f.visibility.is_externally_callable())
            .count();
        if callable > 2 {
            findings.push(SecurityFinding {
                severity: Severity::Low,
                category: FindingCategory::Runtime,
                function: None,
                message: format!(
                    "{callable} externally callable functions; unchecked external calls possible"
                ),
            });
        }

        let risk_score = findings
            .iter()
            .map(|f| f.severity.weight())
            .sum::<u32>()
            .min(MAX_RISK_SCORE);
        let passed = !findings
            .iter()
            .any(|f| matches!(f.severity, Severity::Critical | Severity::High));

        debug!(contract_address, risk_score, passed, "security analysis complete");
        SecurityReport {
            contract_address: contract_address.to_string(),
            findings,
            risk_score,
            passed,
        }
    }

    fn check_blocked_patterns(&self, function: &ContractFunction, findings: &mut Vec<SecurityFinding>) {
        let name = function.name.to_lowercase();
        for pattern in BLOCKED_PATTERNS.iter() {
            if name.contains(pattern) {
                findings.push(SecurityFinding {
                    severity: Severity::Critical,
                    category: FindingCategory::BlockedPattern,
                    function: Some(function.name.clone()),
                    message: format!("matches blocked pattern {pattern}"),
                });
            }
        }
    }

    fn check_static(&self, function: &ContractFunction, findings: &mut Vec<SecurityFinding>) {
        if function.mutability.is_payable() && function.inputs.is_empty() {
            findings.push(SecurityFinding {
                severity: Severity::Medium,
                category: FindingCategory::Static,
                function: Some(function.name.clone()),
                message: "payable function accepts value without any validating inputs".into(),
            });
        }

        if let Some(limit) = function.gas_limit {
            if limit > GAS_LIMIT_FLAG_THRESHOLD {
                findings.push(SecurityFinding {
                    severity: Severity::Medium,
                    category: FindingCategory::Static,
                    function: Some(function.name.clone()),
                    message: format!("gas limit {limit} above {GAS_LIMIT_FLAG_THRESHOLD}"),
                });
            }
        }

        let name = function.name.to_lowercase();
        if function.visibility.is_externally_callable()
            && !ROLE_CHECK_NAMES.iter().any(|role| name.contains(role))
        {
            findings.push(SecurityFinding {
                severity: Severity::Low,
                category: FindingCategory::Static,
                function: Some(function.name.clone()),
                message: "publicly callable without an access-control naming convention".into(),
            });
        }
    }

    fn check_runtime_heuristics(&self, function: &ContractFunction, findings: &mut Vec<SecurityFinding>) {
        let name = function.name.to_lowercase();

        if name.contains("withdraw") && function.mutability.is_payable() {
            findings.push(SecurityFinding {
                severity: Severity::High,
                category: FindingCategory::Runtime,
                function: Some(function.name.clone()),
                message: "withdraw-named payable function; possible reentrancy".into(),
            });
        }

        if ARITHMETIC_NAMES.iter().any(|frag| name.contains(frag)) {
            findings.push(SecurityFinding {
                severity: Severity::Low,
                category: FindingCategory::Runtime,
                function: Some(function.name.clone()),
                message: "arithmetic-named function; possible overflow risk".into(),
            });
        }
    }

    fn check_access_control(&self, function: &ContractFunction, findings: &mut Vec<SecurityFinding>) {
        let name = function.name.to_lowercase();

        if ADMIN_NAMES.iter().any(|frag| name.contains(frag))
            && function.visibility.is_externally_callable()
        {
            findings.push(SecurityFinding {
                severity: Severity::High,
                category: FindingCategory::AccessControl,
                function: Some(function.name.clone()),
                message: "administrative function is publicly visible".into(),
            });
        }

        if VALUE_MOVING_NAMES.iter().any(|frag| name.contains(frag))
            && !ROLE_CHECK_NAMES.iter().any(|role| name.contains(role))
        {
            findings.push(SecurityFinding {
                severity: Severity::Medium,
                category: FindingCategory::AccessControl,
                function: Some(function.name.clone()),
                message: "value-moving function without role-check naming".into(),
            });
        }
    }
}
