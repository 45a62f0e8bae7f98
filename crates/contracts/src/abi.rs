//! Declarative contract schema.
//!
//! The ABI is supplied once at deployment and immutable thereafter. Every
//! parameter carries a fixed type tag with a concrete validation predicate;
//! argument values arrive as JSON, matching the call surface.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Per-function gas limits above this are rejected at deployment.
pub const MAX_FUNCTION_GAS_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("unknown parameter type tag: {0}")]
    UnknownType(String),
    #[error("contract declares no functions")]
    EmptyAbi,
    #[error("function {0} has no inputs and no outputs")]
    UselessFunction(String),
    #[error("function {function} declares gas limit {limit}, maximum is {MAX_FUNCTION_GAS_LIMIT}")]
    GasLimitTooHigh { function: String, limit: u64 },
    #[error("contract declares no public or external functions")]
    NoCallableFunctions,
}

/// Fixed parameter type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `uint8` through `uint256`; bare `uint` means 256 bits.
    Uint(u16),
    Int256,
    Address,
    Bool,
    String,
    Bytes,
    Bytes32,
}

impl ParamType {
    /// Concrete validation predicate for one argument value.
    pub fn validates(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::Uint(_) => value.as_u64().is_some(),
            ParamType::Int256 => value.as_i64().is_some(),
            ParamType::Address => value
                .as_str()
                .map(|s| s.len() == 42 && s.starts_with("0x"))
                .unwrap_or(false),
            ParamType::Bool => value.is_boolean(),
            ParamType::String => value.is_string(),
            ParamType::Bytes | ParamType::Bytes32 => value.is_string(),
        }
    }

    /// Interpreter-side gas cost of passing one argument of this type.
    /// `argc` is the total argument count of the call.
    pub fn dispatch_cost(&self, argc: usize) -> u64 {
        match self {
            ParamType::String => 100 + 10 * argc as u64,
            ParamType::Bytes | ParamType::Bytes32 => 100,
            _ => 50,
        }
    }
}

impl FromStr for ParamType {
    type Err = AbiError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "int256" => return Ok(ParamType::Int256),
            "address" => return Ok(ParamType::Address),
            "bool" => return Ok(ParamType::Bool),
            "string" => return Ok(ParamType::String),
            "bytes" => return Ok(ParamType::Bytes),
            "bytes32" => return Ok(ParamType::Bytes32),
            "uint" => return Ok(ParamType::Uint(256)),
            _ => {}
        }
        if let Some(bits) = tag.strip_prefix("uint") {
            if let Ok(bits) = bits.parse::<u16>() {
                if bits >= 8 && bits <= 256 && bits % 8 == 0 {
                    return Ok(ParamType::Uint(bits));
                }
            }
        }
        Err(AbiError::UnknownType(tag.to_string()))
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Uint(bits) => write!(f, "uint{bits}"),
            ParamType::Int256 => write!(f, "int256"),
            ParamType::Address => write!(f, "address"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::String => write!(f, "string"),
            ParamType::Bytes => write!(f, "bytes"),
            ParamType::Bytes32 => write!(f, "bytes32"),
        }
    }
}

impl Serialize for ParamType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ParamType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = std::string::String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Internal,
    External,
}

impl Visibility {
    pub fn is_externally_callable(self) -> bool {
        matches!(self, Visibility::Public | Visibility::External)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    Pure,
    View,
    Nonpayable,
    Payable,
}

impl Mutability {
    pub fn is_read_only(self) -> bool {
        matches!(self, Mutability::Pure | Mutability::View)
    }

    pub fn is_payable(self) -> bool {
        matches!(self, Mutability::Payable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
}

impl ContractParameter {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractFunction {
    pub name: String,
    pub inputs: Vec<ContractParameter>,
    pub outputs: Vec<ContractParameter>,
    pub visibility: Visibility,
    pub mutability: Mutability,
    /// Per-function gas ceiling; the call context's limit applies when unset.
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub name: String,
    pub inputs: Vec<ContractParameter>,
}

/// The complete declared schema of a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAbi {
    pub functions: Vec<ContractFunction>,
    pub events: Vec<ContractEvent>,
}

impl ContractAbi {
    pub fn function(&self, name: &str) -> Option<&ContractFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Deployment-side schema rules: a non-empty ABI, no function that is
    /// both input-less and output-less, per-function gas limits within the
    /// ceiling, and at least one externally callable function.
    pub fn validate_for_deployment(&self) -> Result<(), AbiError> {
        if self.functions.is_empty() {
            return Err(AbiError::EmptyAbi);
        }
        for function in &self.functions {
            if function.inputs.is_empty() && function.outputs.is_empty() {
                return Err(AbiError::UselessFunction(function.name.clone()));
            }
            if let Some(limit) = function.gas_limit {
                if limit > MAX_FUNCTION_GAS_LIMIT {
                    return Err(AbiError::GasLimitTooHigh {
                        function: function.name.clone(),
                        limit,
                    });
                }
            }
        }
        if !self
            .functions
            .iter()
            .any(|f| f.visibility.is_externally_callable())
        {
            return Err(AbiError::NoCallableFunctions);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn function(name: &str, visibility: Visibility) -> ContractFunction {
        ContractFunction {
            name: name.to_string(),
            inputs: vec![ContractParameter::new("value", ParamType::Uint(256))],
            outputs: vec![],
            visibility,
            mutability: Mutability::Nonpayable,
            gas_limit: None,
        }
    }

    #[test]
    fn param_type_tags_round_trip() {
        for tag in ["uint8", "uint256", "int256", "address", "bool", "string", "bytes", "bytes32"] {
            let parsed: ParamType = tag.parse().unwrap();
            assert_eq!(parsed.to_string(), tag);
        }
        assert_eq!("uint".parse::<ParamType>().unwrap(), ParamType::Uint(256));
        assert!("uint7".parse::<ParamType>().is_err());
        assert!("float".parse::<ParamType>().is_err());
    }

    #[test]
    fn predicates_match_their_types() {
        assert!(ParamType::Uint(256).validates(&json!(5)));
        assert!(!ParamType::Uint(256).validates(&json!(-5)));
        assert!(ParamType::Int256.validates(&json!(-5)));
        assert!(ParamType::Address.validates(&json!(format!("0x{}", "a".repeat(40)))));
        assert!(!ParamType::Address.validates(&json!("0xshort")));
        assert!(ParamType::Bool.validates(&json!(true)));
        assert!(!ParamType::Bool.validates(&json!("true")));
        assert!(ParamType::String.validates(&json!("hello")));
        assert!(ParamType::Bytes32.validates(&json!("deadbeef")));
    }

    #[test]
    fn deployment_validation_rules() {
        let empty = ContractAbi::default();
        assert_eq!(empty.validate_for_deployment(), Err(AbiError::EmptyAbi));

        let mut useless = ContractAbi::default();
        useless.functions.push(ContractFunction {
            inputs: vec![],
            outputs: vec![],
            ..function("noop", Visibility::Public)
        });
        assert_eq!(
            useless.validate_for_deployment(),
            Err(AbiError::UselessFunction("noop".into()))
        );

        let mut greedy = ContractAbi::default();
        greedy.functions.push(ContractFunction {
            gas_limit: Some(MAX_FUNCTION_GAS_LIMIT + 1),
            ..function("burn_gas", Visibility::Public)
        });
        assert!(matches!(
            greedy.validate_for_deployment(),
            Err(AbiError::GasLimitTooHigh { .. })
        ));

        let mut hidden = ContractAbi::default();
        hidden.functions.push(function("secret", Visibility::Private));
        assert_eq!(
            hidden.validate_for_deployment(),
            Err(AbiError::NoCallableFunctions)
        );

        let mut valid = ContractAbi::default();
        valid.functions.push(function("transfer", Visibility::Public));
        assert!(valid.validate_for_deployment().is_ok());
    }
}
