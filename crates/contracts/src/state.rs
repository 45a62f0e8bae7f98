//! Per-contract state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full persistent state of one deployed contract.
///
/// Owned exclusively by the state manager; the execution engine works on a
/// copy for the duration of a call and publishes the result back through
/// the manager's update path. The nonce increments on every storage
/// mutation, not per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    pub address: String,
    pub balance: u64,
    pub nonce: u64,
    pub code: String,
    pub storage: BTreeMap<String, String>,
    pub deployed_at: u64,
    pub deployed_by: String,
    pub version: u32,
}

impl ContractState {
    pub fn new(
        address: impl Into<String>,
        code: impl Into<String>,
        deployed_by: impl Into<String>,
        deployed_at: u64,
    ) -> Self {
        Self {
            address: address.into(),
            balance: 0,
            nonce: 0,
            code: code.into(),
            storage: BTreeMap::new(),
            deployed_at,
            deployed_by: deployed_by.into(),
            version: 1,
        }
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialized byte size, the quantity bounded by the storage limit.
    pub fn serialized_size(&self) -> usize {
        self.serialize().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip_preserves_storage() {
        let mut state = ContractState::new("0xabc", "code", "0xdeployer", 1_700_000_000);
        state.storage.insert("owner".into(), "0xdeployer".into());
        state.storage.insert("total".into(), "1000".into());
        state.storage.insert("weird key \"quoted\"".into(), "v\n1".into());
        state.nonce = 7;
        state.balance = 42;

        let raw = state.serialize().unwrap();
        let restored = ContractState::deserialize(&raw).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn serialized_size_grows_with_storage() {
        let mut state = ContractState::new("0xabc", "code", "0xdeployer", 0);
        let before = state.serialized_size();
        state.storage.insert("key".into(), "value".into());
        assert!(state.serialized_size() > before);
    }
}
