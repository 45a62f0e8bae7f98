//! Versioned contract-state management.
//!
//! The state manager exclusively owns every [`ContractState`]. The
//! execution engine works on a copy per call and publishes results through
//! [`StateManager::update_contract_state`], which is where diffing,
//! transition records, per-key history, and snapshotting all happen —
//! mutation through any other path would silently skip them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use palisade_contracts::ContractState;
use palisade_types::LedgerEvent;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state for {address} is {size} bytes, limit is {limit}")]
    StorageLimitExceeded {
        address: String,
        size: usize,
        limit: usize,
    },
    #[error("contract {0} not found")]
    ContractNotFound(String),
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),
    #[error("snapshot codec failed: {0}")]
    Codec(String),
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// State manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Serialized-size ceiling per contract, bytes.
    pub max_storage_size: usize,
    /// Minimum seconds between automatic snapshots; 0 snapshots every update.
    pub snapshot_interval_secs: u64,
    /// Snapshot ring size per contract; oldest dropped first.
    pub max_snapshots: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_storage_size: 1_000_000,
            snapshot_interval_secs: 300,
            max_snapshots: 10,
        }
    }
}

/// Storage keys touched by one update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// One recorded version transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub contract_address: String,
    pub from_version: u32,
    pub to_version: u32,
    pub diff: StateDiff,
    pub transaction_hash: String,
    pub block_number: u64,
    pub timestamp: u64,
}

/// One entry in a storage key's value timeline. `value` is `None` when the
/// update deleted the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    pub value: Option<String>,
    pub transaction_hash: String,
    pub block_number: u64,
    pub timestamp: u64,
}

/// A point-in-time copy of one contract's state. The payload is the
/// codec-encoded serialized state; with the identity codec it is the JSON
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub contract_address: String,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub block_number: u64,
    pub transaction_hash: String,
    pub size: usize,
    pub compressed: bool,
    pub encrypted: bool,
}

/// Pluggable snapshot transform. Real codecs supply compression and
/// encryption; the default does neither. The snapshot lifecycle never
/// special-cases the codec.
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, raw: Vec<u8>) -> Result<Vec<u8>, StateError>;
    fn decode(&self, payload: Vec<u8>) -> Result<Vec<u8>, StateError>;
    fn compresses(&self) -> bool {
        false
    }
    fn encrypts(&self) -> bool {
        false
    }
}

/// The default pass-through codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl SnapshotCodec for IdentityCodec {
    fn encode(&self, raw: Vec<u8>) -> Result<Vec<u8>, StateError> {
        Ok(raw)
    }

    fn decode(&self, payload: Vec<u8>) -> Result<Vec<u8>, StateError> {
        Ok(payload)
    }
}

/// Owner of all contract states, their histories, and their snapshots.
pub struct StateManager {
    config: StateConfig,
    codec: Box<dyn SnapshotCodec>,
    states: RwLock<HashMap<String, ContractState>>,
    snapshots: RwLock<HashMap<String, VecDeque<StateSnapshot>>>,
    transitions: RwLock<Vec<StateTransition>>,
    key_history: RwLock<HashMap<(String, String), Vec<KeyChange>>>,
    last_snapshot_at: RwLock<HashMap<String, u64>>,
    events: Option<mpsc::UnboundedSender<LedgerEvent>>,
}

impl StateManager {
    pub fn new(config: StateConfig) -> Self {
        Self::with_codec(config, Box::new(IdentityCodec))
    }

    pub fn with_codec(config: StateConfig, codec: Box<dyn SnapshotCodec>) -> Self {
        Self {
            config,
            codec,
            states: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            transitions: RwLock::new(Vec::new()),
            key_history: RwLock::new(HashMap::new()),
            last_snapshot_at: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Attach the outbound ledger-event channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<LedgerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: LedgerEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("ledger event receiver dropped; state change not audited");
            }
        }
    }

    /// Register a freshly deployed contract's initial state.
    pub fn register_contract(&self, state: ContractState) -> Result<(), StateError> {
        self.check_size(&state)?;
        debug!(address = %state.address, "registering contract state");
        self.states.write().insert(state.address.clone(), state);
        Ok(())
    }

    pub fn get_state(&self, address: &str) -> Option<ContractState> {
        self.states.read().get(address).cloned()
    }

    pub fn contract_count(&self) -> usize {
        self.states.read().len()
    }

    fn check_size(&self, state: &ContractState) -> Result<(), StateError> {
        let size = state.serialized_size();
        if size > self.config.max_storage_size {
            return Err(StateError::StorageLimitExceeded {
                address: state.address.clone(),
                size,
                limit: self.config.max_storage_size,
            });
        }
        Ok(())
    }

    /// Publish one call's resulting state.
    ///
    /// Computes the storage diff against the prior version, records the
    /// transition and per-key history, bumps the version, and snapshots on
    /// the configured interval.
    pub fn update_contract_state(
        &self,
        address: &str,
        mut new_state: ContractState,
        transaction_hash: &str,
        block_number: u64,
    ) -> Result<StateDiff, StateError> {
        self.check_size(&new_state)?;

        let timestamp = unix_now();
        let diff;
        let to_version;
        {
            let mut states = self.states.write();
            let prior = states
                .get(address)
                .ok_or_else(|| StateError::ContractNotFound(address.to_string()))?;

            diff = diff_storage(prior, &new_state);
            to_version = prior.version + 1;
            new_state.version = to_version;

            let mut history = self.key_history.write();
            for key in diff.added.iter().chain(&diff.modified) {
                history
                    .entry((address.to_string(), key.clone()))
                    .or_default()
                    .push(KeyChange {
                        value: new_state.storage.get(key).cloned(),
                        transaction_hash: transaction_hash.to_string(),
                        block_number,
                        timestamp,
                    });
            }
            for key in &diff.deleted {
                history
                    .entry((address.to_string(), key.clone()))
                    .or_default()
                    .push(KeyChange {
                        value: None,
                        transaction_hash: transaction_hash.to_string(),
                        block_number,
                        timestamp,
                    });
            }

            self.transitions.write().push(StateTransition {
                contract_address: address.to_string(),
                from_version: to_version - 1,
                to_version,
                diff: diff.clone(),
                transaction_hash: transaction_hash.to_string(),
                block_number,
                timestamp,
            });

            states.insert(address.to_string(), new_state.clone());
        }

        self.emit(LedgerEvent::StateUpdated {
            address: address.to_string(),
            version: to_version,
            keys_added: diff.added.len(),
            keys_modified: diff.modified.len(),
            keys_deleted: diff.deleted.len(),
        });

        let due = {
            let last = self.last_snapshot_at.read();
            last.get(address)
                .map(|at| timestamp.saturating_sub(*at) >= self.config.snapshot_interval_secs)
                .unwrap_or(true)
        };
        if due {
            self.take_snapshot(&new_state, transaction_hash, block_number, timestamp)?;
        }

        Ok(diff)
    }

    /// Force a snapshot of the current state, outside the interval schedule.
    pub fn snapshot_now(
        &self,
        address: &str,
        transaction_hash: &str,
        block_number: u64,
    ) -> Result<String, StateError> {
        let state = self
            .get_state(address)
            .ok_or_else(|| StateError::ContractNotFound(address.to_string()))?;
        self.take_snapshot(&state, transaction_hash, block_number, unix_now())
    }

    fn take_snapshot(
        &self,
        state: &ContractState,
        transaction_hash: &str,
        block_number: u64,
        timestamp: u64,
    ) -> Result<String, StateError> {
        let raw = state.serialize()?.into_bytes();
        let payload = self.codec.encode(raw)?;
        let snapshot = StateSnapshot {
            id: Uuid::new_v4().to_string(),
            contract_address: state.address.clone(),
            size: payload.len(),
            payload,
            timestamp,
            block_number,
            transaction_hash: transaction_hash.to_string(),
            compressed: self.codec.compresses(),
            encrypted: self.codec.encrypts(),
        };
        let id = snapshot.id.clone();

        {
            let mut snapshots = self.snapshots.write();
            let ring = snapshots.entry(state.address.clone()).or_default();
            ring.push_back(snapshot);
            while ring.len() > self.config.max_snapshots {
                ring.pop_front();
            }
        }
        self.last_snapshot_at
            .write()
            .insert(state.address.clone(), timestamp);

        info!(address = %state.address, snapshot_id = %id, block_number, "snapshot created");
        self.emit(LedgerEvent::SnapshotCreated {
            address: state.address.clone(),
            snapshot_id: id.clone(),
            block_number,
        });
        Ok(id)
    }

    /// Replace the live state with a snapshot's decoded contents.
    pub fn restore_from_snapshot(
        &self,
        address: &str,
        snapshot_id: &str,
    ) -> Result<(), StateError> {
        let payload = {
            let snapshots = self.snapshots.read();
            snapshots
                .get(address)
                .and_then(|ring| ring.iter().find(|s| s.id == snapshot_id))
                .map(|s| s.payload.clone())
                .ok_or_else(|| StateError::SnapshotNotFound(snapshot_id.to_string()))?
        };

        let raw = self.codec.decode(payload)?;
        let text = String::from_utf8(raw).map_err(|e| StateError::Codec(e.to_string()))?;
        let restored = ContractState::deserialize(&text)?;

        info!(address, snapshot_id, "restored state from snapshot");
        self.states.write().insert(address.to_string(), restored);
        Ok(())
    }

    pub fn snapshots_for(&self, address: &str) -> Vec<StateSnapshot> {
        self.snapshots
            .read()
            .get(address)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recorded timeline for one storage key, oldest first.
    pub fn key_history(&self, address: &str, key: &str) -> Vec<KeyChange> {
        self.key_history
            .read()
            .get(&(address.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn transitions_for(&self, address: &str) -> Vec<StateTransition> {
        self.transitions
            .read()
            .iter()
            .filter(|t| t.contract_address == address)
            .cloned()
            .collect()
    }
}

fn diff_storage(prior: &ContractState, next: &ContractState) -> StateDiff {
    let mut diff = StateDiff::default();
    for (key, value) in &next.storage {
        match prior.storage.get(key) {
            None => diff.added.push(key.clone()),
            Some(old) if old != value => diff.modified.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in prior.storage.keys() {
        if !next.storage.contains_key(key) {
            diff.deleted.push(key.clone());
        }
    }
    diff
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
