//! Proof-of-Authority consensus engine.
//!
//! A fixed, permissioned validator set proposes and votes on blocks by
//! identity. The engine owns the round-robin proposer cursor and the
//! pending-vote tallies; finality for a block hash is a one-shot event —
//! once a majority (approve or reject) is reached the tally is cleared, and
//! any later vote for the same hash starts a fresh one.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use palisade_crypto::{verify_hex, KeyPair};
use palisade_storage::LedgerStore;
use palisade_types::{Block, BlockBuilder, BlockError, LedgerEvent, Transaction, Vote};


pub type ValidatorId = String;

/// Consensus errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("node {0} is not an authorized validator")]
    Unauthorized(String),
    #[error("vote target {0} was not proposed in the current round")]
    VoteTargetUnknown(String),
    #[error("invalid consensus configuration: {0}")]
    InvalidConfig(String),
    #[error("block construction failed: {0}")]
    Block(#[from] BlockError),
}

/// Role the local node plays in the network. Only authorities and
/// validators may propose or vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NodeRole {
    Authority,
    Validator,
    Observer,
}

impl NodeRole {
    fn may_participate(self) -> bool {
        matches!(self, NodeRole::Authority | NodeRole::Validator)
    }
}

/// PoA engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoaConfig {
    /// Target spacing between blocks, milliseconds.
    pub block_time_ms: u64,
    /// Initial ordered validator set.
    pub validators: Vec<ValidatorId>,
    /// Gas limit stamped into proposed blocks.
    pub block_gas_limit: u64,
    /// Minimum validator-set size the node will run with.
    pub min_validators: usize,
    /// How long a candidate block accepts votes, milliseconds.
    pub voting_period_ms: u64,
}

impl Default for PoaConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 5_000,
            validators: vec![],
            block_gas_limit: 8_000_000,
            min_validators: 1,
            voting_period_ms: 30_000,
        }
    }
}

impl PoaConfig {
    /// Fatal misconfiguration surfaces here, at startup.
    pub fn validate(&self, node_id: &str, role: NodeRole) -> Result<(), ConsensusError> {
        if self.min_validators == 0 {
            return Err(ConsensusError::InvalidConfig(
                "min_validators must be at least 1".into(),
            ));
        }
        if self.validators.len() < self.min_validators {
            return Err(ConsensusError::InvalidConfig(format!(
                "validator set has {} members, minimum is {}",
                self.validators.len(),
                self.min_validators
            )));
        }
        let mut seen = HashSet::new();
        for validator in &self.validators {
            if !seen.insert(validator) {
                return Err(ConsensusError::InvalidConfig(format!(
                    "duplicate validator id {validator}"
                )));
            }
        }
        if role.may_participate() && !self.validators.iter().any(|v| v == node_id) {
            return Err(ConsensusError::InvalidConfig(format!(
                "node {node_id} has role {role:?} but is not in the validator set"
            )));
        }
        Ok(())
    }
}

/// Proof-of-Authority consensus engine.
pub struct PoaEngine {
    config: PoaConfig,
    node_id: ValidatorId,
    role: NodeRole,
    keypair: KeyPair,
    store: Arc<dyn LedgerStore>,
    validators: RwLock<Vec<ValidatorId>>,
    validator_keys: RwLock<HashMap<ValidatorId, String>>,
    cursor: Mutex<usize>,
    /// Tallies for candidate hashes. One lock guards read-tally-then-write
    /// so near-simultaneous votes cannot both observe a pre-majority count.
    pending_votes: Mutex<HashMap<String, Vec<Vote>>>,
    /// Hashes proposed and not yet finalized; vote targets must be known.
    /// Pruned by `tally` when a hash reaches finality.
    proposed: Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<LedgerEvent>,
}

impl PoaEngine {
    /// Build an engine and the receiving half of its event channel. The
    /// audit collaborator consumes the receiver.
    pub fn new(
        config: PoaConfig,
        node_id: impl Into<ValidatorId>,
        role: NodeRole,
        keypair: KeyPair,
        store: Arc<dyn LedgerStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LedgerEvent>), ConsensusError> {
        let node_id = node_id.into();
        config.validate(&node_id, role)?;

        let (events, receiver) = mpsc::unbounded_channel();
        let validators = config.validators.clone();
        let mut validator_keys = HashMap::new();
        validator_keys.insert(node_id.clone(), keypair.public_key_hex());

        info!(
            node = %node_id,
            ?role,
            validators = validators.len(),
            "starting PoA consensus engine"
        );

        Ok((
            Self {
                config,
                node_id,
                role,
                keypair,
                store,
                validators: RwLock::new(validators),
                validator_keys: RwLock::new(validator_keys),
                cursor: Mutex::new(0),
                pending_votes: Mutex::new(HashMap::new()),
                proposed: Mutex::new(HashSet::new()),
                events,
            },
            receiver,
        ))
    }

    /// Register the verifying key for a remote validator. Votes from
    /// validators without a registered key are rejected.
    pub fn register_validator_key(&self, validator: impl Into<ValidatorId>, public_key_hex: String) {
        self.validator_keys
            .write()
            .insert(validator.into(), public_key_hex);
    }

    fn authorize(&self) -> Result<(), ConsensusError> {
        let in_set = self.validators.read().iter().any(|v| v == &self.node_id);
        if in_set && self.role.may_participate() {
            Ok(())
        } else {
            Err(ConsensusError::Unauthorized(self.node_id.clone()))
        }
    }

    fn emit(&self, event: LedgerEvent) {
        if self.events.send(event).is_err() {
            warn!("ledger event receiver dropped; audit trail is dark");
        }
    }

    /// Propose a block extending the current chain head.
    ///
    /// The block is signed but not stored; ownership stays with the
    /// consensus layer until the vote tally finalizes it.
    pub fn propose_block(&self, transactions: Vec<Transaction>) -> Result<Block, ConsensusError> {
        self.authorize()?;

        let parent_hash = self.store.latest_block_hash();
        let number = self.store.latest_block_number() + 1;

        let mut block = BlockBuilder::new(parent_hash, number, self.node_id.clone())
            .transactions(transactions)
            .gas_limit(self.config.block_gas_limit)
            .build()?;
        block.signature = self.keypair.sign_hex(block.hash.as_bytes());

        self.proposed.lock().insert(block.hash.clone());
        debug!(number, hash = %block.hash, "proposed block");
        self.emit(LedgerEvent::BlockProposed {
            block_hash: block.hash.clone(),
            number,
            validator: self.node_id.clone(),
            transaction_count: block.transactions.len(),
        });

        Ok(block)
    }

    /// Cast the local node's vote on a candidate block hash.
    pub fn vote_on_block(&self, block_hash: &str, approve: bool) -> Result<Vote, ConsensusError> {
        self.authorize()?;

        if !self.proposed.lock().contains(block_hash) {
            return Err(ConsensusError::VoteTargetUnknown(block_hash.to_string()));
        }

        let mut vote = Vote {
            validator: self.node_id.clone(),
            block_hash: block_hash.to_string(),
            approve,
            signature: String::new(),
            timestamp: unix_now(),
        };
        vote.signature = self.keypair.sign_hex(&vote.signing_payload());

        self.emit(LedgerEvent::VoteCast {
            block_hash: vote.block_hash.clone(),
            validator: vote.validator.clone(),
            approve,
        });

        Ok(vote)
    }

    /// Record a vote received from a validator.
    ///
    /// Fails closed (`false`) when the vote's Ed25519 signature does not
    /// verify against the registered key. Otherwise the vote is appended
    /// and the tally is checked in the same critical section; the return
    /// value is whether this vote finalized the block as approved.
    pub fn add_vote(&self, vote: Vote) -> bool {
        if !self.verify_vote_signature(&vote) {
            warn!(
                validator = %vote.validator,
                block_hash = %vote.block_hash,
                "rejecting vote with bad signature"
            );
            return false;
        }

        let mut pending = self.pending_votes.lock();
        let block_hash = vote.block_hash.clone();
        pending.entry(block_hash.clone()).or_default().push(vote);
        self.tally(&mut pending, &block_hash)
    }

    fn verify_vote_signature(&self, vote: &Vote) -> bool {
        let keys = self.validator_keys.read();
        let Some(public_key) = keys.get(&vote.validator) else {
            return false;
        };
        verify_hex(public_key, &vote.signing_payload(), &vote.signature)
    }

    /// Re-check the tally for a candidate hash.
    pub fn check_consensus(&self, block_hash: &str) -> bool {
        let mut pending = self.pending_votes.lock();
        self.tally(&mut pending, block_hash)
    }

    /// Majority check under the tally lock. `required = n/2 + 1`.
    fn tally(&self, pending: &mut HashMap<String, Vec<Vote>>, block_hash: &str) -> bool {
        let validator_count = self.validators.read().len();
        let required = validator_count / 2 + 1;

        let Some(votes) = pending.get(block_hash) else {
            return false;
        };
        let approvals = votes.iter().filter(|v| v.approve).count();
        let rejections = votes.len() - approvals;

        if approvals >= required {
            info!(block_hash, approvals, required, "consensus reached: approved");
            pending.remove(block_hash);
            self.proposed.lock().remove(block_hash);
            self.emit(LedgerEvent::ConsensusReached {
                block_hash: block_hash.to_string(),
                approved: true,
            });
            return true;
        }
        if rejections >= required {
            info!(block_hash, rejections, required, "consensus reached: rejected");
            pending.remove(block_hash);
            self.proposed.lock().remove(block_hash);
            self.emit(LedgerEvent::ConsensusReached {
                block_hash: block_hash.to_string(),
                approved: false,
            });
            return false;
        }
        false
    }

    /// Round-robin proposer selection. Returns each validator once per
    /// rotation, in set order; `None` when the set is empty.
    pub fn next_validator(&self) -> Option<ValidatorId> {
        let validators = self.validators.read();
        if validators.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let selected = validators[*cursor % validators.len()].clone();
        *cursor = (*cursor + 1) % validators.len();
        Some(selected)
    }

    /// Idempotent: adding a present validator is a no-op and emits nothing.
    pub fn add_validator(&self, validator: impl Into<ValidatorId>) {
        let validator = validator.into();
        let mut validators = self.validators.write();
        if validators.iter().any(|v| v == &validator) {
            return;
        }
        validators.push(validator.clone());
        info!(%validator, "validator added");
        self.emit(LedgerEvent::ValidatorAdded { validator });
    }

    /// Idempotent: removing an absent validator is a no-op and emits nothing.
    pub fn remove_validator(&self, validator: &str) {
        let mut validators = self.validators.write();
        let Some(position) = validators.iter().position(|v| v == validator) else {
            return;
        };
        validators.remove(position);

        // Keep the cursor on a live slot after the set shrinks.
        let mut cursor = self.cursor.lock();
        if !validators.is_empty() {
            *cursor %= validators.len();
        } else {
            *cursor = 0;
        }

        info!(validator, "validator removed");
        self.emit(LedgerEvent::ValidatorRemoved {
            validator: validator.to_string(),
        });
    }

    pub fn validator_count(&self) -> usize {
        self.validators.read().len()
    }

    /// Pending vote count for a candidate hash; 0 once finalized.
    pub fn pending_vote_count(&self, block_hash: &str) -> usize {
        self.pending_votes
            .lock()
            .get(block_hash)
            .map(|votes| votes.len())
            .unwrap_or(0)
    }

    pub fn config(&self) -> &PoaConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
