//! Gas metering.
//!
//! Everything here is advisory except the recorded numbers: estimates carry
//! warnings rather than failing, refunds are banked per transaction hash and
//! claimable exactly once, and a background task nudges the published gas
//! price toward the trailing usage average.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use palisade_contracts::{ContractFunction, ParamType};
use palisade_types::LedgerEvent;

/// Base charge for any transaction.
const BASE_GAS: u64 = 21_000;
/// Surcharge for constructor execution at deployment.
const CONSTRUCTOR_GAS: u64 = 32_000;
/// Per-argument storage cost for read-only calls.
const READ_STORAGE_GAS: u64 = 200;
/// Per-argument storage cost for mutating calls.
const WRITE_STORAGE_GAS: u64 = 20_000;
/// Estimates above this draw an "unusually high" warning.
const HIGH_USAGE_THRESHOLD: u64 = 1_000_000;
/// Non-view estimates below this draw a "suspiciously low" warning.
const LOW_USAGE_THRESHOLD: u64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GasError {
    #[error("no refund available for transaction {0}")]
    RefundUnavailable(String),
    #[error("invalid gas policy: {0}")]
    InvalidPolicy(String),
}

/// Gas meter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasPolicy {
    pub base_gas_price: u64,
    pub max_gas_price: u64,
    /// Per-transaction gas cap; estimates above it carry a warning.
    pub tx_gas_cap: u64,
    pub refund_percentage: u64,
    pub refunds_enabled: bool,
    /// In-memory retention for the usage ledger.
    pub history_limit: usize,
    /// Price adjustment cadence, seconds.
    pub adjust_interval_secs: u64,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            base_gas_price: 1_000_000_000,
            max_gas_price: 10_000_000_000,
            tx_gas_cap: 10_000_000,
            refund_percentage: 50,
            refunds_enabled: true,
            history_limit: 10_000,
            adjust_interval_secs: 30,
        }
    }
}

impl GasPolicy {
    pub fn validate(&self) -> Result<(), GasError> {
        if self.base_gas_price > self.max_gas_price {
            return Err(GasError::InvalidPolicy(
                "base gas price exceeds maximum".into(),
            ));
        }
        if self.refund_percentage > 100 {
            return Err(GasError::InvalidPolicy(
                "refund percentage above 100".into(),
            ));
        }
        if self.history_limit == 0 {
            return Err(GasError::InvalidPolicy("history limit is zero".into()));
        }
        Ok(())
    }
}

/// One recorded execution cost. Append-only, bounded retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasUsage {
    pub contract_address: String,
    pub function_name: String,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub cost: u64,
    pub timestamp: u64,
    pub transaction_hash: String,
}

/// An estimate with advisory context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasEstimate {
    pub estimated: u64,
    /// 0.0..=1.0, derived from historical variance; 0.5 with no history.
    pub confidence: f64,
    pub warnings: Vec<String>,
}

/// The gas meter: price oracle, estimator, usage ledger, refund bank.
pub struct GasMeter {
    policy: GasPolicy,
    price: RwLock<u64>,
    history: Mutex<VecDeque<GasUsage>>,
    refunds: Mutex<HashMap<String, u64>>,
    /// Discount percentages by sender; the best match wins.
    discounts: RwLock<HashMap<String, Vec<u64>>>,
    events: Option<mpsc::UnboundedSender<LedgerEvent>>,
}

impl GasMeter {
    pub fn new(policy: GasPolicy) -> Result<Self, GasError> {
        policy.validate()?;
        let price = policy.base_gas_price;
        Ok(Self {
            policy,
            price: RwLock::new(price),
            history: Mutex::new(VecDeque::new()),
            refunds: Mutex::new(HashMap::new()),
            discounts: RwLock::new(HashMap::new()),
            events: None,
        })
    }

    /// Attach the outbound ledger-event channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<LedgerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Currently published gas price.
    pub fn gas_price(&self) -> u64 {
        *self.price.read()
    }

    /// Grant `sender` a percentage discount on estimates.
    pub fn add_discount(&self, sender: impl Into<String>, percentage: u64) {
        self.discounts
            .write()
            .entry(sender.into())
            .or_default()
            .push(percentage.min(100));
    }

    fn best_discount(&self, sender: &str) -> u64 {
        self.discounts
            .read()
            .get(sender)
            .and_then(|grants| grants.iter().max().copied())
            .unwrap_or(0)
    }

    /// Estimate the cost of calling `function` with `args`.
    ///
    /// Larger argument lists and longer string payloads never lower the
    /// estimate; the warnings are advisory and never abort a call.
    pub fn estimate(
        &self,
        contract_address: &str,
        function: &ContractFunction,
        args: &[serde_json::Value],
        sender: &str,
    ) -> GasEstimate {
        let mut estimated = BASE_GAS;

        for (parameter, value) in function.inputs.iter().zip(args) {
            estimated += match parameter.param_type {
                ParamType::Uint(_) | ParamType::Int256 => 32,
                ParamType::Address => 40,
                ParamType::Bool => 8,
                ParamType::String => {
                    let len = value.as_str().map(|s| s.len()).unwrap_or(0) as u64;
                    100 + len * 10
                }
                ParamType::Bytes | ParamType::Bytes32 => 100,
            };
        }

        let storage_unit = if function.mutability.is_read_only() {
            READ_STORAGE_GAS
        } else {
            WRITE_STORAGE_GAS
        };
        estimated += storage_unit * args.len() as u64;

        if function.name == "constructor" {
            estimated += CONSTRUCTOR_GAS;
        }

        let discount = self.best_discount(sender);
        if discount > 0 {
            estimated = estimated * (100 - discount) / 100;
            debug!(sender, discount, "applied gas discount");
        }

        let mut warnings = Vec::new();
        if estimated > self.policy.tx_gas_cap {
            warnings.push(format!(
                "estimate {estimated} exceeds the per-transaction cap {}",
                self.policy.tx_gas_cap
            ));
        }
        if let Some(limit) = function.gas_limit {
            if estimated > limit {
                warnings.push(format!(
                    "estimate {estimated} exceeds the function's declared limit {limit}"
                ));
            }
        }
        if estimated > HIGH_USAGE_THRESHOLD {
            warnings.push("unusually high gas usage".to_string());
        }
        if estimated < LOW_USAGE_THRESHOLD && !function.mutability.is_read_only() {
            warnings.push("suspiciously low gas usage for a state-changing call".to_string());
        }

        GasEstimate {
            estimated,
            confidence: self.confidence(contract_address, &function.name),
            warnings,
        }
    }

    /// Confidence from the variance of recorded usage for the same
    /// `(contract, function)` pair. No history means 0.5.
    fn confidence(&self, contract_address: &str, function_name: &str) -> f64 {
        let history = self.history.lock();
        let samples: Vec<f64> = history
            .iter()
            .filter(|u| u.contract_address == contract_address && u.function_name == function_name)
            .map(|u| u.gas_used as f64)
            .collect();
        if samples.is_empty() {
            return 0.5;
        }

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        if mean == 0.0 {
            return 0.5;
        }
        let variance =
            samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        let relative_spread = variance.sqrt() / mean;
        (1.0 - relative_spread).clamp(0.1, 0.99)
    }

    /// Append one usage record, evicting the oldest entries past the
    /// retention bound, and bank a refund when gas went unused.
    pub fn record_usage(&self, usage: GasUsage) {
        if usage.gas_used < usage.gas_limit && self.policy.refunds_enabled {
            let unused = usage.gas_limit - usage.gas_used;
            let refund = unused * self.policy.refund_percentage / 100;
            if refund > 0 {
                self.refunds
                    .lock()
                    .insert(usage.transaction_hash.clone(), refund);
            }
        }

        if let Some(events) = &self.events {
            let sent = events.send(LedgerEvent::GasRecorded {
                address: usage.contract_address.clone(),
                function: usage.function_name.clone(),
                gas_used: usage.gas_used,
                cost: usage.cost,
            });
            if sent.is_err() {
                warn!("ledger event receiver dropped; gas record not audited");
            }
        }

        let mut history = self.history.lock();
        history.push_back(usage);
        while history.len() > self.policy.history_limit {
            history.pop_front();
        }
    }

    /// Claim the refund banked for a transaction. Pays out exactly once.
    pub fn claim_refund(&self, transaction_hash: &str) -> Result<u64, GasError> {
        self.refunds
            .lock()
            .remove(transaction_hash)
            .ok_or_else(|| GasError::RefundUnavailable(transaction_hash.to_string()))
    }

    /// Usage records for one contract, most recent last.
    pub fn usage_history(&self, contract_address: &str) -> Vec<GasUsage> {
        self.history
            .lock()
            .iter()
            .filter(|u| u.contract_address == contract_address)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// One price adjustment step: move ±5% toward the trailing-100 average
    /// recorded price, clamped to the policy band.
    pub fn adjust_price_once(&self) {
        let trailing_average = {
            let history = self.history.lock();
            let recent: Vec<u64> = history
                .iter()
                .rev()
                .take(100)
                .map(|u| u.gas_price)
                .collect();
            if recent.is_empty() {
                return;
            }
            recent.iter().sum::<u64>() / recent.len() as u64
        };

        let mut price = self.price.write();
        let nudged = if trailing_average > *price {
            *price + *price / 20
        } else if trailing_average < *price {
            *price - *price / 20
        } else {
            *price
        };
        let clamped = nudged.clamp(self.policy.base_gas_price, self.policy.max_gas_price);
        if clamped != *price {
            info!(from = *price, to = clamped, "adjusted published gas price");
            *price = clamped;
        }
    }

    /// Background price adjustment loop on the policy's cadence.
    pub fn spawn_price_adjuster(meter: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(meter.policy.adjust_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so the first
            // adjustment happens one full period after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                meter.adjust_price_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_contracts::{ContractParameter, Mutability, Visibility};
    use serde_json::json;

    fn function(
        name: &str,
        inputs: Vec<ContractParameter>,
        mutability: Mutability,
        gas_limit: Option<u64>,
    ) -> ContractFunction {
        ContractFunction {
            name: name.into(),
            inputs,
            outputs: vec![],
            visibility: Visibility::Public,
            mutability,
            gas_limit,
        }
    }

    fn meter() -> GasMeter {
        GasMeter::new(GasPolicy::default()).unwrap()
    }

    fn usage(tx: &str, used: u64, limit: u64, price: u64) -> GasUsage {
        GasUsage {
            contract_address: "0xc0ffee".into(),
            function_name: "transfer".into(),
            gas_used: used,
            gas_limit: limit,
            gas_price: price,
            cost: used * price,
            timestamp: 1_700_000_000,
            transaction_hash: tx.into(),
        }
    }

    #[test]
    fn policy_validation_catches_misconfiguration() {
        let inverted = GasPolicy {
            base_gas_price: 10,
            max_gas_price: 5,
            ..GasPolicy::default()
        };
        assert!(GasMeter::new(inverted).is_err());

        let over_refund = GasPolicy {
            refund_percentage: 150,
            ..GasPolicy::default()
        };
        assert!(GasMeter::new(over_refund).is_err());
    }

    #[test]
    fn estimate_is_monotonic_in_arguments() {
        let m = meter();
        let one_arg = function(
            "store",
            vec![ContractParameter::new("a", ParamType::Uint(256))],
            Mutability::Nonpayable,
            None,
        );
        let two_args = function(
            "store",
            vec![
                ContractParameter::new("a", ParamType::Uint(256)),
                ContractParameter::new("b", ParamType::Uint(256)),
            ],
            Mutability::Nonpayable,
            None,
        );

        let small = m.estimate("0xc", &one_arg, &[json!(1)], "0xsender");
        let large = m.estimate("0xc", &two_args, &[json!(1), json!(2)], "0xsender");
        assert!(large.estimated >= small.estimated);

        let text = function(
            "log",
            vec![ContractParameter::new("msg", ParamType::String)],
            Mutability::Nonpayable,
            None,
        );
        let short = m.estimate("0xc", &text, &[json!("hi")], "0xsender");
        let long = m.estimate("0xc", &text, &[json!("hi".repeat(50))], "0xsender");
        assert!(long.estimated > short.estimated);
    }

    #[test]
    fn view_calls_cost_less_storage_than_mutating_calls() {
        let m = meter();
        let inputs = vec![ContractParameter::new("a", ParamType::Uint(256))];
        let view = function("peek", inputs.clone(), Mutability::View, None);
        let write = function("poke", inputs, Mutability::Nonpayable, None);

        let view_est = m.estimate("0xc", &view, &[json!(1)], "0xsender");
        let write_est = m.estimate("0xc", &write, &[json!(1)], "0xsender");
        assert!(write_est.estimated > view_est.estimated);
    }

    #[test]
    fn constructor_carries_surcharge() {
        let m = meter();
        let inputs = vec![ContractParameter::new("a", ParamType::Uint(256))];
        let plain = function("init", inputs.clone(), Mutability::Nonpayable, None);
        let ctor = function("constructor", inputs, Mutability::Nonpayable, None);

        let plain_est = m.estimate("0xc", &plain, &[json!(1)], "0xsender");
        let ctor_est = m.estimate("0xc", &ctor, &[json!(1)], "0xsender");
        assert_eq!(ctor_est.estimated, plain_est.estimated + 32_000);
    }

    #[test]
    fn highest_discount_wins() {
        let m = meter();
        m.add_discount("0xvip", 10);
        m.add_discount("0xvip", 25);

        let f = function(
            "store",
            vec![ContractParameter::new("a", ParamType::Uint(256))],
            Mutability::Nonpayable,
            None,
        );
        let full = m.estimate("0xc", &f, &[json!(1)], "0xnobody");
        let cut = m.estimate("0xc", &f, &[json!(1)], "0xvip");
        assert_eq!(cut.estimated, full.estimated * 75 / 100);
    }

    #[test]
    fn warnings_flag_suspicious_estimates() {
        let m = meter();
        let cheap_write = function(
            "flip",
            vec![ContractParameter::new("a", ParamType::Bool)],
            Mutability::Nonpayable,
            None,
        );
        let est = m.estimate("0xc", &cheap_write, &[json!(true)], "0xsender");
        assert!(est
            .warnings
            .iter()
            .any(|w| w.contains("suspiciously low")));

        let declared = function(
            "tight",
            vec![ContractParameter::new("a", ParamType::Uint(256))],
            Mutability::Nonpayable,
            Some(10_000),
        );
        let est = m.estimate("0xc", &declared, &[json!(1)], "0xsender");
        assert!(est.warnings.iter().any(|w| w.contains("declared limit")));
    }

    #[test]
    fn confidence_defaults_to_half_without_history() {
        let m = meter();
        let f = function(
            "transfer",
            vec![ContractParameter::new("a", ParamType::Uint(256))],
            Mutability::Nonpayable,
            None,
        );
        let est = m.estimate("0xc0ffee", &f, &[json!(1)], "0xsender");
        assert_eq!(est.confidence, 0.5);

        // Stable history raises confidence above the no-data default.
        for i in 0..10 {
            m.record_usage(usage(&format!("0xtx{i}"), 70_000, 100_000, 100));
        }
        let est = m.estimate("0xc0ffee", &f, &[json!(1)], "0xsender");
        assert!(est.confidence > 0.5);
    }

    #[test]
    fn refund_is_claimable_exactly_once() {
        let m = meter();
        m.record_usage(usage("0xtx1", 60_000, 100_000, 100));

        // 40_000 unused at the default 50% refund rate.
        assert_eq!(m.claim_refund("0xtx1").unwrap(), 20_000);
        assert_eq!(
            m.claim_refund("0xtx1"),
            Err(GasError::RefundUnavailable("0xtx1".into()))
        );
    }

    #[test]
    fn full_usage_banks_no_refund() {
        let m = meter();
        m.record_usage(usage("0xtx2", 100_000, 100_000, 100));
        assert!(m.claim_refund("0xtx2").is_err());
    }

    #[test]
    fn history_retention_is_bounded() {
        let policy = GasPolicy {
            history_limit: 5,
            ..GasPolicy::default()
        };
        let m = GasMeter::new(policy).unwrap();
        for i in 0..8 {
            m.record_usage(usage(&format!("0xtx{i}"), 1, 1, 100));
        }
        assert_eq!(m.history_len(), 5);
    }

    #[test]
    fn price_moves_toward_trailing_average_within_band() {
        let policy = GasPolicy {
            base_gas_price: 100,
            max_gas_price: 200,
            ..GasPolicy::default()
        };
        let m = GasMeter::new(policy).unwrap();
        assert_eq!(m.gas_price(), 100);

        // Recorded prices far above the published price pull it up 5%...
        for i in 0..10 {
            m.record_usage(usage(&format!("0xtx{i}"), 1, 1, 400));
        }
        m.adjust_price_once();
        assert_eq!(m.gas_price(), 105);

        // ...but never past the policy ceiling.
        for _ in 0..100 {
            m.adjust_price_once();
        }
        assert_eq!(m.gas_price(), 200);
    }

    #[test]
    fn price_never_drops_below_base() {
        let policy = GasPolicy {
            base_gas_price: 100,
            max_gas_price: 200,
            ..GasPolicy::default()
        };
        let m = GasMeter::new(policy).unwrap();
        for i in 0..10 {
            m.record_usage(usage(&format!("0xtx{i}"), 1, 1, 1));
        }
        m.adjust_price_once();
        assert_eq!(m.gas_price(), 100);
    }
}
