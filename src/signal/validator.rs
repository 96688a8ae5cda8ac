use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Signal, SignalKind};

/// Tunables for the validation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_supported_symbols")]
    pub supported_symbols: Vec<String>,
    #[serde(default = "default_min_quantity")]
    pub min_quantity: f64,
    #[serde(default = "default_max_quantity")]
    pub max_quantity: f64,
    /// Trailing window for duplicate detection, seconds
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: i64,
    /// Confidence multiplier applied to a detected duplicate
    #[serde(default = "default_duplicate_penalty")]
    pub duplicate_penalty: f64,
    /// Maximum tolerated clock skew between signal and wall time, seconds
    #[serde(default = "default_max_skew_secs")]
    pub max_skew_secs: i64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_supported_symbols() -> Vec<String> {
    vec!["BTC-USDT-SWAP".to_string(), "ETH-USDT-SWAP".to_string()]
}
fn default_min_quantity() -> f64 {
    0.1
}
fn default_max_quantity() -> f64 {
    1000.0
}
fn default_duplicate_window_secs() -> i64 {
    60
}
fn default_duplicate_penalty() -> f64 {
    0.5
}
fn default_max_skew_secs() -> i64 {
    300
}
fn default_min_confidence() -> f64 {
    0.3
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            supported_symbols: default_supported_symbols(),
            min_quantity: default_min_quantity(),
            max_quantity: default_max_quantity(),
            duplicate_window_secs: default_duplicate_window_secs(),
            duplicate_penalty: default_duplicate_penalty(),
            max_skew_secs: default_max_skew_secs(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Outcome of running the validation pipeline over one signal.
///
/// Created fresh per signal, immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Product of per-rule penalty factors, clamped to [0, 1]
    pub confidence_score: f64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub applied_rules: Vec<String>,
    pub is_duplicate: bool,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            is_valid: true,
            confidence_score: 1.0,
            warnings: Vec::new(),
            errors: Vec::new(),
            applied_rules: Vec::new(),
            is_duplicate: false,
        }
    }

    /// Shorthand for tests and wiring code that bypass validation
    pub fn passing() -> Self {
        let mut result = Self::new();
        result.applied_rules.push("bypass".to_string());
        result
    }
}

#[derive(Debug, Default, Clone)]
pub struct ValidationStats {
    pub total: u64,
    pub passed: u64,
    pub passed_with_warnings: u64,
    pub rejected: u64,
}

/// Runs the fixed rule pipeline over parsed signals.
///
/// Each rule may append warnings/errors and multiply the running confidence by
/// a penalty factor in [0, 1]. A rule failing internally is recorded as an
/// error and never aborts the remaining rules.
pub struct SignalValidator {
    config: ValidatorConfig,
    history: Vec<Signal>,
    stats: ValidationStats,
}

const MAX_HISTORY: usize = 100;
const DUPLICATE_LOOKBACK: usize = 10;

type Rule = fn(&SignalValidator, &Signal, &mut ValidationResult) -> anyhow::Result<()>;

impl SignalValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
            stats: ValidationStats::default(),
        }
    }

    pub fn validate(&mut self, signal: &Signal) -> ValidationResult {
        self.stats.total += 1;

        let mut result = ValidationResult::new();

        let rules: &[(&str, Rule)] = &[
            ("format", Self::check_format),
            ("quantity_range", Self::check_quantity_range),
            ("symbol", Self::check_symbol),
            ("duplicate", Self::check_duplicate),
            ("timing", Self::check_timing),
            ("sequence_logic", Self::check_sequence_logic),
            ("confidence_floor", Self::check_confidence_floor),
        ];

        for (name, rule) in rules {
            result.applied_rules.push(name.to_string());
            if let Err(e) = rule(self, signal, &mut result) {
                // One misbehaving rule must not silence the rest of the pipeline
                result.errors.push(format!("rule {} failed: {}", name, e));
            }
        }

        if !result.errors.is_empty() {
            result.is_valid = false;
            result.confidence_score = 0.0;
        }
        result.confidence_score = result.confidence_score.clamp(0.0, 1.0);

        self.record(signal, &result);

        result
    }

    pub fn stats(&self) -> &ValidationStats {
        &self.stats
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn check_format(&self, signal: &Signal, result: &mut ValidationResult) -> anyhow::Result<()> {
        if signal.raw.is_empty() {
            result.errors.push("raw message is empty".to_string());
        }
        if signal.symbol.is_empty() {
            result.errors.push("symbol is empty".to_string());
        }
        if signal.kind == SignalKind::Directional && signal.quantity <= 0.0 {
            result.errors.push(format!(
                "quantity must be positive, got {}",
                signal.quantity
            ));
        }
        Ok(())
    }

    fn check_quantity_range(
        &self,
        signal: &Signal,
        result: &mut ValidationResult,
    ) -> anyhow::Result<()> {
        if signal.kind != SignalKind::Directional {
            return Ok(());
        }

        if signal.quantity < self.config.min_quantity {
            result.warnings.push(format!(
                "quantity {} below sane minimum {}",
                signal.quantity, self.config.min_quantity
            ));
            result.confidence_score *= 0.8;
        }
        if signal.quantity > self.config.max_quantity {
            result.warnings.push(format!(
                "quantity {} above sane maximum {}",
                signal.quantity, self.config.max_quantity
            ));
            result.confidence_score *= 0.7;
        }

        // Feed quantities come in 0.1 steps; finer precision smells like a parse slip
        if (signal.quantity * 10.0).round() / 10.0 != signal.quantity {
            result
                .warnings
                .push(format!("suspicious quantity precision: {}", signal.quantity));
            result.confidence_score *= 0.9;
        }

        Ok(())
    }

    fn check_symbol(&self, signal: &Signal, result: &mut ValidationResult) -> anyhow::Result<()> {
        if signal.kind == SignalKind::Control {
            return Ok(());
        }

        if !self
            .config
            .supported_symbols
            .iter()
            .any(|s| s == &signal.symbol)
        {
            result
                .warnings
                .push(format!("symbol {} not whitelisted", signal.symbol));
            result.confidence_score *= 0.8;
        }
        Ok(())
    }

    fn check_duplicate(&self, signal: &Signal, result: &mut ValidationResult) -> anyhow::Result<()> {
        let window = Duration::seconds(self.config.duplicate_window_secs);

        for prior in self.history.iter().rev().take(DUPLICATE_LOOKBACK) {
            let age = signal.timestamp - prior.timestamp;
            if age >= window {
                continue;
            }

            let same_fields = prior.action == signal.action
                && prior.quantity == signal.quantity
                && prior.symbol == signal.symbol;
            let same_text = prior.raw.trim() == signal.raw.trim();

            if same_fields || same_text {
                result.warnings.push(format!(
                    "duplicate of signal seen {:.1}s ago",
                    age.num_milliseconds() as f64 / 1000.0
                ));
                result.confidence_score *= self.config.duplicate_penalty;
                result.is_duplicate = true;
                break;
            }
        }
        Ok(())
    }

    fn check_timing(&self, signal: &Signal, result: &mut ValidationResult) -> anyhow::Result<()> {
        let skew = (Utc::now() - signal.timestamp).num_seconds().abs();
        if skew > self.config.max_skew_secs {
            result
                .warnings
                .push(format!("signal timestamp skewed by {}s", skew));
            result.confidence_score *= 0.8;
        }
        Ok(())
    }

    fn check_sequence_logic(
        &self,
        signal: &Signal,
        result: &mut ValidationResult,
    ) -> anyhow::Result<()> {
        if signal.kind != SignalKind::Directional {
            return Ok(());
        }

        let cutoff = Utc::now() - Duration::minutes(30);
        let recent: Vec<&Signal> = self
            .history
            .iter()
            .filter(|s| s.kind == SignalKind::Directional && s.timestamp >= cutoff)
            .collect();

        let Some(last) = recent.last() else {
            return Ok(());
        };

        if signal.is_closing() && last.is_closing() {
            result
                .warnings
                .push("two consecutive closing signals".to_string());
            result.confidence_score *= 0.9;
        }

        if signal.is_opening() {
            let max_open_qty = recent
                .iter()
                .filter(|s| s.is_opening())
                .map(|s| s.quantity)
                .fold(f64::NEG_INFINITY, f64::max);
            if max_open_qty.is_finite() && signal.quantity < max_open_qty {
                result
                    .warnings
                    .push("opening quantity sequence is not increasing".to_string());
                result.confidence_score *= 0.9;
            }
        }

        Ok(())
    }

    fn check_confidence_floor(
        &self,
        signal: &Signal,
        result: &mut ValidationResult,
    ) -> anyhow::Result<()> {
        if signal.confidence < self.config.min_confidence {
            result.warnings.push(format!(
                "signal confidence {:.2} below floor {:.2}",
                signal.confidence, self.config.min_confidence
            ));
            result.confidence_score *= signal.confidence;
        }
        Ok(())
    }

    fn record(&mut self, signal: &Signal, result: &ValidationResult) {
        self.history.push(signal.clone());
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }

        if result.is_valid {
            if result.warnings.is_empty() {
                self.stats.passed += 1;
            } else {
                self.stats.passed_with_warnings += 1;
            }
            tracing::debug!(
                signal_id = %signal.id,
                score = result.confidence_score,
                warnings = result.warnings.len(),
                "signal validated"
            );
        } else {
            self.stats.rejected += 1;
            tracing::warn!(
                signal_id = %signal.id,
                errors = ?result.errors,
                "signal rejected by validation"
            );
        }
    }
}
