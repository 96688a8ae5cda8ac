// Strategy engine: shared state machine core, decision protocol, and the
// concrete reverse strategies
pub mod fixed_target;
pub mod selector;
pub mod tiered;

pub use fixed_target::{FixedTargetConfig, FixedTargetStrategy};
pub use selector::{SelectionMode, StrategySelector};
pub use tiered::{TieredConfig, TieredStrategy};

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Signal, SignalAction};
use crate::signal::ValidationResult;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum StrategyState {
    Inactive,
    Active,
    Paused,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Decision {
    Ignore,
    Execute,
    Delay,
    Modify,
}

/// Outcome of one (strategy, signal) pairing
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDecision {
    pub decision: Decision,
    pub action: Option<SignalAction>,
    pub quantity: f64,
    pub symbol: String,
    pub confidence: f64,
    pub reasoning: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub delay_secs: u64,
}

impl StrategyDecision {
    pub fn ignore(reasoning: impl Into<String>) -> Self {
        Self {
            decision: Decision::Ignore,
            action: None,
            quantity: 0.0,
            symbol: String::new(),
            confidence: 0.0,
            reasoning: reasoning.into(),
            metadata: HashMap::new(),
            delay_secs: 0,
        }
    }

    pub fn execute(
        action: SignalAction,
        quantity: f64,
        symbol: impl Into<String>,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            decision: Decision::Execute,
            action: Some(action),
            quantity,
            symbol: symbol.into(),
            confidence,
            reasoning: reasoning.into(),
            metadata: HashMap::new(),
            delay_secs: 0,
        }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_execute(&self) -> bool {
        self.decision == Decision::Execute
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StrategyMetrics {
    pub total_signals: u64,
    pub executed_signals: u64,
    pub ignored_signals: u64,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub total_pnl: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatus {
    pub name: String,
    pub state: StrategyState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub metrics: StrategyMetrics,
    /// Strategy-specific fields (open positions, sequences, ...)
    pub extra: serde_json::Value,
}

/// Shared state machine and bookkeeping every strategy composes.
///
/// INACTIVE -start-> ACTIVE <-> PAUSED -stop-> STOPPED, with initialization
/// faults landing in ERROR.
pub struct StrategyCore {
    name: String,
    state: Mutex<StrategyState>,
    metrics: Mutex<StrategyMetrics>,
    created_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

impl StrategyCore {
    pub fn new(name: &str) -> Self {
        tracing::info!(strategy = name, "strategy created");
        Self {
            name: name.to_string(),
            state: Mutex::new(StrategyState::Inactive),
            metrics: Mutex::new(StrategyMetrics::default()),
            created_at: Utc::now(),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StrategyState {
        *self.state.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.state() == StrategyState::Active
    }

    /// Inactive -> Active; anything else is rejected
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != StrategyState::Inactive {
            tracing::warn!(strategy = %self.name, state = ?*state, "cannot start from this state");
            return false;
        }
        *state = StrategyState::Active;
        *self.started_at.lock().unwrap() = Some(Utc::now());
        tracing::info!(strategy = %self.name, "strategy started");
        true
    }

    pub fn mark_error(&self) {
        *self.state.lock().unwrap() = StrategyState::Error;
        tracing::error!(strategy = %self.name, "strategy entered error state");
    }

    pub fn pause(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != StrategyState::Active {
            return false;
        }
        *state = StrategyState::Paused;
        tracing::info!(strategy = %self.name, "strategy paused");
        true
    }

    pub fn resume(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != StrategyState::Paused {
            return false;
        }
        *state = StrategyState::Active;
        tracing::info!(strategy = %self.name, "strategy resumed");
        true
    }

    pub fn mark_stopped(&self) {
        *self.state.lock().unwrap() = StrategyState::Stopped;
        *self.stopped_at.lock().unwrap() = Some(Utc::now());
        tracing::info!(strategy = %self.name, "strategy stopped");
    }

    pub fn note_signal(&self, executed: bool) {
        let mut metrics = self.metrics.lock().unwrap();
        if executed {
            metrics.executed_signals += 1;
        } else {
            metrics.ignored_signals += 1;
        }
    }

    fn note_signal_seen(&self) {
        self.metrics.lock().unwrap().total_signals += 1;
    }

    pub fn record_trade(&self, success: bool, pnl: f64) {
        let mut metrics = self.metrics.lock().unwrap();
        if success {
            metrics.successful_trades += 1;
            metrics.total_pnl += pnl;
        } else {
            metrics.failed_trades += 1;
            metrics.total_pnl += pnl;
        }
        let total = metrics.successful_trades + metrics.failed_trades;
        if total > 0 {
            metrics.win_rate = metrics.successful_trades as f64 / total as f64;
        }
    }

    pub fn metrics(&self) -> StrategyMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn uptime_secs(&self) -> Option<i64> {
        let started = (*self.started_at.lock().unwrap())?;
        let end = self.stopped_at.lock().unwrap().unwrap_or_else(Utc::now);
        Some((end - started).num_seconds())
    }

    pub fn status(&self, extra: serde_json::Value) -> StrategyStatus {
        StrategyStatus {
            name: self.name.clone(),
            state: self.state(),
            created_at: self.created_at,
            started_at: *self.started_at.lock().unwrap(),
            stopped_at: *self.stopped_at.lock().unwrap(),
            uptime_secs: self.uptime_secs(),
            metrics: self.metrics(),
            extra,
        }
    }
}

/// The strategy contract.
///
/// Concrete strategies implement `decide`/`execute_decision` plus the
/// start/stop hooks for their background monitors; the signal-processing
/// shell and state machine come from the provided methods and `StrategyCore`.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn core(&self) -> &StrategyCore;

    /// Decision logic; faults are captured by `process_signal`
    async fn decide(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> anyhow::Result<StrategyDecision>;

    /// Carry out an Execute decision against the venue; returns whether the
    /// trade went through
    async fn execute_decision(&self, decision: &StrategyDecision) -> anyhow::Result<bool>;

    /// Spawn background monitors; a fault here lands the strategy in ERROR
    async fn on_start(&self) -> anyhow::Result<()>;

    /// Cancel background monitors and await them
    async fn on_stop(&self);

    fn status(&self) -> StrategyStatus;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Current load as a fraction of capacity, for load-balanced selection
    fn utilization(&self) -> f64 {
        0.0
    }

    /// How well this strategy matches the signal, for best-match selection
    fn affinity(&self, _signal: &Signal, _validation: &ValidationResult) -> f64 {
        0.0
    }

    async fn process_signal(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> StrategyDecision {
        let core = self.core();
        if !core.is_active() {
            return StrategyDecision::ignore(format!(
                "strategy not active (state: {:?})",
                core.state()
            ));
        }

        core.note_signal_seen();

        match self.decide(signal, validation).await {
            Ok(decision) => {
                core.note_signal(decision.is_execute());
                tracing::info!(
                    strategy = %core.name(),
                    signal_id = %signal.id,
                    decision = ?decision.decision,
                    reasoning = %decision.reasoning,
                    "strategy decision"
                );
                decision
            }
            Err(e) => {
                core.note_signal(false);
                tracing::error!(
                    strategy = %core.name(),
                    signal_id = %signal.id,
                    error = %e,
                    "strategy decision fault"
                );
                StrategyDecision::ignore(format!("decision fault: {}", e))
            }
        }
    }

    async fn start(&self) -> bool {
        if self.core().state() != StrategyState::Inactive {
            tracing::warn!(
                strategy = %self.core().name(),
                state = ?self.core().state(),
                "start rejected"
            );
            return false;
        }

        match self.on_start().await {
            Ok(()) => self.core().activate(),
            Err(e) => {
                tracing::error!(
                    strategy = %self.core().name(),
                    error = %e,
                    "strategy initialization failed"
                );
                self.core().mark_error();
                false
            }
        }
    }

    async fn stop(&self) {
        if self.core().state() == StrategyState::Stopped {
            return;
        }
        self.on_stop().await;
        self.core().mark_stopped();
    }

    fn pause(&self) -> bool {
        self.core().pause()
    }

    fn resume(&self) -> bool {
        self.core().resume()
    }
}
