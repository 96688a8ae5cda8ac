use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use super::{Decision, Strategy, StrategyDecision};
use crate::dispatch::SignalHandler;
use crate::models::{Signal, Strength};
use crate::signal::ValidationResult;

const SCORE_CEILING: f64 = 2.0;
const SCORE_FLOOR: f64 = 0.1;
/// ~2% reward per successful execution, ~5% decay per failure
const SCORE_REWARD: f64 = 1.02;
const SCORE_DECAY: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionMode {
    /// Every active strategy sees the signal
    AllActive,
    /// Single highest-scoring strategy by affinity x performance
    BestMatch,
    /// Strategy with the lowest current utilization
    LoadBalance,
    /// Ordered first-match rules: confidence, quantity, performance leader,
    /// remaining capacity, strength tag
    Conditional,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SelectorStats {
    pub total_signals: u64,
    pub selections: HashMap<String, u64>,
}

/// Routes each signal to one or more strategies and runs them concurrently.
///
/// A strategy's execution failure degrades its own performance score but
/// never blocks its siblings.
pub struct StrategySelector {
    strategies: RwLock<HashMap<String, Arc<dyn Strategy>>>,
    mode: Mutex<SelectionMode>,
    scores: Mutex<HashMap<String, f64>>,
    stats: Mutex<SelectorStats>,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>, mode: SelectionMode) -> Self {
        let mut map = HashMap::new();
        let mut scores = HashMap::new();
        for strategy in strategies {
            scores.insert(strategy.name().to_string(), 1.0);
            map.insert(strategy.name().to_string(), strategy);
        }
        tracing::info!(strategies = map.len(), ?mode, "strategy selector created");

        Self {
            strategies: RwLock::new(map),
            mode: Mutex::new(mode),
            scores: Mutex::new(scores),
            stats: Mutex::new(SelectorStats::default()),
        }
    }

    pub fn set_mode(&self, mode: SelectionMode) {
        *self.mode.lock().unwrap() = mode;
        tracing::info!(?mode, "selection mode changed");
    }

    pub fn add_strategy(&self, strategy: Arc<dyn Strategy>) {
        let name = strategy.name().to_string();
        self.scores.lock().unwrap().insert(name.clone(), 1.0);
        self.strategies.write().unwrap().insert(name, strategy);
    }

    pub fn remove_strategy(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.scores.lock().unwrap().remove(name);
        self.strategies.write().unwrap().remove(name)
    }

    pub fn performance_score(&self, name: &str) -> f64 {
        self.scores.lock().unwrap().get(name).copied().unwrap_or(1.0)
    }

    pub fn stats(&self) -> SelectorStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn strategies(&self) -> Vec<Arc<dyn Strategy>> {
        self.strategies.read().unwrap().values().cloned().collect()
    }

    pub async fn process_signal(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> Vec<StrategyDecision> {
        self.stats.lock().unwrap().total_signals += 1;

        let selected = self.select(signal, validation);
        if selected.is_empty() {
            tracing::warn!(signal_id = %signal.id, "no strategy selected for signal");
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(selected.len());
        for strategy in selected {
            let signal = signal.clone();
            let validation = validation.clone();
            handles.push(tokio::spawn(async move {
                let name = strategy.name().to_string();
                let mut decision = strategy.process_signal(&signal, &validation).await;
                let mut executed = None;

                if decision.is_execute() {
                    match strategy.execute_decision(&decision).await {
                        Ok(true) => executed = Some(true),
                        Ok(false) => {
                            executed = Some(false);
                            decision.decision = Decision::Ignore;
                            decision.reasoning.push_str(" (execution failed)");
                        }
                        Err(e) => {
                            executed = Some(false);
                            decision.decision = Decision::Ignore;
                            decision
                                .reasoning
                                .push_str(&format!(" (execution fault: {})", e));
                            tracing::error!(
                                strategy = %name,
                                signal_id = %signal.id,
                                error = %e,
                                "strategy execution fault"
                            );
                        }
                    }
                }

                (name, decision, executed)
            }));
        }

        let mut decisions = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((name, decision, executed)) => {
                    self.stats
                        .lock()
                        .unwrap()
                        .selections
                        .entry(name.clone())
                        .and_modify(|n| *n += 1)
                        .or_insert(1);
                    if let Some(success) = executed {
                        self.update_score(&name, success);
                    }
                    decisions.push(decision);
                }
                Err(e) => {
                    tracing::error!(error = %e, "strategy task panicked");
                }
            }
        }

        decisions
    }

    fn select(&self, signal: &Signal, validation: &ValidationResult) -> Vec<Arc<dyn Strategy>> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            SelectionMode::AllActive => self.active_strategies(),
            SelectionMode::BestMatch => self.select_best_match(signal, validation),
            SelectionMode::LoadBalance => self.select_load_balanced(),
            SelectionMode::Conditional => self.select_conditional(signal, validation),
        }
    }

    fn active_strategies(&self) -> Vec<Arc<dyn Strategy>> {
        let mut actives: Vec<Arc<dyn Strategy>> = self
            .strategies
            .read()
            .unwrap()
            .values()
            .filter(|s| s.core().is_active())
            .cloned()
            .collect();
        // Deterministic rule evaluation regardless of map order
        actives.sort_by(|a, b| a.name().cmp(b.name()));
        actives
    }

    fn select_best_match(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> Vec<Arc<dyn Strategy>> {
        let scores = self.scores.lock().unwrap().clone();

        self.active_strategies()
            .into_iter()
            .map(|s| {
                let performance = scores.get(s.name()).copied().unwrap_or(1.0);
                let score = s.affinity(signal, validation) * performance;
                (s, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| vec![s])
            .unwrap_or_default()
    }

    fn select_load_balanced(&self) -> Vec<Arc<dyn Strategy>> {
        self.active_strategies()
            .into_iter()
            .map(|s| {
                let load = s.utilization();
                (s, load)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| vec![s])
            .unwrap_or_default()
    }

    fn select_conditional(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> Vec<Arc<dyn Strategy>> {
        let actives = self.active_strategies();
        let mut picked: Vec<Arc<dyn Strategy>> = Vec::new();
        let mut pick = |candidate: Option<Arc<dyn Strategy>>| {
            if let Some(candidate) = candidate {
                if !picked.iter().any(|s| s.name() == candidate.name()) {
                    picked.push(candidate);
                }
            }
        };

        // Confidence tier
        if validation.confidence_score >= 0.8 {
            pick(find_by_hint(&actives, &["tiered", "turtle"]));
        } else if validation.confidence_score >= 0.5 {
            pick(find_by_hint(&actives, &["fixed", "simple"]));
        }

        // Quantity tier
        if signal.quantity >= 3.0 {
            pick(find_by_hint(&actives, &["tiered", "turtle"]));
        } else if signal.quantity >= 1.0 {
            pick(find_by_hint(&actives, &["fixed", "simple"]));
        }

        // Current performance leader
        {
            let scores = self.scores.lock().unwrap();
            let leader = scores
                .iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .filter(|(_, score)| **score > 1.2)
                .map(|(name, _)| name.clone());
            if let Some(name) = leader {
                pick(actives.iter().find(|s| s.name() == name).cloned());
            }
        }

        // Remaining capacity
        pick(actives.iter().find(|s| s.utilization() < 1.0).cloned());

        // Strength tag
        match signal.strength() {
            Strength::Weak => pick(find_by_hint(&actives, &["fixed", "simple"])),
            Strength::Medium | Strength::Strong => {
                pick(find_by_hint(&actives, &["tiered", "turtle"]))
            }
        }

        picked
    }

    fn update_score(&self, name: &str, success: bool) {
        let mut scores = self.scores.lock().unwrap();
        let score = scores.entry(name.to_string()).or_insert(1.0);
        *score = if success {
            (*score * SCORE_REWARD).min(SCORE_CEILING)
        } else {
            (*score * SCORE_DECAY).max(SCORE_FLOOR)
        };
        tracing::debug!(strategy = name, score = *score, "performance score updated");
    }
}

fn find_by_hint(
    strategies: &[Arc<dyn Strategy>],
    hints: &[&str],
) -> Option<Arc<dyn Strategy>> {
    strategies
        .iter()
        .find(|s| {
            let name = s.name().to_lowercase();
            hints.iter().any(|h| name.contains(h))
        })
        .cloned()
}

#[async_trait]
impl SignalHandler for StrategySelector {
    async fn handle(&self, signal: &Signal, validation: &ValidationResult) -> anyhow::Result<()> {
        let decisions = self.process_signal(signal, validation).await;
        let executed = decisions.iter().filter(|d| d.is_execute()).count();
        tracing::info!(
            signal_id = %signal.id,
            strategies = decisions.len(),
            executed,
            "signal routed"
        );
        Ok(())
    }
}
