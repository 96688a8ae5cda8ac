use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Strategy, StrategyCore, StrategyDecision, StrategyStatus};
use crate::exchange::ExchangeApi;
use crate::execution::{OrderExecutor, OrderRequest, OrderSide};
use crate::models::{Direction, Signal, SignalAction, SignalKind};
use crate::position::PositionBook;
use crate::signal::ValidationResult;

/// The tier tables are hand-tuned and supplied by configuration; the defaults
/// reproduce the originally deployed values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredConfig {
    /// Tier -> position size
    #[serde(default = "default_position_sizes")]
    pub position_sizes: HashMap<u32, f64>,
    /// Tier -> aggregate PnL fraction that arms partial profit-taking
    #[serde(default = "default_profit_thresholds")]
    pub profit_thresholds: HashMap<u32, f64>,
    /// Tier -> fraction of total open size closed when the threshold is hit
    #[serde(default = "default_close_ratios")]
    pub close_ratios: HashMap<u32, f64>,
    /// Same-direction signals within this window join one sequence
    #[serde(default = "default_sequence_window_hours")]
    pub sequence_window_hours: i64,
    #[serde(default = "default_sequence_timeout_hours")]
    pub sequence_timeout_hours: i64,
    /// Aggregate PnL fraction that force-closes a sequence (negative)
    #[serde(default = "default_emergency_stop_loss")]
    pub emergency_stop_loss: f64,
    #[serde(default = "default_max_active_sequences")]
    pub max_active_sequences: usize,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    /// A single sequence may use at most this fraction of max_position_size
    #[serde(default = "default_max_sequence_ratio")]
    pub max_sequence_ratio: f64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_position_sizes() -> HashMap<u32, f64> {
    (1..=8).map(|tier| (tier, tier as f64 * 10.0)).collect()
}

fn default_profit_thresholds() -> HashMap<u32, f64> {
    let mut table = HashMap::new();
    table.insert(1, 0.0);
    table.insert(2, 0.0);
    table.insert(3, 0.50);
    for tier in 4..=8 {
        table.insert(tier, 0.30);
    }
    table
}

fn default_close_ratios() -> HashMap<u32, f64> {
    let mut table = HashMap::new();
    table.insert(1, 0.0);
    table.insert(2, 0.0);
    table.insert(3, 0.50);
    table.insert(4, 0.80);
    for tier in 5..=8 {
        table.insert(tier, 0.90);
    }
    table
}

fn default_sequence_window_hours() -> i64 {
    2
}
fn default_sequence_timeout_hours() -> i64 {
    8
}
fn default_emergency_stop_loss() -> f64 {
    -0.20
}
fn default_max_active_sequences() -> usize {
    3
}
fn default_max_position_size() -> f64 {
    1000.0
}
fn default_max_sequence_ratio() -> f64 {
    0.8
}
fn default_monitor_interval_ms() -> u64 {
    5000
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            position_sizes: default_position_sizes(),
            profit_thresholds: default_profit_thresholds(),
            close_ratios: default_close_ratios(),
            sequence_window_hours: default_sequence_window_hours(),
            sequence_timeout_hours: default_sequence_timeout_hours(),
            emergency_stop_loss: default_emergency_stop_loss(),
            max_active_sequences: default_max_active_sequences(),
            max_position_size: default_max_position_size(),
            max_sequence_ratio: default_max_sequence_ratio(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

/// A time-windowed group of same-direction reverse positions managed as one
/// risk unit
#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: String,
    /// Direction expressed by the source signals; our positions sit opposite
    pub signal_direction: Direction,
    pub position_ids: Vec<Uuid>,
    pub tiers: HashSet<u32>,
    /// Tiers whose partial-profit rule has already fired
    pub fired_tiers: HashSet<u32>,
    pub highest_tier: u32,
    pub total_size: f64,
    pub started_at: DateTime<Utc>,
    pub active: bool,
}

/// Tiered-sequence reverse strategy.
///
/// Consecutive same-direction open signals within a rolling window stack into
/// one sequence, sized per the tier table. Higher tiers arm partial
/// profit-taking over the whole sequence; timeout and the emergency stop win
/// over profit-taking, and a closing signal from the feed hands control back
/// by flattening everything.
pub struct TieredStrategy {
    core: Arc<StrategyCore>,
    config: TieredConfig,
    exchange: Arc<dyn ExchangeApi>,
    executor: Arc<OrderExecutor>,
    book: Arc<Mutex<PositionBook>>,
    conservative: Arc<AtomicBool>,
    sequences: Arc<Mutex<HashMap<String, Sequence>>>,
    monitor_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TieredStrategy {
    pub fn new(
        name: &str,
        config: TieredConfig,
        exchange: Arc<dyn ExchangeApi>,
        executor: Arc<OrderExecutor>,
        book: Arc<Mutex<PositionBook>>,
        conservative: Arc<AtomicBool>,
    ) -> Self {
        Self {
            core: Arc::new(StrategyCore::new(name)),
            config,
            exchange,
            executor,
            book,
            conservative,
            sequences: Arc::new(Mutex::new(HashMap::new())),
            monitor_task: Mutex::new(None),
        }
    }

    pub fn active_sequence_count(&self) -> usize {
        self.sequences
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.active)
            .count()
    }

    pub fn sequence(&self, id: &str) -> Option<Sequence> {
        self.sequences.lock().unwrap().get(id).cloned()
    }

    pub fn sequences_snapshot(&self) -> Vec<Sequence> {
        self.sequences.lock().unwrap().values().cloned().collect()
    }

    fn find_active_sequence(&self, direction: Direction) -> Option<String> {
        let window = chrono::Duration::hours(self.config.sequence_window_hours);
        let now = Utc::now();
        self.sequences
            .lock()
            .unwrap()
            .values()
            .find(|s| s.active && s.signal_direction == direction && now - s.started_at < window)
            .map(|s| s.id.clone())
    }

    fn tier_size(&self, tier: u32, signal: &Signal) -> f64 {
        let base = self
            .config
            .position_sizes
            .get(&tier)
            .copied()
            .unwrap_or(tier as f64 * 10.0);

        let mut size = base * signal.confidence.max(0.7);
        if self.conservative.load(Ordering::SeqCst) {
            size *= 0.5;
        }
        size = size.min(self.config.max_position_size);
        (size * 10.0).round() / 10.0
    }

    fn worker(&self) -> SequenceWorker {
        SequenceWorker {
            config: self.config.clone(),
            exchange: self.exchange.clone(),
            executor: self.executor.clone(),
            book: self.book.clone(),
            core: self.core.clone(),
            sequences: self.sequences.clone(),
        }
    }

    /// One pass of the sequence checks, exposed for deterministic tests.
    ///
    /// Timeout and the emergency stop are evaluated before profit-taking.
    pub async fn run_monitor_cycle(&self) {
        self.worker().cycle().await;
    }

    /// Flatten every active sequence (explicit hand-over to the source feed)
    pub async fn hand_over(&self, reason: &str) {
        let ids: Vec<String> = {
            let sequences = self.sequences.lock().unwrap();
            sequences
                .values()
                .filter(|s| s.active)
                .map(|s| s.id.clone())
                .collect()
        };
        let worker = self.worker();
        for id in ids {
            worker.close_sequence(&id, reason).await;
        }
    }
}

#[async_trait]
impl Strategy for TieredStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn decide(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> anyhow::Result<StrategyDecision> {
        if signal.kind == SignalKind::Control {
            return Ok(StrategyDecision::ignore("control signals are not traded"));
        }

        if signal.is_closing() {
            // The source is flattening: hand control back immediately,
            // regardless of sequence PnL
            tracing::warn!(
                strategy = %self.core.name(),
                signal_id = %signal.id,
                "closing signal from feed, handing over"
            );
            self.hand_over("hand-over").await;
            return Ok(StrategyDecision::ignore(
                "hand-over: sequences flattened on closing signal",
            ));
        }

        let tier = signal.quantity as u32;
        if tier == 0 {
            return Ok(StrategyDecision::ignore("quantity maps to no tier"));
        }

        let Some(signal_direction) = signal.direction() else {
            return Ok(StrategyDecision::ignore("signal carries no direction"));
        };

        let existing = self.find_active_sequence(signal_direction);

        if let Some(seq_id) = &existing {
            let sequences = self.sequences.lock().unwrap();
            if let Some(sequence) = sequences.get(seq_id) {
                // No duplicate-tier stacking: repeated identical signals must
                // not balloon the sequence
                if sequence.tiers.contains(&tier) {
                    return Ok(StrategyDecision::ignore(format!(
                        "tier {} already present in sequence {}",
                        tier, seq_id
                    )));
                }
            }
        } else if self.active_sequence_count() >= self.config.max_active_sequences {
            return Ok(StrategyDecision::ignore(format!(
                "at sequence cap ({})",
                self.config.max_active_sequences
            )));
        }

        let size = self.tier_size(tier, signal);
        if size <= 0.0 {
            return Ok(StrategyDecision::ignore(format!(
                "tier {} sized at zero",
                tier
            )));
        }

        if let Some(seq_id) = &existing {
            let ceiling = self.config.max_position_size * self.config.max_sequence_ratio;
            let total = self
                .sequences
                .lock()
                .unwrap()
                .get(seq_id)
                .map(|s| s.total_size)
                .unwrap_or(0.0);
            if total + size > ceiling {
                return Ok(StrategyDecision::ignore(format!(
                    "sequence size {} + {} would exceed ceiling {}",
                    total, size, ceiling
                )));
            }
        }

        let our_direction = signal_direction.opposite();
        if self.book.lock().unwrap().would_exceed_limit(
            &signal.symbol,
            our_direction,
            size,
            self.config.max_position_size,
        ) {
            return Ok(StrategyDecision::ignore("risk limit would be exceeded"));
        }

        let action = match our_direction {
            Direction::Long => SignalAction::OpenLong,
            Direction::Short => SignalAction::OpenShort,
        };
        let sequence_id = existing.clone().unwrap_or_else(|| {
            format!(
                "seq-{}-{}",
                signal_direction.as_str(),
                &Uuid::new_v4().simple().to_string()[..8]
            )
        });

        Ok(StrategyDecision::execute(
            action,
            size,
            &signal.symbol,
            validation.confidence_score,
            format!(
                "tier {} rolls into sequence {}: opening {} {:.1} {}",
                tier,
                sequence_id,
                our_direction.as_str(),
                size,
                signal.symbol
            ),
        )
        .with_meta("signal_id", serde_json::json!(signal.id))
        .with_meta("tier", serde_json::json!(tier))
        .with_meta("sequence_id", serde_json::json!(sequence_id))
        .with_meta("is_new_sequence", serde_json::json!(existing.is_none()))
        .with_meta(
            "signal_direction",
            serde_json::json!(signal_direction.as_str()),
        ))
    }

    async fn execute_decision(&self, decision: &StrategyDecision) -> anyhow::Result<bool> {
        if !decision.is_execute() {
            return Ok(true);
        }

        let direction = match decision.action {
            Some(SignalAction::OpenLong) => Direction::Long,
            Some(SignalAction::OpenShort) => Direction::Short,
            other => anyhow::bail!("unexpected decision action {:?}", other),
        };
        let tier: u32 = decision
            .metadata
            .get("tier")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or_else(|| anyhow::anyhow!("decision missing tier"))?;
        let sequence_id: String = decision
            .metadata
            .get("sequence_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("decision missing sequence id"))?;

        let side = match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };
        let request = OrderRequest::market(
            &decision.symbol,
            side,
            decision.quantity,
            self.core.name(),
        )
        .with_pos_side(direction);

        let result = self.executor.execute(request).await?;
        if !result.is_filled() {
            tracing::warn!(
                strategy = %self.core.name(),
                sequence_id = %sequence_id,
                status = ?result.status,
                error = ?result.error,
                "sequence entry did not fill"
            );
            return Ok(false);
        }

        let signal_id = decision
            .metadata
            .get("signal_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let position_id = self.book.lock().unwrap().create(
            &decision.symbol,
            direction,
            result.filled_amount,
            result.average_price,
            self.core.name(),
            signal_id,
        );

        {
            let mut sequences = self.sequences.lock().unwrap();
            let sequence = sequences.entry(sequence_id.clone()).or_insert_with(|| Sequence {
                id: sequence_id.clone(),
                signal_direction: direction.opposite(),
                position_ids: Vec::new(),
                tiers: HashSet::new(),
                fired_tiers: HashSet::new(),
                highest_tier: 0,
                total_size: 0.0,
                started_at: Utc::now(),
                active: true,
            });
            sequence.position_ids.push(position_id);
            sequence.tiers.insert(tier);
            sequence.highest_tier = sequence.highest_tier.max(tier);
            sequence.total_size += result.filled_amount;
        }

        tracing::info!(
            strategy = %self.core.name(),
            sequence_id = %sequence_id,
            position_id = %position_id,
            tier,
            entry = result.average_price,
            "sequence position opened"
        );

        // A fresh entry can already put the sequence over its tier threshold
        self.worker().check_partial_profit(&sequence_id).await;

        Ok(true)
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let worker = self.worker();
        let interval = Duration::from_millis(self.config.monitor_interval_ms);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tick.tick() => worker.cycle().await,
                }
            }
        });

        *self.monitor_task.lock().unwrap() = Some((token, handle));
        Ok(())
    }

    async fn on_stop(&self) {
        let taken = self.monitor_task.lock().unwrap().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.await;
        }
    }

    fn status(&self) -> StrategyStatus {
        let sequences = self.sequences.lock().unwrap();
        let active: Vec<_> = sequences.values().filter(|s| s.active).collect();
        let total_positions: usize = sequences.values().map(|s| s.position_ids.len()).sum();

        self.core.status(serde_json::json!({
            "active_sequences": active.len(),
            "max_sequences": self.config.max_active_sequences,
            "total_positions": total_positions,
            "sequences": active.iter().map(|s| serde_json::json!({
                "id": s.id,
                "signal_direction": s.signal_direction.as_str(),
                "highest_tier": s.highest_tier,
                "total_size": s.total_size,
                "positions": s.position_ids.len(),
                "fired_tiers": s.fired_tiers.iter().copied().collect::<Vec<u32>>(),
            })).collect::<Vec<_>>(),
        }))
    }

    fn utilization(&self) -> f64 {
        self.active_sequence_count() as f64 / self.config.max_active_sequences.max(1) as f64
    }

    fn affinity(&self, signal: &Signal, validation: &ValidationResult) -> f64 {
        let mut score = validation.confidence_score * 0.3;
        if signal.quantity >= 3.0 {
            score += 0.5;
        }
        if validation.confidence_score >= 0.7 {
            score += 0.3;
        }
        score
    }
}

#[derive(Clone)]
struct SequenceWorker {
    config: TieredConfig,
    exchange: Arc<dyn ExchangeApi>,
    executor: Arc<OrderExecutor>,
    book: Arc<Mutex<PositionBook>>,
    core: Arc<StrategyCore>,
    sequences: Arc<Mutex<HashMap<String, Sequence>>>,
}

impl SequenceWorker {
    async fn cycle(&self) {
        let ids: Vec<String> = {
            let sequences = self.sequences.lock().unwrap();
            sequences
                .values()
                .filter(|s| s.active)
                .map(|s| s.id.clone())
                .collect()
        };

        for id in ids {
            // Timeout and emergency stop always win over profit-taking
            if self.timed_out(&id) {
                self.close_sequence(&id, "timeout").await;
                continue;
            }

            let Some(pnl_fraction) = self.aggregate_pnl(&id).await else {
                continue;
            };

            if pnl_fraction <= self.config.emergency_stop_loss {
                tracing::warn!(
                    sequence_id = %id,
                    pnl_fraction,
                    "emergency stop tripped"
                );
                self.close_sequence(&id, "emergency-stop").await;
                continue;
            }

            self.partial_profit_if_armed(&id, pnl_fraction).await;
        }
    }

    fn timed_out(&self, sequence_id: &str) -> bool {
        let sequences = self.sequences.lock().unwrap();
        let Some(sequence) = sequences.get(sequence_id) else {
            return false;
        };
        (Utc::now() - sequence.started_at).num_hours() >= self.config.sequence_timeout_hours
    }

    fn open_positions_of(&self, sequence_id: &str) -> Vec<(Uuid, String, Direction, f64, f64)> {
        let position_ids = {
            let sequences = self.sequences.lock().unwrap();
            match sequences.get(sequence_id) {
                Some(s) => s.position_ids.clone(),
                None => return Vec::new(),
            }
        };

        let book = self.book.lock().unwrap();
        position_ids
            .iter()
            .filter_map(|id| book.get(*id))
            .filter(|p| p.is_open())
            .map(|p| (p.id, p.symbol.clone(), p.side, p.size, p.entry_price))
            .collect()
    }

    /// Refresh prices and compute the aggregate PnL fraction over open
    /// positions; None when nothing is open
    async fn aggregate_pnl(&self, sequence_id: &str) -> Option<f64> {
        let open = self.open_positions_of(sequence_id);
        if open.is_empty() {
            return None;
        }

        let mut prices: HashMap<String, f64> = HashMap::new();
        for (_, symbol, ..) in &open {
            if prices.contains_key(symbol) {
                continue;
            }
            match self.exchange.fetch_ticker(symbol).await {
                Ok(ticker) => {
                    prices.insert(symbol.clone(), ticker.last);
                }
                Err(e) => {
                    tracing::warn!(sequence_id, symbol = %symbol, error = %e, "price refresh failed");
                }
            }
        }

        let mut book = self.book.lock().unwrap();
        let mut total_pnl = 0.0;
        let mut total_invested = 0.0;
        for (id, symbol, _, _, _) in &open {
            if let Some(&price) = prices.get(symbol) {
                let _ = book.update_price(*id, price);
            }
            if let Some(position) = book.get(*id) {
                total_pnl += position.unrealized_pnl();
                total_invested += position.entry_price * position.size;
            }
        }

        if total_invested > 0.0 {
            Some(total_pnl / total_invested)
        } else {
            None
        }
    }

    async fn check_partial_profit(&self, sequence_id: &str) {
        if let Some(pnl_fraction) = self.aggregate_pnl(sequence_id).await {
            self.partial_profit_if_armed(sequence_id, pnl_fraction).await;
        }
    }

    async fn partial_profit_if_armed(&self, sequence_id: &str, pnl_fraction: f64) {
        let (tier, threshold, ratio) = {
            let sequences = self.sequences.lock().unwrap();
            let Some(sequence) = sequences.get(sequence_id) else {
                return;
            };
            let tier = sequence.highest_tier;
            // Each tier's partial-profit rule fires at most once per sequence
            if sequence.fired_tiers.contains(&tier) {
                return;
            }
            let threshold = self
                .config
                .profit_thresholds
                .get(&tier)
                .copied()
                .unwrap_or(0.30);
            let ratio = self.config.close_ratios.get(&tier).copied().unwrap_or(0.0);
            (tier, threshold, ratio)
        };

        if threshold <= 0.0 || ratio <= 0.0 || pnl_fraction < threshold {
            return;
        }

        let open = self.open_positions_of(sequence_id);
        let total_open: f64 = open.iter().map(|(_, _, _, size, _)| size).sum();
        let close_size = total_open * ratio;

        tracing::info!(
            sequence_id,
            tier,
            pnl_fraction,
            close_ratio = ratio,
            close_size,
            "partial profit-taking armed"
        );

        let mut remaining = close_size;
        for (id, symbol, side, size, _) in open {
            if remaining <= 0.0 {
                break;
            }
            let portion = (size * ratio).min(remaining);
            if portion <= 0.0 {
                continue;
            }

            let close_side = match side {
                Direction::Long => OrderSide::Sell,
                Direction::Short => OrderSide::Buy,
            };
            let request = OrderRequest::market(&symbol, close_side, portion, self.core.name())
                .with_pos_side(side);

            match self.executor.execute(request).await {
                Ok(result) if result.is_filled() => {
                    if let Err(e) = self.book.lock().unwrap().reduce(
                        id,
                        portion,
                        result.average_price,
                        result.venue_order_id.clone(),
                    ) {
                        tracing::error!(position_id = %id, error = %e, "registry reduce failed");
                        continue;
                    }
                    remaining -= portion;
                }
                Ok(result) => {
                    tracing::error!(
                        position_id = %id,
                        status = ?result.status,
                        "partial close did not fill"
                    );
                }
                Err(e) => {
                    tracing::error!(position_id = %id, error = %e, "partial close failed");
                }
            }
        }

        let mut sequences = self.sequences.lock().unwrap();
        if let Some(sequence) = sequences.get_mut(sequence_id) {
            sequence.fired_tiers.insert(tier);
        }
    }

    async fn close_sequence(&self, sequence_id: &str, reason: &str) {
        let open = self.open_positions_of(sequence_id);

        for (id, symbol, side, size, entry) in open {
            let close_side = match side {
                Direction::Long => OrderSide::Sell,
                Direction::Short => OrderSide::Buy,
            };
            let request = OrderRequest::market(&symbol, close_side, size, self.core.name())
                .with_pos_side(side);

            match self.executor.execute(request).await {
                Ok(result) if result.is_filled() => {
                    let close_price = result.average_price;
                    let pnl = match side {
                        Direction::Long => (close_price - entry) * size,
                        Direction::Short => (entry - close_price) * size,
                    };
                    if let Err(e) = self.book.lock().unwrap().close(
                        id,
                        close_price,
                        result.venue_order_id.clone(),
                    ) {
                        tracing::error!(position_id = %id, error = %e, "registry close failed");
                        continue;
                    }
                    self.core.record_trade(pnl > 0.0, pnl);
                }
                Ok(result) => {
                    tracing::error!(
                        position_id = %id,
                        status = ?result.status,
                        "sequence close did not fill"
                    );
                }
                Err(e) => {
                    tracing::error!(position_id = %id, error = %e, "sequence close failed");
                }
            }
        }

        let mut sequences = self.sequences.lock().unwrap();
        if let Some(sequence) = sequences.get_mut(sequence_id) {
            sequence.active = false;
        }
        tracing::info!(sequence_id, reason, "sequence closed");
    }
}
