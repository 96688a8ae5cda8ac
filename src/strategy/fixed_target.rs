use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Strategy, StrategyCore, StrategyDecision, StrategyStatus};
use crate::exchange::ExchangeApi;
use crate::execution::{OrderExecutor, OrderRequest, OrderSide};
use crate::models::{Direction, Signal, SignalAction};
use crate::position::PositionBook;
use crate::signal::ValidationResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedTargetConfig {
    #[serde(default = "default_base_size")]
    pub base_size: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    /// Close when unrealized PnL reaches this percentage
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: f64,
    /// Close when unrealized PnL falls to this percentage (negative)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_position_timeout_hours")]
    pub position_timeout_hours: i64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_base_size() -> f64 {
    10.0
}
fn default_max_position_size() -> f64 {
    1000.0
}
fn default_profit_target_pct() -> f64 {
    30.0
}
fn default_stop_loss_pct() -> f64 {
    -15.0
}
fn default_position_timeout_hours() -> i64 {
    6
}
fn default_max_concurrent_positions() -> usize {
    5
}
fn default_min_confidence() -> f64 {
    0.3
}
fn default_monitor_interval_ms() -> u64 {
    2000
}

impl Default for FixedTargetConfig {
    fn default() -> Self {
        Self {
            base_size: default_base_size(),
            max_position_size: default_max_position_size(),
            profit_target_pct: default_profit_target_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            position_timeout_hours: default_position_timeout_hours(),
            max_concurrent_positions: default_max_concurrent_positions(),
            min_confidence: default_min_confidence(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

/// Fixed-target reverse strategy.
///
/// Every open-direction signal is answered with a market position on the
/// exact opposite side. Each position runs independently to a fixed profit
/// target, stop loss, or timeout; closing signals from the feed are ignored.
pub struct FixedTargetStrategy {
    core: Arc<StrategyCore>,
    config: FixedTargetConfig,
    exchange: Arc<dyn ExchangeApi>,
    executor: Arc<OrderExecutor>,
    book: Arc<Mutex<PositionBook>>,
    conservative: Arc<AtomicBool>,
    monitor_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FixedTargetStrategy {
    pub fn new(
        name: &str,
        config: FixedTargetConfig,
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
            monitor_task: Mutex::new(None),
        }
    }

    fn open_count(&self) -> usize {
        self.book
            .lock()
            .unwrap()
            .open_count_for_strategy(self.core.name())
    }

    fn position_size(&self, signal: &Signal) -> f64 {
        let confidence_factor = signal.confidence.max(0.5);
        let mut size = self.config.base_size * signal.quantity * confidence_factor;
        if self.conservative.load(Ordering::SeqCst) {
            size *= 0.5;
        }
        size = size.min(self.config.max_position_size);
        (size * 10.0).round() / 10.0
    }

    fn monitor(&self) -> PositionMonitor {
        PositionMonitor {
            config: self.config.clone(),
            exchange: self.exchange.clone(),
            executor: self.executor.clone(),
            book: self.book.clone(),
            core: self.core.clone(),
        }
    }

    /// One pass of the close-condition check, exposed for deterministic tests
    pub async fn run_monitor_cycle(&self) {
        self.monitor().cycle().await;
    }
}

#[async_trait]
impl Strategy for FixedTargetStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn decide(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> anyhow::Result<StrategyDecision> {
        if validation.confidence_score < self.config.min_confidence {
            return Ok(StrategyDecision::ignore(format!(
                "confidence {:.2} below floor {:.2}",
                validation.confidence_score, self.config.min_confidence
            )));
        }

        // Closing signals are ignored: exits are owned by the monitor
        if !signal.is_opening() {
            return Ok(StrategyDecision::ignore(
                "only open signals are reversed, exits are managed internally",
            ));
        }

        let open = self.open_count();
        if open >= self.config.max_concurrent_positions {
            return Ok(StrategyDecision::ignore(format!(
                "at concurrent position cap ({}/{})",
                open, self.config.max_concurrent_positions
            )));
        }

        let Some(signal_direction) = signal.direction() else {
            return Ok(StrategyDecision::ignore("signal carries no direction"));
        };
        let our_direction = signal_direction.opposite();
        let action = match our_direction {
            Direction::Long => SignalAction::OpenLong,
            Direction::Short => SignalAction::OpenShort,
        };

        let size = self.position_size(signal);
        if size <= 0.0 {
            return Ok(StrategyDecision::ignore("computed size is zero"));
        }

        if self.book.lock().unwrap().would_exceed_limit(
            &signal.symbol,
            our_direction,
            size,
            self.config.max_position_size,
        ) {
            return Ok(StrategyDecision::ignore("risk limit would be exceeded"));
        }

        Ok(StrategyDecision::execute(
            action,
            size,
            &signal.symbol,
            validation.confidence_score,
            format!(
                "reversing {}: opening {} {:.1} {}",
                signal.action.as_str(),
                our_direction.as_str(),
                size,
                signal.symbol
            ),
        )
        .with_meta("signal_id", serde_json::json!(signal.id))
        .with_meta(
            "profit_target_pct",
            serde_json::json!(self.config.profit_target_pct),
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
                status = ?result.status,
                error = ?result.error,
                "reverse entry did not fill"
            );
            return Ok(false);
        }

        let entry = result.average_price;
        let signal_id = decision
            .metadata
            .get("signal_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let (take_profit, stop_loss) = match direction {
            Direction::Long => (
                entry * (1.0 + self.config.profit_target_pct / 100.0),
                entry * (1.0 + self.config.stop_loss_pct / 100.0),
            ),
            Direction::Short => (
                entry * (1.0 - self.config.profit_target_pct / 100.0),
                entry * (1.0 - self.config.stop_loss_pct / 100.0),
            ),
        };

        let mut book = self.book.lock().unwrap();
        let position_id = book.create(
            &decision.symbol,
            direction,
            result.filled_amount,
            entry,
            self.core.name(),
            signal_id,
        );
        book.set_protection(position_id, Some(stop_loss), Some(take_profit))?;

        tracing::info!(
            strategy = %self.core.name(),
            position_id = %position_id,
            entry,
            take_profit,
            stop_loss,
            "reverse position opened"
        );

        Ok(true)
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let monitor = self.monitor();
        let interval = Duration::from_millis(self.config.monitor_interval_ms);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tick.tick() => monitor.cycle().await,
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
        let book = self.book.lock().unwrap();
        let positions = book.positions_for_strategy(self.core.name());
        let open: Vec<_> = positions.iter().filter(|p| p.is_open()).collect();
        let unrealized: f64 = open.iter().map(|p| p.unrealized_pnl()).sum();

        self.core.status(serde_json::json!({
            "active_positions": open.len(),
            "max_concurrent": self.config.max_concurrent_positions,
            "unrealized_pnl": unrealized,
            "profit_target_pct": self.config.profit_target_pct,
            "stop_loss_pct": self.config.stop_loss_pct,
            "position_timeout_hours": self.config.position_timeout_hours,
            "conservative": self.conservative.load(Ordering::SeqCst),
        }))
    }

    fn utilization(&self) -> f64 {
        self.open_count() as f64 / self.config.max_concurrent_positions.max(1) as f64
    }

    fn affinity(&self, signal: &Signal, validation: &ValidationResult) -> f64 {
        let mut score = validation.confidence_score * 0.3;
        if signal.quantity <= 3.0 {
            score += 0.4;
        }
        if validation.confidence_score >= 0.5 {
            score += 0.3;
        }
        score
    }
}

#[derive(Clone)]
struct PositionMonitor {
    config: FixedTargetConfig,
    exchange: Arc<dyn ExchangeApi>,
    executor: Arc<OrderExecutor>,
    book: Arc<Mutex<PositionBook>>,
    core: Arc<StrategyCore>,
}

impl PositionMonitor {
    async fn cycle(&self) {
        let targets: Vec<(Uuid, String)> = {
            let book = self.book.lock().unwrap();
            book.positions_for_strategy(self.core.name())
                .iter()
                .filter(|p| p.is_open())
                .map(|p| (p.id, p.symbol.clone()))
                .collect()
        };

        for (id, symbol) in targets {
            let ticker = match self.exchange.fetch_ticker(&symbol).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(position_id = %id, symbol = %symbol, error = %e, "price refresh failed");
                    continue;
                }
            };

            let verdict = {
                let mut book = self.book.lock().unwrap();
                if book.update_price(id, ticker.last).is_err() {
                    continue;
                }
                book.get(id).and_then(|p| self.close_reason(p))
            };

            if let Some(reason) = verdict {
                self.close_position(id, reason).await;
            }
        }
    }

    /// Close conditions in priority order: take-profit, stop-loss, timeout
    fn close_reason(&self, position: &crate::position::Position) -> Option<&'static str> {
        let pnl_pct = position.pnl_pct();
        if pnl_pct >= self.config.profit_target_pct {
            return Some("take-profit");
        }
        if pnl_pct <= self.config.stop_loss_pct {
            return Some("stop-loss");
        }
        let age = Utc::now() - position.created_at;
        if age.num_hours() >= self.config.position_timeout_hours {
            return Some("timeout");
        }
        None
    }

    async fn close_position(&self, id: Uuid, reason: &str) {
        let Some((symbol, side, size, entry)) = ({
            let book = self.book.lock().unwrap();
            book.get(id)
                .map(|p| (p.symbol.clone(), p.side, p.size, p.entry_price))
        }) else {
            return;
        };

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

                if let Err(e) = self.book.lock().unwrap().close(id, close_price, result.venue_order_id.clone()) {
                    tracing::error!(position_id = %id, error = %e, "registry close failed");
                    return;
                }
                self.core.record_trade(pnl > 0.0, pnl);

                tracing::info!(
                    strategy = %self.core.name(),
                    position_id = %id,
                    reason,
                    close_price,
                    pnl,
                    "position closed"
                );
            }
            Ok(result) => {
                tracing::error!(
                    position_id = %id,
                    status = ?result.status,
                    error = ?result.error,
                    "close order did not fill"
                );
            }
            Err(e) => {
                tracing::error!(position_id = %id, error = %e, "close order failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::execution::ExecutorConfig;
    use crate::models::SignalKind;
    use crate::position::PositionStatus;

    const SYMBOL: &str = "BTC-USDT-SWAP";

    struct Harness {
        venue: Arc<PaperExchange>,
        strategy: FixedTargetStrategy,
        book: Arc<Mutex<PositionBook>>,
        conservative: Arc<AtomicBool>,
    }

    fn harness() -> Harness {
        let venue = Arc::new(PaperExchange::new());
        venue.set_price(SYMBOL, 100.0);

        let executor = Arc::new(OrderExecutor::new(
            venue.clone(),
            ExecutorConfig {
                fill_poll_ms: 10,
                order_timeout_secs: 1,
                ..Default::default()
            },
        ));
        let book = Arc::new(Mutex::new(PositionBook::new()));
        let conservative = Arc::new(AtomicBool::new(false));

        let strategy = FixedTargetStrategy::new(
            "reverse-fixed",
            FixedTargetConfig::default(),
            venue.clone(),
            executor,
            book.clone(),
            conservative.clone(),
        );

        Harness {
            venue,
            strategy,
            book,
            conservative,
        }
    }

    fn open_long(quantity: f64, confidence: f64) -> Signal {
        let mut signal = Signal::directional(
            format!("[open-long] qty:{} market:{}", quantity, SYMBOL),
            SignalAction::OpenLong,
            quantity,
            SYMBOL.into(),
        );
        signal.confidence = confidence;
        signal
    }

    #[tokio::test]
    async fn test_reverses_open_long_into_short() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;

        assert!(decision.is_execute());
        assert_eq!(decision.action, Some(SignalAction::OpenShort));
        // base 10 * qty 1 * max(0.5, 0.9)
        assert_eq!(decision.quantity, 9.0);
    }

    #[tokio::test]
    async fn test_confidence_factor_floors_at_half() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(2.0, 0.1), &ValidationResult::passing())
            .await;

        assert!(decision.is_execute());
        // base 10 * qty 2 * floor 0.5
        assert_eq!(decision.quantity, 10.0);
    }

    #[tokio::test]
    async fn test_low_validation_score_ignored() {
        let h = harness();
        h.strategy.start().await;

        let mut validation = ValidationResult::passing();
        validation.confidence_score = 0.2;

        let decision = h.strategy.process_signal(&open_long(1.0, 0.9), &validation).await;

        assert!(!decision.is_execute());
        assert!(decision.reasoning.contains("below floor"));
    }

    #[tokio::test]
    async fn test_closing_signals_ignored() {
        let h = harness();
        h.strategy.start().await;

        let close = Signal::directional(
            format!("[close-long] qty:1 market:{}", SYMBOL),
            SignalAction::CloseLong,
            1.0,
            SYMBOL.into(),
        );
        let decision = h
            .strategy
            .process_signal(&close, &ValidationResult::passing())
            .await;

        assert!(!decision.is_execute());
        assert!(decision.reasoning.contains("exits are managed internally"));
    }

    #[tokio::test]
    async fn test_position_cap_rejects_not_queues() {
        let h = harness();
        h.strategy.start().await;

        {
            let mut book = h.book.lock().unwrap();
            for _ in 0..5 {
                book.create(SYMBOL, Direction::Short, 1.0, 100.0, "reverse-fixed", None);
            }
        }

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;

        assert!(!decision.is_execute());
        assert!(decision.reasoning.contains("cap"));
    }

    #[tokio::test]
    async fn test_conservative_mode_halves_size() {
        let h = harness();
        h.strategy.start().await;
        h.conservative.store(true, Ordering::SeqCst);

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;

        assert_eq!(decision.quantity, 4.5);
    }

    #[tokio::test]
    async fn test_execute_opens_position_with_protection() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;
        assert!(h.strategy.execute_decision(&decision).await.unwrap());

        let book = h.book.lock().unwrap();
        let positions = book.positions_for_strategy("reverse-fixed");
        assert_eq!(positions.len(), 1);

        let position = positions[0];
        assert_eq!(position.side, Direction::Short);
        assert_eq!(position.entry_price, 100.0);
        // Short from 100: profit at 70, stop at 115
        assert_eq!(position.take_profit, Some(70.0));
        assert_eq!(position.stop_loss, Some(115.0));
    }

    #[tokio::test]
    async fn test_monitor_takes_profit_at_thirty_pct() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;
        h.strategy.execute_decision(&decision).await.unwrap();

        // Short from 100; a 30% favorable move is price 70
        h.venue.set_price(SYMBOL, 70.0);
        h.strategy.run_monitor_cycle().await;

        let book = h.book.lock().unwrap();
        let position = book.positions_for_strategy("reverse-fixed")[0];
        assert_eq!(position.status, PositionStatus::Closed);

        let metrics = h.strategy.core().metrics();
        assert_eq!(metrics.successful_trades, 1);
        assert!(metrics.total_pnl > 0.0);
    }

    #[tokio::test]
    async fn test_monitor_stops_loss_at_minus_fifteen_pct() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;
        h.strategy.execute_decision(&decision).await.unwrap();

        // Short from 100; price 115 is -15%
        h.venue.set_price(SYMBOL, 115.0);
        h.strategy.run_monitor_cycle().await;

        let book = h.book.lock().unwrap();
        let position = book.positions_for_strategy("reverse-fixed")[0];
        assert_eq!(position.status, PositionStatus::Closed);

        let metrics = h.strategy.core().metrics();
        assert_eq!(metrics.failed_trades, 1);
        assert!(metrics.total_pnl < 0.0);
    }

    #[tokio::test]
    async fn test_monitor_times_out_stale_position() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;
        h.strategy.execute_decision(&decision).await.unwrap();

        // Age the position past the 6h window; price unchanged
        {
            let mut book = h.book.lock().unwrap();
            let id = book.positions_for_strategy("reverse-fixed")[0].id;
            book.positions.get_mut(&id).unwrap().created_at =
                Utc::now() - chrono::Duration::hours(7);
        }

        h.strategy.run_monitor_cycle().await;

        let book = h.book.lock().unwrap();
        let position = book.positions_for_strategy("reverse-fixed")[0];
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_monitor_leaves_healthy_position_open() {
        let h = harness();
        h.strategy.start().await;

        let decision = h
            .strategy
            .process_signal(&open_long(1.0, 0.9), &ValidationResult::passing())
            .await;
        h.strategy.execute_decision(&decision).await.unwrap();

        // Small favorable move only
        h.venue.set_price(SYMBOL, 95.0);
        h.strategy.run_monitor_cycle().await;

        let book = h.book.lock().unwrap();
        let position = book.positions_for_strategy("reverse-fixed")[0];
        assert!(position.is_open());
    }

    #[tokio::test]
    async fn test_control_signals_carry_no_direction() {
        let h = harness();
        h.strategy.start().await;

        let control = Signal::control("pause".into(), crate::models::ControlCommand::Pause);
        assert_eq!(control.kind, SignalKind::Control);

        let decision = h
            .strategy
            .process_signal(&control, &ValidationResult::passing())
            .await;
        assert!(!decision.is_execute());
    }
}
