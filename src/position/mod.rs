use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Direction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    /// Partially closed, some size remaining
    Partial,
    Closed,
    Liquidated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FillKind {
    Entry,
    Exit,
}

/// One executed fill contributing to a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub quantity: f64,
    pub price: f64,
    pub kind: FillKind,
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<String>,
}

impl Fill {
    pub fn entry(quantity: f64, price: f64, order_id: Option<String>) -> Self {
        Self {
            quantity,
            price,
            kind: FillKind::Entry,
            timestamp: Utc::now(),
            order_id,
        }
    }

    pub fn exit(quantity: f64, price: f64, order_id: Option<String>) -> Self {
        Self {
            quantity,
            price,
            kind: FillKind::Exit,
            timestamp: Utc::now(),
            order_id,
        }
    }
}

/// A live or historical position.
///
/// Invariants: `size >= 0`; `status == Closed` exactly when `size == 0`;
/// the entry price is the fill-size-weighted mean of the entry fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entry_fills: Vec<Fill>,
    pub exit_fills: Vec<Fill>,
    pub strategy: String,
    pub signal_id: Option<Uuid>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Position {
    /// Unrealized PnL at the current price
    pub fn unrealized_pnl(&self) -> f64 {
        if self.current_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Direction::Long => (self.current_price - self.entry_price) * self.size,
            Direction::Short => (self.entry_price - self.current_price) * self.size,
        }
    }

    /// Unrealized PnL as a percentage of the entry notional
    pub fn pnl_pct(&self) -> f64 {
        let notional = self.entry_price * self.size;
        if notional <= 0.0 {
            return 0.0;
        }
        self.unrealized_pnl() / notional * 100.0
    }

    /// Fill-size-weighted mean entry price
    pub fn weighted_entry_price(&self) -> f64 {
        let mut total_value = 0.0;
        let mut total_quantity = 0.0;
        for fill in &self.entry_fills {
            total_value += fill.price * fill.quantity;
            total_quantity += fill.quantity;
        }
        if total_quantity > 0.0 {
            total_value / total_quantity
        } else {
            self.entry_price
        }
    }

    pub fn hit_take_profit(&self) -> bool {
        let Some(tp) = self.take_profit else {
            return false;
        };
        match self.side {
            Direction::Long => self.current_price >= tp,
            Direction::Short => self.current_price <= tp,
        }
    }

    pub fn hit_stop_loss(&self) -> bool {
        let Some(sl) = self.stop_loss else {
            return false;
        };
        match self.side {
            Direction::Long => self.current_price <= sl,
            Direction::Short => self.current_price >= sl,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::Partial)
    }

    fn apply_entry_fill(&mut self, fill: Fill) {
        self.size += fill.quantity;
        self.entry_fills.push(fill);
        self.entry_price = self.weighted_entry_price();
        self.updated_at = Utc::now();
    }

    fn apply_exit_fill(&mut self, fill: Fill) {
        self.size = (self.size - fill.quantity).max(0.0);
        self.exit_fills.push(fill);
        if self.size <= 0.0 {
            self.status = PositionStatus::Closed;
        } else {
            self.status = PositionStatus::Partial;
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BookStats {
    pub total_positions: usize,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub unrealized_pnl: f64,
}

/// The position registry. The single writer of position state: every other
/// component reads snapshots or submits mutations through these methods.
/// Callers share one instance behind `Arc<Mutex<_>>`, which serializes all
/// mutating operations.
pub struct PositionBook {
    pub(crate) positions: HashMap<Uuid, Position>,
    by_strategy: HashMap<String, Vec<Uuid>>,
    by_symbol: HashMap<String, Vec<Uuid>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            by_strategy: HashMap::new(),
            by_symbol: HashMap::new(),
        }
    }

    /// Open a new position from a filled entry order
    pub fn create(
        &mut self,
        symbol: &str,
        side: Direction,
        size: f64,
        entry_price: f64,
        strategy: &str,
        signal_id: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let position = Position {
            id,
            symbol: symbol.to_string(),
            side,
            size,
            entry_price,
            current_price: entry_price,
            status: PositionStatus::Open,
            created_at: now,
            updated_at: now,
            entry_fills: vec![Fill::entry(size, entry_price, None)],
            exit_fills: Vec::new(),
            strategy: strategy.to_string(),
            signal_id,
            stop_loss: None,
            take_profit: None,
        };

        self.by_strategy
            .entry(strategy.to_string())
            .or_default()
            .push(id);
        self.by_symbol
            .entry(symbol.to_string())
            .or_default()
            .push(id);
        self.positions.insert(id, position);

        tracing::info!(
            position_id = %id,
            symbol,
            side = side.as_str(),
            size,
            entry_price,
            strategy,
            "position opened"
        );

        id
    }

    pub fn get(&self, id: Uuid) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn set_protection(
        &mut self,
        id: Uuid,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        Ok(())
    }

    /// Increase size; the entry price is recomputed as the weighted mean
    pub fn add_to(&mut self, id: Uuid, quantity: f64, price: f64, order_id: Option<String>) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        if !position.is_open() {
            anyhow::bail!("position {} is closed", id);
        }

        position.apply_entry_fill(Fill::entry(quantity, price, order_id));

        tracing::info!(
            position_id = %id,
            added = quantity,
            price,
            new_size = position.size,
            avg_entry = position.entry_price,
            "position increased"
        );
        Ok(())
    }

    /// Decrease size by at most the current size; transitions to
    /// Partial/Closed automatically
    pub fn reduce(&mut self, id: Uuid, quantity: f64, price: f64, order_id: Option<String>) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        if !position.is_open() {
            anyhow::bail!("position {} is closed", id);
        }

        let quantity = quantity.min(position.size);
        position.apply_exit_fill(Fill::exit(quantity, price, order_id));

        tracing::info!(
            position_id = %id,
            reduced = quantity,
            price,
            remaining = position.size,
            status = ?position.status,
            "position reduced"
        );
        Ok(())
    }

    /// Close out whatever size remains
    pub fn close(&mut self, id: Uuid, price: f64, order_id: Option<String>) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        if !position.is_open() {
            anyhow::bail!("position {} already closed", id);
        }

        let remaining = position.size;
        position.current_price = price;
        position.apply_exit_fill(Fill::exit(remaining, price, order_id));

        tracing::info!(
            position_id = %id,
            closed = remaining,
            price,
            pnl = position.unrealized_pnl(),
            "position closed"
        );
        Ok(())
    }

    pub fn update_price(&mut self, id: Uuid, price: f64) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        position.current_price = price;
        position.updated_at = Utc::now();
        Ok(())
    }

    pub fn positions_for_strategy(&self, strategy: &str) -> Vec<&Position> {
        self.by_strategy
            .get(strategy)
            .map(|ids| ids.iter().filter_map(|id| self.positions.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn positions_for_symbol(&self, symbol: &str) -> Vec<&Position> {
        self.by_symbol
            .get(symbol)
            .map(|ids| ids.iter().filter_map(|id| self.positions.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions.values().filter(|p| p.is_open()).collect()
    }

    pub fn open_count_for_strategy(&self, strategy: &str) -> usize {
        self.positions_for_strategy(strategy)
            .iter()
            .filter(|p| p.is_open())
            .count()
    }

    /// Risk check: would adding `delta` of same-direction exposure on the
    /// instrument exceed `ceiling`? Callers check before opening or adding.
    pub fn would_exceed_limit(
        &self,
        symbol: &str,
        side: Direction,
        delta: f64,
        ceiling: f64,
    ) -> bool {
        let existing: f64 = self
            .positions_for_symbol(symbol)
            .iter()
            .filter(|p| p.side == side && p.is_open())
            .map(|p| p.size)
            .sum();

        let total = existing + delta;
        if total > ceiling {
            tracing::warn!(
                symbol,
                side = side.as_str(),
                existing,
                delta,
                ceiling,
                "risk limit would be exceeded"
            );
            true
        } else {
            false
        }
    }

    /// Drop closed positions older than the retention window
    pub fn purge_closed(&mut self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let stale: Vec<Uuid> = self
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Closed && p.updated_at < cutoff)
            .map(|p| p.id)
            .collect();

        for id in &stale {
            if let Some(position) = self.positions.remove(id) {
                if let Some(ids) = self.by_strategy.get_mut(&position.strategy) {
                    ids.retain(|x| x != id);
                }
                if let Some(ids) = self.by_symbol.get_mut(&position.symbol) {
                    ids.retain(|x| x != id);
                }
            }
        }

        if !stale.is_empty() {
            tracing::info!(purged = stale.len(), "purged closed positions");
        }
        stale.len()
    }

    pub fn stats(&self) -> BookStats {
        let open = self.open_positions();
        BookStats {
            total_positions: self.positions.len(),
            open_positions: open.len(),
            closed_positions: self
                .positions
                .values()
                .filter(|p| p.status == PositionStatus::Closed)
                .count(),
            unrealized_pnl: open.iter().map(|p| p.unrealized_pnl()).sum(),
        }
    }

    fn get_mut(&mut self, id: Uuid) -> anyhow::Result<&mut Position> {
        self.positions
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("position {} not found", id))
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_short(book: &mut PositionBook, size: f64, price: f64) -> Uuid {
        book.create("BTC-USDT-SWAP", Direction::Short, size, price, "test", None)
    }

    #[test]
    fn test_create_position() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);

        let position = book.get(id).unwrap();
        assert_eq!(position.size, 10.0);
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.entry_fills.len(), 1);
    }

    #[test]
    fn test_add_recomputes_weighted_entry() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);

        book.add_to(id, 10.0, 110.0, None).unwrap();

        let position = book.get(id).unwrap();
        assert_eq!(position.size, 20.0);
        // (10*100 + 10*110) / 20
        assert_eq!(position.entry_price, 105.0);
    }

    #[test]
    fn test_reduce_transitions_partial_then_closed() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);

        book.reduce(id, 4.0, 95.0, None).unwrap();
        assert_eq!(book.get(id).unwrap().status, PositionStatus::Partial);
        assert_eq!(book.get(id).unwrap().size, 6.0);

        book.reduce(id, 6.0, 95.0, None).unwrap();
        assert_eq!(book.get(id).unwrap().status, PositionStatus::Closed);
        assert_eq!(book.get(id).unwrap().size, 0.0);
    }

    #[test]
    fn test_reduce_clamps_to_current_size() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 5.0, 100.0);

        book.reduce(id, 50.0, 90.0, None).unwrap();

        let position = book.get(id).unwrap();
        assert_eq!(position.size, 0.0);
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[test]
    fn test_size_invariant_over_fill_sequence() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);
        book.add_to(id, 5.0, 102.0, None).unwrap();
        book.reduce(id, 3.0, 99.0, None).unwrap();
        book.add_to(id, 2.0, 101.0, None).unwrap();
        book.reduce(id, 8.0, 98.0, None).unwrap();

        let position = book.get(id).unwrap();
        let entries: f64 = position.entry_fills.iter().map(|f| f.quantity).sum();
        let exits: f64 = position.exit_fills.iter().map(|f| f.quantity).sum();
        assert_eq!(position.size, (entries - exits).max(0.0));
        assert!(position.is_open());

        // Close out the rest; the invariant must still hold
        book.close(id, 97.0, None).unwrap();
        let position = book.get(id).unwrap();
        let entries: f64 = position.entry_fills.iter().map(|f| f.quantity).sum();
        let exits: f64 = position.exit_fills.iter().map(|f| f.quantity).sum();
        assert_eq!((entries - exits).max(0.0), 0.0);
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[test]
    fn test_closed_iff_size_zero() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);

        book.reduce(id, 9.9, 100.0, None).unwrap();
        let position = book.get(id).unwrap();
        assert!(position.size > 0.0);
        assert_ne!(position.status, PositionStatus::Closed);

        book.reduce(id, 0.1, 100.0, None).unwrap();
        let position = book.get(id).unwrap();
        assert_eq!(position.size, 0.0);
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[test]
    fn test_double_close_rejected() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);

        book.close(id, 100.0, None).unwrap();
        assert!(book.close(id, 100.0, None).is_err());
    }

    #[test]
    fn test_short_pnl() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);

        book.update_price(id, 70.0).unwrap();
        let position = book.get(id).unwrap();
        // Short from 100, price at 70: +30 per unit
        assert_eq!(position.unrealized_pnl(), 300.0);
        assert_eq!(position.pnl_pct(), 30.0);

        book.update_price(id, 115.0).unwrap();
        let position = book.get(id).unwrap();
        assert_eq!(position.unrealized_pnl(), -150.0);
        assert_eq!(position.pnl_pct(), -15.0);
    }

    #[test]
    fn test_long_pnl() {
        let mut book = PositionBook::new();
        let id = book.create("ETH-USDT-SWAP", Direction::Long, 2.0, 2000.0, "test", None);

        book.update_price(id, 2600.0).unwrap();
        let position = book.get(id).unwrap();
        assert_eq!(position.unrealized_pnl(), 1200.0);
        assert_eq!(position.pnl_pct(), 30.0);
    }

    #[test]
    fn test_protection_levels() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);
        // Short: take profit below entry, stop above
        book.set_protection(id, Some(115.0), Some(70.0)).unwrap();

        book.update_price(id, 69.0).unwrap();
        assert!(book.get(id).unwrap().hit_take_profit());
        assert!(!book.get(id).unwrap().hit_stop_loss());

        book.update_price(id, 116.0).unwrap();
        assert!(book.get(id).unwrap().hit_stop_loss());
        assert!(!book.get(id).unwrap().hit_take_profit());
    }

    #[test]
    fn test_indexed_lookups() {
        let mut book = PositionBook::new();
        book.create("BTC-USDT-SWAP", Direction::Short, 1.0, 100.0, "alpha", None);
        book.create("BTC-USDT-SWAP", Direction::Long, 2.0, 100.0, "beta", None);
        book.create("ETH-USDT-SWAP", Direction::Short, 3.0, 2000.0, "alpha", None);

        assert_eq!(book.positions_for_strategy("alpha").len(), 2);
        assert_eq!(book.positions_for_strategy("beta").len(), 1);
        assert_eq!(book.positions_for_symbol("BTC-USDT-SWAP").len(), 2);
        assert_eq!(book.open_count_for_strategy("alpha"), 2);
    }

    #[test]
    fn test_risk_limit_check() {
        let mut book = PositionBook::new();
        book.create("BTC-USDT-SWAP", Direction::Short, 60.0, 100.0, "test", None);

        assert!(!book.would_exceed_limit("BTC-USDT-SWAP", Direction::Short, 30.0, 100.0));
        assert!(book.would_exceed_limit("BTC-USDT-SWAP", Direction::Short, 50.0, 100.0));
        // Opposite side does not count against the same ceiling
        assert!(!book.would_exceed_limit("BTC-USDT-SWAP", Direction::Long, 50.0, 100.0));
    }

    #[test]
    fn test_purge_respects_retention() {
        let mut book = PositionBook::new();
        let id = open_short(&mut book, 10.0, 100.0);
        book.close(id, 100.0, None).unwrap();

        // Fresh close is retained
        assert_eq!(book.purge_closed(Duration::days(7)), 0);

        // Age the record past the window
        book.positions.get_mut(&id).unwrap().updated_at = Utc::now() - Duration::days(8);
        assert_eq!(book.purge_closed(Duration::days(7)), 1);
        assert!(book.get(id).is_none());
        assert!(book.positions_for_strategy("test").is_empty());
    }

    #[test]
    fn test_stats() {
        let mut book = PositionBook::new();
        let a = open_short(&mut book, 10.0, 100.0);
        let _b = open_short(&mut book, 5.0, 100.0);
        book.close(a, 100.0, None).unwrap();

        let stats = book.stats();
        assert_eq!(stats.total_positions, 2);
        assert_eq!(stats.open_positions, 1);
        assert_eq!(stats.closed_positions, 1);
    }
}
