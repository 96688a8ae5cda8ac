// Venue boundary: the rest of the system treats the exchange as a black box
// behind `ExchangeApi`, with faults bucketed into the three categories the
// retry policy cares about.
pub mod okx;
pub mod paper;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{OrderSide, OrderType};
use crate::models::Direction;

#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("venue rejected request: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Transient faults are worth retrying with backoff; rejections are not
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::RateLimited(_) | ExchangeError::Network(_))
    }
}

/// Last-trade snapshot for an instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    pub total: f64,
    pub available: f64,
}

/// Position as reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Direction,
    pub size: f64,
    pub entry_price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl VenueOrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VenueOrderStatus::Open)
    }
}

/// Order as reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub status: VenueOrderStatus,
    pub filled: f64,
    pub average_price: f64,
    pub fee: f64,
}

/// Extra execution parameters passed through to the venue
#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub pos_side: Option<Direction>,
    pub stop_price: Option<f64>,
    /// Strategy tag attached to the order for later attribution
    pub tag: Option<String>,
    pub client_order_id: Option<String>,
}

/// The venue API surface the core depends on.
///
/// Every call is fallible with a distinguishable fault category; callers decide
/// what to retry via `ExchangeError::is_transient`.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
        params: &OrderParams,
    ) -> Result<VenueOrder, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<VenueOrder, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_balance(&self) -> Result<Vec<AccountBalance>, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(!ExchangeError::Rejected("insufficient balance".into()).is_transient());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!VenueOrderStatus::Open.is_terminal());
        assert!(VenueOrderStatus::Filled.is_terminal());
        assert!(VenueOrderStatus::Cancelled.is_terminal());
        assert!(VenueOrderStatus::Rejected.is_terminal());
    }
}
