// Order execution: typed requests/results and the queued executor
pub mod executor;

pub use executor::{ExecutorConfig, OrderExecutor};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::exchange::ExchangeError;
use crate::models::Direction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop-limit",
        }
    }

    pub fn requires_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    pub fn requires_stop_price(&self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
    Expired,
    Failed,
}

/// Immutable order request. The client order id doubles as the idempotency
/// token handed to the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: Uuid,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub amount: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub pos_side: Option<Direction>,
    pub client_order_id: String,
    pub strategy: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    fn base(symbol: &str, order_type: OrderType, side: OrderSide, amount: f64, strategy: &str) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            symbol: symbol.to_string(),
            order_type,
            side,
            amount,
            price: None,
            stop_price: None,
            pos_side: None,
            client_order_id: format!("rb{}", &id.simple().to_string()[..12]),
            strategy: strategy.to_string(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn market(symbol: &str, side: OrderSide, amount: f64, strategy: &str) -> Self {
        Self::base(symbol, OrderType::Market, side, amount, strategy)
    }

    pub fn limit(symbol: &str, side: OrderSide, amount: f64, price: f64, strategy: &str) -> Self {
        let mut request = Self::base(symbol, OrderType::Limit, side, amount, strategy);
        request.price = Some(price);
        request
    }

    pub fn stop(symbol: &str, side: OrderSide, amount: f64, stop_price: f64, strategy: &str) -> Self {
        let mut request = Self::base(symbol, OrderType::Stop, side, amount, strategy);
        request.stop_price = Some(stop_price);
        request
    }

    pub fn with_pos_side(mut self, pos_side: Direction) -> Self {
        self.pos_side = Some(pos_side);
        self
    }
}

/// Mutable until terminal; one per executed request
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub request_id: Uuid,
    pub venue_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_amount: f64,
    pub remaining_amount: f64,
    pub average_price: f64,
    pub fees: f64,
    /// Venue call attempts spent on this order (1 = no retries)
    pub attempts: u32,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl OrderResult {
    pub fn pending(request_id: Uuid) -> Self {
        Self {
            request_id,
            venue_order_id: None,
            status: OrderStatus::Pending,
            filled_amount: 0.0,
            remaining_amount: 0.0,
            average_price: 0.0,
            fees: 0.0,
            attempts: 0,
            error: None,
            executed_at: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Bad request shape; rejected before reaching the queue
    #[error("order validation failed: {0}")]
    Validation(String),

    #[error("execution queue is full")]
    QueueFull,

    #[error("limit order {order_id} unfilled within {timeout_secs}s")]
    FillTimeout { order_id: String, timeout_secs: u64 },

    #[error("venue error after {attempts} attempt(s): {source}")]
    Venue {
        source: ExchangeError,
        attempts: u32,
    },

    #[error("executor is shut down")]
    Shutdown,
}

/// Completion hook invoked for every executed order. Faults are logged and
/// isolated from other callbacks and from the execution loop.
pub trait OrderCallback: Send + Sync {
    fn on_complete(&self, request: &OrderRequest, result: &OrderResult) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_orders: u64,
    pub successful_orders: u64,
    pub failed_orders: u64,
    /// Extra venue attempts beyond the first, summed over all orders
    pub total_retries: u64,
    pub total_volume: f64,
    pub avg_execution_ms: f64,
}
