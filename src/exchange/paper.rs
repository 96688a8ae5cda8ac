use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AccountBalance, ExchangeApi, ExchangeError, OrderParams, Ticker, VenueOrder, VenueOrderStatus,
    VenuePosition,
};
use crate::execution::{OrderSide, OrderType};

/// In-process venue simulator used for dry-run mode and tests.
///
/// Market orders fill at the current instrument price. Limit orders fill when
/// marketable, otherwise rest until the price crosses them (checked on each
/// `fetch_order` poll). Faults queued with `inject_fault` are returned from
/// the next `create_order` call, in order.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    fee_rate: f64,
}

struct PaperState {
    prices: HashMap<String, f64>,
    orders: HashMap<String, VenueOrder>,
    resting: HashMap<String, RestingOrder>,
    faults: VecDeque<ExchangeError>,
    balances: Vec<AccountBalance>,
    next_id: u64,
}

struct RestingOrder {
    side: OrderSide,
    amount: f64,
    limit_price: Option<f64>,
    order_type: OrderType,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                prices: HashMap::new(),
                orders: HashMap::new(),
                resting: HashMap::new(),
                faults: VecDeque::new(),
                balances: vec![AccountBalance {
                    currency: "USDT".to_string(),
                    total: 10_000.0,
                    available: 10_000.0,
                }],
                next_id: 1,
            }),
            fee_rate: 0.0005,
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(symbol.to_string(), price);
    }

    /// Queue a fault to be returned by the next `create_order` call
    pub fn inject_fault(&self, fault: ExchangeError) {
        let mut state = self.state.lock().unwrap();
        state.faults.push_back(fault);
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    pub fn order(&self, order_id: &str) -> Option<VenueOrder> {
        self.state.lock().unwrap().orders.get(order_id).cloned()
    }

    fn fill(&self, order: &mut VenueOrder, amount: f64, price: f64) {
        order.status = VenueOrderStatus::Filled;
        order.filled = amount;
        order.average_price = price;
        order.fee = amount * price * self.fee_rate;
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

fn limit_crosses(side: OrderSide, limit_price: f64, market: f64) -> bool {
    match side {
        OrderSide::Buy => limit_price >= market,
        OrderSide::Sell => limit_price <= market,
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
        params: &OrderParams,
    ) -> Result<VenueOrder, ExchangeError> {
        let mut state = self.state.lock().unwrap();

        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }

        let market = *state
            .prices
            .get(symbol)
            .ok_or_else(|| ExchangeError::Rejected(format!("no market data for {}", symbol)))?;

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        let mut order = VenueOrder {
            id: id.clone(),
            client_order_id: params.client_order_id.clone(),
            symbol: symbol.to_string(),
            status: VenueOrderStatus::Open,
            filled: 0.0,
            average_price: 0.0,
            fee: 0.0,
        };

        match order_type {
            OrderType::Market => {
                self.fill(&mut order, amount, market);
            }
            OrderType::Limit => {
                let limit = price
                    .ok_or_else(|| ExchangeError::Rejected("limit order without price".into()))?;
                if limit_crosses(side, limit, market) {
                    self.fill(&mut order, amount, market);
                } else {
                    state.resting.insert(
                        id.clone(),
                        RestingOrder {
                            side,
                            amount,
                            limit_price: Some(limit),
                            order_type,
                        },
                    );
                }
            }
            OrderType::Stop | OrderType::StopLimit => {
                if params.stop_price.is_none() {
                    return Err(ExchangeError::Rejected("stop order without trigger price".into()));
                }
                // Armed but not triggered; fills are not simulated for stops
                state.resting.insert(
                    id.clone(),
                    RestingOrder {
                        side,
                        amount,
                        limit_price: price,
                        order_type,
                    },
                );
            }
        }

        state.orders.insert(id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();

        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {}", order_id)))?;

        if order.status != VenueOrderStatus::Open {
            return Err(ExchangeError::Rejected(format!(
                "order {} is not open",
                order_id
            )));
        }

        order.status = VenueOrderStatus::Cancelled;
        state.resting.remove(order_id);
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<VenueOrder, ExchangeError> {
        let mut state = self.state.lock().unwrap();

        // Resting limit orders fill once the price has crossed them
        if let Some(resting) = state.resting.get(order_id) {
            if resting.order_type == OrderType::Limit {
                if let (Some(limit), Some(&market)) =
                    (resting.limit_price, state.prices.get(symbol))
                {
                    if limit_crosses(resting.side, limit, market) {
                        let amount = resting.amount;
                        state.resting.remove(order_id);
                        if let Some(order) = state.orders.get_mut(order_id) {
                            order.status = VenueOrderStatus::Filled;
                            order.filled = amount;
                            order.average_price = limit;
                            order.fee = amount * limit * self.fee_rate;
                        }
                    }
                }
            }
        }

        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {}", order_id)))
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let state = self.state.lock().unwrap();
        let last = *state
            .prices
            .get(symbol)
            .ok_or_else(|| ExchangeError::Rejected(format!("no market data for {}", symbol)))?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: last * 0.9995,
            ask: last * 1.0005,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_balance(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        Ok(self.state.lock().unwrap().balances.clone())
    }

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        Ok(Vec::new())
    }
}
